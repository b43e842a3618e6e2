//! # vole
//!
//! A computation-graph execution engine for layered neural networks.
//!
//! A graph is described once through [`GraphConfig`] as named inputs and
//! named vertices wired by name, then built into a [`ComputationGraph`]:
//! wiring is validated, a deterministic topological order is fixed,
//! every edge's shape is inferred, and all trainable parameters are laid
//! out in one flat buffer with per-layer views.
//!
//! ```no_run
//! use vole::{GraphConfig, TensorShape, VertexConfig};
//! use vole::nn::{DenseLayer, Loss, OutputLayer};
//!
//! # fn main() -> vole::Result<()> {
//! let mut graph = GraphConfig::new()
//!     .seed(42)
//!     .input("features", TensorShape::feed_forward(8))
//!     .vertex(
//!         "hidden",
//!         VertexConfig::Dense(DenseLayer::new(8, 16)),
//!         &["features"],
//!     )
//!     .vertex(
//!         "predictions",
//!         VertexConfig::Output(OutputLayer::new(16, 2, Loss::Mse)),
//!         &["hidden"],
//!     )
//!     .output("predictions")
//!     .build()?;
//!
//! let batch = ndarray::ArrayD::zeros(vec![4, 8]);
//! let eval = graph.forward(&[batch], false)?;
//! let predictions = graph.output_activations(&eval);
//! # let _ = predictions;
//! # Ok(())
//! # }
//! ```

pub mod graph;

pub use graph::{ComputationGraph, Evaluation, GraphConfig};

pub use vole_core::{
    Activations, Dim, Error, Gradients, MaskState, MemoryReport, ModelBuffers,
    ParamLayout, ParamSpan, Result, TensorShape,
};
pub use vole_nn::{Vertex, VertexConfig, VertexRegistry};

/// Vertex and layer building blocks, re-exported from `vole-nn`.
pub mod nn {
    pub use vole_nn::{
        Activation, ActivationLayer, AutoEncoder, DenseLayer, L2Normalize,
        LastTimeStep, Loss, LossLayer, Merge, OutputLayer, Scale, Subset, Trace,
        WeightInit, WeightNoise,
    };
}
