//! # vole-nn
//!
//! Graph vertices and parametrized layers for the vole
//! computation-graph engine.
//!
//! Everything that can sit at a graph node implements the [`Vertex`]
//! trait: shape inference, memory estimation, forward, and backward.
//! Structural vertices ([`Merge`], [`Subset`], [`Scale`],
//! [`LastTimeStep`], [`L2Normalize`], [`ActivationLayer`],
//! [`LossLayer`]) transform activations without trainable parameters;
//! parametrized layers ([`DenseLayer`], [`OutputLayer`],
//! [`AutoEncoder`]) own views into the model's flat parameter buffer.
//!
//! Vertices are stateless between evaluations: whatever a backward pass
//! needs from the matching forward pass travels in an explicit
//! [`Trace`] value held by the executor for one pass pair.

pub mod activation;
pub mod activation_layer;
pub mod autoencoder;
pub mod dense;
pub mod init;
pub mod l2_normalize;
pub mod last_time_step;
pub mod loss;
pub mod loss_layer;
pub mod merge;
pub mod noise;
pub mod output;
pub mod scale;
pub mod subset;
pub mod vertex;

pub use activation::Activation;
pub use activation_layer::ActivationLayer;
pub use autoencoder::AutoEncoder;
pub use dense::DenseLayer;
pub use init::WeightInit;
pub use l2_normalize::L2Normalize;
pub use last_time_step::LastTimeStep;
pub use loss::Loss;
pub use loss_layer::LossLayer;
pub use merge::Merge;
pub use noise::WeightNoise;
pub use output::OutputLayer;
pub use scale::Scale;
pub use subset::Subset;
pub use vertex::{
    Arity, LayerTrace, Trace, Vertex, VertexConfig, VertexRegistry,
};
