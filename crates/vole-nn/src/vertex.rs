// Vertex — the capability interface every graph node implements.
//
// A vertex is anything that sits at a node of the computation graph:
// structural operators (Merge, Subset, Scale, ...) with no trainable
// parameters, and parametrized layers (Dense, Output, AutoEncoder).
// All of them expose the same four capabilities:
//
//   output_shape   — shape inference, run at graph-build time
//   memory_report  — pre-flight capacity estimate
//   forward        — activations in, activations out
//   backward       — epsilon in, per-input epsilons out (plus parameter
//                    gradients written into the flat gradient view)
//
// Vertices are stateless between evaluations. Everything a backward pass
// needs from the matching forward pass (recorded shapes, selected time
// steps, pre-activation outputs, a noise-perturbed weight) travels in an
// explicit `Trace` value returned by `forward`. The executor holds the
// trace for exactly one forward/backward pair and then drops it, so stale
// state from a previous pass can never leak into the next one.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{Array2, ArrayD};
use rand::rngs::StdRng;

use vole_core::{Activations, Error, Gradients, MemoryReport, Result, TensorShape};

use crate::activation_layer::ActivationLayer;
use crate::autoencoder::AutoEncoder;
use crate::dense::DenseLayer;
use crate::l2_normalize::L2Normalize;
use crate::last_time_step::LastTimeStep;
use crate::loss_layer::LossLayer;
use crate::merge::Merge;
use crate::output::OutputLayer;
use crate::scale::Scale;
use crate::subset::Subset;

/// Declared input arity of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: usize,
}

impl Arity {
    /// Exactly `n` inputs.
    pub fn exact(n: usize) -> Self {
        Arity { min: n, max: n }
    }

    /// At least `n` inputs, unbounded above.
    pub fn at_least(n: usize) -> Self {
        Arity {
            min: n,
            max: usize::MAX,
        }
    }

    /// Check an actual input count against this range.
    pub fn check(&self, kind: &'static str, got: usize) -> Result<()> {
        if got < self.min || got > self.max {
            return Err(Error::InvalidArity {
                kind,
                min: self.min,
                max: self.max,
                got,
            });
        }
        Ok(())
    }
}

/// State recorded by a forward pass for the matching backward pass.
///
/// Scoped to one forward/backward pair: the executor creates it in
/// `forward`, hands it back in `backward`, and drops it afterwards.
#[derive(Debug, Clone, Default)]
pub enum Trace {
    /// No state needed (Scale, and any vertex whose backward is closed-form).
    #[default]
    None,
    /// Per-input shapes recorded by Merge, used to split the epsilon.
    MergedShapes(Vec<Vec<usize>>),
    /// The input shape recorded by Subset, used to size the scatter target.
    InputShape(Vec<usize>),
    /// Input shape plus per-example extracted time indices (None when no
    /// mask was present and the fixed last index applies to all examples).
    TimeSteps {
        shape: Vec<usize>,
        steps: Option<Vec<usize>>,
    },
    /// The full input tensor (L2Normalize and ActivationLayer gradients
    /// need it).
    Input(ArrayD<f64>),
    /// Parametrized-layer state.
    Layer(LayerTrace),
}

/// Forward-pass state of a parametrized layer.
#[derive(Debug, Clone)]
pub struct LayerTrace {
    /// The rank-2 input `x`.
    pub input: Array2<f64>,
    /// Pre-activation output `z = x·W + b`.
    pub pre_output: Array2<f64>,
    /// Noise-perturbed weight used in forward, reused by backward within
    /// this one step and discarded with the trace.
    pub noisy_weight: Option<Array2<f64>>,
    /// Input mask, applied to delta during backward.
    pub mask: Option<ArrayD<f64>>,
}

/// The capability interface implemented by every graph node.
pub trait Vertex: fmt::Debug + Send + Sync {
    /// Short kind name used in error messages ("merge", "dense", ...).
    fn kind(&self) -> &'static str;

    /// Declared input arity. Defaults to exactly one input.
    fn arity(&self) -> Arity {
        Arity::exact(1)
    }

    /// Number of trainable parameters. Zero for structural vertices.
    fn param_count(&self) -> usize {
        0
    }

    /// Infer the output shape from the input shapes, or fail with one of
    /// the shape-inference errors. Checks arity first.
    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape>;

    /// Pre-flight memory estimate. Structural vertices report zero in
    /// every field; the default validates the shapes and does exactly that.
    fn memory_report(&self, inputs: &[TensorShape]) -> Result<MemoryReport> {
        self.output_shape(inputs)?;
        Ok(MemoryReport::none())
    }

    /// Initialize this vertex's parameter view. The default accepts only
    /// an empty view (no parameters).
    fn init_params(&self, params: &mut [f64], _rng: &mut StdRng) -> Result<()> {
        expect_len(self.kind(), self.param_count(), params.len())
    }

    /// Forward pass. `params` is this vertex's view into the flat
    /// parameter buffer (empty for structural vertices).
    fn forward(
        &self,
        params: &[f64],
        input: &Activations,
        training: bool,
        rng: &mut StdRng,
    ) -> Result<(Activations, Trace)>;

    /// Backward pass. `grad_view` is this vertex's view into the flat
    /// gradient buffer; parameter gradients are written there in place.
    /// Returns one epsilon per input edge, in input order.
    fn backward(
        &self,
        params: &[f64],
        grad_view: &mut [f64],
        trace: &Trace,
        epsilon: &Gradients,
    ) -> Result<Gradients>;

    /// (l1, l2) regularization penalty contributions for the current
    /// parameter values. Zero for structural vertices.
    fn score_penalty(&self, _params: &[f64]) -> (f64, f64) {
        (0.0, 0.0)
    }
}

/// Check a supplied buffer length against the expected parameter count.
pub(crate) fn expect_len(kind: &'static str, expected: usize, got: usize) -> Result<()> {
    if got != expected {
        return Err(Error::SizeMismatch {
            kind,
            expected,
            got,
        });
    }
    Ok(())
}

/// Structural vertices own no parameters: reject any non-empty parameter
/// or gradient view handed to them.
pub(crate) fn ensure_no_params(
    kind: &'static str,
    params: &[f64],
    grad_view: &[f64],
) -> Result<()> {
    expect_len(kind, 0, params.len())?;
    expect_len(kind, 0, grad_view.len())
}

/// Immutable per-vertex configuration: the closed set of vertex variants,
/// plus an open point for registered custom vertices.
///
/// Configurations are cloned, never mutated, when a graph is copied; each
/// graph build instantiates its runtime state (buffers, traces) separately.
#[derive(Debug, Clone)]
pub enum VertexConfig {
    Merge(Merge),
    Subset(Subset),
    Scale(Scale),
    LastTimeStep(LastTimeStep),
    L2Normalize(L2Normalize),
    Activation(ActivationLayer),
    Dense(DenseLayer),
    Output(OutputLayer),
    LossOutput(LossLayer),
    AutoEncoder(AutoEncoder),
    Custom(Arc<dyn Vertex>),
}

impl VertexConfig {
    /// Dispatch to the underlying capability implementation.
    pub fn as_vertex(&self) -> &dyn Vertex {
        match self {
            VertexConfig::Merge(v) => v,
            VertexConfig::Subset(v) => v,
            VertexConfig::Scale(v) => v,
            VertexConfig::LastTimeStep(v) => v,
            VertexConfig::L2Normalize(v) => v,
            VertexConfig::Activation(v) => v,
            VertexConfig::Dense(v) => v,
            VertexConfig::Output(v) => v,
            VertexConfig::LossOutput(v) => v,
            VertexConfig::AutoEncoder(v) => v,
            VertexConfig::Custom(v) => v.as_ref(),
        }
    }

    /// Number of trainable parameters (convenience passthrough).
    pub fn param_count(&self) -> usize {
        self.as_vertex().param_count()
    }
}

/// Registry of custom vertex implementations, keyed by kind name.
///
/// The built-in variants are dispatched statically through
/// [`VertexConfig`]; the registry is the extension point for vertices
/// defined outside this crate. Registered vertices must be stateless
/// (state belongs in the [`Trace`]), so a shared `Arc` per kind suffices.
#[derive(Debug, Clone, Default)]
pub struct VertexRegistry {
    entries: HashMap<String, Arc<dyn Vertex>>,
}

impl VertexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom vertex under a kind name. Replaces any previous
    /// entry with the same name.
    pub fn register(&mut self, name: impl Into<String>, vertex: Arc<dyn Vertex>) {
        self.entries.insert(name.into(), vertex);
    }

    /// Look up a registered vertex as a config value.
    pub fn get(&self, name: &str) -> Option<VertexConfig> {
        self.entries
            .get(name)
            .map(|v| VertexConfig::Custom(Arc::clone(v)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_check() {
        let a = Arity::exact(1);
        assert!(a.check("scale", 1).is_ok());
        assert!(matches!(
            a.check("scale", 2),
            Err(Error::InvalidArity {
                kind: "scale",
                min: 1,
                max: 1,
                got: 2
            })
        ));

        let m = Arity::at_least(2);
        assert!(m.check("merge", 7).is_ok());
        assert!(m.check("merge", 1).is_err());
    }

    #[test]
    fn test_ensure_no_params() {
        assert!(ensure_no_params("merge", &[], &[]).is_ok());
        assert!(matches!(
            ensure_no_params("merge", &[1.0], &[]),
            Err(Error::SizeMismatch {
                kind: "merge",
                expected: 0,
                got: 1
            })
        ));
        let grads = [0.0];
        assert!(ensure_no_params("merge", &[], &grads).is_err());
    }

    #[test]
    fn test_registry_round_trip() {
        let mut reg = VertexRegistry::new();
        assert!(!reg.contains("scale"));
        reg.register("scale2x", Arc::new(Scale::new(2.0)));
        assert!(reg.contains("scale2x"));
        let cfg = reg.get("scale2x").unwrap();
        assert_eq!(cfg.as_vertex().kind(), "scale");
        assert_eq!(cfg.param_count(), 0);
    }
}
