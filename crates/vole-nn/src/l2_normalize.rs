// L2Normalize vertex: scales each example to unit L2 norm over all
// non-batch dimensions. Works on any input rank since the reduction is
// per example.
//
// Norms are floored at a small epsilon so an all-zero example divides by
// the floor instead of by zero, in both the forward and backward pass.

use ndarray::Axis;
use rand::rngs::StdRng;

use vole_core::{Activations, Error, Gradients, Result, TensorShape};

use crate::vertex::{ensure_no_params, expect_len, Trace, Vertex};

const KIND: &str = "l2-normalize";
const DEFAULT_EPS: f64 = 1e-8;

/// Per-example L2 normalization.
#[derive(Debug, Clone, Copy)]
pub struct L2Normalize {
    eps: f64,
}

impl L2Normalize {
    pub fn new() -> Self {
        L2Normalize { eps: DEFAULT_EPS }
    }

    /// Override the norm floor.
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
}

impl Default for L2Normalize {
    fn default() -> Self {
        L2Normalize::new()
    }
}

impl Vertex for L2Normalize {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        Ok(inputs[0].clone())
    }

    fn forward(
        &self,
        params: &[f64],
        input: &Activations,
        _training: bool,
        _rng: &mut StdRng,
    ) -> Result<(Activations, Trace)> {
        expect_len(KIND, 0, params.len())?;
        self.arity().check(KIND, input.len())?;
        let arr = input.required(0, KIND)?;

        let mut out = arr.clone();
        for mut example in out.axis_iter_mut(Axis(0)) {
            let norm = floored_norm(example.iter(), self.eps);
            example.mapv_inplace(|v| v / norm);
        }
        Ok((
            Activations::single_masked(out, input.mask(0).cloned(), input.mask_state(0)),
            Trace::Input(arr.clone()),
        ))
    }

    fn backward(
        &self,
        params: &[f64],
        grad_view: &mut [f64],
        trace: &Trace,
        epsilon: &Gradients,
    ) -> Result<Gradients> {
        ensure_no_params(KIND, params, grad_view)?;
        let Trace::Input(x) = trace else {
            return Err(Error::InvalidInput {
                kind: KIND,
                detail: "backward called without the forward input".into(),
            });
        };
        let eps = epsilon.required(0, KIND)?;
        if eps.shape() != x.shape() {
            return Err(Error::IncompatibleShapes {
                kind: KIND,
                detail: format!(
                    "epsilon shape {:?} does not match input shape {:?}",
                    eps.shape(),
                    x.shape()
                ),
            });
        }

        // d/dx (x / ||x||) applied to eps:
        //   eps / n  -  x * (eps . x) / n^3
        let mut out = eps.clone();
        for ((mut example, x_i), eps_i) in out
            .axis_iter_mut(Axis(0))
            .zip(x.axis_iter(Axis(0)))
            .zip(eps.axis_iter(Axis(0)))
        {
            let norm = floored_norm(x_i.iter(), self.eps);
            let dot: f64 = eps_i.iter().zip(x_i.iter()).map(|(&e, &v)| e * v).sum();
            let coeff = dot / (norm * norm * norm);
            example
                .iter_mut()
                .zip(x_i.iter())
                .for_each(|(g, &v)| *g = *g / norm - v * coeff);
        }
        Ok(Gradients::single(out))
    }
}

fn floored_norm<'a>(values: impl Iterator<Item = &'a f64>, floor: f64) -> f64 {
    let sq: f64 = values.map(|&v| v * v).sum();
    sq.sqrt().max(floor)
}
