// LastTimeStep vertex: collapses a recurrent input [batch, size, steps]
// to the feed-forward activations [batch, size] of each example's final
// time step.
//
// With no mask the final step is simply index steps-1 for every example.
// With a mask of shape [batch, steps] the final step of example i is the
// last position where mask[i, t] is nonzero (0 when the row is all zero,
// matching a fully padded example). The mask is consumed: the output
// carries none, since a single step per example needs no padding info.

use ndarray::{ArrayD, Ix2, Ix3};
use rand::rngs::StdRng;

use vole_core::{Activations, Error, Gradients, Result, TensorShape};

use crate::vertex::{ensure_no_params, expect_len, Trace, Vertex};

const KIND: &str = "last-time-step";

/// Recurrent-to-feed-forward collapse onto the last (unmasked) time step.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastTimeStep;

impl LastTimeStep {
    pub fn new() -> Self {
        LastTimeStep
    }
}

impl Vertex for LastTimeStep {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        match &inputs[0] {
            TensorShape::Recurrent { size, .. } => Ok(TensorShape::feed_forward(*size)),
            other => Err(Error::UnsupportedShape {
                kind: KIND,
                shape: other.clone(),
            }),
        }
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
        let arr = input
            .required(0, KIND)?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| Error::InvalidInput {
                kind: KIND,
                detail: "input is not rank 3".into(),
            })?;
        let (batch, size, steps) = arr.dim();
        if steps == 0 {
            return Err(Error::InvalidInput {
                kind: KIND,
                detail: "recurrent input has zero time steps".into(),
            });
        }

        let indices = match input.mask(0) {
            None => None,
            Some(mask) => Some(last_steps(mask, batch, steps)?),
        };

        let mut out = ArrayD::zeros(vec![batch, size]);
        for i in 0..batch {
            let t = indices.as_ref().map_or(steps - 1, |idx| idx[i]);
            for j in 0..size {
                out[[i, j]] = arr[[i, j, t]];
            }
        }

        let trace = Trace::TimeSteps {
            shape: vec![batch, size, steps],
            steps: indices,
        };
        Ok((Activations::single(out), trace))
    }

    fn backward(
        &self,
        params: &[f64],
        grad_view: &mut [f64],
        trace: &Trace,
        epsilon: &Gradients,
    ) -> Result<Gradients> {
        ensure_no_params(KIND, params, grad_view)?;
        let Trace::TimeSteps { shape, steps } = trace else {
            return Err(Error::InvalidInput {
                kind: KIND,
                detail: "backward called without a time-step trace".into(),
            });
        };
        let eps = epsilon
            .required(0, KIND)?
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| Error::InvalidInput {
                kind: KIND,
                detail: "epsilon is not rank 2".into(),
            })?;
        let (batch, size, n_steps) = (shape[0], shape[1], shape[2]);
        let mut full = ArrayD::zeros(shape.clone());
        for i in 0..batch {
            let t = steps.as_ref().map_or(n_steps - 1, |idx| idx[i]);
            for j in 0..size {
                full[[i, j, t]] = eps[[i, j]];
            }
        }
        Ok(Gradients::single(full))
    }
}

/// Per-example index of the last nonzero mask position.
fn last_steps(mask: &ArrayD<f64>, batch: usize, steps: usize) -> Result<Vec<usize>> {
    let mask = mask
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::InvalidInput {
            kind: KIND,
            detail: "mask is not rank 2".into(),
        })?;
    if mask.dim() != (batch, steps) {
        return Err(Error::InvalidInput {
            kind: KIND,
            detail: format!(
                "mask shape {:?} does not match [batch, steps] = [{batch}, {steps}]",
                mask.dim()
            ),
        });
    }
    let mut out = Vec::with_capacity(batch);
    for i in 0..batch {
        let mut last = 0;
        for t in 0..steps {
            if mask[[i, t]] != 0.0 {
                last = t;
            }
        }
        out.push(last);
    }
    Ok(out)
}
