// Subset vertex: selects an inclusive range [from, to] of the feature
// axis. Feed-forward and recurrent inputs keep their other dimensions;
// convolutional inputs are narrowed along depth.
//
// The backward pass scatters the epsilon into a zero tensor of the
// recorded input shape, so positions outside the range get zero gradient.

use ndarray::{ArrayD, Axis, Slice};
use rand::rngs::StdRng;

use vole_core::{Activations, Dim, Error, Gradients, Result, TensorShape};

use crate::vertex::{ensure_no_params, expect_len, Trace, Vertex};

const KIND: &str = "subset";

/// Feature-range selection vertex with inclusive bounds.
#[derive(Debug, Clone, Copy)]
pub struct Subset {
    from: usize,
    to: usize,
}

impl Subset {
    pub fn new(from: usize, to: usize) -> Self {
        Subset { from, to }
    }

    /// Width of the inclusive range.
    fn width(&self) -> usize {
        self.to - self.from + 1
    }

    fn check_range(&self, available: Dim) -> Result<()> {
        if self.from > self.to {
            return Err(Error::OutOfRange {
                from: self.from,
                to: self.to,
                available: available.value().unwrap_or(0),
            });
        }
        if let Dim::Known(n) = available {
            if self.to >= n {
                return Err(Error::OutOfRange {
                    from: self.from,
                    to: self.to,
                    available: n,
                });
            }
        }
        Ok(())
    }
}

impl Vertex for Subset {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        let input = &inputs[0];
        if let TensorShape::ConvolutionalFlat { .. } = input {
            // channel boundaries are lost after flattening
            return Err(Error::UnsupportedShape {
                kind: KIND,
                shape: input.clone(),
            });
        }
        self.check_range(input.feature_size())?;
        let width = Dim::Known(self.width());
        Ok(match input {
            TensorShape::FeedForward { .. } => TensorShape::feed_forward(width),
            TensorShape::Recurrent { steps, .. } => TensorShape::recurrent(width, *steps),
            TensorShape::Convolutional { height, width: w, .. } => {
                TensorShape::convolutional(*height, *w, width)
            }
            TensorShape::ConvolutionalFlat { .. } => unreachable!(),
        })
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
        self.check_range(Dim::Known(arr.shape()[1]))?;

        let out = arr
            .slice_axis(
                Axis(1),
                Slice::from(self.from as isize..=self.to as isize),
            )
            .to_owned();
        Ok((
            Activations::single_masked(out, input.mask(0).cloned(), input.mask_state(0)),
            Trace::InputShape(arr.shape().to_vec()),
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
        let Trace::InputShape(shape) = trace else {
            return Err(Error::InvalidInput {
                kind: KIND,
                detail: "backward called without a subset trace".into(),
            });
        };
        let eps = epsilon.required(0, KIND)?;
        let mut full = ArrayD::zeros(shape.clone());
        full.slice_axis_mut(
            Axis(1),
            Slice::from(self.from as isize..=self.to as isize),
        )
        .assign(eps);
        Ok(Gradients::single(full))
    }
}
