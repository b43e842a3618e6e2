// Activation layer: applies an activation function elementwise, with no
// trainable parameters. Pairs with vertices that emit pre-activation
// features, such as a merge of linear outputs.
//
// The forward pass records the pre-activation input; backward multiplies
// the incoming epsilon by the activation derivative at that input.

use ndarray::Ix2;
use rand::rngs::StdRng;

use vole_core::{Activations, Error, Gradients, Result, TensorShape};

use crate::activation::Activation;
use crate::vertex::{ensure_no_params, expect_len, Trace, Vertex};

const KIND: &str = "activation";

/// Parameterless elementwise activation vertex.
#[derive(Debug, Clone, Copy)]
pub struct ActivationLayer {
    activation: Activation,
}

impl ActivationLayer {
    pub fn new(activation: Activation) -> Self {
        ActivationLayer { activation }
    }
}

impl Vertex for ActivationLayer {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        match &inputs[0] {
            TensorShape::FeedForward { .. } | TensorShape::ConvolutionalFlat { .. } => {
                Ok(inputs[0].clone())
            }
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
        let arr = input.required(0, KIND)?;
        let z = as_rank2(arr)?;
        let a = self.activation.apply(&z);
        Ok((
            Activations::single_masked(
                a.into_dyn(),
                input.mask(0).cloned(),
                input.mask_state(0),
            ),
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
        let Trace::Input(z) = trace else {
            return Err(Error::InvalidInput {
                kind: KIND,
                detail: "backward called without the forward input".into(),
            });
        };
        let z = as_rank2(z)?;
        let eps = as_rank2(epsilon.required(0, KIND)?)?;
        if eps.dim() != z.dim() {
            return Err(Error::IncompatibleShapes {
                kind: KIND,
                detail: format!(
                    "epsilon shape {:?} does not match input shape {:?}",
                    eps.dim(),
                    z.dim()
                ),
            });
        }
        let delta = self.activation.backprop(&z, &eps);
        Ok(Gradients::single(delta.into_dyn()))
    }
}

fn as_rank2(arr: &ndarray::ArrayD<f64>) -> Result<ndarray::Array2<f64>> {
    arr.view()
        .into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|_| Error::InvalidInput {
            kind: KIND,
            detail: format!("expected rank-2 input, got rank {}", arr.ndim()),
        })
}
