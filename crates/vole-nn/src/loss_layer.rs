// Loss layer: an output layer with no trainable parameters. The incoming
// features are the pre-activation output; the activation and loss are
// applied directly, so labels must have the same width as the input.
//
// Like the fully connected output layer, the trait-level backward is an
// error; the executor seeds the chain through `backward_labelled`.

use ndarray::{Array2, ArrayD, Ix2};
use rand::rngs::StdRng;

use vole_core::{Activations, Dim, Error, Gradients, MemoryReport, Result, TensorShape};

use crate::activation::Activation;
use crate::loss::{apply_mask, Loss};
use crate::vertex::{expect_len, LayerTrace, Trace, Vertex};

const KIND: &str = "loss";

/// Parameterless output layer: activation plus loss over the raw input.
#[derive(Debug, Clone, Copy)]
pub struct LossLayer {
    activation: Activation,
    loss: Loss,
}

impl LossLayer {
    pub fn new(loss: Loss) -> Self {
        LossLayer {
            activation: Activation::default(),
            loss,
        }
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    /// Backward pass seeded by the loss gradient against `labels`. With
    /// no parameters the loss delta is itself the epsilon for the input.
    pub fn backward_labelled(
        &self,
        trace: &Trace,
        labels: &Array2<f64>,
        label_mask: Option<&ArrayD<f64>>,
    ) -> Result<Gradients> {
        let layer = layer_trace(trace)?;
        let mask = label_mask.or(layer.mask.as_ref());
        let mut delta = self
            .loss
            .gradient(labels, &layer.pre_output, self.activation, mask)?;
        if label_mask.is_some() {
            if let Some(m) = &layer.mask {
                apply_mask(KIND, &mut delta, m)?;
            }
        }
        Ok(Gradients::single(delta.into_dyn()))
    }

    /// Scalar score for the minibatch recorded in `trace`: mean
    /// per-example loss plus the network-level regularization terms.
    pub fn compute_score(
        &self,
        trace: &Trace,
        labels: &Array2<f64>,
        label_mask: Option<&ArrayD<f64>>,
        network_l1: f64,
        network_l2: f64,
    ) -> Result<f64> {
        let layer = layer_trace(trace)?;
        let mask = label_mask.or(layer.mask.as_ref());
        let loss = self
            .loss
            .compute_score(labels, &layer.pre_output, self.activation, mask)?;
        Ok(loss + network_l1 + network_l2)
    }

    /// Per-example score column `[batch, 1]`, with the regularization
    /// terms added to every row.
    pub fn score_per_example(
        &self,
        trace: &Trace,
        labels: &Array2<f64>,
        label_mask: Option<&ArrayD<f64>>,
        network_l1: f64,
        network_l2: f64,
    ) -> Result<Array2<f64>> {
        let layer = layer_trace(trace)?;
        let mask = label_mask.or(layer.mask.as_ref());
        let mut col = self
            .loss
            .score_array(labels, &layer.pre_output, self.activation, mask)?;
        col.mapv_inplace(|v| v + network_l1 + network_l2);
        Ok(col)
    }
}

fn layer_trace(trace: &Trace) -> Result<&LayerTrace> {
    match trace {
        Trace::Layer(layer) => Ok(layer),
        _ => Err(Error::InvalidInput {
            kind: KIND,
            detail: "backward called without a layer trace".into(),
        }),
    }
}

impl Vertex for LossLayer {
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

    fn memory_report(&self, inputs: &[TensorShape]) -> Result<MemoryReport> {
        self.output_shape(inputs)?;
        // no parameters, but the trace caches the input per example
        Ok(MemoryReport::for_layer(
            0,
            Dim::Known(0),
            inputs[0].flattened_size(),
        ))
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
        let z = arr
            .view()
            .into_dimensionality::<Ix2>()
            .map(|v| v.to_owned())
            .map_err(|_| Error::InvalidInput {
                kind: KIND,
                detail: format!("expected rank-2 input, got rank {}", arr.ndim()),
            })?;
        let a = self.activation.apply(&z);

        let mask = input.mask(0).cloned();
        let trace = Trace::Layer(LayerTrace {
            input: z.clone(),
            pre_output: z,
            noisy_weight: None,
            mask: mask.clone(),
        });
        Ok((
            Activations::single_masked(a.into_dyn(), mask, input.mask_state(0)),
            trace,
        ))
    }

    /// Loss layers need labels to compute their delta; the executor must
    /// call [`LossLayer::backward_labelled`].
    fn backward(
        &self,
        _params: &[f64],
        _grad_view: &mut [f64],
        _trace: &Trace,
        _epsilon: &Gradients,
    ) -> Result<Gradients> {
        Err(Error::InvalidInput {
            kind: KIND,
            detail: "loss layers are differentiated against labels, \
                     not an incoming epsilon"
                .into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    fn forward_trace(layer: &LossLayer, x: Array2<f64>) -> Trace {
        let input = Activations::single(x.into_dyn());
        let (_, trace) = layer.forward(&[], &input, false, &mut rng()).unwrap();
        trace
    }

    #[test]
    fn test_shape_passthrough() {
        let layer = LossLayer::new(Loss::Mse);
        let ff = TensorShape::feed_forward(3);
        assert_eq!(layer.output_shape(&[ff.clone()]).unwrap(), ff);
        assert!(matches!(
            layer.output_shape(&[TensorShape::recurrent(3, 4)]),
            Err(Error::UnsupportedShape { kind: "loss", .. })
        ));
    }

    #[test]
    fn test_trait_backward_rejected() {
        let layer = LossLayer::new(Loss::Mse);
        let trace = forward_trace(&layer, array![[1.0, 2.0]]);
        let eps = Gradients::single(array![[1.0, 1.0]].into_dyn());
        assert!(matches!(
            layer.backward(&[], &mut [], &trace, &eps),
            Err(Error::InvalidInput { kind: "loss", .. })
        ));
    }

    #[test]
    fn test_backward_labelled_delta_is_input_epsilon() {
        let layer = LossLayer::new(Loss::Mse);
        let trace = forward_trace(&layer, array![[1.0, 2.0]]);
        // identity activation: delta = 2(a - y)/n_out = [1, 2]
        let labels = array![[0.0, 0.0]];
        let back = layer.backward_labelled(&trace, &labels, None).unwrap();
        let g = back.get(0).unwrap();
        assert_relative_eq!(g[[0, 0]], 1.0);
        assert_relative_eq!(g[[0, 1]], 2.0);
    }

    #[test]
    fn test_score_is_mean_loss_plus_penalties() {
        let layer = LossLayer::new(Loss::Mse);
        let trace = forward_trace(&layer, array![[1.0, 2.0]]);
        let labels = array![[0.0, 0.0]];
        // per-example loss = (1 + 4)/2 = 2.5
        let score = layer
            .compute_score(&trace, &labels, None, 0.25, 0.75)
            .unwrap();
        assert_relative_eq!(score, 3.5);
    }

    #[test]
    fn test_sigmoid_activation_applied() {
        let layer = LossLayer::new(Loss::Mse).activation(Activation::Sigmoid);
        let input = Activations::single(array![[0.0]].into_dyn());
        let (out, _) = layer.forward(&[], &input, false, &mut rng()).unwrap();
        assert_relative_eq!(out.get(0).unwrap()[[0, 0]], 0.5);
    }
}
