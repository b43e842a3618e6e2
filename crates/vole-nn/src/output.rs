// Output layer: a fully connected layer paired with a loss function.
//
// Forward is identical to a dense layer. Backward differs in where the
// initial delta comes from: instead of an epsilon flowing in from
// downstream, the loss gradient against the labels starts the chain.
// Labels are not part of the activations flowing through the graph, so
// the trait-level backward (which has no way to receive them) is an
// error; the executor calls `backward_labelled` instead.

use ndarray::{Array2, ArrayD};
use rand::rngs::StdRng;

use vole_core::{
    Activations, Dim, Error, Gradients, MemoryReport, Result, TensorShape,
};

use crate::activation::Activation;
use crate::dense::{
    bias_view, check_fan_in, linear, linear_param_count, rank2_input, weight_penalty,
    weight_view, write_linear_grads,
};
use crate::init::WeightInit;
use crate::loss::{apply_mask, Loss};
use crate::vertex::{expect_len, LayerTrace, Trace, Vertex};

const KIND: &str = "output";

/// Fully connected output layer with an attached loss.
#[derive(Debug, Clone, Copy)]
pub struct OutputLayer {
    n_in: usize,
    n_out: usize,
    activation: Activation,
    loss: Loss,
    weight_init: WeightInit,
    l1: f64,
    l2: f64,
}

impl OutputLayer {
    pub fn new(n_in: usize, n_out: usize, loss: Loss) -> Self {
        OutputLayer {
            n_in,
            n_out,
            activation: Activation::default(),
            loss,
            weight_init: WeightInit::default(),
            l1: 0.0,
            l2: 0.0,
        }
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn weight_init(mut self, init: WeightInit) -> Self {
        self.weight_init = init;
        self
    }

    pub fn l1(mut self, l1: f64) -> Self {
        self.l1 = l1;
        self
    }

    pub fn l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    /// Backward pass seeded by the loss gradient against `labels`.
    /// Parameter gradients go into `grad_view`; the returned bundle
    /// carries the epsilon for this layer's input.
    pub fn backward_labelled(
        &self,
        params: &[f64],
        grad_view: &mut [f64],
        trace: &Trace,
        labels: &Array2<f64>,
        label_mask: Option<&ArrayD<f64>>,
    ) -> Result<Gradients> {
        expect_len(KIND, self.param_count(), params.len())?;
        expect_len(KIND, self.param_count(), grad_view.len())?;
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

        let weight = weight_view(KIND, params, self.n_in, self.n_out)?;
        let eps_next =
            write_linear_grads(grad_view, self.n_in, self.n_out, &layer.input, &delta, &weight)?;
        Ok(Gradients::single(eps_next.into_dyn()))
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

impl Vertex for OutputLayer {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn param_count(&self) -> usize {
        linear_param_count(self.n_in, self.n_out)
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        check_fan_in(KIND, &inputs[0], self.n_in)?;
        Ok(TensorShape::feed_forward(self.n_out))
    }

    fn memory_report(&self, inputs: &[TensorShape]) -> Result<MemoryReport> {
        self.output_shape(inputs)?;
        Ok(MemoryReport::for_layer(
            self.param_count(),
            Dim::Known(self.n_out),
            Dim::Known(self.n_in + self.n_out),
        ))
    }

    fn init_params(&self, params: &mut [f64], rng: &mut StdRng) -> Result<()> {
        expect_len(KIND, self.param_count(), params.len())?;
        let w_len = self.n_in * self.n_out;
        self.weight_init
            .fill(self.n_in, self.n_out, &mut params[..w_len], rng)?;
        params[w_len..].fill(0.0);
        Ok(())
    }

    fn forward(
        &self,
        params: &[f64],
        input: &Activations,
        _training: bool,
        _rng: &mut StdRng,
    ) -> Result<(Activations, Trace)> {
        expect_len(KIND, self.param_count(), params.len())?;
        self.arity().check(KIND, input.len())?;
        let x = rank2_input(KIND, input, self.n_in)?;

        let weight = weight_view(KIND, params, self.n_in, self.n_out)?;
        let bias = bias_view(params, self.n_in, self.n_out);
        let z = linear(&x, &weight, bias);
        let a = self.activation.apply(&z);

        let mask = input.mask(0).cloned();
        let trace = Trace::Layer(LayerTrace {
            input: x,
            pre_output: z,
            noisy_weight: None,
            mask: mask.clone(),
        });
        Ok((
            Activations::single_masked(a.into_dyn(), mask, input.mask_state(0)),
            trace,
        ))
    }

    /// Output layers need labels to compute their delta; the executor
    /// must call [`OutputLayer::backward_labelled`].
    fn backward(
        &self,
        _params: &[f64],
        _grad_view: &mut [f64],
        _trace: &Trace,
        _epsilon: &Gradients,
    ) -> Result<Gradients> {
        Err(Error::InvalidInput {
            kind: KIND,
            detail: "output layers are differentiated against labels, \
                     not an incoming epsilon"
                .into(),
        })
    }

    fn score_penalty(&self, params: &[f64]) -> (f64, f64) {
        weight_penalty(params, self.n_in, self.n_out, self.l1, self.l2)
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

    // identity weights, zero bias
    const PARAMS: [f64; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

    fn forward_trace(layer: &OutputLayer, x: Array2<f64>) -> Trace {
        let input = Activations::single(x.into_dyn());
        let (_, trace) = layer.forward(&PARAMS, &input, false, &mut rng()).unwrap();
        trace
    }

    #[test]
    fn test_trait_backward_rejected() {
        let layer = OutputLayer::new(2, 2, Loss::Mse);
        let trace = forward_trace(&layer, array![[1.0, 2.0]]);
        let eps = Gradients::single(array![[1.0, 1.0]].into_dyn());
        let mut grads = [0.0; 6];
        assert!(matches!(
            layer.backward(&PARAMS, &mut grads, &trace, &eps),
            Err(Error::InvalidInput { kind: "output", .. })
        ));
    }

    #[test]
    fn test_zero_loss_score_is_penalty_only() {
        let layer = OutputLayer::new(2, 2, Loss::Mse);
        let trace = forward_trace(&layer, array![[1.0, 2.0]]);
        // identity weights: output equals input, so these labels give zero loss
        let labels = array![[1.0, 2.0]];
        let score = layer
            .compute_score(&trace, &labels, None, 0.25, 0.75)
            .unwrap();
        assert_relative_eq!(score, 1.0);
    }

    #[test]
    fn test_backward_labelled_writes_grads() {
        let layer = OutputLayer::new(2, 2, Loss::Mse);
        let trace = forward_trace(&layer, array![[1.0, 0.0]]);
        // output = [1, 0]; labels = [0, 0]; delta = 2(a-y)/2 = [1, 0]
        let labels = array![[0.0, 0.0]];
        let mut grads = [0.0; 6];
        let back = layer
            .backward_labelled(&PARAMS, &mut grads, &trace, &labels, None)
            .unwrap();
        // dW = xᵀ·delta = [[1,0],[0,0]], db = [1, 0]
        assert_eq!(&grads[..4], &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(&grads[4..], &[1.0, 0.0]);
        // eps_next = delta·Wᵀ = [1, 0]
        assert_relative_eq!(back.get(0).unwrap()[[0, 0]], 1.0);
    }

    #[test]
    fn test_label_mask_zeroes_example() {
        let layer = OutputLayer::new(2, 2, Loss::Mse);
        let trace = forward_trace(&layer, array![[1.0, 0.0], [1.0, 0.0]]);
        let labels = array![[0.0, 0.0], [0.0, 0.0]];
        let mask = ArrayD::from_shape_vec(vec![2, 1], vec![1.0, 0.0]).unwrap();
        let mut grads = [0.0; 6];
        layer
            .backward_labelled(&PARAMS, &mut grads, &trace, &labels, Some(&mask))
            .unwrap();
        // only the first example contributes
        assert_eq!(&grads[4..], &[1.0, 0.0]);
    }

    #[test]
    fn test_score_per_example_adds_penalty_rows() {
        let layer = OutputLayer::new(2, 2, Loss::Mse);
        let trace = forward_trace(&layer, array![[1.0, 0.0], [0.0, 0.0]]);
        let labels = array![[0.0, 0.0], [0.0, 0.0]];
        let col = layer
            .score_per_example(&trace, &labels, None, 0.1, 0.2)
            .unwrap();
        assert_eq!(col.shape(), &[2, 1]);
        assert_relative_eq!(col[[0, 0]], 0.5 + 0.3);
        assert_relative_eq!(col[[1, 0]], 0.3);
    }
}
