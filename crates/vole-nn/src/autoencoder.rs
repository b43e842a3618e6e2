// Denoising autoencoder layer.
//
// Parameters are a single tied weight matrix plus two biases, laid out
// W [n_visible, n_hidden], then the hidden bias [n_hidden], then the
// visible bias [n_visible]. Encoding is y = f(x·W + hb); decoding reuses
// the transposed weights, z = f(y·Wᵀ + vb).
//
// Inside a graph the layer behaves like a dense layer over (W, hb): the
// supervised backward pass never touches the visible bias. The
// unsupervised pretraining step is a separate entry point that corrupts
// the input, reconstructs it, and writes gradients for all three
// parameter groups.

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;

use vole_core::{
    Activations, Dim, Error, Gradients, MemoryReport, Result, TensorShape,
};

use crate::activation::Activation;
use crate::dense::{
    check_fan_in, linear, rank2_input, weight_penalty, weight_view, write_linear_grads,
};
use crate::init::WeightInit;
use crate::loss::Loss;
use crate::vertex::{expect_len, LayerTrace, Trace, Vertex};

const KIND: &str = "autoencoder";

/// Denoising autoencoder with tied encode/decode weights.
#[derive(Debug, Clone, Copy)]
pub struct AutoEncoder {
    n_visible: usize,
    n_hidden: usize,
    activation: Activation,
    weight_init: WeightInit,
    /// Reconstruction loss reported by pretraining.
    loss: Loss,
    /// Probability of zeroing each input element during pretraining.
    corruption: f64,
    /// Sparsity target; zero disables the sparsity penalty.
    sparsity: f64,
    l1: f64,
    l2: f64,
}

impl AutoEncoder {
    pub fn new(n_visible: usize, n_hidden: usize) -> Self {
        AutoEncoder {
            n_visible,
            n_hidden,
            activation: Activation::Sigmoid,
            weight_init: WeightInit::default(),
            loss: Loss::Mse,
            corruption: 0.0,
            sparsity: 0.0,
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

    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    pub fn corruption(mut self, level: f64) -> Self {
        self.corruption = level;
        self
    }

    pub fn sparsity(mut self, target: f64) -> Self {
        self.sparsity = target;
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

    fn w_len(&self) -> usize {
        self.n_visible * self.n_hidden
    }

    fn hidden_bias<'a>(&self, params: &'a [f64]) -> &'a [f64] {
        &params[self.w_len()..self.w_len() + self.n_hidden]
    }

    fn visible_bias<'a>(&self, params: &'a [f64]) -> &'a [f64] {
        &params[self.w_len() + self.n_hidden..]
    }

    /// y = f(x·W + hb).
    pub fn encode(&self, params: &[f64], x: &Array2<f64>) -> Result<Array2<f64>> {
        expect_len(KIND, self.param_count(), params.len())?;
        let w = weight_view(KIND, params, self.n_visible, self.n_hidden)?;
        Ok(self.activation.apply(&linear(x, &w, self.hidden_bias(params))))
    }

    /// z = f(y·Wᵀ + vb).
    pub fn decode(&self, params: &[f64], y: &Array2<f64>) -> Result<Array2<f64>> {
        expect_len(KIND, self.param_count(), params.len())?;
        let w = weight_view(KIND, params, self.n_visible, self.n_hidden)?;
        let wt = w.t();
        Ok(self
            .activation
            .apply(&linear(y, &wt, self.visible_bias(params))))
    }

    /// Encode then decode, without corruption.
    pub fn reconstruct(&self, params: &[f64], x: &Array2<f64>) -> Result<Array2<f64>> {
        let y = self.encode(params, x)?;
        self.decode(params, &y)
    }

    /// Hidden state given a visible state. Deterministic for an
    /// autoencoder: both the distribution parameters and the sample are
    /// the encoder activations.
    pub fn sample_hidden_given_visible(
        &self,
        params: &[f64],
        visible: &Array2<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let y = self.encode(params, visible)?;
        Ok((y.clone(), y))
    }

    /// Visible state given a hidden state; deterministic, like
    /// [`AutoEncoder::sample_hidden_given_visible`].
    pub fn sample_visible_given_hidden(
        &self,
        params: &[f64],
        hidden: &Array2<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let z = self.decode(params, hidden)?;
        Ok((z.clone(), z))
    }

    /// One unsupervised pretraining step: corrupt, reconstruct, and write
    /// the gradients for all three parameter groups into `grad_view`.
    /// Returns the mean reconstruction error over the minibatch, per the
    /// configured loss.
    pub fn pretrain_gradient(
        &self,
        params: &[f64],
        grad_view: &mut [f64],
        x: &Array2<f64>,
        rng: &mut StdRng,
    ) -> Result<f64> {
        expect_len(KIND, self.param_count(), params.len())?;
        expect_len(KIND, self.param_count(), grad_view.len())?;
        if x.ncols() != self.n_visible {
            return Err(Error::SizeMismatch {
                kind: KIND,
                expected: self.n_visible,
                got: x.ncols(),
            });
        }
        if !(0.0..1.0).contains(&self.corruption) {
            return Err(Error::InvalidInput {
                kind: KIND,
                detail: format!("corruption level {} outside [0, 1)", self.corruption),
            });
        }

        let corrupted = if self.corruption > 0.0 {
            let keep = 1.0 - self.corruption;
            x.mapv(|v| if rng.gen::<f64>() < keep { v } else { 0.0 })
        } else {
            x.clone()
        };

        let w = weight_view(KIND, params, self.n_visible, self.n_hidden)?;
        let pre_hidden = linear(&corrupted, &w, self.hidden_bias(params));
        let y = self.activation.apply(&pre_hidden);
        let wt = w.t();
        let z = self
            .activation
            .apply(&linear(&y, &wt, self.visible_bias(params)));

        let visible_loss: Array2<f64> = x - &z;
        let back = visible_loss.dot(&w);
        let hidden_loss = if self.sparsity > 0.0 {
            // sparsity target replaces the (1 - y) factor of the sigmoid
            // derivative: delta = back ∘ y ∘ (y - sparsity)
            let mut h = back;
            h.zip_mut_with(&y, |g, &v| *g *= v * (v - self.sparsity));
            h
        } else {
            self.activation.backprop(&pre_hidden, &back)
        };

        let w_grad = corrupted.t().dot(&hidden_loss) + visible_loss.t().dot(&y);
        let w_len = self.w_len();
        grad_view[..w_len].copy_from_slice(w_grad.as_slice().ok_or_else(|| {
            Error::msg("weight gradient is not contiguous")
        })?);
        let hb = hidden_loss.sum_axis(Axis(0));
        let vb = visible_loss.sum_axis(Axis(0));
        grad_view[w_len..w_len + self.n_hidden]
            .iter_mut()
            .zip(hb.iter())
            .for_each(|(g, &v)| *g = v);
        grad_view[w_len + self.n_hidden..]
            .iter_mut()
            .zip(vb.iter())
            .for_each(|(g, &v)| *g = v);

        self.loss.compute_score(x, &z, Activation::Identity, None)
    }
}

impl Vertex for AutoEncoder {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn param_count(&self) -> usize {
        self.w_len() + self.n_hidden + self.n_visible
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        check_fan_in(KIND, &inputs[0], self.n_visible)?;
        Ok(TensorShape::feed_forward(self.n_hidden))
    }

    fn memory_report(&self, inputs: &[TensorShape]) -> Result<MemoryReport> {
        self.output_shape(inputs)?;
        Ok(MemoryReport::for_layer(
            self.param_count(),
            Dim::Known(self.n_hidden + self.n_visible),
            Dim::Known(self.n_visible + self.n_hidden),
        ))
    }

    fn init_params(&self, params: &mut [f64], rng: &mut StdRng) -> Result<()> {
        expect_len(KIND, self.param_count(), params.len())?;
        let w_len = self.w_len();
        self.weight_init
            .fill(self.n_visible, self.n_hidden, &mut params[..w_len], rng)?;
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
        let x = rank2_input(KIND, input, self.n_visible)?;

        let w = weight_view(KIND, params, self.n_visible, self.n_hidden)?;
        let z = linear(&x, &w, self.hidden_bias(params));
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

    /// Supervised backward through the encoder half. The visible bias
    /// takes no gradient here; only pretraining updates it.
    fn backward(
        &self,
        params: &[f64],
        grad_view: &mut [f64],
        trace: &Trace,
        epsilon: &Gradients,
    ) -> Result<Gradients> {
        expect_len(KIND, self.param_count(), params.len())?;
        expect_len(KIND, self.param_count(), grad_view.len())?;
        let Trace::Layer(layer) = trace else {
            return Err(Error::InvalidInput {
                kind: KIND,
                detail: "backward called without a layer trace".into(),
            });
        };
        let eps = crate::dense::rank2_epsilon(KIND, epsilon, self.n_hidden)?;
        let delta = self.activation.backprop(&layer.pre_output, &eps);

        let w = weight_view(KIND, params, self.n_visible, self.n_hidden)?;
        let encoder_len = self.w_len() + self.n_hidden;
        grad_view[encoder_len..].fill(0.0);
        let eps_next = write_linear_grads(
            &mut grad_view[..encoder_len],
            self.n_visible,
            self.n_hidden,
            &layer.input,
            &delta,
            &w,
        )?;
        Ok(Gradients::single(eps_next.into_dyn()))
    }

    fn score_penalty(&self, params: &[f64]) -> (f64, f64) {
        weight_penalty(params, self.n_visible, self.n_hidden, self.l1, self.l2)
    }
}
