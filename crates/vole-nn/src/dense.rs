// Dense (fully connected) layer: z = x·W + b, a = f(z).
//
// Parameters live in the layer's view of the flat model buffer, laid out
// weights first in row-major [n_in, n_out] order, then the bias [n_out].
// The forward pass never copies parameters (noise-perturbed weights are
// the one exception, and those live only in the trace); the backward pass
// writes parameter gradients straight into the flat gradient view.

use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Axis, Ix2};
use rand::rngs::StdRng;

use vole_core::{
    Activations, Dim, Error, Gradients, MemoryReport, Result, TensorShape,
};

use crate::activation::Activation;
use crate::init::WeightInit;
use crate::loss::apply_mask;
use crate::noise::WeightNoise;
use crate::vertex::{expect_len, LayerTrace, Trace, Vertex};

const KIND: &str = "dense";

/// Fully connected layer.
#[derive(Debug, Clone, Copy)]
pub struct DenseLayer {
    n_in: usize,
    n_out: usize,
    activation: Activation,
    weight_init: WeightInit,
    noise: Option<WeightNoise>,
    bias: bool,
    l1: f64,
    l2: f64,
}

impl DenseLayer {
    pub fn new(n_in: usize, n_out: usize) -> Self {
        DenseLayer {
            n_in,
            n_out,
            activation: Activation::default(),
            weight_init: WeightInit::default(),
            noise: None,
            bias: true,
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

    pub fn weight_noise(mut self, noise: WeightNoise) -> Self {
        self.noise = Some(noise);
        self
    }

    /// Disable the bias term; the parameter view then holds weights only.
    pub fn has_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
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

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }
}

impl Vertex for DenseLayer {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn param_count(&self) -> usize {
        if self.bias {
            linear_param_count(self.n_in, self.n_out)
        } else {
            self.n_in * self.n_out
        }
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        check_fan_in(KIND, &inputs[0], self.n_in)?;
        Ok(TensorShape::feed_forward(self.n_out))
    }

    fn memory_report(&self, inputs: &[TensorShape]) -> Result<MemoryReport> {
        self.output_shape(inputs)?;
        // trace caches the input and the pre-activation output per example
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
        training: bool,
        rng: &mut StdRng,
    ) -> Result<(Activations, Trace)> {
        expect_len(KIND, self.param_count(), params.len())?;
        self.arity().check(KIND, input.len())?;
        let x = rank2_input(KIND, input, self.n_in)?;

        let weight = weight_view(KIND, params, self.n_in, self.n_out)?;
        let bias = bias_view(params, self.n_in, self.n_out);

        let noisy = match (&self.noise, training) {
            (Some(noise), true) => Some(noise.apply(&weight.to_owned(), rng)?),
            _ => None,
        };
        let w_used = noisy.as_ref().map(Array2::view).unwrap_or(weight);

        let z = linear(&x, &w_used, bias);
        let mut a = self.activation.apply(&z);

        let mask = input.mask(0).cloned();
        if let (Some(m), vole_core::MaskState::Active) = (&mask, input.mask_state(0)) {
            apply_mask(KIND, &mut a, m)?;
        }

        let trace = Trace::Layer(LayerTrace {
            input: x.to_owned(),
            pre_output: z,
            noisy_weight: noisy,
            mask: mask.clone(),
        });
        Ok((
            Activations::single_masked(a.into_dyn(), mask, input.mask_state(0)),
            trace,
        ))
    }

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
        let eps = rank2_epsilon(KIND, epsilon, self.n_out)?;

        let mut delta = self.activation.backprop(&layer.pre_output, &eps);
        if let Some(m) = &layer.mask {
            apply_mask(KIND, &mut delta, m)?;
        }

        let weight = weight_view(KIND, params, self.n_in, self.n_out)?;
        let w_used = layer
            .noisy_weight
            .as_ref()
            .map(Array2::view)
            .unwrap_or(weight);

        let eps_next =
            write_linear_grads(grad_view, self.n_in, self.n_out, &layer.input, &delta, &w_used)?;
        Ok(Gradients::single(eps_next.into_dyn()))
    }

    fn score_penalty(&self, params: &[f64]) -> (f64, f64) {
        weight_penalty(params, self.n_in, self.n_out, self.l1, self.l2)
    }
}

/// Parameter count of one weight matrix plus its bias.
pub(crate) fn linear_param_count(n_in: usize, n_out: usize) -> usize {
    n_in * n_out + n_out
}

/// View the weight portion of a parameter slice as [n_in, n_out].
pub(crate) fn weight_view<'a>(
    kind: &'static str,
    params: &'a [f64],
    n_in: usize,
    n_out: usize,
) -> Result<ArrayView2<'a, f64>> {
    ArrayView2::from_shape((n_in, n_out), &params[..n_in * n_out])
        .map_err(|e| Error::InvalidInput {
            kind,
            detail: e.to_string(),
        })
}

/// The bias portion of a parameter slice.
pub(crate) fn bias_view(params: &[f64], n_in: usize, n_out: usize) -> &[f64] {
    &params[n_in * n_out..]
}

/// z = x·W + b.
pub(crate) fn linear(x: &Array2<f64>, w: &ArrayView2<f64>, bias: &[f64]) -> Array2<f64> {
    let mut z = x.dot(w);
    for mut row in z.axis_iter_mut(Axis(0)) {
        row.iter_mut().zip(bias.iter()).for_each(|(v, &b)| *v += b);
    }
    z
}

/// Pull the single rank-2 input of a layer, validating its fan-in.
pub(crate) fn rank2_input(
    kind: &'static str,
    input: &Activations,
    n_in: usize,
) -> Result<Array2<f64>> {
    let arr = input.required(0, kind)?;
    let x = arr
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::InvalidInput {
            kind,
            detail: format!("expected rank-2 input, got rank {}", arr.ndim()),
        })?;
    if x.ncols() != n_in {
        return Err(Error::SizeMismatch {
            kind,
            expected: n_in,
            got: x.ncols(),
        });
    }
    Ok(x.to_owned())
}

/// Pull the single rank-2 epsilon arriving at a layer.
pub(crate) fn rank2_epsilon(
    kind: &'static str,
    epsilon: &Gradients,
    n_out: usize,
) -> Result<Array2<f64>> {
    let arr = epsilon.required(0, kind)?;
    let eps = arr
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::InvalidInput {
            kind,
            detail: format!("expected rank-2 epsilon, got rank {}", arr.ndim()),
        })?;
    if eps.ncols() != n_out {
        return Err(Error::SizeMismatch {
            kind,
            expected: n_out,
            got: eps.ncols(),
        });
    }
    Ok(eps.to_owned())
}

/// Write dW = xᵀ·delta and db = column sums of delta into the flat
/// gradient view, and return the epsilon for the layer's input,
/// delta·Wᵀ.
pub(crate) fn write_linear_grads(
    grad_view: &mut [f64],
    n_in: usize,
    n_out: usize,
    x: &Array2<f64>,
    delta: &Array2<f64>,
    w: &ArrayView2<f64>,
) -> Result<Array2<f64>> {
    let w_len = n_in * n_out;
    let (w_grad, b_grad) = grad_view.split_at_mut(w_len);
    let mut wg = ArrayViewMut2::from_shape((n_in, n_out), w_grad)
        .map_err(|e| Error::msg(e.to_string()))?;
    general_mat_mul(1.0, &x.t(), delta, 0.0, &mut wg);

    // layers without a bias pass a weights-only gradient view
    if !b_grad.is_empty() {
        let sums = delta.sum_axis(Axis(0));
        b_grad.copy_from_slice(sums.as_slice().ok_or_else(|| {
            Error::msg("bias gradient is not contiguous")
        })?);
    }

    Ok(delta.dot(&w.t()))
}

/// (l1, l2) penalty over the weight portion of a parameter view. The
/// bias is exempt from regularization.
pub(crate) fn weight_penalty(
    params: &[f64],
    n_in: usize,
    n_out: usize,
    l1: f64,
    l2: f64,
) -> (f64, f64) {
    if (l1 == 0.0 && l2 == 0.0) || params.len() < n_in * n_out {
        return (0.0, 0.0);
    }
    let weights = &params[..n_in * n_out];
    let abs_sum: f64 = weights.iter().map(|w| w.abs()).sum();
    let sq_sum: f64 = weights.iter().map(|w| w * w).sum();
    (l1 * abs_sum, 0.5 * l2 * sq_sum)
}

/// Reject layer input shapes whose known feature size disagrees with the
/// declared fan-in. Unknown sizes pass; they are rechecked at runtime.
pub(crate) fn check_fan_in(
    kind: &'static str,
    input: &TensorShape,
    n_in: usize,
) -> Result<()> {
    match input {
        TensorShape::FeedForward { .. } | TensorShape::ConvolutionalFlat { .. } => {
            if let Dim::Known(n) = input.flattened_size() {
                if n != n_in {
                    return Err(Error::IncompatibleShapes {
                        kind,
                        detail: format!("input size {n} does not match fan-in {n_in}"),
                    });
                }
            }
            Ok(())
        }
        other => Err(Error::UnsupportedShape {
            kind,
            shape: other.clone(),
        }),
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

    // weights [2, 2] = [[1, 0], [0, 2]], bias = [0.5, -0.5]
    const PARAMS: [f64; 6] = [1.0, 0.0, 0.0, 2.0, 0.5, -0.5];

    #[test]
    fn test_param_count_and_shape() {
        let layer = DenseLayer::new(3, 5);
        assert_eq!(layer.param_count(), 20);
        assert_eq!(
            layer.output_shape(&[TensorShape::feed_forward(3)]).unwrap(),
            TensorShape::feed_forward(5)
        );
        assert!(layer
            .output_shape(&[TensorShape::feed_forward(4)])
            .is_err());
        assert!(layer
            .output_shape(&[TensorShape::recurrent(3, 2)])
            .is_err());
    }

    #[test]
    fn test_unknown_input_size_accepted() {
        let layer = DenseLayer::new(3, 5);
        assert!(layer
            .output_shape(&[TensorShape::feed_forward(Dim::Unknown)])
            .is_ok());
    }

    #[test]
    fn test_forward_linear() {
        let layer = DenseLayer::new(2, 2);
        let input = Activations::single(array![[1.0, 1.0]].into_dyn());
        let (out, _) = layer.forward(&PARAMS, &input, false, &mut rng()).unwrap();
        let a = out.get(0).unwrap();
        // [1, 1]·[[1,0],[0,2]] + [0.5, -0.5] = [1.5, 1.5]
        assert_relative_eq!(a[[0, 0]], 1.5);
        assert_relative_eq!(a[[0, 1]], 1.5);
    }

    #[test]
    fn test_backward_grads_and_epsilon() {
        let layer = DenseLayer::new(2, 2);
        let input = Activations::single(array![[1.0, 2.0]].into_dyn());
        let (_, trace) = layer.forward(&PARAMS, &input, false, &mut rng()).unwrap();

        let eps = Gradients::single(array![[1.0, 1.0]].into_dyn());
        let mut grads = [0.0; 6];
        let back = layer.backward(&PARAMS, &mut grads, &trace, &eps).unwrap();

        // dW = xᵀ·delta = [[1],[2]]·[1,1] = [[1,1],[2,2]]
        assert_eq!(&grads[..4], &[1.0, 1.0, 2.0, 2.0]);
        // db = [1, 1]
        assert_eq!(&grads[4..], &[1.0, 1.0]);
        // eps_next = delta·Wᵀ = [1, 2]
        let next = back.get(0).unwrap();
        assert_relative_eq!(next[[0, 0]], 1.0);
        assert_relative_eq!(next[[0, 1]], 2.0);
    }

    #[test]
    fn test_mask_zeroes_padded_rows() {
        let layer = DenseLayer::new(2, 2);
        let mask = ndarray::ArrayD::from_shape_vec(vec![2, 1], vec![1.0, 0.0]).unwrap();
        let input = Activations::single_masked(
            array![[1.0, 1.0], [1.0, 1.0]].into_dyn(),
            Some(mask),
            vole_core::MaskState::Active,
        );
        let (out, trace) = layer.forward(&PARAMS, &input, false, &mut rng()).unwrap();
        let a = out.get(0).unwrap();
        assert_relative_eq!(a[[1, 0]], 0.0);
        assert_relative_eq!(a[[1, 1]], 0.0);

        // masked rows contribute nothing to the bias gradient
        let eps = Gradients::single(array![[1.0, 1.0], [1.0, 1.0]].into_dyn());
        let mut grads = [0.0; 6];
        layer.backward(&PARAMS, &mut grads, &trace, &eps).unwrap();
        assert_eq!(&grads[4..], &[1.0, 1.0]);
    }

    #[test]
    fn test_noise_recorded_and_reused() {
        let layer =
            DenseLayer::new(2, 2).weight_noise(WeightNoise::DropConnect { keep: 0.0 });
        let input = Activations::single(array![[1.0, 1.0]].into_dyn());
        let (out, trace) = layer.forward(&PARAMS, &input, true, &mut rng()).unwrap();
        // all weights dropped: output is just the bias
        let a = out.get(0).unwrap();
        assert_relative_eq!(a[[0, 0]], 0.5);
        assert_relative_eq!(a[[0, 1]], -0.5);

        // backward uses the same dropped weights: eps_next is zero
        let eps = Gradients::single(array![[1.0, 1.0]].into_dyn());
        let mut grads = [0.0; 6];
        let back = layer.backward(&PARAMS, &mut grads, &trace, &eps).unwrap();
        assert!(back.get(0).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_inference_skips_noise() {
        let layer =
            DenseLayer::new(2, 2).weight_noise(WeightNoise::DropConnect { keep: 0.0 });
        let input = Activations::single(array![[1.0, 1.0]].into_dyn());
        let (out, _) = layer.forward(&PARAMS, &input, false, &mut rng()).unwrap();
        assert_relative_eq!(out.get(0).unwrap()[[0, 0]], 1.5);
    }

    #[test]
    fn test_training_forwards_draw_fresh_noise() {
        let layer =
            DenseLayer::new(2, 2).weight_noise(WeightNoise::Additive { std: 1.0 });
        let input = Activations::single(array![[1.0, 1.0]].into_dyn());
        let mut r = rng();
        let (first, _) = layer.forward(&PARAMS, &input, true, &mut r).unwrap();
        let (second, _) = layer.forward(&PARAMS, &input, true, &mut r).unwrap();
        assert_ne!(first.get(0).unwrap(), second.get(0).unwrap());
    }

    #[test]
    fn test_without_bias() {
        let layer = DenseLayer::new(2, 2).has_bias(false);
        assert_eq!(layer.param_count(), 4);

        let input = Activations::single(array![[1.0, 1.0]].into_dyn());
        let (out, trace) = layer
            .forward(&PARAMS[..4], &input, false, &mut rng())
            .unwrap();
        // no bias offset: [1, 1]·[[1,0],[0,2]] = [1, 2]
        let a = out.get(0).unwrap();
        assert_relative_eq!(a[[0, 0]], 1.0);
        assert_relative_eq!(a[[0, 1]], 2.0);

        let eps = Gradients::single(array![[1.0, 1.0]].into_dyn());
        let mut grads = [0.0; 4];
        layer
            .backward(&PARAMS[..4], &mut grads, &trace, &eps)
            .unwrap();
        assert_eq!(&grads, &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_score_penalty() {
        let layer = DenseLayer::new(2, 2).l1(0.1).l2(0.2);
        let (l1, l2) = layer.score_penalty(&PARAMS);
        // |w| sums to 3, w² sums to 5; bias excluded
        assert_relative_eq!(l1, 0.3);
        assert_relative_eq!(l2, 0.5);
    }

    #[test]
    fn test_init_zero_bias() {
        let layer = DenseLayer::new(4, 3).weight_init(WeightInit::Xavier);
        let mut params = vec![9.0; layer.param_count()];
        layer.init_params(&mut params, &mut rng()).unwrap();
        assert!(params[12..].iter().all(|&b| b == 0.0));
        assert!(params[..12].iter().any(|&w| w != 0.0));
    }

    #[test]
    fn test_wrong_param_len() {
        let layer = DenseLayer::new(2, 2);
        let input = Activations::single(array![[1.0, 1.0]].into_dyn());
        assert!(matches!(
            layer.forward(&PARAMS[..4], &input, false, &mut rng()),
            Err(Error::SizeMismatch { kind: "dense", .. })
        ));
    }
}
