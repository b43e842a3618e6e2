// Activation functions.
//
// A layer's activation is a config-time handle: a closed enum rather than
// a trait object, since the set is small and every variant needs both the
// function and its manual backprop rule.
//
// backprop(z, eps) computes delta = eps ∘ f'(z) — the gradient of the
// loss with respect to the pre-activation output z, given the gradient
// eps with respect to the activation output f(z).

use ndarray::Array2;

/// Elementwise activation function with a manual differentiation rule.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Activation {
    /// f(z) = z. The conventional choice for output layers whose loss
    /// handles the nonlinearity.
    #[default]
    Identity,
    /// f(z) = 1 / (1 + e^-z)
    Sigmoid,
    /// f(z) = tanh(z)
    Tanh,
    /// f(z) = max(0, z)
    Relu,
    /// f(z) = z for z > 0, alpha·z otherwise.
    LeakyRelu(f64),
}

impl Activation {
    /// Apply the activation elementwise.
    pub fn apply(&self, z: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Identity => z.clone(),
            Activation::Sigmoid => z.mapv(sigmoid),
            Activation::Tanh => z.mapv(f64::tanh),
            Activation::Relu => z.mapv(|v| v.max(0.0)),
            Activation::LeakyRelu(alpha) => {
                let a = *alpha;
                z.mapv(|v| if v > 0.0 { v } else { a * v })
            }
        }
    }

    /// Chain-rule step: delta = eps ∘ f'(z).
    pub fn backprop(&self, z: &Array2<f64>, eps: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Identity => eps.clone(),
            Activation::Sigmoid => {
                let mut out = z.mapv(|v| {
                    let s = sigmoid(v);
                    s * (1.0 - s)
                });
                out *= eps;
                out
            }
            Activation::Tanh => {
                let mut out = z.mapv(|v| 1.0 - v.tanh().powi(2));
                out *= eps;
                out
            }
            Activation::Relu => {
                let mut out = z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
                out *= eps;
                out
            }
            Activation::LeakyRelu(alpha) => {
                let a = *alpha;
                let mut out = z.mapv(|v| if v > 0.0 { 1.0 } else { a });
                out *= eps;
                out
            }
        }
    }
}

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}
