// Loss functions.
//
// A loss is a config-time handle owned by output layers. Each variant
// provides three operations against (labels, pre-activation output,
// activation function):
//
//   score_array — per-example loss column [batch, 1], mask-reduced
//   gradient    — delta = dL/dz, substituted for the activation gradient
//                 in the output layer's backward pass
//
// Label masks come in two forms: a per-example column vector (rows are
// kept or dropped wholesale) or a full-shape array (per-output masking).

use ndarray::{Array2, ArrayD, Axis};

use vole_core::{Error, Result};

use crate::activation::Activation;

const CLAMP_EPS: f64 = 1e-7;

/// Loss function handle for output layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loss {
    /// Mean squared error: per-example sum((a−y)²) / n_out.
    #[default]
    Mse,
    /// Mean absolute error: per-example sum(|a−y|) / n_out.
    Mae,
    /// Binary cross-entropy on sigmoid-style outputs:
    /// per-example −sum(y·ln a + (1−y)·ln(1−a)).
    BinaryXent,
}

impl Loss {
    /// Per-example loss column of shape `[batch, 1]`.
    pub fn score_array(
        &self,
        labels: &Array2<f64>,
        pre_out: &Array2<f64>,
        activation: Activation,
        mask: Option<&ArrayD<f64>>,
    ) -> Result<Array2<f64>> {
        check_same_shape("loss", labels, pre_out)?;
        let out = activation.apply(pre_out);
        let mut per_elem = self.elementwise(labels, &out);
        if let Some(m) = mask {
            apply_mask("loss", &mut per_elem, m)?;
        }
        let col = per_elem.sum_axis(Axis(1));
        let batch = labels.nrows();
        Ok(col.into_shape((batch, 1)).map_err(|e| Error::msg(e.to_string()))?)
    }

    /// Scalar score: per-example losses summed and divided by the
    /// minibatch size.
    pub fn compute_score(
        &self,
        labels: &Array2<f64>,
        pre_out: &Array2<f64>,
        activation: Activation,
        mask: Option<&ArrayD<f64>>,
    ) -> Result<f64> {
        let col = self.score_array(labels, pre_out, activation, mask)?;
        let batch = labels.nrows().max(1);
        Ok(col.sum() / batch as f64)
    }

    /// Gradient of the loss with respect to the pre-activation output:
    /// delta = dL/da ∘ f'(z), with the mask applied to delta.
    pub fn gradient(
        &self,
        labels: &Array2<f64>,
        pre_out: &Array2<f64>,
        activation: Activation,
        mask: Option<&ArrayD<f64>>,
    ) -> Result<Array2<f64>> {
        check_same_shape("loss", labels, pre_out)?;
        let out = activation.apply(pre_out);
        let dlda = self.grad_wrt_output(labels, &out);
        let mut delta = activation.backprop(pre_out, &dlda);
        if let Some(m) = mask {
            apply_mask("loss", &mut delta, m)?;
        }
        Ok(delta)
    }

    /// Per-element loss values.
    fn elementwise(&self, labels: &Array2<f64>, out: &Array2<f64>) -> Array2<f64> {
        let n = out.ncols().max(1) as f64;
        match self {
            Loss::Mse => {
                let mut d = out - labels;
                d.mapv_inplace(|v| v * v / n);
                d
            }
            Loss::Mae => {
                let mut d = out - labels;
                d.mapv_inplace(|v| v.abs() / n);
                d
            }
            Loss::BinaryXent => {
                let mut l = out.clone();
                l.zip_mut_with(labels, |a, &y| {
                    let p = a.clamp(CLAMP_EPS, 1.0 - CLAMP_EPS);
                    *a = -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
                });
                l
            }
        }
    }

    /// dL/da, the gradient with respect to the activation output.
    fn grad_wrt_output(&self, labels: &Array2<f64>, out: &Array2<f64>) -> Array2<f64> {
        let n = out.ncols().max(1) as f64;
        match self {
            Loss::Mse => {
                let mut d = out - labels;
                d.mapv_inplace(|v| 2.0 * v / n);
                d
            }
            Loss::Mae => {
                let mut d = out - labels;
                d.mapv_inplace(|v| v.signum() / n);
                d
            }
            Loss::BinaryXent => {
                let mut d = out.clone();
                d.zip_mut_with(labels, |a, &y| {
                    let p = a.clamp(CLAMP_EPS, 1.0 - CLAMP_EPS);
                    *a = (p - y) / (p * (1.0 - p));
                });
                d
            }
        }
    }
}

/// Apply a mask to a rank-2 array in place.
///
/// A `[batch, 1]` or `[batch]` mask scales whole rows (per-example
/// masking); a mask with the array's exact shape is applied elementwise
/// (per-output masking). Anything else is an error.
pub(crate) fn apply_mask(
    kind: &'static str,
    to: &mut Array2<f64>,
    mask: &ArrayD<f64>,
) -> Result<()> {
    let per_example = match mask.ndim() {
        1 => mask.shape()[0] == to.nrows(),
        2 => mask.shape()[0] == to.nrows() && mask.shape()[1] == 1,
        _ => false,
    };
    if per_example {
        for (mut row, &m) in to.axis_iter_mut(Axis(0)).zip(mask.iter()) {
            row.mapv_inplace(|v| v * m);
        }
        return Ok(());
    }
    if mask.shape() == to.shape() {
        to.zip_mut_with(mask, |v, &m| *v *= m);
        return Ok(());
    }
    Err(Error::InvalidInput {
        kind,
        detail: format!(
            "mask shape {:?} matches neither per-example column [{},1] nor output shape {:?}",
            mask.shape(),
            to.nrows(),
            to.shape()
        ),
    })
}

fn check_same_shape(kind: &'static str, labels: &Array2<f64>, out: &Array2<f64>) -> Result<()> {
    if labels.shape() != out.shape() {
        return Err(Error::InvalidInput {
            kind,
            detail: format!(
                "labels shape {:?} does not match output shape {:?}",
                labels.shape(),
                out.shape()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_mse_zero_when_equal() {
        let y = array![[1.0, 2.0], [3.0, 4.0]];
        let score = Loss::Mse
            .compute_score(&y, &y, Activation::Identity, None)
            .unwrap();
        assert_relative_eq!(score, 0.0);
    }

    #[test]
    fn test_mse_score_and_gradient() {
        let labels = array![[0.0, 0.0]];
        let pre = array![[1.0, 3.0]];
        // per-example: (1 + 9) / 2 = 5
        let col = Loss::Mse
            .score_array(&labels, &pre, Activation::Identity, None)
            .unwrap();
        assert_relative_eq!(col[[0, 0]], 5.0);
        // delta = 2(a - y)/n = [1, 3]
        let delta = Loss::Mse
            .gradient(&labels, &pre, Activation::Identity, None)
            .unwrap();
        assert_relative_eq!(delta[[0, 0]], 1.0);
        assert_relative_eq!(delta[[0, 1]], 3.0);
    }

    #[test]
    fn test_score_divides_by_minibatch() {
        let labels = array![[0.0], [0.0]];
        let pre = array![[2.0], [4.0]];
        // per-example scores: 4 and 16; score = 20 / 2
        let score = Loss::Mse
            .compute_score(&labels, &pre, Activation::Identity, None)
            .unwrap();
        assert_relative_eq!(score, 10.0);
    }

    #[test]
    fn test_per_example_mask_drops_rows() {
        let labels = array![[0.0], [0.0]];
        let pre = array![[2.0], [4.0]];
        let mask = ArrayD::from_shape_vec(vec![2, 1], vec![1.0, 0.0]).unwrap();
        let col = Loss::Mse
            .score_array(&labels, &pre, Activation::Identity, Some(&mask))
            .unwrap();
        assert_relative_eq!(col[[0, 0]], 4.0);
        assert_relative_eq!(col[[1, 0]], 0.0);

        let delta = Loss::Mse
            .gradient(&labels, &pre, Activation::Identity, Some(&mask))
            .unwrap();
        assert_relative_eq!(delta[[1, 0]], 0.0);
    }

    #[test]
    fn test_bad_mask_shape_rejected() {
        let labels = array![[0.0, 0.0]];
        let pre = array![[1.0, 1.0]];
        let mask = ArrayD::from_shape_vec(vec![3], vec![1.0, 1.0, 1.0]).unwrap();
        assert!(matches!(
            Loss::Mse.score_array(&labels, &pre, Activation::Identity, Some(&mask)),
            Err(Error::InvalidInput { kind: "loss", .. })
        ));
    }

    #[test]
    fn test_label_shape_mismatch() {
        let labels = array![[0.0, 0.0]];
        let pre = array![[1.0]];
        assert!(Loss::Mse
            .compute_score(&labels, &pre, Activation::Identity, None)
            .is_err());
    }

    #[test]
    fn test_binary_xent_perfect_prediction() {
        let labels = array![[1.0, 0.0]];
        let pre = array![[10.0, -10.0]]; // sigmoid ≈ 1 and 0
        let score = Loss::BinaryXent
            .compute_score(&labels, &pre, Activation::Sigmoid, None)
            .unwrap();
        assert!(score < 1e-3);
    }

    #[test]
    fn test_mae_gradient_sign() {
        let labels = array![[1.0, 5.0]];
        let pre = array![[3.0, 2.0]];
        let delta = Loss::Mae
            .gradient(&labels, &pre, Activation::Identity, None)
            .unwrap();
        assert_relative_eq!(delta[[0, 0]], 0.5);
        assert_relative_eq!(delta[[0, 1]], -0.5);
    }
}
