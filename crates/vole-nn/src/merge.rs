// Merge vertex: concatenates its inputs along the feature axis.
//
// Feed-forward inputs of sizes [a, b, ...] produce one output of size
// a + b + ...; recurrent inputs additionally require agreeing step
// counts; convolutional inputs require identical spatial dimensions and
// concatenate along depth. With a single input the vertex is an identity
// pass-through.
//
// The forward pass records each input's runtime shape so the backward
// pass can split the incoming epsilon back into per-input slices.

use ndarray::{Axis, Slice};
use rand::rngs::StdRng;

use vole_core::{
    Activations, Dim, Error, Gradients, MaskState, Result, TensorShape,
};

use crate::vertex::{ensure_no_params, expect_len, Arity, Trace, Vertex};

const KIND: &str = "merge";

/// Concatenation vertex. See the module docs for the shape rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct Merge;

impl Merge {
    pub fn new() -> Self {
        Merge
    }
}

impl Vertex for Merge {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn arity(&self) -> Arity {
        Arity::at_least(1)
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        let first = &inputs[0];
        if inputs.len() == 1 {
            return Ok(first.clone());
        }
        for other in &inputs[1..] {
            if other.kind_name() != first.kind_name() {
                return Err(Error::IncompatibleShapes {
                    kind: KIND,
                    detail: format!("cannot merge {first} with {other}"),
                });
            }
        }
        match first {
            TensorShape::FeedForward { .. } => {
                let size = sum_features(inputs);
                Ok(TensorShape::feed_forward(size))
            }
            TensorShape::Recurrent { steps, .. } => {
                let mut merged_steps = *steps;
                for other in &inputs[1..] {
                    let TensorShape::Recurrent { steps: s, .. } = other else {
                        unreachable!()
                    };
                    merged_steps = match (merged_steps, *s) {
                        (Dim::Known(a), Dim::Known(b)) if a != b => {
                            return Err(Error::IncompatibleShapes {
                                kind: KIND,
                                detail: format!(
                                    "recurrent inputs disagree on step count: {a} vs {b}"
                                ),
                            });
                        }
                        (Dim::Known(a), _) | (_, Dim::Known(a)) => Dim::Known(a),
                        _ => Dim::Unknown,
                    };
                }
                Ok(TensorShape::recurrent(sum_features(inputs), merged_steps))
            }
            TensorShape::Convolutional { height, width, .. } => {
                for other in &inputs[1..] {
                    let TensorShape::Convolutional { height: h, width: w, .. } = other
                    else {
                        unreachable!()
                    };
                    if h != height || w != width {
                        return Err(Error::IncompatibleShapes {
                            kind: KIND,
                            detail: format!(
                                "convolutional inputs disagree on spatial dims: \
                                 {height}x{width} vs {h}x{w}"
                            ),
                        });
                    }
                }
                Ok(TensorShape::convolutional(
                    *height,
                    *width,
                    sum_features(inputs),
                ))
            }
            // flattened convolutional data has lost its channel boundaries
            TensorShape::ConvolutionalFlat { .. } => Err(Error::UnsupportedShape {
                kind: KIND,
                shape: first.clone(),
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

        let mut views = Vec::with_capacity(input.len());
        let mut shapes = Vec::with_capacity(input.len());
        for i in 0..input.len() {
            let arr = input.required(i, KIND)?;
            shapes.push(arr.shape().to_vec());
            views.push(arr.view());
        }

        let out = if views.len() == 1 {
            views[0].to_owned()
        } else {
            ndarray::concatenate(Axis(1), &views).map_err(|e| Error::IncompatibleShapes {
                kind: KIND,
                detail: e.to_string(),
            })?
        };

        let mask = merged_mask(input)?;
        Ok((
            Activations::single_masked(out, mask, MaskState::Active),
            Trace::MergedShapes(shapes),
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
        let Trace::MergedShapes(shapes) = trace else {
            return Err(Error::InvalidInput {
                kind: KIND,
                detail: "backward called without a merge trace".into(),
            });
        };
        let eps = epsilon.required(0, KIND)?;
        let mut pieces = Vec::with_capacity(shapes.len());
        let mut offset = 0usize;
        for shape in shapes {
            let width = shape[1];
            let piece = eps
                .slice_axis(
                    Axis(1),
                    Slice::from(offset as isize..(offset + width) as isize),
                )
                .to_owned();
            offset += width;
            pieces.push(piece);
        }
        if offset != eps.shape()[1] {
            return Err(Error::IncompatibleShapes {
                kind: KIND,
                detail: format!(
                    "epsilon feature size {} does not match merged size {offset}",
                    eps.shape()[1]
                ),
            });
        }
        Ok(Gradients::from_epsilons(pieces))
    }
}

fn sum_features(inputs: &[TensorShape]) -> Dim {
    inputs
        .iter()
        .map(TensorShape::feature_size)
        .fold(Dim::Known(0), Dim::add)
}

/// Elementwise union of the input masks. If every input carries a mask
/// the result is their pointwise maximum; if any input has none, the
/// merged activations are unmasked.
fn merged_mask(input: &Activations) -> Result<Option<ndarray::ArrayD<f64>>> {
    let mut merged: Option<ndarray::ArrayD<f64>> = None;
    for i in 0..input.len() {
        let Some(mask) = input.mask(i) else {
            return Ok(None);
        };
        match &mut merged {
            None => merged = Some(mask.clone()),
            Some(acc) => {
                if acc.shape() != mask.shape() {
                    return Err(Error::IncompatibleShapes {
                        kind: KIND,
                        detail: format!(
                            "mask shapes disagree: {:?} vs {:?}",
                            acc.shape(),
                            mask.shape()
                        ),
                    });
                }
                acc.zip_mut_with(mask, |a, &b| *a = a.max(b));
            }
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    fn arr2(rows: usize, cols: usize, fill: f64) -> ArrayD<f64> {
        ArrayD::from_elem(vec![rows, cols], fill)
    }

    #[test]
    fn test_feed_forward_sizes_sum() {
        let out = Merge
            .output_shape(&[TensorShape::feed_forward(4), TensorShape::feed_forward(6)])
            .unwrap();
        assert_eq!(out, TensorShape::feed_forward(10));
    }

    #[test]
    fn test_unknown_size_propagates() {
        let out = Merge
            .output_shape(&[
                TensorShape::feed_forward(4),
                TensorShape::feed_forward(Dim::Unknown),
            ])
            .unwrap();
        assert_eq!(out, TensorShape::feed_forward(Dim::Unknown));
    }

    #[test]
    fn test_mixed_kinds_rejected() {
        assert!(matches!(
            Merge.output_shape(&[
                TensorShape::feed_forward(4),
                TensorShape::recurrent(4, 5)
            ]),
            Err(Error::IncompatibleShapes { kind: "merge", .. })
        ));
    }

    #[test]
    fn test_flattened_convolutional_rejected() {
        assert!(matches!(
            Merge.output_shape(&[
                TensorShape::convolutional_flat(4, 4, 2),
                TensorShape::convolutional_flat(4, 4, 3),
            ]),
            Err(Error::UnsupportedShape { kind: "merge", .. })
        ));
        // single input is still a passthrough
        let flat = TensorShape::convolutional_flat(4, 4, 2);
        assert_eq!(Merge.output_shape(&[flat.clone()]).unwrap(), flat);
    }

    #[test]
    fn test_convolutional_depths_sum() {
        let out = Merge
            .output_shape(&[
                TensorShape::convolutional(5, 5, 2),
                TensorShape::convolutional(5, 5, 3),
            ])
            .unwrap();
        assert_eq!(out, TensorShape::convolutional(5, 5, 5));
    }

    #[test]
    fn test_convolutional_unknown_depth_propagates() {
        let out = Merge
            .output_shape(&[
                TensorShape::convolutional(5, 5, 2),
                TensorShape::convolutional(5, 5, Dim::Unknown),
            ])
            .unwrap();
        assert_eq!(out, TensorShape::convolutional(5, 5, Dim::Unknown));
    }

    #[test]
    fn test_convolutional_spatial_mismatch_rejected() {
        assert!(matches!(
            Merge.output_shape(&[
                TensorShape::convolutional(5, 5, 2),
                TensorShape::convolutional(5, 4, 3),
            ]),
            Err(Error::IncompatibleShapes { kind: "merge", .. })
        ));
    }

    #[test]
    fn test_recurrent_step_disagreement() {
        assert!(Merge
            .output_shape(&[
                TensorShape::recurrent(2, 5),
                TensorShape::recurrent(3, 6)
            ])
            .is_err());
        // one unknown step count defers to the known one
        let out = Merge
            .output_shape(&[
                TensorShape::recurrent(2, 5),
                TensorShape::recurrent(3, Dim::Unknown),
            ])
            .unwrap();
        assert_eq!(out, TensorShape::recurrent(5, 5));
    }

    #[test]
    fn test_forward_concat_and_backward_split() {
        let mut input = Activations::unwired(2);
        input.set(0, arr2(2, 3, 1.0), None);
        input.set(1, arr2(2, 2, 2.0), None);

        let (out, trace) = Merge.forward(&[], &input, false, &mut rng()).unwrap();
        let merged = out.get(0).unwrap();
        assert_eq!(merged.shape(), &[2, 5]);
        assert_eq!(merged[[0, 0]], 1.0);
        assert_eq!(merged[[0, 3]], 2.0);

        let eps = Gradients::single(merged.clone());
        let split = Merge.backward(&[], &mut [], &trace, &eps).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split.get(0).unwrap().shape(), &[2, 3]);
        assert_eq!(split.get(1).unwrap().shape(), &[2, 2]);
        assert_eq!(split.get(1).unwrap()[[1, 1]], 2.0);
    }

    #[test]
    fn test_mask_union() {
        let m1 = ArrayD::from_shape_vec(vec![3, 1], vec![1.0, 0.0, 1.0]).unwrap();
        let m2 = ArrayD::from_shape_vec(vec![3, 1], vec![0.0, 0.0, 1.0]).unwrap();
        let mut input = Activations::unwired(2);
        input.set(0, arr2(3, 2, 0.0), Some(m1));
        input.set(1, arr2(3, 2, 0.0), Some(m2));

        let (out, _) = Merge.forward(&[], &input, false, &mut rng()).unwrap();
        let mask = out.mask(0).unwrap();
        assert_eq!(mask.as_slice().unwrap(), &[1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_missing_mask_drops_result_mask() {
        let m1 = ArrayD::from_shape_vec(vec![2, 1], vec![1.0, 0.0]).unwrap();
        let mut input = Activations::unwired(2);
        input.set(0, arr2(2, 2, 0.0), Some(m1));
        input.set(1, arr2(2, 2, 0.0), None);
        let (out, _) = Merge.forward(&[], &input, false, &mut rng()).unwrap();
        assert!(out.mask(0).is_none());
    }

    #[test]
    fn test_unwired_input_fails() {
        let input = Activations::unwired(2);
        assert!(matches!(
            Merge.forward(&[], &input, false, &mut rng()),
            Err(Error::UnwiredInput { kind: "merge" })
        ));
    }
}
