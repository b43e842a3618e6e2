// Scale vertex: multiplies its input by a fixed scalar. Shape-preserving,
// and its backward pass is closed-form (the same scalar applied to the
// epsilon), so it records no trace.

use rand::rngs::StdRng;

use vole_core::{Activations, Gradients, Result, TensorShape};

use crate::vertex::{ensure_no_params, expect_len, Trace, Vertex};

const KIND: &str = "scale";

/// Elementwise scaling by a configured scalar factor.
#[derive(Debug, Clone, Copy)]
pub struct Scale {
    factor: f64,
}

impl Scale {
    pub fn new(factor: f64) -> Self {
        Scale { factor }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl Vertex for Scale {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn output_shape(&self, inputs: &[TensorShape]) -> Result<TensorShape> {
        self.arity().check(KIND, inputs.len())?;
        Ok(inputs[0].clone())
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
        let out = arr.mapv(|v| v * self.factor);
        Ok((
            Activations::single_masked(out, input.mask(0).cloned(), input.mask_state(0)),
            Trace::None,
        ))
    }

    fn backward(
        &self,
        params: &[f64],
        grad_view: &mut [f64],
        _trace: &Trace,
        epsilon: &Gradients,
    ) -> Result<Gradients> {
        ensure_no_params(KIND, params, grad_view)?;
        let eps = epsilon.required(0, KIND)?;
        Ok(Gradients::single(eps.mapv(|v| v * self.factor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn test_shape_preserved() {
        let s = Scale::new(0.5);
        let shape = TensorShape::recurrent(8, 3);
        assert_eq!(s.output_shape(&[shape.clone()]).unwrap(), shape);
    }

    #[test]
    fn test_forward_backward_scale() {
        let s = Scale::new(2.0);
        let arr = ArrayD::from_shape_vec(vec![1, 3], vec![1.0, -2.0, 3.0]).unwrap();
        let input = Activations::single(arr);

        let (out, trace) = s.forward(&[], &input, false, &mut rng()).unwrap();
        assert_eq!(out.get(0).unwrap().as_slice().unwrap(), &[2.0, -4.0, 6.0]);

        let eps = ArrayD::from_shape_vec(vec![1, 3], vec![1.0, 1.0, 1.0]).unwrap();
        let back = s
            .backward(&[], &mut [], &trace, &Gradients::single(eps))
            .unwrap();
        assert_eq!(back.get(0).unwrap().as_slice().unwrap(), &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_two_inputs_rejected() {
        let s = Scale::new(1.5);
        assert!(s
            .output_shape(&[TensorShape::feed_forward(2), TensorShape::feed_forward(2)])
            .is_err());
    }
}
