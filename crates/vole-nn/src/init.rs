// Weight initialization schemes.
//
// Initialization draws from an explicitly threaded `StdRng`, so two graphs
// built with the same seed get byte-identical parameter buffers.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use vole_core::{Error, Result};

/// Weight initialization scheme for parametrized layers.
///
/// Biases are always zero-initialized; these schemes apply to the weight
/// portion of a layer's parameter view.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum WeightInit {
    /// Gaussian with variance 2 / (fan_in + fan_out).
    #[default]
    Xavier,
    /// Uniform on [-1/sqrt(fan_in), 1/sqrt(fan_in)].
    Uniform,
    /// All zeros.
    Zero,
}

impl WeightInit {
    /// Fill a weight view for a layer with the given fan-in and fan-out.
    pub fn fill(
        &self,
        fan_in: usize,
        fan_out: usize,
        weights: &mut [f64],
        rng: &mut StdRng,
    ) -> Result<()> {
        match self {
            WeightInit::Xavier => {
                let std = (2.0 / (fan_in + fan_out).max(1) as f64).sqrt();
                let dist = Normal::new(0.0, std).map_err(|e| Error::msg(e.to_string()))?;
                for w in weights.iter_mut() {
                    *w = dist.sample(rng);
                }
            }
            WeightInit::Uniform => {
                let a = 1.0 / (fan_in.max(1) as f64).sqrt();
                let dist = Uniform::new_inclusive(-a, a);
                for w in weights.iter_mut() {
                    *w = rng.sample(dist);
                }
            }
            WeightInit::Zero => {
                for w in weights.iter_mut() {
                    *w = 0.0;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_same_seed_same_weights() {
        let mut a = [0.0; 32];
        let mut b = [0.0; 32];
        WeightInit::Xavier
            .fill(4, 8, &mut a, &mut StdRng::seed_from_u64(7))
            .unwrap();
        WeightInit::Xavier
            .fill(4, 8, &mut b, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_uniform_bounds() {
        let mut w = [0.0; 64];
        WeightInit::Uniform
            .fill(16, 4, &mut w, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let a = 1.0 / 4.0;
        assert!(w.iter().all(|&v| v >= -a && v <= a));
        assert!(w.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_zero_init() {
        let mut w = [1.0; 8];
        WeightInit::Zero
            .fill(4, 2, &mut w, &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert!(w.iter().all(|&v| v == 0.0));
    }
}
