// Weight noise schemes.
//
// Noise perturbs a layer's weight matrix at the start of a training-mode
// forward pass. The perturbed copy is recorded in the layer's trace so
// the matching backward pass differentiates through the exact weights the
// forward pass used; it is dropped with the trace, never written back to
// the parameter buffer.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use vole_core::{Error, Result};

/// Weight noise applied during training-mode forward passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightNoise {
    /// Zero each weight independently with probability `1 - keep`.
    DropConnect { keep: f64 },
    /// Add zero-mean Gaussian noise with the given standard deviation.
    Additive { std: f64 },
    /// Multiply each weight by a Gaussian sample centered at 1.
    Multiplicative { std: f64 },
}

impl WeightNoise {
    /// A perturbed copy of `weight`.
    pub fn apply(&self, weight: &Array2<f64>, rng: &mut StdRng) -> Result<Array2<f64>> {
        match self {
            WeightNoise::DropConnect { keep } => {
                if !(0.0..=1.0).contains(keep) {
                    return Err(Error::msg(format!(
                        "drop-connect keep probability {keep} outside [0, 1]"
                    )));
                }
                let mut out = weight.clone();
                out.mapv_inplace(|w| if rng.gen::<f64>() < *keep { w } else { 0.0 });
                Ok(out)
            }
            WeightNoise::Additive { std } => {
                let dist = Normal::new(0.0, *std).map_err(|e| Error::msg(e.to_string()))?;
                let mut out = weight.clone();
                out.mapv_inplace(|w| w + dist.sample(rng));
                Ok(out)
            }
            WeightNoise::Multiplicative { std } => {
                let dist = Normal::new(1.0, *std).map_err(|e| Error::msg(e.to_string()))?;
                let mut out = weight.clone();
                out.mapv_inplace(|w| w * dist.sample(rng));
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_drop_connect_extremes() {
        let w = array![[1.0, 2.0], [3.0, 4.0]];
        let mut rng = StdRng::seed_from_u64(3);
        let kept = WeightNoise::DropConnect { keep: 1.0 }
            .apply(&w, &mut rng)
            .unwrap();
        assert_eq!(kept, w);
        let dropped = WeightNoise::DropConnect { keep: 0.0 }
            .apply(&w, &mut rng)
            .unwrap();
        assert!(dropped.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_drop_connect_rejects_bad_prob() {
        let w = array![[1.0]];
        let mut rng = StdRng::seed_from_u64(0);
        assert!(WeightNoise::DropConnect { keep: 1.5 }
            .apply(&w, &mut rng)
            .is_err());
    }

    #[test]
    fn test_additive_zero_std_is_identity() {
        let w = array![[1.0, -2.0]];
        let mut rng = StdRng::seed_from_u64(0);
        let out = WeightNoise::Additive { std: 0.0 }
            .apply(&w, &mut rng)
            .unwrap();
        assert_eq!(out, w);
    }

    #[test]
    fn test_noise_leaves_original_untouched() {
        let w = array![[1.0, 2.0], [3.0, 4.0]];
        let orig = w.clone();
        let mut rng = StdRng::seed_from_u64(9);
        let _ = WeightNoise::Multiplicative { std: 0.5 }
            .apply(&w, &mut rng)
            .unwrap();
        assert_eq!(w, orig);
    }
}
