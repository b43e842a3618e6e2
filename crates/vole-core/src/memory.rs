use crate::shape::Dim;

// MemoryReport — pre-flight capacity estimate for one vertex or layer.
//
// Used by graph-build tooling to size hardware before any tensor exists.
// Never consulted during execution.

/// Bytes per stored element (all tensors are f64).
pub const ELEM_BYTES: usize = 8;

/// Memory cost estimate for a vertex given its input/output shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryReport {
    /// Memory for trainable parameters (and their gradients).
    pub param_bytes: usize,
    /// Additional working memory per pass, beyond activations/epsilons.
    pub working_bytes: usize,
    /// Memory retained between forward and backward (cached state).
    pub cache_bytes: usize,
}

impl MemoryReport {
    /// The zero report: all structural vertices report this.
    pub fn none() -> Self {
        MemoryReport::default()
    }

    /// Report for a layer with `params` trainable values, `working`
    /// per-example working values, and `cached` per-example cached values.
    /// Unknown dims count as zero (the estimate is a lower bound then).
    pub fn for_layer(params: usize, working: Dim, cached: Dim) -> Self {
        MemoryReport {
            param_bytes: params * ELEM_BYTES,
            working_bytes: working.value().unwrap_or(0) * ELEM_BYTES,
            cache_bytes: cached.value().unwrap_or(0) * ELEM_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_all_zero() {
        let r = MemoryReport::none();
        assert_eq!(r.param_bytes, 0);
        assert_eq!(r.working_bytes, 0);
        assert_eq!(r.cache_bytes, 0);
    }

    #[test]
    fn test_layer_report() {
        let r = MemoryReport::for_layer(10, Dim::Known(4), Dim::Unknown);
        assert_eq!(r.param_bytes, 80);
        assert_eq!(r.working_bytes, 32);
        assert_eq!(r.cache_bytes, 0);
    }
}
