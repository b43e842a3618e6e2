use ndarray::ArrayD;

use crate::error::{Error, Result};

// Activations / Gradients — the bundles flowing along graph edges.
//
// An Activations bundle carries one tensor per edge feeding a vertex,
// each paired with an optional mask and a mask state. A Gradients bundle
// is the mirror image on the backward pass: one epsilon (dL/d_output)
// per incoming edge.
//
// Bundles own no long-lived tensor memory: they are created per forward
// or backward call and dropped afterwards. Parameter gradients never
// travel in these bundles — they are written directly into the flat
// gradient buffer views (see `buffer`).

/// How a mask should be treated downstream of the vertex that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskState {
    /// The mask applies to the current activations.
    #[default]
    Active,
    /// The mask is carried along but should not be re-applied.
    Passthrough,
}

/// One entry of an [`Activations`] bundle: a tensor (possibly not yet
/// wired), its optional mask, and the mask state.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub array: Option<ArrayD<f64>>,
    pub mask: Option<ArrayD<f64>>,
    pub mask_state: MaskState,
}

/// Ordered bundle of activation tensors, one per incoming graph edge.
#[derive(Debug, Clone, Default)]
pub struct Activations {
    slots: Vec<Slot>,
}

impl Activations {
    /// An empty bundle with `n` unwired slots.
    pub fn unwired(n: usize) -> Self {
        Activations {
            slots: (0..n).map(|_| Slot::default()).collect(),
        }
    }

    /// A single-entry bundle without a mask.
    pub fn single(array: ArrayD<f64>) -> Self {
        Activations {
            slots: vec![Slot {
                array: Some(array),
                mask: None,
                mask_state: MaskState::Active,
            }],
        }
    }

    /// A single-entry bundle with an optional mask.
    pub fn single_masked(
        array: ArrayD<f64>,
        mask: Option<ArrayD<f64>>,
        mask_state: MaskState,
    ) -> Self {
        Activations {
            slots: vec![Slot {
                array: Some(array),
                mask,
                mask_state,
            }],
        }
    }

    /// A bundle from pre-built slots.
    pub fn from_slots(slots: Vec<Slot>) -> Self {
        Activations { slots }
    }

    /// Number of entries (equals the consuming vertex's input arity).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// True if any entry has no tensor yet — the distinct "inputs not
    /// wired" error state checked by every forward pass.
    pub fn any_missing(&self) -> bool {
        self.slots.iter().any(|s| s.array.is_none())
    }

    /// Tensor at position `i`, if wired.
    pub fn get(&self, i: usize) -> Option<&ArrayD<f64>> {
        self.slots.get(i).and_then(|s| s.array.as_ref())
    }

    /// The tensor at position `i`, or an `UnwiredInput` error naming the
    /// calling vertex kind.
    pub fn required(&self, i: usize, kind: &'static str) -> Result<&ArrayD<f64>> {
        self.get(i).ok_or(Error::UnwiredInput { kind })
    }

    /// Mask at position `i`, if present.
    pub fn mask(&self, i: usize) -> Option<&ArrayD<f64>> {
        self.slots.get(i).and_then(|s| s.mask.as_ref())
    }

    /// Mask state at position `i` (Active for out-of-range positions).
    pub fn mask_state(&self, i: usize) -> MaskState {
        self.slots.get(i).map(|s| s.mask_state).unwrap_or_default()
    }

    /// Wire a tensor (and optionally a mask) into position `i`.
    pub fn set(&mut self, i: usize, array: ArrayD<f64>, mask: Option<ArrayD<f64>>) {
        if i < self.slots.len() {
            self.slots[i] = Slot {
                array: Some(array),
                mask,
                mask_state: MaskState::Active,
            };
        }
    }

    /// Iterate over the slots in order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

/// Ordered bundle of epsilon tensors (dL/d_output), one per incoming
/// edge of the vertex that produced the corresponding activations.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    epsilons: Vec<Option<ArrayD<f64>>>,
}

impl Gradients {
    /// A single-epsilon bundle.
    pub fn single(epsilon: ArrayD<f64>) -> Self {
        Gradients {
            epsilons: vec![Some(epsilon)],
        }
    }

    /// A bundle from per-edge epsilons, in input order.
    pub fn from_epsilons(epsilons: Vec<ArrayD<f64>>) -> Self {
        Gradients {
            epsilons: epsilons.into_iter().map(Some).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.epsilons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epsilons.is_empty()
    }

    /// Epsilon at position `i`, if present.
    pub fn get(&self, i: usize) -> Option<&ArrayD<f64>> {
        self.epsilons.get(i).and_then(|e| e.as_ref())
    }

    /// The epsilon at position `i`, or an `UnwiredGradient` error naming
    /// the calling vertex kind.
    pub fn required(&self, i: usize, kind: &'static str) -> Result<&ArrayD<f64>> {
        self.get(i).ok_or(Error::UnwiredGradient { kind })
    }

    /// Consume the bundle, yielding per-edge epsilons in input order.
    pub fn into_epsilons(self) -> Vec<Option<ArrayD<f64>>> {
        self.epsilons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn arr(v: &[f64]) -> ArrayD<f64> {
        ArrayD::from_shape_vec(vec![1, v.len()], v.to_vec()).unwrap()
    }

    #[test]
    fn test_unwired_bundle() {
        let a = Activations::unwired(3);
        assert_eq!(a.len(), 3);
        assert!(a.any_missing());
        assert!(a.get(0).is_none());
        assert!(matches!(
            a.required(0, "merge"),
            Err(Error::UnwiredInput { kind: "merge" })
        ));
    }

    #[test]
    fn test_partial_wiring_is_still_missing() {
        let mut a = Activations::unwired(2);
        a.set(0, arr(&[1.0, 2.0]), None);
        assert!(a.any_missing());
        a.set(1, arr(&[3.0]), None);
        assert!(!a.any_missing());
    }

    #[test]
    fn test_mask_state_defaults_active() {
        let a = Activations::single(arr(&[1.0]));
        assert_eq!(a.mask_state(0), MaskState::Active);
        assert!(a.mask(0).is_none());
    }

    #[test]
    fn test_gradients_missing() {
        let g = Gradients::default();
        assert!(matches!(
            g.required(0, "scale"),
            Err(Error::UnwiredGradient { kind: "scale" })
        ));
        let g = Gradients::single(arr(&[1.0]));
        assert!(g.required(0, "scale").is_ok());
    }
}
