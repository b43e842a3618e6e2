use std::collections::HashMap;

use crate::error::{Error, Result};

// Flat parameter/gradient buffers.
//
// A model owns exactly one contiguous parameter buffer and one gradient
// buffer of the same length. Each parametrized layer is assigned a
// contiguous (offset, len) span inside both, in a deterministic
// (topological) order computed once at graph-build time. Layers read and
// write through slice views into these buffers — never copies — so the
// optimizer can mutate the flat parameter buffer and every layer sees the
// new values on its next forward pass.
//
// The span assignment is the persisted-state contract: the parameter
// buffer's byte layout is the concatenation of each ordered layer's own
// sub-layout. Any change to the ordering, or to a layer's internal field
// order, is a breaking format change.

/// One layer's span inside the flat buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpan {
    pub name: String,
    pub offset: usize,
    pub len: usize,
}

impl ParamSpan {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Deterministic mapping from layer name to buffer span.
///
/// Built from `(name, param_count)` pairs in topological order; entries
/// with zero parameters are skipped. Spans are contiguous and
/// non-overlapping by construction.
#[derive(Debug, Clone, Default)]
pub struct ParamLayout {
    spans: Vec<ParamSpan>,
    index: HashMap<String, usize>,
    total: usize,
}

impl ParamLayout {
    /// Assign contiguous spans in iteration order.
    pub fn build<'a>(ordered: impl IntoIterator<Item = (&'a str, usize)>) -> Self {
        let mut spans = Vec::new();
        let mut index = HashMap::new();
        let mut offset = 0usize;
        for (name, count) in ordered {
            if count == 0 {
                continue;
            }
            index.insert(name.to_string(), spans.len());
            spans.push(ParamSpan {
                name: name.to_string(),
                offset,
                len: count,
            });
            offset += count;
        }
        ParamLayout {
            spans,
            index,
            total: offset,
        }
    }

    /// Total buffer length (sum of all span lengths).
    pub fn total_len(&self) -> usize {
        self.total
    }

    /// Span for a layer, if it has parameters.
    pub fn span(&self, name: &str) -> Option<&ParamSpan> {
        self.index.get(name).map(|&i| &self.spans[i])
    }

    /// All spans, in assignment (topological) order.
    pub fn spans(&self) -> &[ParamSpan] {
        &self.spans
    }

    /// Layer names in assignment order — the ordered parameter list the
    /// optimizer iterates over.
    pub fn ordered_names(&self) -> impl Iterator<Item = &str> {
        self.spans.iter().map(|s| s.name.as_str())
    }
}

/// The model's flat parameter and gradient buffers plus their layout.
#[derive(Debug, Clone)]
pub struct ModelBuffers {
    layout: ParamLayout,
    params: Vec<f64>,
    grads: Vec<f64>,
}

impl ModelBuffers {
    /// Allocate zeroed buffers for the given layout.
    pub fn new(layout: ParamLayout) -> Self {
        let n = layout.total_len();
        ModelBuffers {
            layout,
            params: vec![0.0; n],
            grads: vec![0.0; n],
        }
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// The whole flat parameter buffer.
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Mutable access to the whole flat parameter buffer (for the
    /// optimizer's update step).
    pub fn params_mut(&mut self) -> &mut [f64] {
        &mut self.params
    }

    /// The whole flat gradient buffer.
    pub fn grads(&self) -> &[f64] {
        &self.grads
    }

    /// One layer's parameter view.
    pub fn param_view(&self, name: &str) -> Result<&[f64]> {
        let span = self.span_for(name)?;
        Ok(&self.params[span.range()])
    }

    /// One layer's mutable parameter view (initialization, updates).
    pub fn param_view_mut(&mut self, name: &str) -> Result<&mut [f64]> {
        let range = self.span_for(name)?.range();
        Ok(&mut self.params[range])
    }

    /// One layer's gradient view.
    pub fn grad_view(&self, name: &str) -> Result<&[f64]> {
        let span = self.span_for(name)?;
        Ok(&self.grads[span.range()])
    }

    /// One layer's mutable gradient view (written during backward).
    pub fn grad_view_mut(&mut self, name: &str) -> Result<&mut [f64]> {
        let range = self.span_for(name)?.range();
        Ok(&mut self.grads[range])
    }

    /// Both views for one layer at once (forward needs params, backward
    /// writes grads while reading params).
    pub fn views_mut(&mut self, name: &str) -> Result<(&[f64], &mut [f64])> {
        let range = self.span_for(name)?.range();
        Ok((&self.params[range.clone()], &mut self.grads[range]))
    }

    /// Replace the parameter buffer contents from an external flat array.
    /// The length must match exactly.
    pub fn set_params(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.params.len() {
            return Err(Error::SizeMismatch {
                kind: "model parameters",
                expected: self.params.len(),
                got: values.len(),
            });
        }
        self.params.copy_from_slice(values);
        Ok(())
    }

    /// Zero the gradient buffer before a backward pass.
    pub fn zero_grads(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = 0.0);
    }

    fn span_for(&self, name: &str) -> Result<&ParamSpan> {
        self.layout
            .span(name)
            .ok_or_else(|| Error::msg(format!("no parameter span for layer '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_skips_zero_counts() {
        let layout = ParamLayout::build([("merge", 0), ("dense0", 6), ("scale", 0), ("out", 4)]);
        assert_eq!(layout.total_len(), 10);
        assert_eq!(layout.spans().len(), 2);
        assert!(layout.span("merge").is_none());
        assert_eq!(layout.span("dense0").unwrap().offset, 0);
        assert_eq!(layout.span("out").unwrap().offset, 6);
        let names: Vec<&str> = layout.ordered_names().collect();
        assert_eq!(names, vec!["dense0", "out"]);
    }

    #[test]
    fn test_spans_are_contiguous_and_disjoint() {
        let layout = ParamLayout::build([("a", 3), ("b", 5), ("c", 2)]);
        let spans = layout.spans();
        let mut end = 0;
        for s in spans {
            assert_eq!(s.offset, end, "span {} not contiguous", s.name);
            end = s.offset + s.len;
        }
        assert_eq!(end, layout.total_len());
    }

    #[test]
    fn test_view_round_trip() {
        // Mutating the flat buffer must be visible through every view,
        // and vice versa: views are sub-ranges, not copies.
        let layout = ParamLayout::build([("a", 2), ("b", 3)]);
        let mut buffers = ModelBuffers::new(layout);

        buffers.param_view_mut("b").unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(buffers.params(), &[0.0, 0.0, 1.0, 2.0, 3.0]);

        buffers.params_mut()[0] = 9.0;
        assert_eq!(buffers.param_view("a").unwrap(), &[9.0, 0.0]);
    }

    #[test]
    fn test_set_params_length_checked() {
        let mut buffers = ModelBuffers::new(ParamLayout::build([("a", 2)]));
        assert!(matches!(
            buffers.set_params(&[1.0, 2.0, 3.0]),
            Err(Error::SizeMismatch {
                expected: 2,
                got: 3,
                ..
            })
        ));
        buffers.set_params(&[4.0, 5.0]).unwrap();
        assert_eq!(buffers.params(), &[4.0, 5.0]);
    }

    #[test]
    fn test_zero_grads() {
        let mut buffers = ModelBuffers::new(ParamLayout::build([("a", 2)]));
        buffers.grad_view_mut("a").unwrap()[0] = 3.0;
        buffers.zero_grads();
        assert_eq!(buffers.grads(), &[0.0, 0.0]);
    }
}
