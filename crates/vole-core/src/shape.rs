use std::fmt;

use crate::error::{Error, Result};

// TensorShape — shape metadata propagated through the graph before any
// tensor is allocated.
//
// Every edge in a computation graph carries one of four shape variants:
//
//   FeedForward       [batch, size]                 rank 2
//   Recurrent         [batch, size, steps]          rank 3
//   Convolutional     [batch, depth, width, height] rank 4
//   ConvolutionalFlat [batch, depth*width*height]   rank 2
//
// The batch dimension is never part of the shape metadata — it is only
// known at runtime. Feature sizes and depths may be Unknown: a graph can
// be type-checked before every producer has a fully determined size, and
// unknown sizes propagate through composition rules instead of failing.

/// A feature size or depth that is either known or not yet determined.
///
/// `Unknown` propagates through sums: merging anything with an unknown
/// size yields an unknown size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Known(usize),
    Unknown,
}

impl Dim {
    /// Is this a concrete size?
    pub fn is_known(&self) -> bool {
        matches!(self, Dim::Known(_))
    }

    /// The concrete value, if any.
    pub fn value(&self) -> Option<usize> {
        match self {
            Dim::Known(n) => Some(*n),
            Dim::Unknown => None,
        }
    }

    /// Sum of two dims; unknown propagates.
    pub fn add(self, other: Dim) -> Dim {
        match (self, other) {
            (Dim::Known(a), Dim::Known(b)) => Dim::Known(a + b),
            _ => Dim::Unknown,
        }
    }

    /// Product of two dims; unknown propagates.
    pub fn mul(self, other: Dim) -> Dim {
        match (self, other) {
            (Dim::Known(a), Dim::Known(b)) => Dim::Known(a * b),
            _ => Dim::Unknown,
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Known(n)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Known(n) => write!(f, "{n}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

/// Shape metadata for one graph edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TensorShape {
    /// Rank-2 activations: `[batch, size]`.
    FeedForward { size: Dim },
    /// Rank-3 time-series activations: `[batch, size, steps]`.
    Recurrent { size: Dim, steps: Dim },
    /// Rank-4 convolutional activations: `[batch, depth, width, height]`.
    Convolutional {
        height: usize,
        width: usize,
        depth: Dim,
    },
    /// Convolutional activations flattened to rank 2, with the original
    /// spatial dimensions retained so they can be un-flattened.
    ConvolutionalFlat {
        height: usize,
        width: usize,
        depth: Dim,
    },
}

impl TensorShape {
    /// Feed-forward shape of the given feature size.
    pub fn feed_forward(size: impl Into<Dim>) -> Self {
        TensorShape::FeedForward { size: size.into() }
    }

    /// Recurrent (time-series) shape.
    pub fn recurrent(size: impl Into<Dim>, steps: impl Into<Dim>) -> Self {
        TensorShape::Recurrent {
            size: size.into(),
            steps: steps.into(),
        }
    }

    /// Convolutional shape.
    pub fn convolutional(height: usize, width: usize, depth: impl Into<Dim>) -> Self {
        TensorShape::Convolutional {
            height,
            width,
            depth: depth.into(),
        }
    }

    /// Flattened convolutional shape.
    pub fn convolutional_flat(height: usize, width: usize, depth: impl Into<Dim>) -> Self {
        TensorShape::ConvolutionalFlat {
            height,
            width,
            depth: depth.into(),
        }
    }

    /// Short name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TensorShape::FeedForward { .. } => "feed-forward",
            TensorShape::Recurrent { .. } => "recurrent",
            TensorShape::Convolutional { .. } => "convolutional",
            TensorShape::ConvolutionalFlat { .. } => "convolutional-flat",
        }
    }

    /// The runtime rank of tensors carrying this shape (including batch).
    pub fn rank(&self) -> usize {
        match self {
            TensorShape::FeedForward { .. } => 2,
            TensorShape::Recurrent { .. } => 3,
            TensorShape::Convolutional { .. } => 4,
            TensorShape::ConvolutionalFlat { .. } => 2,
        }
    }

    /// Feature size along the merge/subset axis (axis 1 at runtime):
    /// size for FF/Recurrent, depth for convolutional variants.
    pub fn feature_size(&self) -> Dim {
        match self {
            TensorShape::FeedForward { size } => *size,
            TensorShape::Recurrent { size, .. } => *size,
            TensorShape::Convolutional { depth, .. } => *depth,
            TensorShape::ConvolutionalFlat { depth, .. } => *depth,
        }
    }

    /// Number of values per example, when fully known.
    pub fn flattened_size(&self) -> Dim {
        match self {
            TensorShape::FeedForward { size } => *size,
            TensorShape::Recurrent { size, steps } => size.mul(*steps),
            TensorShape::Convolutional {
                height,
                width,
                depth,
            }
            | TensorShape::ConvolutionalFlat {
                height,
                width,
                depth,
            } => depth.mul(Dim::Known(height * width)),
        }
    }

    /// Convert a convolutional shape to its flattened form.
    /// Fails for any other variant.
    pub fn flatten(&self) -> Result<TensorShape> {
        match self {
            TensorShape::Convolutional {
                height,
                width,
                depth,
            } => Ok(TensorShape::convolutional_flat(*height, *width, *depth)),
            other => Err(Error::UnsupportedShape {
                kind: "flatten",
                shape: other.clone(),
            }),
        }
    }

    /// Convert a flattened convolutional shape back to rank-4 form.
    /// Fails for any other variant.
    pub fn unflatten(&self) -> Result<TensorShape> {
        match self {
            TensorShape::ConvolutionalFlat {
                height,
                width,
                depth,
            } => Ok(TensorShape::convolutional(*height, *width, *depth)),
            other => Err(Error::UnsupportedShape {
                kind: "unflatten",
                shape: other.clone(),
            }),
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorShape::FeedForward { size } => write!(f, "FeedForward(size={size})"),
            TensorShape::Recurrent { size, steps } => {
                write!(f, "Recurrent(size={size}, steps={steps})")
            }
            TensorShape::Convolutional {
                height,
                width,
                depth,
            } => write!(f, "Convolutional(h={height}, w={width}, d={depth})"),
            TensorShape::ConvolutionalFlat {
                height,
                width,
                depth,
            } => write!(f, "ConvolutionalFlat(h={height}, w={width}, d={depth})"),
        }
    }
}
