use crate::shape::TensorShape;

/// All errors that can occur within vole.
///
/// These are programming/configuration errors, not transient conditions:
/// none are retried, none are silently recovered. Each carries enough
/// context (vertex kind, expected vs actual values) for the graph executor
/// to surface a useful message to the user.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrong number of inputs wired to a vertex.
    #[error("{kind}: invalid number of inputs: expected {min}..={max}, got {got}")]
    InvalidArity {
        kind: &'static str,
        min: usize,
        max: usize,
        got: usize,
    },

    /// Shape inference failure: inputs that can never be combined.
    #[error("{kind}: incompatible input shapes: {detail}")]
    IncompatibleShapes { kind: &'static str, detail: String },

    /// Shape variant that a vertex permanently does not support
    /// (e.g. merging flattened convolutional data).
    #[error("{kind}: unsupported input shape {shape}")]
    UnsupportedShape {
        kind: &'static str,
        shape: TensorShape,
    },

    /// Subset bounds exceed the available size/depth.
    #[error("cannot select subset [{from},{to}] inclusive: only {available} values available")]
    OutOfRange {
        from: usize,
        to: usize,
        available: usize,
    },

    /// Forward pass called before all inputs were attached.
    #[error("{kind}: cannot do forward pass: inputs not set")]
    UnwiredInput { kind: &'static str },

    /// Backward pass called before the activation gradient was available.
    #[error("{kind}: cannot do backward pass: activation gradient not available")]
    UnwiredGradient { kind: &'static str },

    /// Runtime tensor does not match the expected rank/dimensions.
    #[error("{kind}: invalid input: {detail}")]
    InvalidInput { kind: &'static str, detail: String },

    /// Externally supplied buffer of the wrong length.
    #[error("{kind}: buffer length mismatch: expected {expected}, got {got}")]
    SizeMismatch {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
