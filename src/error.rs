use thiserror::Error;

/// Validation failures raised by shape and descriptor operations.
///
/// All of these are local, synchronous errors: the crate performs no I/O and
/// never retries, so every failure surfaces immediately to the caller.
#[derive(Debug, Error)]
pub enum DescError {
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
    #[error("shape {shape} is incompatible with dims {dims}")]
    ShapeMismatch { shape: String, dims: String },
    #[error("cannot get static dims for non static shape")]
    NotStatic,
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("unsupported native format: {0}")]
    UnsupportedFormat(String),
    #[error("descriptor kind mismatch: expected {expected}, got {actual}")]
    CastMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}
