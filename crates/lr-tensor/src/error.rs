use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("matmul dimension mismatch: [{m}x{k}] @ [{k2}x{n}]")]
    MatmulMismatch {
        m: usize,
        k: usize,
        k2: usize,
        n: usize,
    },
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),
    #[error("buffer allocation failed: {0}")]
    AllocFailure(String),
    #[error("invalid buffer access: {0}")]
    InvalidAccess(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;
