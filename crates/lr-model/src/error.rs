use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad model format: {0}")]
    BadFormat(String),
    #[error("unsupported model format: {0}")]
    UnsupportedFormat(String),
    #[error("tensor '{name}' has wrong shape; expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("tensor '{0}' is missing from model")]
    MissingTensor(String),
    #[error("file contains unexpected tensor '{0}'")]
    ExtraTensor(String),
    #[error("allocation failed: {0}")]
    AllocFailure(String),
    #[error("cannot quantize tensor: {0}")]
    QuantizeUnsupported(String),
    #[error("requantizing from type {0} is disabled")]
    RequantizeDisabled(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("tensor error: {0}")]
    Tensor(#[from] lr_tensor::TensorError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
