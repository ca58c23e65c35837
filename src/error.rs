#[cfg(feature = "cuda")]
use cust;
use thiserror::Error;

use crate::backend::HandleKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{library} library error: {message}")]
    LibraryError {
        library: HandleKind,
        message: String,
    },

    #[error("Device driver error: {0}")]
    DriverError(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    CudaError(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA cuBLAS error: {0}")]
    CublasError(String),

    #[error("Internal logic error: {0}")]
    InternalLogicError(String),
}

impl Error {
    pub(crate) fn library(library: HandleKind, message: impl Into<String>) -> Self {
        Error::LibraryError {
            library,
            message: message.into(),
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Error::InternalLogicError(format!("{} mutex was poisoned", what))
    }
}

#[cfg(feature = "cuda")]
impl From<cust::error::CudaError> for Error {
    fn from(err: cust::error::CudaError) -> Self {
        Error::CudaError(err.to_string())
    }
}
