//! Error types for the prediction service

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The client sent something we refuse to process. Maps to 400.
    #[error("{0}")]
    InvalidUpload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_upload(msg: impl Into<String>) -> Self {
        Error::InvalidUpload(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Error::Inference(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the failure was caused by the request rather than by us.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidUpload(_))
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Inference(format!("image decoding failed: {}", err))
    }
}
