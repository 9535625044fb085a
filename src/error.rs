use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model call failed ({backend}): {message}")]
    ModelCall { backend: String, message: String },

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Output basename already in use: {0}")]
    BasenameCollision(String),

    #[error("Invalid output path: {0}")]
    InvalidOutputPath(String),

    #[error("Invalid dataset path: {0}")]
    InvalidDataset(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn model_call(backend: impl std::fmt::Display, message: impl Into<String>) -> Self {
        AppError::ModelCall {
            backend: backend.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
