use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid secret reference: {0}")]
    RefShape(String),

    #[error("provider '{provider}' unusable: {message}")]
    ProviderScoped { provider: String, message: String },

    #[error("failed to resolve {ref_key}: {message}")]
    RefResolution { ref_key: String, message: String },

    #[error("secret at {path} resolved to an unexpected shape: expected {expected}")]
    ShapeMismatch { path: String, expected: &'static str },

    #[error("invalid plan: {0}")]
    PlanInvalid(String),

    #[error("apply failed writing {path}: {message}")]
    ApplyIo { path: PathBuf, message: String },

    #[error("path error at {path}: {message}")]
    Path { path: String, message: String },

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SecretsError {
    /// True for failures that poison every ref handed to the same provider,
    /// letting callers skip per-ref retries.
    pub fn is_provider_scoped(&self) -> bool {
        matches!(self, SecretsError::ProviderScoped { .. })
    }
}

pub type Result<T> = std::result::Result<T, SecretsError>;
