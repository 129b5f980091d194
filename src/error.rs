//! Error taxonomy for the detection core.
//!
//! Only `Validation` ever reaches a detection caller; the other variants are
//! returned by maintenance/introspection operations or logged and degraded.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    /// Input carries no title, description or keywords.
    #[error("validation failed: {0}")]
    Validation(String),

    /// AI provider / embedder failure or timeout.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// Store write or read failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A learning pass is already running.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl DetectionError {
    /// Keep the full anyhow context chain in the message.
    pub fn persistence(err: anyhow::Error) -> Self {
        DetectionError::Persistence(format!("{err:#}"))
    }

    /// Short machine-friendly kind, used by the HTTP adapter and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::Validation(_) => "validation",
            DetectionError::ExternalService(_) => "external_service",
            DetectionError::Persistence(_) => "persistence",
            DetectionError::Concurrency(_) => "concurrency",
            DetectionError::NotFound(_) => "not_found",
        }
    }
}
