//! Error taxonomy for the knowledge subsystem.

use thiserror::Error;

/// Errors surfaced by stores, providers, and the orchestrator.
#[derive(Debug, Error)]
pub enum CompanionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("completion failed: {0}")]
    CompletionFailure(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Discriminant of [`CompanionError`], for front ends mapping errors to
/// exit codes or status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    StoreUnavailable,
    EmbeddingUnavailable,
    CompletionFailure,
    Serialization,
}

impl CompanionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            Self::CompletionFailure(_) => ErrorKind::CompletionFailure,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn store_unavailable(message: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(message.to_string())
    }
}

impl From<std::io::Error> for CompanionError {
    fn from(error: std::io::Error) -> Self {
        Self::StoreUnavailable(error.to_string())
    }
}

impl From<serde_json::Error> for CompanionError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for companion operations.
pub type CompanionResult<T> = Result<T, CompanionError>;
