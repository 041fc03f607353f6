//! Error taxonomy shared by every engine component and protocol adapter.

use crate::models::transfer::ConflictCode;
use std::io;
use thiserror::Error;

/// Reasons the path sandbox refuses a resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("path `{0}` escapes the space root")]
    Escape(String),
    #[error("path `{0}` is reserved")]
    Reserved(String),
    #[error("path `{0}` is invalid")]
    Invalid(String),
}

/// Failures of the quota tracker.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota exceeded: {used} used + {delta} requested > {quota} allowed")]
    Exceeded { used: u64, quota: u64, delta: u64 },
    #[error("usage scan cancelled")]
    Cancelled,
    #[error("usage scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{message}")]
    Conflict { code: ConflictCode, message: String },
    #[error("quota exceeded: {used} used + {delta} requested > {quota} allowed")]
    QuotaExceeded { used: u64, quota: u64, delta: u64 },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn conflict(code: ConflictCode, message: impl Into<String>) -> Self {
        EngineError::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        EngineError::AccessDenied(message.into())
    }

    /// The per-item code reported in batch outcomes.
    pub fn code(&self) -> ConflictCode {
        match self {
            EngineError::AccessDenied(_) => ConflictCode::AccessDenied,
            EngineError::NotFound(_) => ConflictCode::NotFound,
            EngineError::Conflict { code, .. } => *code,
            EngineError::QuotaExceeded { .. } => ConflictCode::QuotaExceeded,
            EngineError::InvalidInput(_) => ConflictCode::InvalidInput,
            EngineError::Cancelled
            | EngineError::Sqlx(_)
            | EngineError::Io(_)
            | EngineError::Join(_)
            | EngineError::Zip(_) => ConflictCode::Internal,
        }
    }

    /// Unexpected failures that must be logged before being surfaced.
    pub fn is_internal(&self) -> bool {
        self.code() == ConflictCode::Internal
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => EngineError::NotFound(err.to_string()),
            io::ErrorKind::AlreadyExists => {
                EngineError::conflict(ConflictCode::DestinationExists, err.to_string())
            }
            _ => EngineError::Io(err),
        }
    }
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Invalid(_) => EngineError::InvalidInput(err.to_string()),
            SandboxError::Escape(_) | SandboxError::Reserved(_) => {
                EngineError::AccessDenied(err.to_string())
            }
        }
    }
}

impl From<QuotaError> for EngineError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded { used, quota, delta } => {
                EngineError::QuotaExceeded { used, quota, delta }
            }
            QuotaError::Cancelled => EngineError::Cancelled,
            QuotaError::Join(e) => EngineError::Join(e),
        }
    }
}
