//! Error types for the orchestration engine

use thiserror::Error;

/// Errors surfaced by the ability orchestration engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("ability not found: {0}")]
    AbilityNotFound(String),

    #[error("insufficient wallet balance: need {need}, have {balance}")]
    WalletInsufficient { need: i64, balance: i64 },

    #[error("wallet hold not found: {0}")]
    WalletHoldNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("no available executor for provider: {0}")]
    NoExecutor(String),

    #[error("no active credential for provider: {0}")]
    NoCredential(String),

    #[error("unauthorized")]
    Unauthorized,

    /// A prior process died before the provider call was submitted; the
    /// fixed text is what callers observe on the abandoned task.
    #[error("INTERRUPTED")]
    Interrupted,

    #[error("provider {provider}: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

macro_rules! impl_from_storage {
    ($($ty:ty),+) => {
        $(impl From<$ty> for Error {
            fn from(e: $ty) -> Self {
                Error::Storage(e.into())
            }
        })+
    };
}

impl_from_storage!(
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

impl Error {
    /// Whether an adapter may retry the failed provider call.
    /// Network failures and 5xx responses are retryable; 4xx and
    /// malformed-response errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { status, .. } => match status {
                Some(code) => *code >= 500,
                None => true,
            },
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
