//! Error types for the token ledger

use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Action has no configured cost
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Non-positive credit amount
    #[error("Invalid amount: {0} (must be positive)")]
    InvalidAmount(i64),

    /// Balance does not cover the requested debit; no mutation performed
    #[error("Insufficient balance: need {required}, have {balance} (short {shortfall})")]
    InsufficientBalance {
        /// Cost of the rejected debit
        required: i64,
        /// Balance at the time of the check
        balance: i64,
        /// Tokens missing
        shortfall: i64,
    },

    /// Pool totals do not cover the ledger-implied balance (fatal, never auto-repaired)
    #[error("Ledger inconsistency for user {user_id}: {detail}")]
    LedgerInconsistency {
        /// Affected user
        user_id: Uuid,
        /// Human-readable description of the drift
        detail: String,
    },

    /// Optimistic commit kept losing races; safe to retry the whole call
    #[error("Concurrent update conflict persisted after {attempts} attempts")]
    ConcurrencyExhausted {
        /// Number of commit attempts made
        attempts: u32,
    },

    /// Pool not found
    #[error("Pool not found: {0}")]
    PoolNotFound(Uuid),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

impl Error {
    /// True for transient errors where retrying the whole call is safe
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyExhausted { .. })
    }
}
