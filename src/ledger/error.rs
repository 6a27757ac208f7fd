//! Ledger Error Types
//!
//! One taxonomy for the whole engine. Persistence failures are classified by
//! SQLSTATE when converted from `sqlx::Error`; the transaction coordinator is
//! the only place that wraps an error with more information.

use thiserror::Error;

/// SQLSTATE: foreign_key_violation
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLSTATE: unique_violation
const PG_UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE: check_violation
const PG_CHECK_VIOLATION: &str = "23514";
/// SQLSTATE: not_null_violation
const PG_NOT_NULL_VIOLATION: &str = "23502";
/// SQLSTATE: serialization_failure
const PG_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE: deadlock_detected
const PG_DEADLOCK_DETECTED: &str = "40P01";

/// Ledger error types
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    // === Precondition Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Source and destination account are the same")]
    SameAccount,

    #[error("Currency mismatch: {from} -> {to}")]
    CurrencyMismatch { from: String, to: String },

    // === Persistence Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {message}")]
    Database {
        code: Option<String>,
        message: String,
    },

    // === Unit-of-Work Errors ===
    #[error("Transaction aborted: {0}")]
    TransactionAborted(#[source] Box<LedgerError>),

    #[error("Rollback failed: {rollback} (after: {source})")]
    RollbackFailed {
        source: Box<LedgerError>,
        rollback: Box<LedgerError>,
    },

    #[error("Commit failed: {0}")]
    CommitFailed(#[source] Box<LedgerError>),

    #[error("Transaction cancelled")]
    Cancelled,
}

impl LedgerError {
    pub fn aborted(original: LedgerError) -> Self {
        LedgerError::TransactionAborted(Box::new(original))
    }

    pub fn rollback_failed(original: LedgerError, rollback: LedgerError) -> Self {
        LedgerError::RollbackFailed {
            source: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    pub fn commit_failed(cause: LedgerError) -> Self {
        LedgerError::CommitFailed(Box::new(cause))
    }

    /// The error that started the failure, looking through unit-of-work wrappers
    pub fn root_cause(&self) -> &LedgerError {
        match self {
            LedgerError::TransactionAborted(inner) => inner.root_cause(),
            LedgerError::RollbackFailed { source, .. } => source.root_cause(),
            LedgerError::CommitFailed(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// SQLSTATE reported by the storage engine, if any
    pub fn sql_state(&self) -> Option<&str> {
        match self.root_cause() {
            LedgerError::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Serialization failures and detected deadlocks succeed on a fresh attempt.
    ///
    /// The coordinator retries these itself at REPEATABLE READ and above.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.sql_state(),
            Some(PG_SERIALIZATION_FAILURE) | Some(PG_DEADLOCK_DETECTED)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), LedgerError::NotFound(_))
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self.root_cause(), LedgerError::ConstraintViolation(_))
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::SameAccount => "SAME_ACCOUNT",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            LedgerError::Connection(_) => "CONNECTION_ERROR",
            LedgerError::Database { .. } => "DATABASE_ERROR",
            LedgerError::TransactionAborted(inner) => inner.code(),
            LedgerError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            LedgerError::CommitFailed(_) => "COMMIT_FAILED",
            LedgerError::Cancelled => "CANCELLED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount
            | LedgerError::SameAccount
            | LedgerError::CurrencyMismatch { .. } => 400,
            LedgerError::NotFound(_) => 404,
            LedgerError::ConstraintViolation(_) => 403,
            LedgerError::TransactionAborted(inner) => inner.http_status(),
            LedgerError::Database { .. } if self.is_retryable() => 409,
            LedgerError::Connection(_) => 503,
            LedgerError::Cancelled => 499,
            LedgerError::Database { .. }
            | LedgerError::RollbackFailed { .. }
            | LedgerError::CommitFailed(_) => 500,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => LedgerError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                match code.as_deref() {
                    Some(PG_FOREIGN_KEY_VIOLATION)
                    | Some(PG_UNIQUE_VIOLATION)
                    | Some(PG_CHECK_VIOLATION)
                    | Some(PG_NOT_NULL_VIOLATION) => {
                        LedgerError::ConstraintViolation(db_err.message().to_string())
                    }
                    _ => LedgerError::Database {
                        code,
                        message: db_err.message().to_string(),
                    },
                }
            }
            err @ (sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed) => LedgerError::Connection(err.to_string()),
            other => LedgerError::Database {
                code: None,
                message: other.to_string(),
            },
        }
    }
}
