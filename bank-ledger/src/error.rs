//! Error taxonomy shared by the ledger store and the transfer engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Account {0} not found")]
    AccountNotFound(i64),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(anyhow::Error),

    #[error("Connection lost: {0}")]
    ConnectionLost(anyhow::Error),

    #[error("Commit failed: {0}")]
    CommitFailure(anyhow::Error),

    #[error("Rollback failed: {0}")]
    RollbackFailure(anyhow::Error),

    /// The unit of work failed and rolling it back failed too. The unit of
    /// work may be left in an indeterminate state.
    #[error("tx error: {error}, rollback error: {rollback}")]
    RollbackAfterFailure {
        #[source]
        error: Box<LedgerError>,
        rollback: Box<LedgerError>,
    },

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl LedgerError {
    /// Pair the error that aborted a unit of work with the error raised while rolling it back.
    pub fn with_rollback_failure(self, rollback: LedgerError) -> Self {
        LedgerError::RollbackAfterFailure {
            error: Box::new(self),
            rollback: Box::new(rollback),
        }
    }

    /// Stable label for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound(_) => "account_not_found",
            LedgerError::ConstraintViolation(_) => "constraint_violation",
            LedgerError::ConnectionFailure(_) => "connection_failure",
            LedgerError::ConnectionLost(_) => "connection_lost",
            LedgerError::CommitFailure(_) => "commit_failure",
            LedgerError::RollbackFailure(_) => "rollback_failure",
            LedgerError::RollbackAfterFailure { .. } => "rollback_after_failure",
            LedgerError::DatabaseError(_) => "db_error",
            LedgerError::ConfigError(_) => "config_error",
        }
    }

    /// Whether a fresh attempt might succeed. Nothing is retried internally;
    /// a caller that retries must deduplicate on its own. A failed commit is
    /// not transient: the transfer may have been applied.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::ConnectionFailure(_) | LedgerError::ConnectionLost(_) => true,
            LedgerError::RollbackAfterFailure { error, .. } => error.is_transient(),
            _ => false,
        }
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        LedgerError::ConfigError(anyhow::Error::new(err))
    }
}
