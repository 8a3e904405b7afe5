//! Transfer model and the transfer engine's boundary types.

use super::{Account, Entry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Record of a single fund movement between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Input for inserting a transfer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Parameters of a transfer, already validated by the caller
/// (`amount > 0`, `from_account_id != to_account_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl From<TransferParams> for CreateTransfer {
    fn from(params: TransferParams) -> Self {
        Self {
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
        }
    }
}

/// Everything a committed transfer produced. Only built after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    /// Source account after its balance was updated.
    pub from_account: Account,
    /// Destination account after its balance was updated.
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}
