//! Ledger store contract.
//!
//! [`LedgerStore`] hands out units of work; everything a transfer writes goes
//! through a [`UnitOfWork`] and becomes durable only on [`UnitOfWork::commit`].
//! Dropping a unit of work without finishing it rolls it back, so cancellation
//! and panics never leave partial writes behind.
//!
//! [`LedgerQueries`] covers the account-management flow that runs outside
//! transfers: one statement per call, no unit of work.

use crate::error::LedgerError;
use crate::models::{
    Account, CreateAccount, CreateEntry, CreateTransfer, Entry, Pagination, Transfer,
};
use async_trait::async_trait;

/// Source of units of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type UnitOfWork: UnitOfWork;

    /// Open a unit of work. Fails with `ConnectionFailure` when no connection is available.
    async fn begin(&self) -> Result<Self::UnitOfWork, LedgerError>;
}

/// Writes scoped to one atomic unit.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn create_transfer(&mut self, input: &CreateTransfer) -> Result<Transfer, LedgerError>;

    async fn create_entry(&mut self, input: &CreateEntry) -> Result<Entry, LedgerError>;

    /// Atomically add `delta` to an account's balance and return the updated row.
    ///
    /// The increment happens at the storage layer and holds the row lock until the
    /// unit of work ends, so concurrent adjustments of one account serialize.
    async fn add_account_balance(
        &mut self,
        account_id: i64,
        delta: i64,
    ) -> Result<Account, LedgerError>;

    async fn commit(self) -> Result<(), LedgerError>;

    async fn rollback(self) -> Result<(), LedgerError>;
}

/// Single-statement reads and writes for the account lifecycle and history.
#[async_trait]
pub trait LedgerQueries: Send + Sync {
    async fn create_account(&self, input: &CreateAccount) -> Result<Account, LedgerError>;

    async fn get_account(&self, account_id: i64) -> Result<Option<Account>, LedgerError>;

    async fn list_accounts(&self, page: Pagination) -> Result<Vec<Account>, LedgerError>;

    /// Overwrite an account's balance (initial funding, corrections).
    async fn update_account(
        &self,
        account_id: i64,
        balance: i64,
    ) -> Result<Option<Account>, LedgerError>;

    /// Returns `false` when no such account exists.
    async fn delete_account(&self, account_id: i64) -> Result<bool, LedgerError>;

    async fn get_entry(&self, entry_id: i64) -> Result<Option<Entry>, LedgerError>;

    async fn list_entries(
        &self,
        account_id: i64,
        page: Pagination,
    ) -> Result<Vec<Entry>, LedgerError>;

    async fn get_transfer(&self, transfer_id: i64) -> Result<Option<Transfer>, LedgerError>;

    /// Transfers where either side matches, ordered by id.
    async fn list_transfers(
        &self,
        from_account_id: i64,
        to_account_id: i64,
        page: Pagination,
    ) -> Result<Vec<Transfer>, LedgerError>;
}
