//! In-process ledger store.
//!
//! Mirrors the PostgreSQL store's observable behavior:
//! - every account row has its own lock, taken by `add_account_balance` and
//!   held until the unit of work ends;
//! - reads never wait on row locks and see the last committed version;
//! - a commit publishes its transfers, entries and balances all at once;
//! - staged rows pin the accounts they reference, so those accounts cannot be
//!   deleted underneath an open unit of work;
//! - ids come from counters that are never reused.
//!
//! Dropping an unfinished unit of work restores each touched balance and
//! releases its locks and pins.

use crate::error::LedgerError;
use crate::models::{
    Account, CreateAccount, CreateEntry, CreateTransfer, Entry, Pagination, Transfer,
};
use crate::services::store::{LedgerQueries, LedgerStore, UnitOfWork};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, instrument};

type RowLock = Arc<Mutex<Account>>;

struct AccountRow {
    /// Last committed version; what readers see.
    committed: Account,
    /// Row lock. The guarded value is the lock holder's working copy.
    lock: RowLock,
    /// Staged transfers and entries of open units of work that reference this row.
    pending_refs: usize,
}

struct Tables {
    accounts: DashMap<i64, AccountRow>,
    entries: DashMap<i64, Entry>,
    transfers: DashMap<i64, Transfer>,
    /// Commits and deletes take it exclusively, readers shared.
    visibility: RwLock<()>,
    next_account_id: AtomicI64,
    next_entry_id: AtomicI64,
    next_transfer_id: AtomicI64,
    non_negative_balances: bool,
}

impl Tables {
    fn new(non_negative_balances: bool) -> Self {
        Self {
            accounts: DashMap::new(),
            entries: DashMap::new(),
            transfers: DashMap::new(),
            visibility: RwLock::new(()),
            next_account_id: AtomicI64::new(1),
            next_entry_id: AtomicI64::new(1),
            next_transfer_id: AtomicI64::new(1),
            non_negative_balances,
        }
    }

    /// Lock an account row, waiting behind any unit of work holding it.
    async fn lock_row(&self, account_id: i64) -> Result<OwnedMutexGuard<Account>, LedgerError> {
        let lock = self
            .accounts
            .get(&account_id)
            .map(|row| Arc::clone(&row.lock))
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        let guard = Arc::clone(&lock).lock_owned().await;

        // The row may have been deleted while we waited.
        let still_present = self
            .accounts
            .get(&account_id)
            .is_some_and(|row| Arc::ptr_eq(&row.lock, &lock));
        if !still_present {
            return Err(LedgerError::AccountNotFound(account_id));
        }

        Ok(guard)
    }

    fn check_balance(&self, account_id: i64, balance: i64) -> Result<(), LedgerError> {
        if self.non_negative_balances && balance < 0 {
            return Err(LedgerError::ConstraintViolation(format!(
                "balance of account {} rejected by accounts_balance_non_negative: {}",
                account_id, balance
            )));
        }
        Ok(())
    }

    /// Foreign-key check for a staged row. On success the account stays
    /// pinned until [`Tables::unpin`].
    fn pin(&self, operation: &str, account_id: i64) -> Result<(), LedgerError> {
        match self.accounts.get_mut(&account_id) {
            Some(mut row) => {
                row.pending_refs += 1;
                Ok(())
            }
            None => Err(LedgerError::ConstraintViolation(format!(
                "{} rejected: account {} does not exist",
                operation, account_id
            ))),
        }
    }

    fn unpin(&self, account_id: i64) {
        if let Some(mut row) = self.accounts.get_mut(&account_id) {
            row.pending_refs = row.pending_refs.saturating_sub(1);
        }
    }

    fn is_referenced(&self, account_id: i64) -> bool {
        self.entries.iter().any(|e| e.account_id == account_id)
            || self
                .transfers
                .iter()
                .any(|t| t.from_account_id == account_id || t.to_account_id == account_id)
    }
}

/// Ledger store kept entirely in process memory.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Tables::new(false)),
        }
    }

    /// A store whose accounts carry a `balance >= 0` check constraint.
    pub fn with_non_negative_balances() -> Self {
        Self {
            tables: Arc::new(Tables::new(true)),
        }
    }

    /// Number of committed transfers.
    pub fn transfer_count(&self) -> usize {
        self.tables.transfers.len()
    }

    /// Number of committed entries.
    pub fn entry_count(&self) -> usize {
        self.tables.entries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    type UnitOfWork = MemoryUnitOfWork;

    async fn begin(&self) -> Result<MemoryUnitOfWork, LedgerError> {
        Ok(MemoryUnitOfWork {
            tables: Arc::clone(&self.tables),
            held: Vec::new(),
            pinned: Vec::new(),
            transfers: Vec::new(),
            entries: Vec::new(),
        })
    }
}

struct HeldRow {
    guard: OwnedMutexGuard<Account>,
    original_balance: i64,
}

/// Unit of work over a [`MemoryStore`].
pub struct MemoryUnitOfWork {
    tables: Arc<Tables>,
    held: Vec<HeldRow>,
    /// One account id per foreign key of a staged row.
    pinned: Vec<i64>,
    transfers: Vec<Transfer>,
    entries: Vec<Entry>,
}

impl MemoryUnitOfWork {
    fn apply(&mut self, index: usize, delta: i64) -> Result<Account, LedgerError> {
        let row = &mut self.held[index].guard;
        let balance = row.balance.checked_add(delta).ok_or_else(|| {
            LedgerError::ConstraintViolation(format!(
                "balance of account {} out of range",
                row.id
            ))
        })?;
        self.tables.check_balance(row.id, balance)?;
        row.balance = balance;
        Ok(Account::clone(row))
    }

    fn pin(&mut self, operation: &str, account_id: i64) -> Result<(), LedgerError> {
        self.tables.pin(operation, account_id)?;
        self.pinned.push(account_id);
        Ok(())
    }

    fn release_pins(&mut self) {
        for account_id in self.pinned.drain(..) {
            self.tables.unpin(account_id);
        }
    }

    /// Undo balance changes, discard staged rows, release locks and pins.
    fn restore(&mut self) {
        for held in self.held.iter_mut() {
            held.guard.balance = held.original_balance;
        }
        self.held.clear();
        self.transfers.clear();
        self.entries.clear();
        self.release_pins();
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if !self.held.is_empty() || !self.transfers.is_empty() || !self.entries.is_empty() {
            debug!("Unit of work dropped before completion, rolling back");
        }
        self.restore();
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn create_transfer(&mut self, input: &CreateTransfer) -> Result<Transfer, LedgerError> {
        self.pin("create transfer", input.from_account_id)?;
        self.pin("create transfer", input.to_account_id)?;

        let transfer = Transfer {
            id: self.tables.next_transfer_id.fetch_add(1, Ordering::SeqCst),
            from_account_id: input.from_account_id,
            to_account_id: input.to_account_id,
            amount: input.amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn create_entry(&mut self, input: &CreateEntry) -> Result<Entry, LedgerError> {
        self.pin("create entry", input.account_id)?;

        let entry = Entry {
            id: self.tables.next_entry_id.fetch_add(1, Ordering::SeqCst),
            account_id: input.account_id,
            amount: input.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    #[instrument(skip(self))]
    async fn add_account_balance(
        &mut self,
        account_id: i64,
        delta: i64,
    ) -> Result<Account, LedgerError> {
        if let Some(index) = self.held.iter().position(|h| h.guard.id == account_id) {
            return self.apply(index, delta);
        }

        let guard = self.tables.lock_row(account_id).await?;
        let original_balance = guard.balance;
        self.held.push(HeldRow {
            guard,
            original_balance,
        });
        self.apply(self.held.len() - 1, delta)
    }

    async fn commit(mut self) -> Result<(), LedgerError> {
        let tables = Arc::clone(&self.tables);
        let _publish = tables.visibility.write().await;

        for transfer in self.transfers.drain(..) {
            tables.transfers.insert(transfer.id, transfer);
        }
        for entry in self.entries.drain(..) {
            tables.entries.insert(entry.id, entry);
        }
        for held in &self.held {
            if let Some(mut row) = tables.accounts.get_mut(&held.guard.id) {
                row.committed = Account::clone(&held.guard);
            }
        }
        // Committed rows now hold the references; pins are no longer needed.
        self.release_pins();
        self.held.clear();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), LedgerError> {
        self.restore();
        Ok(())
    }
}

fn page_of<T>(rows: Vec<T>, page: Pagination) -> Vec<T> {
    let offset = usize::try_from(page.clamped_offset()).unwrap_or(usize::MAX);
    let limit = usize::try_from(page.clamped_limit()).unwrap_or(usize::MAX);
    rows.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl LedgerQueries for MemoryStore {
    async fn create_account(&self, input: &CreateAccount) -> Result<Account, LedgerError> {
        let id = self.tables.next_account_id.fetch_add(1, Ordering::SeqCst);
        self.tables.check_balance(id, input.balance)?;

        let account = Account {
            id,
            owner: input.owner.clone(),
            balance: input.balance,
            currency: input.currency.as_str().to_string(),
            created_at: Utc::now(),
        };
        self.tables.accounts.insert(
            id,
            AccountRow {
                committed: account.clone(),
                lock: Arc::new(Mutex::new(account.clone())),
                pending_refs: 0,
            },
        );
        Ok(account)
    }

    async fn get_account(&self, account_id: i64) -> Result<Option<Account>, LedgerError> {
        let _snapshot = self.tables.visibility.read().await;
        Ok(self
            .tables
            .accounts
            .get(&account_id)
            .map(|row| row.committed.clone()))
    }

    async fn list_accounts(&self, page: Pagination) -> Result<Vec<Account>, LedgerError> {
        let _snapshot = self.tables.visibility.read().await;
        let mut accounts: Vec<Account> = self
            .tables
            .accounts
            .iter()
            .map(|row| row.committed.clone())
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(page_of(accounts, page))
    }

    async fn update_account(
        &self,
        account_id: i64,
        balance: i64,
    ) -> Result<Option<Account>, LedgerError> {
        let mut working = match self.tables.lock_row(account_id).await {
            Ok(guard) => guard,
            Err(LedgerError::AccountNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.tables.check_balance(account_id, balance)?;

        let _publish = self.tables.visibility.write().await;
        working.balance = balance;
        let account = Account::clone(&working);
        if let Some(mut row) = self.tables.accounts.get_mut(&account_id) {
            row.committed = account.clone();
        }
        Ok(Some(account))
    }

    async fn delete_account(&self, account_id: i64) -> Result<bool, LedgerError> {
        let _working = match self.tables.lock_row(account_id).await {
            Ok(guard) => guard,
            Err(LedgerError::AccountNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let _publish = self.tables.visibility.write().await;
        let referenced = self.tables.is_referenced(account_id);
        let removed = self
            .tables
            .accounts
            .remove_if(&account_id, |_, row| !referenced && row.pending_refs == 0);
        match removed {
            Some(_) => Ok(true),
            None => Err(LedgerError::ConstraintViolation(format!(
                "delete account rejected: account {} is referenced by the ledger",
                account_id
            ))),
        }
    }

    async fn get_entry(&self, entry_id: i64) -> Result<Option<Entry>, LedgerError> {
        let _snapshot = self.tables.visibility.read().await;
        Ok(self.tables.entries.get(&entry_id).map(|e| e.value().clone()))
    }

    async fn list_entries(
        &self,
        account_id: i64,
        page: Pagination,
    ) -> Result<Vec<Entry>, LedgerError> {
        let _snapshot = self.tables.visibility.read().await;
        let mut entries: Vec<Entry> = self
            .tables
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(page_of(entries, page))
    }

    async fn get_transfer(&self, transfer_id: i64) -> Result<Option<Transfer>, LedgerError> {
        let _snapshot = self.tables.visibility.read().await;
        Ok(self
            .tables
            .transfers
            .get(&transfer_id)
            .map(|t| t.value().clone()))
    }

    async fn list_transfers(
        &self,
        from_account_id: i64,
        to_account_id: i64,
        page: Pagination,
    ) -> Result<Vec<Transfer>, LedgerError> {
        let _snapshot = self.tables.visibility.read().await;
        let mut transfers: Vec<Transfer> = self
            .tables
            .transfers
            .iter()
            .filter(|t| t.from_account_id == from_account_id || t.to_account_id == to_account_id)
            .map(|t| t.value().clone())
            .collect();
        transfers.sort_by_key(|t| t.id);
        Ok(page_of(transfers, page))
    }
}
