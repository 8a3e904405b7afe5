//! Funds-transfer transaction engine.
//!
//! A transfer runs as one unit of work: transfer record, debit entry, credit
//! entry, then the two balance adjustments. The adjustments are always issued
//! in ascending account-id order whatever the transfer direction, which gives
//! every concurrent transfer the same row-lock acquisition order and rules out
//! the circular wait between `A -> B` and `B -> A`.

use crate::error::LedgerError;
use crate::models::{CreateEntry, CreateTransfer, TransferParams, TransferResult};
use crate::services::metrics::{ERRORS_TOTAL, TRANSFERS_TOTAL, TRANSFER_DURATION};
use crate::services::store::{LedgerStore, UnitOfWork};
use tracing::{error, info, instrument, warn};

/// Which side of a transfer a balance adjustment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    From,
    To,
}

/// One `add_account_balance` call of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceAdjustment {
    pub side: Side,
    pub account_id: i64,
    pub delta: i64,
}

/// The two balance adjustments of a transfer, in the order they must be issued.
///
/// The lower account id always comes first. Every caller must go through this
/// function; a single call site using another order reintroduces deadlocks.
pub fn lock_ordered_adjustments(
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
) -> [BalanceAdjustment; 2] {
    let debit = BalanceAdjustment {
        side: Side::From,
        account_id: from_account_id,
        delta: -amount,
    };
    let credit = BalanceAdjustment {
        side: Side::To,
        account_id: to_account_id,
        delta: amount,
    };

    if from_account_id < to_account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

/// Executes transfers against a [`LedgerStore`].
///
/// Holds no mutable state of its own; mutual exclusion is left to the store's
/// row locks, so one engine can serve any number of concurrent callers.
#[derive(Clone)]
pub struct TransferEngine<S> {
    store: S,
}

impl<S: LedgerStore> TransferEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Move `amount` from one account to another as a single unit of work.
    ///
    /// Parameters are trusted: `amount > 0` and distinct accounts are the
    /// caller's to validate. Nothing is retried; on failure every write of the
    /// attempt is rolled back and the error is returned, combined with the
    /// rollback error if rolling back failed as well. Dropping the returned
    /// future also rolls the unit of work back.
    #[instrument(
        skip(self, params),
        fields(
            from_account_id = params.from_account_id,
            to_account_id = params.to_account_id,
            amount = params.amount
        )
    )]
    pub async fn transfer(&self, params: TransferParams) -> Result<TransferResult, LedgerError> {
        let timer = TRANSFER_DURATION.start_timer();
        let outcome = self.execute(params).await;
        timer.observe_duration();

        match &outcome {
            Ok(result) => {
                TRANSFERS_TOTAL.with_label_values(&["ok"]).inc();
                info!(
                    transfer_id = result.transfer.id,
                    from_balance = result.from_account.balance,
                    to_balance = result.to_account.balance,
                    "Transfer committed"
                );
            }
            Err(e) => {
                TRANSFERS_TOTAL.with_label_values(&["error"]).inc();
                ERRORS_TOTAL.with_label_values(&[e.error_type()]).inc();
                warn!(error = %e, "Transfer failed");
            }
        }

        outcome
    }

    async fn execute(&self, params: TransferParams) -> Result<TransferResult, LedgerError> {
        let mut uow = self.store.begin().await?;

        match apply_transfer(&mut uow, params).await {
            Ok(result) => {
                uow.commit().await?;
                Ok(result)
            }
            Err(err) => match uow.rollback().await {
                Ok(()) => Err(err),
                Err(rollback_err) => {
                    error!(
                        error = %err,
                        rollback_error = %rollback_err,
                        "Rollback failed, unit of work may be in an indeterminate state"
                    );
                    Err(err.with_rollback_failure(rollback_err))
                }
            },
        }
    }
}

/// The fixed statement sequence of a transfer, run inside `uow`.
async fn apply_transfer<U: UnitOfWork>(
    uow: &mut U,
    params: TransferParams,
) -> Result<TransferResult, LedgerError> {
    let transfer = uow.create_transfer(&CreateTransfer::from(params)).await?;

    let from_entry = uow
        .create_entry(&CreateEntry {
            account_id: params.from_account_id,
            amount: -params.amount,
        })
        .await?;

    let to_entry = uow
        .create_entry(&CreateEntry {
            account_id: params.to_account_id,
            amount: params.amount,
        })
        .await?;

    let [first, second] =
        lock_ordered_adjustments(params.from_account_id, params.to_account_id, params.amount);
    let first_account = uow
        .add_account_balance(first.account_id, first.delta)
        .await?;
    let second_account = uow
        .add_account_balance(second.account_id, second.delta)
        .await?;

    let (from_account, to_account) = match first.side {
        Side::From => (first_account, second_account),
        Side::To => (second_account, first_account),
    };

    Ok(TransferResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}
