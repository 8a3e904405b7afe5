//! Transfer engine integration tests against PostgreSQL.
//!
//! Run with: TEST_DATABASE_URL=postgres://... cargo test -p bank-ledger -- --ignored

mod common;

use bank_ledger::models::{Pagination, TransferParams};
use bank_ledger::services::{Database, LedgerQueries, LedgerStore, TransferEngine, UnitOfWork};
use bank_ledger::LedgerError;
use common::{create_account_with_balance, create_random_account, spawn_db};
use serial_test::serial;
use std::collections::HashSet;
use std::time::Duration;

async fn balance_of(db: &Database, account_id: i64) -> i64 {
    db.get_account(account_id)
        .await
        .expect("Failed to read account")
        .expect("Account should exist")
        .balance
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn concurrent_transfers_apply_every_debit_once() {
    let db = spawn_db().await;
    let engine = TransferEngine::new(db.clone());

    let a = create_random_account(&db).await;
    let b = create_random_account(&db).await;

    let n = 10;
    let amount = 10;
    let params = TransferParams {
        from_account_id: a.id,
        to_account_id: b.id,
        amount,
    };

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.transfer(params).await })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let result = handle
            .await
            .expect("Transfer task panicked")
            .expect("Transfer should succeed");

        let transfer = &result.transfer;
        assert_eq!(transfer.from_account_id, a.id);
        assert_eq!(transfer.to_account_id, b.id);
        assert_eq!(transfer.amount, amount);
        assert!(transfer.id > 0);
        assert!(db.get_transfer(transfer.id).await.unwrap().is_some());

        assert_eq!(result.from_entry.account_id, a.id);
        assert_eq!(result.from_entry.amount, -amount);
        assert!(db.get_entry(result.from_entry.id).await.unwrap().is_some());

        assert_eq!(result.to_entry.account_id, b.id);
        assert_eq!(result.to_entry.amount, amount);
        assert!(db.get_entry(result.to_entry.id).await.unwrap().is_some());

        // Each transfer observes a balance moved by a distinct multiple of `amount`.
        let from_diff = a.balance - result.from_account.balance;
        let to_diff = result.to_account.balance - b.balance;
        assert_eq!(from_diff, to_diff);
        assert!(from_diff > 0);
        assert_eq!(from_diff % amount, 0);

        let k = from_diff / amount;
        assert!((1..=n).contains(&k), "k = {} out of range", k);
        assert!(seen.insert(k), "k = {} observed twice", k);
    }

    assert_eq!(balance_of(&db, a.id).await, a.balance - n * amount);
    assert_eq!(balance_of(&db, b.id).await, b.balance + n * amount);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn opposite_direction_transfers_do_not_deadlock() {
    let db = spawn_db().await;
    let engine = TransferEngine::new(db.clone());

    let a = create_random_account(&db).await;
    let b = create_random_account(&db).await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let engine = engine.clone();
            let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
            tokio::spawn(async move {
                engine
                    .transfer(TransferParams {
                        from_account_id: from,
                        to_account_id: to,
                        amount: 10,
                    })
                    .await
            })
        })
        .collect();

    let all = async {
        for handle in handles {
            handle
                .await
                .expect("Transfer task panicked")
                .expect("Transfer should succeed");
        }
    };
    tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("Transfers did not finish, possible deadlock");

    assert_eq!(balance_of(&db, a.id).await, a.balance);
    assert_eq!(balance_of(&db, b.id).await, b.balance);
}

#[tokio::test]
#[ignore]
#[serial]
async fn transfer_and_transfer_back() {
    let db = spawn_db().await;
    let engine = TransferEngine::new(db.clone());

    let a = create_account_with_balance(&db, 1000).await;
    let b = create_account_with_balance(&db, 500).await;

    let result = engine
        .transfer(TransferParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 100,
        })
        .await
        .expect("Transfer should succeed");
    assert_eq!(result.from_account.balance, 900);
    assert_eq!(result.to_account.balance, 600);

    let result = engine
        .transfer(TransferParams {
            from_account_id: b.id,
            to_account_id: a.id,
            amount: 600,
        })
        .await
        .expect("Transfer back should succeed");
    assert_eq!(result.from_account.id, b.id);
    assert_eq!(result.from_account.balance, 0);
    assert_eq!(result.to_account.id, a.id);
    assert_eq!(result.to_account.balance, 1500);

    let transfers = db
        .list_transfers(a.id, b.id, Pagination::default())
        .await
        .expect("Failed to list transfers");
    assert_eq!(transfers.len(), 2);
}

#[tokio::test]
#[ignore]
#[serial]
async fn rejected_debit_leaves_no_partial_writes() {
    let db = spawn_db().await;
    let engine = TransferEngine::new(db.clone());

    let a = create_account_with_balance(&db, 50).await;
    let b = create_account_with_balance(&db, 50).await;

    let err = engine
        .transfer(TransferParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 51,
        })
        .await
        .expect_err("Overdraft should violate the balance constraint");
    assert!(
        matches!(err, LedgerError::ConstraintViolation(_)),
        "unexpected error: {:?}",
        err
    );

    assert_eq!(balance_of(&db, a.id).await, 50);
    assert_eq!(balance_of(&db, b.id).await, 50);
    assert!(db
        .list_transfers(a.id, b.id, Pagination::default())
        .await
        .unwrap()
        .is_empty());
    assert!(db
        .list_entries(a.id, Pagination::default())
        .await
        .unwrap()
        .is_empty());
    assert!(db
        .list_entries(b.id, Pagination::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[ignore]
#[serial]
async fn unknown_account_is_a_constraint_violation() {
    let db = spawn_db().await;
    let engine = TransferEngine::new(db.clone());

    let a = create_random_account(&db).await;

    let err = engine
        .transfer(TransferParams {
            from_account_id: a.id,
            to_account_id: i64::MAX,
            amount: 10,
        })
        .await
        .expect_err("Transfer to a missing account should fail");
    assert!(
        matches!(err, LedgerError::ConstraintViolation(_)),
        "unexpected error: {:?}",
        err
    );
    assert!(!err.is_transient());

    assert_eq!(balance_of(&db, a.id).await, a.balance);
    assert!(db
        .list_entries(a.id, Pagination::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
#[serial]
async fn cancelled_transfer_is_never_committed() {
    let db = spawn_db().await;
    let engine = TransferEngine::new(db.clone());

    let a = create_random_account(&db).await;
    let b = create_random_account(&db).await;

    // Hold the row lock on `b` so the transfer blocks on its second adjustment.
    let mut blocker = db.begin().await.expect("Failed to begin blocker");
    blocker
        .add_account_balance(b.id, 0)
        .await
        .expect("Failed to lock account");

    let attempt = engine.transfer(TransferParams {
        from_account_id: a.id,
        to_account_id: b.id,
        amount: 10,
    });
    assert!(
        tokio::time::timeout(Duration::from_millis(200), attempt)
            .await
            .is_err(),
        "Transfer should still be waiting for the row lock"
    );

    blocker.rollback().await.expect("Failed to release blocker");

    assert_eq!(balance_of(&db, a.id).await, a.balance);
    assert_eq!(balance_of(&db, b.id).await, b.balance);
    assert!(db
        .list_transfers(a.id, b.id, Pagination::default())
        .await
        .unwrap()
        .is_empty());

    // The accounts stay usable once the abandoned unit of work is gone.
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        engine.transfer(TransferParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 10,
        }),
    )
    .await
    .expect("Follow-up transfer timed out")
    .expect("Follow-up transfer should succeed");
    assert_eq!(result.from_account.balance, a.balance - 10);
    assert_eq!(result.to_account.balance, b.balance + 10);
}
