//! Common test utilities for bank-ledger integration tests.
//!
//! These tests need PostgreSQL: set `TEST_DATABASE_URL` and run with `--ignored`.

#![allow(dead_code)]

use bank_ledger::models::{Account, CreateAccount, Currency};
use bank_ledger::services::{Database, LedgerQueries};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

const SCHEMA: &str = include_str!("../fixtures/schema.sql");

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,bank_ledger=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Connect to the test database and make sure the schema exists.
pub async fn spawn_db() -> Database {
    init_tracing();

    let database_url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run PostgreSQL tests");

    let db = Database::new(&database_url, 20, 1, Duration::from_secs(30))
        .await
        .expect("Failed to connect to test database");

    sqlx::raw_sql(SCHEMA)
        .execute(db.pool())
        .await
        .expect("Failed to apply test schema");

    db
}

pub fn random_owner() -> String {
    let mut rng = rand::thread_rng();
    (0..6).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

pub fn random_money() -> i64 {
    rand::thread_rng().gen_range(100..=10_000)
}

pub fn random_currency() -> Currency {
    *[Currency::Usd, Currency::Eur, Currency::Cad]
        .choose(&mut rand::thread_rng())
        .expect("currency list is not empty")
}

/// Create an account with the given opening balance.
pub async fn create_account_with_balance(db: &Database, balance: i64) -> Account {
    let input = CreateAccount {
        owner: random_owner(),
        balance,
        currency: random_currency(),
    };

    let account = db
        .create_account(&input)
        .await
        .expect("Failed to create account");

    assert_eq!(account.owner, input.owner);
    assert_eq!(account.balance, input.balance);
    assert_eq!(account.currency, input.currency.as_str());
    assert!(account.id > 0);

    account
}

/// Create an account with a random owner, balance and currency.
pub async fn create_random_account(db: &Database) -> Account {
    create_account_with_balance(db, random_money()).await
}
