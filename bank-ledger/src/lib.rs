//! Bank Ledger - accounts, ledger entries and a deadlock-free transfer engine.

pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod services;
pub mod startup;

pub use error::LedgerError;
