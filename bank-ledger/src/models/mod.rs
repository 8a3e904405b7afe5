//! Domain models for bank-ledger.

mod account;
mod entry;
mod transfer;

pub use account::{Account, CreateAccount, Currency, Pagination};
pub use entry::{CreateEntry, Entry};
pub use transfer::{CreateTransfer, Transfer, TransferParams, TransferResult};
