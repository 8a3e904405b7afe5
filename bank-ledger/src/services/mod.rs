//! Ledger store implementations, the transfer engine and metrics.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod transfer;

pub use database::{Database, PgUnitOfWork};
pub use memory::{MemoryStore, MemoryUnitOfWork};
pub use metrics::{get_metrics, init_metrics};
pub use store::{LedgerQueries, LedgerStore, UnitOfWork};
pub use transfer::{lock_ordered_adjustments, BalanceAdjustment, Side, TransferEngine};
