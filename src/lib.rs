//! Bank Ledger - transactional transfer engine
//!
//! Moves money between accounts as single atomic units of work on
//! PostgreSQL, with deterministic lock ordering between concurrent transfers.
//!
//! # Modules
//!
//! - [`ledger`] - Transfer orchestrator, transaction coordinator, lock ordering
//! - [`db`] - PostgreSQL pool and schema bootstrap
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;

// Convenient re-exports at crate root
pub use config::{AppConfig, DatabaseConfig, LedgerConfig};
pub use db::Database;
pub use ledger::{
    Account, Entry, IsolationLevel, LedgerError, LedgerStore, MemoryTxSource, PgTxSource, Store,
    Transfer, TransferParams, TransferResult, TxContext, TxCoordinator,
};
