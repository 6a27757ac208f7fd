//! Transactional Ledger Engine
//!
//! Moves money between two accounts as one atomic unit of work.
//!
//! # Components
//!
//! ```text
//! Store::tx_transfer
//!     │
//!     ▼
//! TxCoordinator ──begin──▶ TxSource (PgTxSource | MemoryTxSource)
//!     │                        │
//!     ▼                        ▼
//! transfer_in_tx ──────▶ Queries (transaction-scoped)
//!     │
//!     └─ lock_order: lower account id updated first
//! ```
//!
//! # Invariants
//!
//! 1. **All-or-nothing**: a transfer record, its two entries and both balance
//!    updates commit together or not at all
//! 2. **Balanced entries**: entries of one transfer sum to zero
//! 3. **Atomic add**: balances change only through `balance = balance + delta`
//! 4. **Global lock order**: balance rows are updated in ascending id order

pub mod error;
pub mod lock_order;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;
pub mod store;
pub mod transfer;
pub mod tx;

// Re-exports for convenience
pub use error::LedgerError;
pub use lock_order::{BalanceMove, order_pair, ordered_moves};
pub use memory::{FailPoint, MemoryTxSource};
pub use models::{
    Account, AccountId, CreateAccountParams, Entry, Page, Transfer, TransferParams, TransferResult,
};
pub use postgres::PgTxSource;
pub use queries::Queries;
pub use store::{LedgerStore, Store};
pub use tx::{IsolationLevel, RetryPolicy, TxContext, TxCoordinator, TxHandle, TxSource};
