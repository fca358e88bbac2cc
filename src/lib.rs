//! ledgersync - wallet ledger synchronization engine
//!
//! Follows an Ethereum-compatible block/transaction feed, tracks the
//! lifecycle of locally-submitted and externally-observed transactions,
//! detects and repairs chain reorganizations, and deterministically derives
//! token and collectible balances from transfer events, notifying
//! registered clients of state changes.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filters;
pub mod keys;
pub mod ledger;
pub mod reconciler;
pub mod records;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod tracker;
pub mod types;

// Re-export the main types for convenience
pub use error::SyncError;
pub use ledger::{BlockLedger, IngestOutcome, RejectReason};
pub use records::{
    BlockRecord, CollectibleContract, CollectibleKind, CollectibleTokenRecord,
    FilterRegistration, NotificationRecord, NotificationRegistration, ReconcileFailure,
    TokenBalanceRecord, TokenTransferRecord, TransactionRecord, TxErrorCode, TxStatus,
    Visibility,
};
pub use store::{LedgerStore, RocksLedgerStore};
