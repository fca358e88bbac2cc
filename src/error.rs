//! Pipeline error taxonomy
//!
//! Fork detection and duplicate registrations are ordinary control-flow
//! outcomes, not errors; they never appear here.

use alloy_primitives::Address;
use thiserror::Error;

/// Errors raised by the synchronization pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Node unreachable or timed out; retried at the ingestion boundary
    /// without mutating ledger state.
    #[error("transient feed error: {0}")]
    TransientFeed(String),

    /// Block's parent is not locally known; ingestion for the height is
    /// deferred pending a backfill, not failed.
    #[error("chain gap at height {height}: parent not locally known")]
    ChainGap { height: u64 },

    /// Local, terminal transaction fault (bad signature, impossible nonce).
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Per-(contract, holder) balance computation failure; isolated to the
    /// pair, recorded for the operator view.
    #[error("balance computation failed for {contract}/{holder}: {message}")]
    BalanceComputation {
        contract: Address,
        holder: Address,
        message: String,
    },

    /// Notification transport failure; retried by the dispatcher with
    /// bounded backoff.
    #[error("dispatch failure: {0}")]
    Dispatch(String),

    /// The durable checkpoint references a stale or unknown block. Fatal;
    /// requires operator-driven resync.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),
}
