//! Transaction tracker
//!
//! Owns the lifecycle state machine of individual transactions, locally
//! submitted or externally observed. Matching is by hash first, then by
//! (sender, nonce); a nonce may be superseded by a gas-price bump, which
//! moves the prior transaction to `Error(Replaced)` and keeps the liveness
//! invariant: at most one non-error transaction per (sender, nonce).

use crate::records::{TransactionRecord, TxErrorCode, TxSignature, TxStatus};
use crate::store::LedgerStore;
use crate::types::FeedTransaction;
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A locally-submitted transaction entering the tracker as `New`.
#[derive(Debug, Clone)]
pub struct Submission {
    pub hash: B256,
    pub from_address: Address,
    pub to_address: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas: U256,
    pub gas_price: U256,
    pub data: Vec<u8>,
    pub signature: TxSignature,
    pub sender_id: Option<String>,
}

/// Current Unix time in seconds.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Transaction tracker over the ledger store.
///
/// Operations are parallelizable across senders but serialized per sender:
/// callers hold the sender lock from `sender_lock` around submission and
/// queue processing for one address.
pub struct TransactionTracker<S: LedgerStore> {
    store: Arc<S>,
    sender_locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
    /// Reorg-evicted transactions waiting to reappear on the new chain,
    /// with the number of polls they have been waiting.
    rematch_ages: Mutex<HashMap<B256, u32>>,
    /// Polls an evicted transaction may wait before going to error.
    rematch_window: u32,
}

impl<S: LedgerStore> TransactionTracker<S> {
    pub fn new(store: Arc<S>, rematch_window: u32) -> Self {
        Self {
            store,
            sender_locks: Mutex::new(HashMap::new()),
            rematch_ages: Mutex::new(HashMap::new()),
            rematch_window,
        }
    }

    /// Mutual exclusion handle for one sender address.
    pub fn sender_lock(&self, sender: Address) -> Arc<Mutex<()>> {
        let mut locks = self.sender_locks.lock().expect("sender lock map poisoned");
        locks.entry(sender).or_default().clone()
    }

    /// The live (non-error) transaction for a (sender, nonce), if any.
    pub fn live_transaction(
        &self,
        sender: Address,
        nonce: u64,
    ) -> Result<Option<TransactionRecord>> {
        let rows = self.store.get_transactions_by_sender_nonce(sender, nonce)?;
        Ok(rows.into_iter().find(|tx| tx.status != TxStatus::Error))
    }

    /// Accept a locally-submitted transaction as `New`.
    ///
    /// A prior live transaction for the same (sender, nonce) in `Queued` or
    /// `Unconfirmed` is superseded (gas-price bump): it moves to
    /// `Error(Replaced)`. A prior `Confirmed` transaction makes the nonce
    /// impossible and the submission is rejected.
    pub fn submit(&self, submission: Submission) -> Result<TransactionRecord> {
        if submission.signature.r == U256::ZERO || submission.signature.s == U256::ZERO {
            return Err(crate::error::SyncError::InvalidTransaction(format!(
                "malformed signature on tx 0x{:x}",
                submission.hash
            ))
            .into());
        }

        let lock = self.sender_lock(submission.from_address);
        let _guard = lock.lock().expect("sender lock poisoned");

        if let Some(prior) = self.live_transaction(submission.from_address, submission.nonce)? {
            if prior.hash == submission.hash {
                // Idempotent resubmission of the same payload
                return Ok(prior);
            }
            match prior.status {
                TxStatus::Confirmed => {
                    return Err(crate::error::SyncError::InvalidTransaction(format!(
                        "nonce {} for {} already confirmed in tx 0x{:x}",
                        submission.nonce, submission.from_address, prior.hash
                    ))
                    .into());
                }
                TxStatus::Queued | TxStatus::Unconfirmed | TxStatus::New => {
                    info!(
                        "Superseding tx 0x{:x} with 0x{:x} for ({}, nonce {})",
                        prior.hash, submission.hash, submission.from_address, submission.nonce
                    );
                    self.transition(prior.hash, TxStatus::Error, None, Some(TxErrorCode::Replaced))?;
                }
                TxStatus::Error => {}
            }
        }

        let now = unix_now();
        let record = TransactionRecord {
            hash: submission.hash,
            from_address: submission.from_address,
            to_address: submission.to_address,
            nonce: submission.nonce,
            value: submission.value,
            gas: submission.gas,
            gas_price: submission.gas_price,
            data: submission.data,
            signature: Some(submission.signature),
            status: TxStatus::New,
            blocknumber: None,
            error_code: None,
            created: now,
            updated: now,
            sender_id: submission.sender_id,
        };
        self.store.put_transaction(&record)?;
        Ok(record)
    }

    /// Apply a status transition if the state machine allows it.
    ///
    /// Returns true if the transition was applied, false if it was rejected
    /// (logged, never silently applied).
    pub fn transition(
        &self,
        hash: B256,
        to: TxStatus,
        blocknumber: Option<u64>,
        error_code: Option<TxErrorCode>,
    ) -> Result<bool> {
        let mut tx = match self.store.get_transaction(hash)? {
            Some(tx) => tx,
            None => {
                warn!("Transition requested for unknown tx 0x{:x}", hash);
                return Ok(false);
            }
        };

        if tx.status == to {
            return Ok(false);
        }
        if !tx.status.can_transition(to) {
            warn!(
                "Rejected transition {} -> {} for tx 0x{:x}",
                tx.status.as_str(),
                to.as_str(),
                hash
            );
            return Ok(false);
        }

        debug!(
            "tx 0x{:x}: {} -> {}",
            hash,
            tx.status.as_str(),
            to.as_str()
        );

        // Maintain the inclusion index across confirmation changes
        if let (TxStatus::Confirmed, Some(old_block)) = (tx.status, tx.blocknumber) {
            self.store.delete_tx_block_index(old_block, hash)?;
        }

        tx.status = to;
        tx.updated = unix_now();
        match to {
            TxStatus::Confirmed => {
                tx.blocknumber = blocknumber.or(tx.blocknumber);
                if let Some(block) = tx.blocknumber {
                    self.store.put_tx_block_index(block, hash)?;
                }
            }
            TxStatus::Error => {
                tx.error_code = error_code;
            }
            TxStatus::Unconfirmed => {
                tx.blocknumber = blocknumber;
            }
            _ => {}
        }

        self.store.put_transaction(&tx)?;
        Ok(true)
    }

    /// Mark a `New` transaction accepted by the broadcaster.
    pub fn mark_queued(&self, hash: B256) -> Result<bool> {
        self.transition(hash, TxStatus::Queued, None, None)
    }

    /// Mark a transaction terminally failed.
    pub fn fail(&self, hash: B256, code: TxErrorCode) -> Result<bool> {
        self.transition(hash, TxStatus::Error, None, Some(code))
    }

    /// Record that a transaction is included in a block that has not yet
    /// reached confirmation depth.
    ///
    /// `New`/`Queued` transactions move to `Unconfirmed`; an already
    /// `Unconfirmed` one just gains the inclusion height. The inclusion
    /// index entry is what reorg eviction and depth promotion scan.
    pub fn note_inclusion(&self, hash: B256, height: u64) -> Result<()> {
        let mut tx = match self.store.get_transaction(hash)? {
            Some(tx) => tx,
            None => return Ok(()),
        };
        match tx.status {
            TxStatus::New | TxStatus::Queued => {
                self.transition(hash, TxStatus::Unconfirmed, Some(height), None)?;
            }
            TxStatus::Unconfirmed => {
                tx.blocknumber = Some(height);
                tx.updated = unix_now();
                self.store.put_transaction(&tx)?;
            }
            TxStatus::Confirmed | TxStatus::Error => return Ok(()),
        }
        self.store.put_tx_block_index(height, hash)?;
        Ok(())
    }

    /// Match an observed on-chain or pending transaction against tracked
    /// rows, creating an externally-originated record if none matches.
    ///
    /// `confirmed` reflects whether the containing block has reached
    /// confirmation depth; until then inclusion only reaches `Unconfirmed`.
    pub fn observe(&self, observed: &FeedTransaction, confirmed: bool) -> Result<TransactionRecord> {
        let target = if confirmed {
            TxStatus::Confirmed
        } else {
            TxStatus::Unconfirmed
        };

        if let Some(existing) = self.store.get_transaction(observed.hash)? {
            self.note_rematched(observed.hash);
            if confirmed {
                self.transition(observed.hash, TxStatus::Confirmed, observed.block_number, None)?;
            } else if let Some(height) = observed.block_number {
                self.note_inclusion(observed.hash, height)?;
            } else if matches!(existing.status, TxStatus::New | TxStatus::Queued) {
                // Pending-pool sighting promotes the broadcast states only;
                // a confirmed transaction is never demoted by a pool echo
                self.transition(observed.hash, TxStatus::Unconfirmed, None, None)?;
            }
            return self
                .store
                .get_transaction(observed.hash)?
                .context("Transaction vanished mid-update");
        }

        let lock = self.sender_lock(observed.from);
        let _guard = lock.lock().expect("sender lock poisoned");

        // A different hash for a tracked (sender, nonce) means ours was
        // overwritten on the network.
        if let Some(prior) = self.live_transaction(observed.from, observed.nonce)? {
            if prior.hash != observed.hash && prior.status != TxStatus::Confirmed {
                warn!(
                    "Observed overwrite of tx 0x{:x} by 0x{:x} ({}, nonce {})",
                    prior.hash, observed.hash, observed.from, observed.nonce
                );
                self.transition(prior.hash, TxStatus::Error, None, Some(TxErrorCode::Replaced))?;
            }
        }

        let now = unix_now();
        let record = TransactionRecord {
            hash: observed.hash,
            from_address: observed.from,
            to_address: observed.to,
            nonce: observed.nonce,
            value: observed.value,
            gas: observed.gas,
            gas_price: observed.gas_price.unwrap_or(U256::ZERO),
            data: observed.input.clone(),
            signature: None,
            status: target,
            blocknumber: observed.block_number,
            error_code: None,
            created: now,
            updated: now,
            sender_id: None,
        };
        self.store.put_transaction(&record)?;
        if let Some(block) = observed.block_number {
            // Indexed at inclusion so depth promotion and reorg eviction
            // can find it
            self.store.put_tx_block_index(block, observed.hash)?;
        }
        Ok(record)
    }

    /// Evict transactions confirmed only in blocks at or above the fork
    /// height: they return to `Unconfirmed` and enter the re-match window.
    ///
    /// Returns the evicted hashes. Must run under the ledger's reorg gate.
    pub fn handle_reorg(&self, fork_height: u64) -> Result<Vec<B256>> {
        let included = self.store.get_tx_hashes_from(fork_height)?;
        let mut evicted = Vec::new();

        for (height, hash) in included {
            // The inclusion points at a stale block either way
            self.store.delete_tx_block_index(height, hash)?;

            let mut tx = match self.store.get_transaction(hash)? {
                Some(tx) => tx,
                None => continue,
            };
            match tx.status {
                TxStatus::Confirmed => {
                    info!("Reorg evicting tx 0x{:x} from stale block {}", hash, height);
                    self.transition(hash, TxStatus::Unconfirmed, None, None)?;
                    evicted.push(hash);
                }
                TxStatus::Unconfirmed => {
                    // Included but not yet deep enough; it just loses the
                    // inclusion and waits for the new chain
                    tx.blocknumber = None;
                    tx.updated = unix_now();
                    self.store.put_transaction(&tx)?;
                    evicted.push(hash);
                }
                _ => continue,
            }
            self.rematch_ages
                .lock()
                .expect("rematch map poisoned")
                .insert(hash, 0);
        }

        Ok(evicted)
    }

    /// Forget the re-match deadline for a transaction seen again.
    fn note_rematched(&self, hash: B256) {
        self.rematch_ages
            .lock()
            .expect("rematch map poisoned")
            .remove(&hash);
    }

    /// Age the re-match window one poll. Evicted transactions that have not
    /// reappeared within the window go to `Error(NonceTimeout)`.
    pub fn tick_rematch_window(&self) -> Result<Vec<B256>> {
        let expired: Vec<B256> = {
            let mut ages = self.rematch_ages.lock().expect("rematch map poisoned");
            let mut expired = Vec::new();
            for (hash, age) in ages.iter_mut() {
                *age += 1;
                if *age > self.rematch_window {
                    expired.push(*hash);
                }
            }
            for hash in &expired {
                ages.remove(hash);
            }
            expired
        };

        for hash in &expired {
            warn!(
                "Evicted tx 0x{:x} not re-included within the re-match window",
                hash
            );
            self.fail(*hash, TxErrorCode::NonceTimeout)?;
        }
        Ok(expired)
    }

    /// Number of evicted transactions still waiting to be re-matched.
    pub fn pending_rematch_count(&self) -> usize {
        self.rematch_ages.lock().expect("rematch map poisoned").len()
    }
}
