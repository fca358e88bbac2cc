//! Ledger synchronization engine
//!
//! Drives the pipeline: blocks from the feed flow into the block ledger,
//! confirmed/stale signals feed the transaction tracker, transfers and raw
//! logs feed the balance reconciler and filter matcher, and all of them feed
//! the notification dispatcher. Ingestion is strictly sequential per chain;
//! the checkpoint advances only after a height's downstream processing is
//! acknowledged.

use crate::config::EngineConfig;
use crate::dispatcher::{EventKind, NotificationDispatcher, OutboundNotification};
use crate::filters::FilterMatcher;
use crate::ledger::{BlockLedger, IngestOutcome, RejectReason};
use crate::reconciler::BalanceReconciler;
use crate::rpc::FeedClient;
use crate::store::LedgerStore;
use crate::tracker::TransactionTracker;
use crate::types::{FeedBlock, FeedTransaction, LogEvent};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// `transfer(address,uint256)` selector
const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
/// `transferFrom(address,address,uint256)` selector
const ERC20_TRANSFER_FROM_SELECTOR: [u8; 4] = [0x23, 0xb8, 0x72, 0xdd];

/// Token transfer parties recognized from transaction calldata, before any
/// log confirms the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalldataTransfer {
    pub from: Option<Address>,
    pub to: Address,
    pub value: U256,
}

/// Decode ERC20 `transfer`/`transferFrom` calldata into the interested
/// parties. Returns None for anything else, malformed lengths included.
pub fn parse_erc20_calldata(input: &[u8]) -> Option<CalldataTransfer> {
    if input.len() == 68 && input[0..4] == ERC20_TRANSFER_SELECTOR {
        let to = Address::from_slice(&input[16..36]);
        let value = U256::from_be_slice(&input[36..68]);
        return Some(CalldataTransfer {
            from: None,
            to,
            value,
        });
    }
    if input.len() == 100 && input[0..4] == ERC20_TRANSFER_FROM_SELECTOR {
        let from = Address::from_slice(&input[16..36]);
        let to = Address::from_slice(&input[48..68]);
        let value = U256::from_be_slice(&input[68..100]);
        return Some(CalldataTransfer {
            from: Some(from),
            to,
            value,
        });
    }
    None
}

/// The synchronization engine. One per followed chain.
pub struct SyncEngine<S: LedgerStore> {
    store: Arc<S>,
    feed: FeedClient,
    ledger: BlockLedger<S>,
    tracker: TransactionTracker<S>,
    reconciler: BalanceReconciler<S>,
    matcher: FilterMatcher<S>,
    dispatcher: NotificationDispatcher<S>,
    config: EngineConfig,
    polls: u32,
}

impl<S: LedgerStore> SyncEngine<S> {
    /// Build the engine and the outbound notification queue receiver; hand
    /// the receiver to `dispatcher::run_delivery_worker`.
    pub fn new(
        store: Arc<S>,
        feed: FeedClient,
        config: EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<OutboundNotification>)> {
        let wrapped_ether = config.wrapped_ether_address()?;
        let ledger = BlockLedger::new(store.clone(), config.confirmation_depth);
        let tracker = TransactionTracker::new(store.clone(), config.rematch_window);
        let reconciler = BalanceReconciler::new(store.clone(), wrapped_ether);
        let matcher = FilterMatcher::new(store.clone());
        let (dispatcher, rx) = NotificationDispatcher::new(store.clone(), config.queue_capacity);

        let engine = Self {
            store,
            feed,
            ledger,
            tracker,
            reconciler,
            matcher,
            dispatcher,
            config,
            polls: 0,
        };
        Ok((engine, rx))
    }

    pub fn ledger(&self) -> &BlockLedger<S> {
        &self.ledger
    }

    pub fn tracker(&self) -> &TransactionTracker<S> {
        &self.tracker
    }

    pub fn reconciler(&self) -> &BalanceReconciler<S> {
        &self.reconciler
    }

    pub fn matcher(&self) -> &FilterMatcher<S> {
        &self.matcher
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher<S> {
        &self.dispatcher
    }

    /// Validate persisted state and establish the starting point.
    ///
    /// On first run the current feed head becomes the designated checkpoint
    /// height; only changes from there forward are tracked.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing synchronization engine...");

        if let Some(checkpoint) = self.ledger.validate_checkpoint()? {
            info!("Resuming from checkpoint {}", checkpoint);
            return Ok(());
        }

        let latest = self
            .feed
            .get_block_number("latest")
            .await
            .context("Failed to get latest block number")?;
        let block = self
            .feed
            .get_block_at(latest)
            .await
            .context("Failed to fetch starting block")?
            .with_context(|| format!("Node has no block at {}", latest))?;

        match self.ledger.ingest(&block)? {
            IngestOutcome::Accepted => {}
            other => anyhow::bail!("Could not install starting block: {:?}", other),
        }
        self.ledger.acknowledge(latest)?;
        info!("First run: starting from block {}", latest);
        Ok(())
    }

    /// Run the main loop: poll the feed head, ingest forward, sweep.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting synchronization loop...");

        loop {
            if let Err(e) = self.poll_once().await {
                // Transient by construction: nothing was mutated
                warn!("Poll failed, will retry: {:#}", e);
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(
                self.config.poll_interval_secs,
            ))
            .await;
        }
    }

    /// One poll: catch up to the feed head, then age the re-match window.
    pub async fn poll_once(&mut self) -> Result<()> {
        let latest = self
            .feed
            .get_block_number("latest")
            .await
            .context("Failed to get latest block number")?;

        self.sync_to(latest).await?;

        self.polls = self.polls.wrapping_add(1);
        if self.polls % self.config.sweep_interval_polls.max(1) == 0 {
            let expired = self.tracker.tick_rematch_window()?;
            if !expired.is_empty() {
                info!("Expired {} unmatched transaction(s)", expired.len());
            }
        }
        Ok(())
    }

    /// Ingest forward until the local head reaches `latest`.
    async fn sync_to(&self, latest: u64) -> Result<()> {
        loop {
            let head = match self.store.get_head()? {
                Some(head) => head,
                None => return Ok(()),
            };
            if head >= latest {
                return Ok(());
            }
            let next = head + 1;

            let block = match self.feed.get_block_at(next).await? {
                Some(block) => block,
                None => {
                    debug!("Node has no block at {} yet", next);
                    return Ok(());
                }
            };
            let logs = self.feed.get_logs(next).await?;

            match self.handle_block(&block, &logs)? {
                IngestOutcome::Accepted | IngestOutcome::ForkDetected { .. } => {
                    self.promote_ready()?;
                }
                IngestOutcome::Rejected(RejectReason::ChainGap) => {
                    self.backfill(next).await?;
                }
                IngestOutcome::Rejected(_) => return Ok(()),
            }
        }
    }

    /// Walk backwards from a gap until a block connects (or forks), then
    /// let the forward ascent resume.
    async fn backfill(&self, gap_at: u64) -> Result<()> {
        info!("Backfilling below height {}", gap_at);
        let mut height = gap_at.saturating_sub(1);
        let mut walked = 0u64;

        loop {
            if walked >= self.config.backfill_limit {
                anyhow::bail!(
                    "Backfill from {} exceeded {} blocks without connecting",
                    gap_at,
                    self.config.backfill_limit
                );
            }
            let block = self
                .feed
                .get_block_at(height)
                .await?
                .with_context(|| format!("Node has no block at {} during backfill", height))?;
            let logs = self.feed.get_logs(height).await?;

            match self.handle_block(&block, &logs)? {
                IngestOutcome::Accepted | IngestOutcome::ForkDetected { .. } => {
                    info!("Backfill connected at height {}", height);
                    return Ok(());
                }
                IngestOutcome::Rejected(RejectReason::AlreadyKnown) => return Ok(()),
                IngestOutcome::Rejected(RejectReason::ChainGap) => {
                    walked += 1;
                    height = height
                        .checked_sub(1)
                        .context("Backfill walked below genesis")?;
                }
                IngestOutcome::Rejected(RejectReason::BelowCheckpoint) => {
                    return Err(crate::error::SyncError::CorruptCheckpoint(format!(
                        "Backfill reached the checkpoint at height {}; the finalized \
                         history diverges from the node",
                        height
                    ))
                    .into());
                }
            }
        }
    }

    /// Apply one block and its logs to the pipeline. Synchronous so the
    /// reorg sequence (ledger, tracker, reconciler) appears atomic to
    /// readers behind the reorg gate.
    pub fn handle_block(&self, block: &FeedBlock, logs: &[LogEvent]) -> Result<IngestOutcome> {
        let outcome = self.ledger.ingest(block)?;

        match &outcome {
            IngestOutcome::Rejected(reason) => {
                debug!("Block {} rejected: {:?}", block.number, reason);
                return Ok(outcome);
            }
            IngestOutcome::ForkDetected {
                height,
                invalidated,
            } => {
                // Exclusive phase: readers see pre-reorg or rolled-back
                // state, never the middle
                let _gate = self.ledger.write_gate();
                let evicted = self.tracker.handle_reorg(*height)?;
                self.reconciler.rollback(*height)?;
                info!(
                    "Rollback at height {} complete: {} block(s) stale, {} transaction(s) evicted",
                    height,
                    invalidated.len(),
                    evicted.len()
                );
            }
            IngestOutcome::Accepted => {}
        }

        self.process_block_content(block, logs)?;
        Ok(outcome)
    }

    /// Observe a block's transactions, record its transfers, and run filter
    /// matching over its logs.
    fn process_block_content(&self, block: &FeedBlock, logs: &[LogEvent]) -> Result<()> {
        for tx in &block.transactions {
            if !self.is_interesting(tx)? {
                continue;
            }
            debug!(
                "Observing tx 0x{:x} in block {}: from={:?}, to={:?}",
                tx.hash, block.number, tx.from, tx.to
            );
            let record = self.tracker.observe(tx, false)?;
            // Inclusion notice; the confirmed notice follows at depth
            let payload = payment_payload(&record, "unconfirmed");
            self.dispatcher
                .notify(record.from_address, EventKind::Payment, &payload)?;
            if let Some(to) = record.to_address {
                self.dispatcher.notify(to, EventKind::Payment, &payload)?;
            }
        }

        for log in logs {
            // Transfer-shaped logs feed the reconciler once the height
            // confirms
            if let Some(transfer) = self.reconciler.parse_transfer_log(log)? {
                self.reconciler.record_transfer(log.block_number, &transfer)?;
            }

            // Everything with a topic runs through the filter matcher
            if let Some(topic_id) = log.topic0() {
                let matched = self.matcher.match_event(log.address, topic_id)?;
                if matched.is_empty() {
                    continue;
                }
                let payload = serde_json::json!({
                    "contractAddress": format!("0x{:x}", log.address),
                    "topic": format!("0x{:x}", topic_id),
                    "data": format!("0x{}", hex::encode(&log.data)),
                    "transactionHash": format!("0x{:x}", log.transaction_hash),
                    "blockNumber": log.block_number,
                })
                .to_string();
                for registration_id in matched {
                    self.dispatcher.notify_filter_match(
                        &registration_id,
                        log.address,
                        &payload,
                    )?;
                }
            }
        }

        Ok(())
    }

    /// Whether a transaction touches anything a client cares about: a
    /// tracked hash, a registered address, or the parties of recognized
    /// token-transfer calldata.
    fn is_interesting(&self, tx: &FeedTransaction) -> Result<bool> {
        if self.store.get_transaction(tx.hash)?.is_some() {
            return Ok(true);
        }
        if !self
            .store
            .get_registrations_for_address(tx.from)?
            .is_empty()
        {
            return Ok(true);
        }
        if let Some(to) = tx.to {
            if !self.store.get_registrations_for_address(to)?.is_empty() {
                return Ok(true);
            }
        }
        if let Some(parsed) = parse_erc20_calldata(&tx.input) {
            let token_sender = parsed.from.unwrap_or(tx.from);
            if !self
                .store
                .get_registrations_for_address(token_sender)?
                .is_empty()
                || !self
                    .store
                    .get_registrations_for_address(parsed.to)?
                    .is_empty()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Promote every height that has reached confirmation depth but is not
    /// yet acknowledged: confirm its transactions, apply its transfers,
    /// emit confirmed notifications, then advance the checkpoint.
    pub fn promote_ready(&self) -> Result<Vec<u64>> {
        let confirmed_up_to = match self.ledger.confirmed_height()? {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };
        let start = match self.store.get_checkpoint()? {
            Some(cp) => cp + 1,
            None => return Ok(Vec::new()),
        };

        let mut promoted = Vec::new();
        for height in start..=confirmed_up_to {
            self.promote_height(height)?;
            self.ledger.acknowledge(height)?;
            promoted.push(height);
        }
        Ok(promoted)
    }

    fn promote_height(&self, height: u64) -> Result<()> {
        let _gate = self.ledger.read_gate();

        // Transactions included at this height reach their terminal depth
        let included = self.store.get_tx_hashes_from(height)?;
        for (h, hash) in included {
            if h != height {
                continue;
            }
            if !self
                .tracker
                .transition(hash, crate::records::TxStatus::Confirmed, Some(height), None)?
            {
                continue;
            }
            let tx = match self.store.get_transaction(hash)? {
                Some(tx) => tx,
                None => continue,
            };
            let payload = payment_payload(&tx, "confirmed");
            self.dispatcher
                .notify(tx.from_address, EventKind::Payment, &payload)?;
            if let Some(to) = tx.to_address {
                self.dispatcher.notify(to, EventKind::Payment, &payload)?;
            }
        }

        // Transfer events at this height hit derived balances exactly once
        let applied = self.reconciler.apply_height(height)?;
        if applied > 0 {
            debug!("Applied {} transfer(s) at height {}", applied, height);
        }
        for (_, transfer) in self.store.get_transfers_in_range(height, height)? {
            let payload = token_payload(&transfer, "confirmed");
            if transfer.from_address != Address::ZERO {
                self.dispatcher.notify(
                    transfer.from_address,
                    EventKind::TokenPayment,
                    &payload,
                )?;
            }
            if transfer.to_address != Address::ZERO {
                self.dispatcher
                    .notify(transfer.to_address, EventKind::TokenPayment, &payload)?;
            }
        }

        Ok(())
    }
}

/// Payment notification payload for a tracked transaction.
fn payment_payload(tx: &crate::records::TransactionRecord, status: &str) -> String {
    serde_json::json!({
        "txHash": format!("0x{:x}", tx.hash),
        "fromAddress": format!("0x{:x}", tx.from_address),
        "toAddress": tx.to_address.map(|a| format!("0x{:x}", a)),
        "value": format!("0x{:x}", tx.value),
        "status": status,
    })
    .to_string()
}

/// Token payment notification payload for a transfer event.
fn token_payload(transfer: &crate::records::TokenTransferRecord, status: &str) -> String {
    serde_json::json!({
        "txHash": format!("0x{:x}", transfer.transaction_hash),
        "contractAddress": format!("0x{:x}", transfer.contract_address),
        "fromAddress": format!("0x{:x}", transfer.from_address),
        "toAddress": format!("0x{:x}", transfer.to_address),
        "value": format!("0x{:x}", transfer.value),
        "status": status,
    })
    .to_string()
}
