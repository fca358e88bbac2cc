//! Balance reconciler
//!
//! Replays confirmed transfer events into per-(contract, address) balances.
//! Fungible balances are additive under a per-pair block watermark so a
//! redelivered event is a no-op; collectible ownership is replacement, a
//! non-fungible token has exactly one owner at a time. Reorg rollback
//! recomputes affected pairs by replaying the surviving events, never by
//! subtracting the stale chain's deltas.

use crate::records::{
    CollectibleKind, CollectibleTokenRecord, ReconcileFailure, TokenBalanceRecord,
    TokenTransferRecord, TxStatus,
};
use crate::store::LedgerStore;
use crate::types::{parse_address_from_topic, LogEvent};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// keccak256("Transfer(address,address,uint256)")
const TRANSFER_TOPIC: [u8; 32] = [
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d,
    0xaa, 0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23,
    0xb3, 0xef,
];

/// keccak256("Deposit(address,uint256)"), wrapped-ether mint
const DEPOSIT_TOPIC: [u8; 32] = [
    0xe1, 0xff, 0xfc, 0xc4, 0x92, 0x3d, 0x04, 0xb5, 0x59, 0xf4, 0xd2, 0x9a, 0x8b, 0xfc, 0x6c,
    0xda, 0x04, 0xeb, 0x5b, 0x0d, 0x3c, 0x46, 0x07, 0x51, 0xc2, 0x40, 0x2c, 0x5c, 0x5c, 0xc9,
    0x10, 0x9c,
];

/// keccak256("Withdrawal(address,uint256)"), wrapped-ether burn
const WITHDRAWAL_TOPIC: [u8; 32] = [
    0x7f, 0xcf, 0x53, 0x2c, 0x15, 0xf0, 0xa6, 0xdb, 0x0b, 0xd6, 0xd0, 0xe0, 0x38, 0xbe, 0xa7,
    0x1d, 0x30, 0xd8, 0x08, 0xc7, 0xd9, 0x8c, 0xb3, 0xbf, 0x72, 0x68, 0xa9, 0x5b, 0xf5, 0x08,
    0x1b, 0x65,
];

/// Balance reconciler over the ledger store.
pub struct BalanceReconciler<S: LedgerStore> {
    store: Arc<S>,
    /// Wrapped-ether contract whose Deposit/Withdrawal events count as
    /// mint/burn transfers, if configured.
    wrapped_ether: Option<Address>,
}

impl<S: LedgerStore> BalanceReconciler<S> {
    pub fn new(store: Arc<S>, wrapped_ether: Option<Address>) -> Self {
        Self {
            store,
            wrapped_ether,
        }
    }

    /// Decode a contract log into a transfer event, if it is one.
    ///
    /// Handles the standard Transfer topic in both its fungible shape
    /// (value in data) and its erc721 shape (token id as a third indexed
    /// topic), plus wrapped-ether Deposit/Withdrawal when configured.
    pub fn parse_transfer_log(&self, log: &LogEvent) -> Result<Option<TokenTransferRecord>> {
        let topic0 = match log.topic0() {
            Some(t) => t,
            None => return Ok(None),
        };

        if topic0.as_slice() == TRANSFER_TOPIC {
            if log.topics.len() < 3 {
                anyhow::bail!("Transfer log has insufficient topics");
            }
            let from = parse_address_from_topic(&log.topics[1])?;
            let to = parse_address_from_topic(&log.topics[2])?;
            let value = if log.topics.len() >= 4 {
                // erc721 shape: token id is indexed
                crate::types::parse_topic(&log.topics[3]).map(|t| U256::from_be_slice(t.as_slice()))?
            } else if log.data.len() >= 32 {
                U256::from_be_slice(&log.data[0..32])
            } else {
                U256::ZERO
            };
            return Ok(Some(TokenTransferRecord {
                transaction_hash: log.transaction_hash,
                log_index: log.log_index,
                contract_address: log.address,
                from_address: from,
                to_address: to,
                value,
                status: TxStatus::Unconfirmed,
            }));
        }

        if let Some(weth) = self.wrapped_ether {
            if log.address == weth && log.topics.len() >= 2 && log.data.len() >= 32 {
                let value = U256::from_be_slice(&log.data[0..32]);
                if topic0.as_slice() == DEPOSIT_TOPIC {
                    let to = parse_address_from_topic(&log.topics[1])?;
                    return Ok(Some(TokenTransferRecord {
                        transaction_hash: log.transaction_hash,
                        log_index: log.log_index,
                        contract_address: log.address,
                        from_address: Address::ZERO,
                        to_address: to,
                        value,
                        status: TxStatus::Unconfirmed,
                    }));
                }
                if topic0.as_slice() == WITHDRAWAL_TOPIC {
                    let from = parse_address_from_topic(&log.topics[1])?;
                    return Ok(Some(TokenTransferRecord {
                        transaction_hash: log.transaction_hash,
                        log_index: log.log_index,
                        contract_address: log.address,
                        from_address: from,
                        to_address: Address::ZERO,
                        value,
                        status: TxStatus::Unconfirmed,
                    }));
                }
            }
        }

        Ok(None)
    }

    /// Persist a transfer observed at a height. Keyed by
    /// (block, transaction, log index), so redelivery overwrites in place.
    pub fn record_transfer(&self, height: u64, transfer: &TokenTransferRecord) -> Result<()> {
        self.store.put_transfer(height, transfer)
    }

    /// Apply one confirmed transfer event to derived balances.
    ///
    /// Idempotent per (contract, address): each side applies only when
    /// `at_block` is above that pair's stored watermark, so redelivery
    /// cannot double-credit. A failure on one pair is recorded and does not
    /// block the other side or other pairs.
    pub fn apply_transfer(&self, transfer: &TokenTransferRecord, at_block: u64) -> Result<()> {
        let kind = self
            .store
            .get_collectible_contract(transfer.contract_address)?
            .map(|c| c.kind);

        match kind {
            Some(kind) if !kind.is_additive() => self.apply_ownership(transfer, kind, at_block),
            Some(CollectibleKind::Fungible) => self.apply_additive(transfer, at_block, true),
            _ => self.apply_additive(transfer, at_block, false),
        }
    }

    /// Ownership replacement for non-fungible kinds: the token's owner
    /// becomes the recipient, unconditionally.
    fn apply_ownership(
        &self,
        transfer: &TokenTransferRecord,
        kind: CollectibleKind,
        at_block: u64,
    ) -> Result<()> {
        let token_id = transfer.value;
        let mut token = self
            .store
            .get_collectible_token(transfer.contract_address, token_id)?
            .unwrap_or_else(|| CollectibleTokenRecord::new(transfer.to_address, None));
        token.owner_address = transfer.to_address;
        self.store
            .put_collectible_token(transfer.contract_address, token_id, &token)
            .with_context(|| {
                format!(
                    "Failed to store collectible {:?} #{}",
                    transfer.contract_address, token_id
                )
            })?;
        self.advance_contract_cursor(transfer.contract_address, at_block)?;
        debug!(
            "collectible {:?} #{} ({:?}) -> {:?}",
            transfer.contract_address, token_id, kind, transfer.to_address
        );
        Ok(())
    }

    /// Advance a collectible contract's processed-through cursor.
    fn advance_contract_cursor(&self, contract: Address, at_block: u64) -> Result<()> {
        if let Some(mut record) = self.store.get_collectible_contract(contract)? {
            if record.last_block < at_block {
                record.last_block = at_block;
                self.store.put_collectible_contract(contract, &record)?;
            }
        }
        Ok(())
    }

    /// Additive application for fungible tokens and fungible collectibles.
    fn apply_additive(
        &self,
        transfer: &TokenTransferRecord,
        at_block: u64,
        collectible: bool,
    ) -> Result<()> {
        let contract = transfer.contract_address;

        // Sender loses, unless this is a mint
        if transfer.from_address != Address::ZERO {
            self.apply_side(contract, transfer.from_address, transfer.value, false, at_block, collectible)?;
        }
        // Receiver gains, unless this is a burn
        if transfer.to_address != Address::ZERO {
            self.apply_side(contract, transfer.to_address, transfer.value, true, at_block, collectible)?;
        }
        Ok(())
    }

    fn apply_side(
        &self,
        contract: Address,
        holder: Address,
        value: U256,
        credit: bool,
        at_block: u64,
        collectible: bool,
    ) -> Result<()> {
        let current = if collectible {
            self.store.get_collectible_balance(contract, holder)?
        } else {
            self.store.get_token_balance(contract, holder)?
        };

        let mut record = current.unwrap_or_else(|| TokenBalanceRecord::new(U256::ZERO, 0));

        // Watermark guard: replays at or below the pair's watermark are
        // no-ops. A fresh pair has watermark 0 and accepts anything above.
        if record.blocknumber >= at_block && record.blocknumber != 0 {
            debug!(
                "Skipping transfer for {:?}/{:?}: block {} at or below watermark {}",
                contract, holder, at_block, record.blocknumber
            );
            return Ok(());
        }

        let updated = if credit {
            record.balance.checked_add(value)
        } else {
            record.balance.checked_sub(value)
        };

        match updated {
            Some(balance) => {
                record.balance = balance;
                record.blocknumber = at_block;
                if collectible {
                    self.store.put_collectible_balance(contract, holder, &record)?;
                } else {
                    self.store.put_token_balance(contract, holder, &record)?;
                }
                Ok(())
            }
            None => {
                let message = if credit {
                    format!("balance overflow adding {}", value)
                } else {
                    format!("balance underflow subtracting {} from {}", value, record.balance)
                };
                self.record_failure(contract, holder, at_block, message)
            }
        }
    }

    /// Record an isolated computation failure for the operator view without
    /// failing the pipeline.
    fn record_failure(
        &self,
        contract: Address,
        holder: Address,
        block: u64,
        message: String,
    ) -> Result<()> {
        error!(
            "Balance computation failed for {:?}/{:?} at block {}: {}",
            contract, holder, block, message
        );
        self.store
            .put_reconcile_failure(contract, holder, &ReconcileFailure { block, message })
    }

    /// Apply every stored transfer for one confirmed height.
    ///
    /// Additive deltas are accumulated per pair first and applied once, so
    /// several transfers touching one pair inside a block all land under a
    /// single watermark advance. Ownership events apply individually.
    pub fn apply_height(&self, height: u64) -> Result<usize> {
        let transfers = self.store.get_transfers_in_range(height, height)?;
        let count = transfers.len();

        // (contract, holder, fungible-collectible) -> (credit, debit)
        let mut acc: HashMap<(Address, Address, bool), (U256, U256)> = HashMap::new();

        for (_, transfer) in &transfers {
            let kind = self
                .store
                .get_collectible_contract(transfer.contract_address)?
                .map(|c| c.kind);
            match kind {
                Some(kind) if !kind.is_additive() => {
                    self.apply_ownership(transfer, kind, height)?;
                }
                other => {
                    let collectible = matches!(other, Some(CollectibleKind::Fungible));
                    if transfer.from_address != Address::ZERO {
                        let entry = acc
                            .entry((transfer.contract_address, transfer.from_address, collectible))
                            .or_insert((U256::ZERO, U256::ZERO));
                        entry.1 = entry.1.saturating_add(transfer.value);
                    }
                    if transfer.to_address != Address::ZERO {
                        let entry = acc
                            .entry((transfer.contract_address, transfer.to_address, collectible))
                            .or_insert((U256::ZERO, U256::ZERO));
                        entry.0 = entry.0.saturating_add(transfer.value);
                    }
                }
            }
        }

        for ((contract, holder, collectible), (credit, debit)) in acc {
            self.apply_net(contract, holder, credit, debit, height, collectible)?;
        }

        Ok(count)
    }

    /// Apply a net (credit, debit) delta for one pair under its watermark.
    fn apply_net(
        &self,
        contract: Address,
        holder: Address,
        credit: U256,
        debit: U256,
        at_block: u64,
        collectible: bool,
    ) -> Result<()> {
        let current = if collectible {
            self.store.get_collectible_balance(contract, holder)?
        } else {
            self.store.get_token_balance(contract, holder)?
        };
        let mut record = current.unwrap_or_else(|| TokenBalanceRecord::new(U256::ZERO, 0));

        if record.blocknumber >= at_block && record.blocknumber != 0 {
            debug!(
                "Skipping delta for {:?}/{:?}: block {} at or below watermark {}",
                contract, holder, at_block, record.blocknumber
            );
            return Ok(());
        }

        let updated = record
            .balance
            .checked_add(credit)
            .and_then(|b| b.checked_sub(debit));

        match updated {
            Some(balance) => {
                record.balance = balance;
                record.blocknumber = at_block;
                if collectible {
                    self.store.put_collectible_balance(contract, holder, &record)?;
                } else {
                    self.store.put_token_balance(contract, holder, &record)?;
                }
                Ok(())
            }
            None => self.record_failure(
                contract,
                holder,
                at_block,
                format!(
                    "net delta +{} -{} over balance {} out of range",
                    credit, debit, record.balance
                ),
            ),
        }
    }

    /// Recompute a pair's balance by replaying every stored transfer up to
    /// and including `up_to`. The idempotence law: this must equal the
    /// incrementally maintained balance.
    pub fn replayed_balance(&self, contract: Address, holder: Address, up_to: u64) -> Result<U256> {
        let transfers = self.store.get_transfers_in_range(0, up_to)?;
        let mut balance = U256::ZERO;
        for (_, t) in transfers {
            if t.contract_address != contract {
                continue;
            }
            if t.to_address == holder {
                balance = balance.saturating_add(t.value);
            }
            if t.from_address == holder {
                balance = balance.saturating_sub(t.value);
            }
        }
        Ok(balance)
    }

    /// Roll affected state back to the last common ancestor of a fork.
    ///
    /// Every pair touched by a transfer at or above `fork_height` is
    /// recomputed by replaying the surviving transfers below the fork; the
    /// stale chain's transfer rows are then dropped. Runs under the ledger's
    /// reorg gate so readers never see a partial rollback.
    pub fn rollback(&self, fork_height: u64) -> Result<()> {
        let stale_transfers: Vec<(u64, TokenTransferRecord)> =
            self.store.get_transfers_in_range(fork_height, u64::MAX)?;

        if stale_transfers.is_empty() {
            return Ok(());
        }

        info!(
            "Rolling back {} transfer(s) at or above height {}",
            stale_transfers.len(),
            fork_height
        );

        // Pairs and tokens touched by the stale chain
        let mut fungible_pairs: HashSet<(Address, Address)> = HashSet::new();
        let mut collectible_tokens: HashSet<(Address, U256)> = HashSet::new();
        for (_, t) in &stale_transfers {
            let kind = self
                .store
                .get_collectible_contract(t.contract_address)?
                .map(|c| c.kind);
            match kind {
                Some(kind) if !kind.is_additive() => {
                    collectible_tokens.insert((t.contract_address, t.value));
                }
                _ => {
                    if t.from_address != Address::ZERO {
                        fungible_pairs.insert((t.contract_address, t.from_address));
                    }
                    if t.to_address != Address::ZERO {
                        fungible_pairs.insert((t.contract_address, t.to_address));
                    }
                }
            }
        }

        // Drop the stale rows before replaying so they cannot contribute
        for (height, t) in &stale_transfers {
            self.store
                .delete_transfer(*height, t.transaction_hash, t.log_index)?;
        }

        let ancestor = fork_height.saturating_sub(1);

        // Fungible pairs: replay the surviving history from genesis forward
        for (contract, holder) in fungible_pairs {
            let replayed = self.replayed_balance(contract, holder, ancestor)?;
            let collectible = self
                .store
                .get_collectible_contract(contract)?
                .map_or(false, |c| c.kind.is_additive());
            let existing = if collectible {
                self.store.get_collectible_balance(contract, holder)?
            } else {
                self.store.get_token_balance(contract, holder)?
            };
            let mut record = existing.unwrap_or_else(|| TokenBalanceRecord::new(U256::ZERO, 0));
            record.balance = replayed;
            record.blocknumber = ancestor;
            if collectible {
                self.store.put_collectible_balance(contract, holder, &record)?;
            } else {
                self.store.put_token_balance(contract, holder, &record)?;
            }
            debug!(
                "Rolled back {:?}/{:?} to {} at watermark {}",
                contract, holder, record.balance, ancestor
            );
        }

        // Collectibles: the owner is whoever the surviving history last
        // assigned; tokens minted only on the stale chain keep their record
        // but ownership reverts on the new chain's events.
        let surviving = self.store.get_transfers_in_range(0, ancestor)?;
        let mut last_owner: HashMap<(Address, U256), Address> = HashMap::new();
        for (_, t) in &surviving {
            last_owner.insert((t.contract_address, t.value), t.to_address);
        }
        let mut touched_contracts: HashSet<Address> = HashSet::new();
        for (contract, token_id) in collectible_tokens {
            touched_contracts.insert(contract);
            if let Some(owner) = last_owner.get(&(contract, token_id)) {
                let mut token = self
                    .store
                    .get_collectible_token(contract, token_id)?
                    .unwrap_or_else(|| CollectibleTokenRecord::new(*owner, None));
                token.owner_address = *owner;
                self.store.put_collectible_token(contract, token_id, &token)?;
            } else {
                warn!(
                    "Collectible {:?} #{} only exists on the stale chain",
                    contract, token_id
                );
            }
        }

        // Their cursors return to the ancestor so the new chain replays
        for contract in touched_contracts {
            if let Some(mut record) = self.store.get_collectible_contract(contract)? {
                if record.last_block > ancestor {
                    record.last_block = ancestor;
                    self.store.put_collectible_contract(contract, &record)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::CollectibleContract;
    use crate::store::RocksLedgerStore;
    use alloy_primitives::{b256, B256};
    use tempfile::TempDir;

    fn create_reconciler(
        weth: Option<Address>,
    ) -> (BalanceReconciler<RocksLedgerStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RocksLedgerStore::open(temp_dir.path()).unwrap());
        (BalanceReconciler::new(store, weth), temp_dir)
    }

    fn contract_c() -> Address {
        Address::from_slice(&hex::decode("dAC17F958D2ee523a2206206994597C13D831ec7").unwrap())
    }

    fn contract_d() -> Address {
        Address::from_slice(&hex::decode("06012c8cf97bead5deae237070f9587f8e7a266d").unwrap())
    }

    fn addr_a() -> Address {
        Address::from_slice(&hex::decode("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap())
    }

    fn addr_b() -> Address {
        Address::from_slice(&hex::decode("70997970c51812dc3a010c7d01b50e0d17dc79c8").unwrap())
    }

    fn transfer(
        contract: Address,
        from: Address,
        to: Address,
        value: u64,
        log_index: u64,
    ) -> TokenTransferRecord {
        TokenTransferRecord {
            transaction_hash: b256!(
                "00000000000000000000000000000000000000000000000000000000000000aa"
            ),
            log_index,
            contract_address: contract,
            from_address: from,
            to_address: to,
            value: U256::from(value),
            status: TxStatus::Confirmed,
        }
    }

    fn balance_of(rec: &BalanceReconciler<RocksLedgerStore>, c: Address, a: Address) -> U256 {
        rec.store
            .get_token_balance(c, a)
            .unwrap()
            .map(|r| r.balance)
            .unwrap_or(U256::ZERO)
    }

    #[test]
    fn test_transfer_moves_balance_and_watermarks() {
        let (rec, _tmp) = create_reconciler(None);

        // Mint 100 to A at block 150, then A -> B 50 at block 200
        let mint = transfer(contract_c(), Address::ZERO, addr_a(), 100, 0);
        rec.record_transfer(150, &mint).unwrap();
        rec.apply_transfer(&mint, 150).unwrap();

        let t = transfer(contract_c(), addr_a(), addr_b(), 50, 1);
        rec.record_transfer(200, &t).unwrap();
        rec.apply_transfer(&t, 200).unwrap();

        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::from(50u64));
        assert_eq!(balance_of(&rec, contract_c(), addr_b()), U256::from(50u64));

        let a = rec.store.get_token_balance(contract_c(), addr_a()).unwrap().unwrap();
        let b = rec.store.get_token_balance(contract_c(), addr_b()).unwrap().unwrap();
        assert_eq!(a.blocknumber, 200);
        assert_eq!(b.blocknumber, 200);
    }

    #[test]
    fn test_redelivery_is_noop() {
        let (rec, _tmp) = create_reconciler(None);

        let mint = transfer(contract_c(), Address::ZERO, addr_a(), 100, 0);
        rec.apply_transfer(&mint, 150).unwrap();

        let t = transfer(contract_c(), addr_a(), addr_b(), 50, 1);
        rec.apply_transfer(&t, 200).unwrap();
        // Same (transaction, log index) delivered again
        rec.apply_transfer(&t, 200).unwrap();

        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::from(50u64));
        assert_eq!(balance_of(&rec, contract_c(), addr_b()), U256::from(50u64));
    }

    #[test]
    fn test_burn_skips_zero_address() {
        let (rec, _tmp) = create_reconciler(None);

        let mint = transfer(contract_c(), Address::ZERO, addr_a(), 100, 0);
        rec.apply_transfer(&mint, 150).unwrap();
        let burn = transfer(contract_c(), addr_a(), Address::ZERO, 40, 1);
        rec.apply_transfer(&burn, 160).unwrap();

        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::from(60u64));
        assert!(rec
            .store
            .get_token_balance(contract_c(), Address::ZERO)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_underflow_isolated_and_recorded() {
        let (rec, _tmp) = create_reconciler(None);

        // A has nothing but sends 50: the A side fails, the B side credits
        let t = transfer(contract_c(), addr_a(), addr_b(), 50, 0);
        rec.apply_transfer(&t, 200).unwrap();

        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::ZERO);
        assert_eq!(balance_of(&rec, contract_c(), addr_b()), U256::from(50u64));

        let failures = rec.store.get_reconcile_failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, contract_c());
        assert_eq!(failures[0].1, addr_a());
        assert_eq!(failures[0].2.block, 200);
    }

    #[test]
    fn test_collectible_ownership_replacement() {
        let (rec, _tmp) = create_reconciler(None);
        rec.store
            .put_collectible_contract(
                contract_d(),
                &CollectibleContract {
                    kind: CollectibleKind::Erc721,
                    last_block: 0,
                },
            )
            .unwrap();

        // Token #7 minted to A, then A -> B. Ownership replaces, never adds.
        let mint = transfer(contract_d(), Address::ZERO, addr_a(), 7, 0);
        rec.apply_transfer(&mint, 100).unwrap();
        let t = transfer(contract_d(), addr_a(), addr_b(), 7, 1);
        rec.apply_transfer(&t, 110).unwrap();

        let token = rec
            .store
            .get_collectible_token(contract_d(), U256::from(7u64))
            .unwrap()
            .unwrap();
        assert_eq!(token.owner_address, addr_b());

        // No additive balance rows for an ownership contract
        assert!(rec
            .store
            .get_token_balance(contract_d(), addr_a())
            .unwrap()
            .is_none());

        // The contract cursor followed the applied events
        let registry = rec.store.get_collectible_contract(contract_d()).unwrap().unwrap();
        assert_eq!(registry.last_block, 110);
    }

    #[test]
    fn test_fungible_collectible_is_additive() {
        let (rec, _tmp) = create_reconciler(None);
        rec.store
            .put_collectible_contract(
                contract_d(),
                &CollectibleContract {
                    kind: CollectibleKind::Fungible,
                    last_block: 0,
                },
            )
            .unwrap();

        let mint = transfer(contract_d(), Address::ZERO, addr_a(), 1000, 0);
        rec.apply_transfer(&mint, 100).unwrap();
        let t = transfer(contract_d(), addr_a(), addr_b(), 300, 1);
        rec.apply_transfer(&t, 110).unwrap();

        let a = rec
            .store
            .get_collectible_balance(contract_d(), addr_a())
            .unwrap()
            .unwrap();
        let b = rec
            .store
            .get_collectible_balance(contract_d(), addr_b())
            .unwrap()
            .unwrap();
        assert_eq!(a.balance, U256::from(700u64));
        assert_eq!(b.balance, U256::from(300u64));
    }

    #[test]
    fn test_batch_transfers_in_one_block_all_apply() {
        let (rec, _tmp) = create_reconciler(None);

        let mint = transfer(contract_c(), Address::ZERO, addr_a(), 100, 0);
        rec.record_transfer(150, &mint).unwrap();
        rec.apply_height(150).unwrap();

        // One transaction, two transfer events to the same pair in block 200
        let first = transfer(contract_c(), addr_a(), addr_b(), 10, 1);
        let second = transfer(contract_c(), addr_a(), addr_b(), 15, 2);
        rec.record_transfer(200, &first).unwrap();
        rec.record_transfer(200, &second).unwrap();
        let applied = rec.apply_height(200).unwrap();
        assert_eq!(applied, 2);

        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::from(75u64));
        assert_eq!(balance_of(&rec, contract_c(), addr_b()), U256::from(25u64));

        // Replaying the whole height is a no-op
        rec.apply_height(200).unwrap();
        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::from(75u64));
        assert_eq!(balance_of(&rec, contract_c(), addr_b()), U256::from(25u64));
    }

    #[test]
    fn test_incremental_matches_replay() {
        let (rec, _tmp) = create_reconciler(None);

        let steps: &[(Address, Address, u64, u64, u64)] = &[
            (Address::ZERO, addr_a(), 1000, 100, 0),
            (addr_a(), addr_b(), 200, 110, 0),
            (addr_b(), addr_a(), 50, 120, 0),
            (addr_a(), addr_b(), 300, 130, 1),
        ];
        for (from, to, value, block, idx) in steps {
            let mut t = transfer(contract_c(), *from, *to, *value, *idx);
            // Distinct rows per block
            let mut hash = [0u8; 32];
            hash[24..].copy_from_slice(&block.to_be_bytes());
            t.transaction_hash = B256::from(hash);
            rec.record_transfer(*block, &t).unwrap();
            rec.apply_transfer(&t, *block).unwrap();
        }

        let incremental = balance_of(&rec, contract_c(), addr_a());
        let replayed = rec.replayed_balance(contract_c(), addr_a(), 130).unwrap();
        assert_eq!(incremental, replayed);
        assert_eq!(incremental, U256::from(550u64));

        let incremental_b = balance_of(&rec, contract_c(), addr_b());
        let replayed_b = rec.replayed_balance(contract_c(), addr_b(), 130).unwrap();
        assert_eq!(incremental_b, replayed_b);
        assert_eq!(incremental_b, U256::from(450u64));
    }

    #[test]
    fn test_rollback_replays_surviving_history() {
        let (rec, _tmp) = create_reconciler(None);

        // Surviving history: mint 1000 to A at 100, A -> B 200 at 110
        for (from, to, value, block) in [
            (Address::ZERO, addr_a(), 1000u64, 100u64),
            (addr_a(), addr_b(), 200, 110),
        ] {
            let mut t = transfer(contract_c(), from, to, value, 0);
            let mut hash = [0u8; 32];
            hash[24..].copy_from_slice(&block.to_be_bytes());
            t.transaction_hash = B256::from(hash);
            rec.record_transfer(block, &t).unwrap();
            rec.apply_transfer(&t, block).unwrap();
        }

        // Stale chain: A -> B 500 at 120
        let mut stale = transfer(contract_c(), addr_a(), addr_b(), 500, 0);
        stale.transaction_hash =
            b256!("00000000000000000000000000000000000000000000000000000000000000ff");
        rec.record_transfer(120, &stale).unwrap();
        rec.apply_transfer(&stale, 120).unwrap();

        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::from(300u64));

        // Block 120 forked away
        rec.rollback(120).unwrap();

        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::from(800u64));
        assert_eq!(balance_of(&rec, contract_c(), addr_b()), U256::from(200u64));

        let a = rec.store.get_token_balance(contract_c(), addr_a()).unwrap().unwrap();
        assert_eq!(a.blocknumber, 119);

        // The stale transfer row is gone; replay confirms
        assert_eq!(
            rec.replayed_balance(contract_c(), addr_a(), u64::MAX).unwrap(),
            U256::from(800u64)
        );

        // The replacement block's transfer applies normally afterwards
        let mut replay = transfer(contract_c(), addr_a(), addr_b(), 100, 0);
        replay.transaction_hash =
            b256!("00000000000000000000000000000000000000000000000000000000000000fe");
        rec.record_transfer(120, &replay).unwrap();
        rec.apply_transfer(&replay, 120).unwrap();
        assert_eq!(balance_of(&rec, contract_c(), addr_a()), U256::from(700u64));
    }

    #[test]
    fn test_rollback_reverts_collectible_owner() {
        let (rec, _tmp) = create_reconciler(None);
        rec.store
            .put_collectible_contract(
                contract_d(),
                &CollectibleContract {
                    kind: CollectibleKind::Erc721,
                    last_block: 0,
                },
            )
            .unwrap();

        let mint = transfer(contract_d(), Address::ZERO, addr_a(), 7, 0);
        rec.record_transfer(100, &mint).unwrap();
        rec.apply_transfer(&mint, 100).unwrap();

        let mut stale = transfer(contract_d(), addr_a(), addr_b(), 7, 0);
        stale.transaction_hash =
            b256!("00000000000000000000000000000000000000000000000000000000000000ff");
        rec.record_transfer(120, &stale).unwrap();
        rec.apply_transfer(&stale, 120).unwrap();

        let token = rec
            .store
            .get_collectible_token(contract_d(), U256::from(7u64))
            .unwrap()
            .unwrap();
        assert_eq!(token.owner_address, addr_b());

        rec.rollback(120).unwrap();
        let token = rec
            .store
            .get_collectible_token(contract_d(), U256::from(7u64))
            .unwrap()
            .unwrap();
        assert_eq!(token.owner_address, addr_a());
        let registry = rec.store.get_collectible_contract(contract_d()).unwrap().unwrap();
        assert_eq!(registry.last_block, 119);
    }

    #[test]
    fn test_parse_erc20_transfer_log() {
        let (rec, _tmp) = create_reconciler(None);

        let mut data = vec![0u8; 32];
        data[31] = 50;
        let log = LogEvent {
            address: contract_c(),
            topics: vec![
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef".into(),
                "0x0000000000000000000000000742d35cc6634c0532925a3b844bc9e7595f0beb".into(),
                "0x00000000000000000000000070997970c51812dc3a010c7d01b50e0d17dc79c8".into(),
            ],
            data,
            transaction_hash: b256!(
                "00000000000000000000000000000000000000000000000000000000000000aa"
            ),
            log_index: 3,
            block_number: 200,
        };

        let parsed = rec.parse_transfer_log(&log).unwrap().unwrap();
        assert_eq!(parsed.from_address, addr_a());
        assert_eq!(parsed.to_address, addr_b());
        assert_eq!(parsed.value, U256::from(50u64));
        assert_eq!(parsed.log_index, 3);
    }

    #[test]
    fn test_parse_erc721_transfer_log_indexed_token_id() {
        let (rec, _tmp) = create_reconciler(None);

        let log = LogEvent {
            address: contract_d(),
            topics: vec![
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef".into(),
                "0x0000000000000000000000000742d35cc6634c0532925a3b844bc9e7595f0beb".into(),
                "0x00000000000000000000000070997970c51812dc3a010c7d01b50e0d17dc79c8".into(),
                "0x0000000000000000000000000000000000000000000000000000000000000007".into(),
            ],
            data: Vec::new(),
            transaction_hash: b256!(
                "00000000000000000000000000000000000000000000000000000000000000aa"
            ),
            log_index: 0,
            block_number: 200,
        };

        let parsed = rec.parse_transfer_log(&log).unwrap().unwrap();
        assert_eq!(parsed.value, U256::from(7u64));
    }

    #[test]
    fn test_parse_weth_deposit_as_mint() {
        let weth = contract_c();
        let (rec, _tmp) = create_reconciler(Some(weth));

        let mut data = vec![0u8; 32];
        data[31] = 25;
        let log = LogEvent {
            address: weth,
            topics: vec![
                "0xe1fffcc4923d04b559f4d29a8bfc6cda04eb5b0d3c460751c2402c5c5cc9109c".into(),
                "0x0000000000000000000000000742d35cc6634c0532925a3b844bc9e7595f0beb".into(),
            ],
            data,
            transaction_hash: b256!(
                "00000000000000000000000000000000000000000000000000000000000000aa"
            ),
            log_index: 0,
            block_number: 200,
        };

        let parsed = rec.parse_transfer_log(&log).unwrap().unwrap();
        assert_eq!(parsed.from_address, Address::ZERO);
        assert_eq!(parsed.to_address, addr_a());
        assert_eq!(parsed.value, U256::from(25u64));
    }

    #[test]
    fn test_non_transfer_log_ignored() {
        let (rec, _tmp) = create_reconciler(None);
        let log = LogEvent {
            address: contract_c(),
            topics: vec![
                "0xa34547120a941eab43859acf535a121237e5536fd476dccda8174fb1af6926ed".into(),
            ],
            data: Vec::new(),
            transaction_hash: b256!(
                "00000000000000000000000000000000000000000000000000000000000000aa"
            ),
            log_index: 0,
            block_number: 200,
        };
        assert!(rec.parse_transfer_log(&log).unwrap().is_none());
    }
}
