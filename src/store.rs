//! LedgerStore trait and RocksDB implementation
//!
//! Provides the persistent key-value store backing the synchronization
//! engine. Uses RocksDB with column families for efficient organization.

use crate::keys::{
    decode_balance_key, decode_block_key, decode_failure_key, decode_sender_nonce_key,
    decode_transfer_key, decode_tx_block_key, encode_balance_key, encode_block_key,
    encode_collectible_contract_key, encode_collectible_token_key, encode_failure_key,
    encode_filter_key, encode_filter_prefix, encode_meta_key, encode_notification_key,
    encode_registration_key, encode_registration_prefix, encode_sender_nonce_key,
    encode_transfer_key, encode_tx_block_key, encode_tx_key, META_CHECKPOINT, META_HEAD,
};
use crate::records::{
    BlockRecord, CollectibleContract, CollectibleTokenRecord, FilterRegistration,
    NotificationRecord, NotificationRegistration, ReconcileFailure, TokenBalanceRecord,
    TokenTransferRecord, TransactionRecord,
};
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::Path;

/// Trait defining the interface for ledger state storage.
///
/// All methods return Results for proper error handling.
pub trait LedgerStore {
    // ─────────────────────────────────────────────────────────────────
    // Blocks and checkpoint
    // ─────────────────────────────────────────────────────────────────

    /// Store a block record (keyed by height + hash).
    fn put_block(&self, block: &BlockRecord) -> Result<()>;

    /// Get every block stored at a height, stale ones included.
    fn get_blocks_at(&self, height: u64) -> Result<Vec<BlockRecord>>;

    /// Get the non-stale block at a height, if any.
    fn get_canonical_block(&self, height: u64) -> Result<Option<BlockRecord>>;

    /// Get the current head height (highest ingested block).
    fn get_head(&self) -> Result<Option<u64>>;

    /// Set the current head height.
    fn set_head(&self, height: u64) -> Result<()>;

    /// Get the durable checkpoint (last acknowledged height).
    fn get_checkpoint(&self) -> Result<Option<u64>>;

    /// Set the durable checkpoint.
    fn set_checkpoint(&self, height: u64) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────

    /// Store a transaction record and maintain its indexes.
    fn put_transaction(&self, tx: &TransactionRecord) -> Result<()>;

    /// Get a transaction record by hash.
    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>>;

    /// Get every transaction for a (sender, nonce) pair, superseded rows
    /// included.
    fn get_transactions_by_sender_nonce(
        &self,
        sender: Address,
        nonce: u64,
    ) -> Result<Vec<TransactionRecord>>;

    /// Record that a transaction is included in a block (for reorg eviction).
    fn put_tx_block_index(&self, height: u64, hash: B256) -> Result<()>;

    /// Remove a transaction's block-index entry.
    fn delete_tx_block_index(&self, height: u64, hash: B256) -> Result<()>;

    /// Get hashes of all transactions included at or above a height.
    fn get_tx_hashes_from(&self, height: u64) -> Result<Vec<(u64, B256)>>;

    // ─────────────────────────────────────────────────────────────────
    // Token transfers and balances
    // ─────────────────────────────────────────────────────────────────

    /// Store a transfer event (keyed by block + tx hash + log index, so
    /// redelivery overwrites the same row).
    fn put_transfer(&self, height: u64, transfer: &TokenTransferRecord) -> Result<()>;

    /// Get a single transfer by its composite identity.
    fn get_transfer(
        &self,
        height: u64,
        tx_hash: B256,
        log_index: u64,
    ) -> Result<Option<TokenTransferRecord>>;

    /// Get all transfers in [start, end] in chain order.
    fn get_transfers_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, TokenTransferRecord)>>;

    /// Delete a transfer row.
    fn delete_transfer(&self, height: u64, tx_hash: B256, log_index: u64) -> Result<()>;

    /// Store a token balance for (contract, holder).
    fn put_token_balance(
        &self,
        contract: Address,
        holder: Address,
        record: &TokenBalanceRecord,
    ) -> Result<()>;

    /// Get a token balance for (contract, holder).
    fn get_token_balance(
        &self,
        contract: Address,
        holder: Address,
    ) -> Result<Option<TokenBalanceRecord>>;

    /// Get every (holder, balance) pair tracked for a contract.
    fn get_token_balances_for_contract(
        &self,
        contract: Address,
    ) -> Result<Vec<(Address, TokenBalanceRecord)>>;

    // ─────────────────────────────────────────────────────────────────
    // Collectibles
    // ─────────────────────────────────────────────────────────────────

    /// Register or update a collectible contract.
    fn put_collectible_contract(
        &self,
        contract: Address,
        record: &CollectibleContract,
    ) -> Result<()>;

    /// Get a collectible contract's registry entry.
    fn get_collectible_contract(&self, contract: Address) -> Result<Option<CollectibleContract>>;

    /// Store a collectible token (ownership + metadata).
    fn put_collectible_token(
        &self,
        contract: Address,
        token_id: U256,
        record: &CollectibleTokenRecord,
    ) -> Result<()>;

    /// Get a collectible token.
    fn get_collectible_token(
        &self,
        contract: Address,
        token_id: U256,
    ) -> Result<Option<CollectibleTokenRecord>>;

    /// Store a fungible-collectible balance for (contract, owner).
    fn put_collectible_balance(
        &self,
        contract: Address,
        owner: Address,
        record: &TokenBalanceRecord,
    ) -> Result<()>;

    /// Get a fungible-collectible balance for (contract, owner).
    fn get_collectible_balance(
        &self,
        contract: Address,
        owner: Address,
    ) -> Result<Option<TokenBalanceRecord>>;

    // ─────────────────────────────────────────────────────────────────
    // Filters and notifications
    // ─────────────────────────────────────────────────────────────────

    /// Store a filter registration (keyed by contract + topic + registration
    /// id, so duplicates overwrite themselves).
    fn put_filter(&self, filter: &FilterRegistration) -> Result<()>;

    /// Get the filter registration for an exact (contract, topic,
    /// registration id) triple.
    fn get_filter(
        &self,
        contract: Address,
        topic_id: B256,
        registration_id: &str,
    ) -> Result<Option<FilterRegistration>>;

    /// Get every filter registration matching (contract, topic).
    fn get_filters_for_event(
        &self,
        contract: Address,
        topic_id: B256,
    ) -> Result<Vec<FilterRegistration>>;

    /// Store a notification registration.
    fn put_registration(&self, reg: &NotificationRegistration) -> Result<()>;

    /// Get every notification registration for an address.
    fn get_registrations_for_address(
        &self,
        address: Address,
    ) -> Result<Vec<NotificationRegistration>>;

    /// Store a notification delivery record under its idempotency key.
    fn put_notification(&self, digest: B256, record: &NotificationRecord) -> Result<()>;

    /// Get a notification delivery record by idempotency key.
    fn get_notification(&self, digest: B256) -> Result<Option<NotificationRecord>>;

    // ─────────────────────────────────────────────────────────────────
    // Operator view
    // ─────────────────────────────────────────────────────────────────

    /// Record an isolated balance computation failure for (contract, holder).
    fn put_reconcile_failure(
        &self,
        contract: Address,
        holder: Address,
        failure: &ReconcileFailure,
    ) -> Result<()>;

    /// List all recorded reconcile failures.
    fn get_reconcile_failures(&self) -> Result<Vec<(Address, Address, ReconcileFailure)>>;

    /// Clear a recorded failure once the operator has resolved it.
    fn delete_reconcile_failure(&self, contract: Address, holder: Address) -> Result<()>;
}

/// RocksDB-backed implementation of LedgerStore.
///
/// Uses column families to organize different types of data:
/// - blocks: block records, stale forks included
/// - transactions: transaction records by hash
/// - tx_sender_nonce: (sender, nonce) index entries
/// - tx_by_block: inclusion index for reorg eviction
/// - token_transfers: transfer events in chain order
/// - token_balances: derived fungible balances
/// - collectible_contracts / collectible_tokens / collectible_balances
/// - filters / registrations / notifications
/// - reconcile_failures: operator view of isolated failures
/// - meta: checkpoint and head
pub struct RocksLedgerStore {
    db: DB,
}

const COLUMN_FAMILIES: &[&str] = &[
    "blocks",
    "transactions",
    "tx_sender_nonce",
    "tx_by_block",
    "token_transfers",
    "token_balances",
    "collectible_contracts",
    "collectible_tokens",
    "collectible_balances",
    "filters",
    "registrations",
    "notifications",
    "reconcile_failures",
    "meta",
];

impl RocksLedgerStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB database")?;

        Ok(Self { db })
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    fn get_meta_u64(&self, meta_id: u8) -> Result<Option<u64>> {
        let cf = self.get_cf("meta")?;
        let key = encode_meta_key(meta_id);
        match self.db.get_cf(cf, &key).context("Failed to get meta row")? {
            Some(bytes) => {
                if bytes.len() != 8 {
                    anyhow::bail!("Meta row must be 8 bytes (u64), got {}", bytes.len());
                }
                Ok(Some(u64::from_be_bytes(
                    bytes.try_into().expect("8 bytes for u64"),
                )))
            }
            None => Ok(None),
        }
    }

    fn set_meta_u64(&self, meta_id: u8, value: u64) -> Result<()> {
        let cf = self.get_cf("meta")?;
        let key = encode_meta_key(meta_id);
        self.db
            .put_cf(cf, &key, value.to_be_bytes())
            .context("Failed to set meta row")?;
        Ok(())
    }
}

impl LedgerStore for RocksLedgerStore {
    fn put_block(&self, block: &BlockRecord) -> Result<()> {
        let cf = self.get_cf("blocks")?;
        let key = encode_block_key(block.number, block.hash);
        let value = postcard::to_allocvec(block).context("Failed to serialize block record")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put block")?;
        Ok(())
    }

    fn get_blocks_at(&self, height: u64) -> Result<Vec<BlockRecord>> {
        let cf = self.get_cf("blocks")?;
        let start_key = encode_block_key(height, B256::ZERO);
        let end_key = encode_block_key(height.saturating_add(1), B256::ZERO);

        let mut blocks = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if key.as_ref() >= end_key.as_slice() {
                break;
            }
            let (key_height, _) = decode_block_key(&key).context("Failed to decode block key")?;
            if key_height != height {
                continue;
            }
            let block: BlockRecord =
                postcard::from_bytes(&value).context("Failed to deserialize block record")?;
            blocks.push(block);
        }

        Ok(blocks)
    }

    fn get_canonical_block(&self, height: u64) -> Result<Option<BlockRecord>> {
        Ok(self
            .get_blocks_at(height)?
            .into_iter()
            .find(|b| !b.stale))
    }

    fn get_head(&self) -> Result<Option<u64>> {
        self.get_meta_u64(META_HEAD)
    }

    fn set_head(&self, height: u64) -> Result<()> {
        self.set_meta_u64(META_HEAD, height)
    }

    fn get_checkpoint(&self) -> Result<Option<u64>> {
        self.get_meta_u64(META_CHECKPOINT)
    }

    fn set_checkpoint(&self, height: u64) -> Result<()> {
        self.set_meta_u64(META_CHECKPOINT, height)
    }

    fn put_transaction(&self, tx: &TransactionRecord) -> Result<()> {
        let cf = self.get_cf("transactions")?;
        let key = encode_tx_key(tx.hash);
        let value = postcard::to_allocvec(tx).context("Failed to serialize transaction")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put transaction")?;

        // Maintain the (sender, nonce) index
        let index_cf = self.get_cf("tx_sender_nonce")?;
        let index_key = encode_sender_nonce_key(tx.from_address, tx.nonce, tx.hash);
        self.db
            .put_cf(index_cf, &index_key, b"")
            .context("Failed to put sender-nonce index")?;
        Ok(())
    }

    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>> {
        let cf = self.get_cf("transactions")?;
        let key = encode_tx_key(hash);
        match self
            .db
            .get_cf(cf, &key)
            .context("Failed to get transaction")?
        {
            Some(bytes) => {
                let tx = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize transaction")?;
                Ok(Some(tx))
            }
            None => Ok(None),
        }
    }

    fn get_transactions_by_sender_nonce(
        &self,
        sender: Address,
        nonce: u64,
    ) -> Result<Vec<TransactionRecord>> {
        let cf = self.get_cf("tx_sender_nonce")?;
        let start_key = encode_sender_nonce_key(sender, nonce, B256::ZERO);
        let end_key = encode_sender_nonce_key(sender, nonce.saturating_add(1), B256::ZERO);

        let mut txs = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.context("Failed to read iterator")?;
            if key.as_ref() >= end_key.as_slice() {
                break;
            }
            let (key_sender, key_nonce, hash) =
                decode_sender_nonce_key(&key).context("Failed to decode sender-nonce key")?;
            if key_sender != sender || key_nonce != nonce {
                continue;
            }
            if let Some(tx) = self.get_transaction(hash)? {
                txs.push(tx);
            }
        }

        Ok(txs)
    }

    fn put_tx_block_index(&self, height: u64, hash: B256) -> Result<()> {
        let cf = self.get_cf("tx_by_block")?;
        let key = encode_tx_block_key(height, hash);
        self.db
            .put_cf(cf, &key, b"")
            .context("Failed to put tx-by-block index")?;
        Ok(())
    }

    fn delete_tx_block_index(&self, height: u64, hash: B256) -> Result<()> {
        let cf = self.get_cf("tx_by_block")?;
        let key = encode_tx_block_key(height, hash);
        self.db
            .delete_cf(cf, &key)
            .context("Failed to delete tx-by-block index")?;
        Ok(())
    }

    fn get_tx_hashes_from(&self, height: u64) -> Result<Vec<(u64, B256)>> {
        let cf = self.get_cf("tx_by_block")?;
        let start_key = encode_tx_block_key(height, B256::ZERO);

        let mut hashes = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.context("Failed to read iterator")?;
            let (key_height, hash) =
                decode_tx_block_key(&key).context("Failed to decode tx-by-block key")?;
            hashes.push((key_height, hash));
        }

        Ok(hashes)
    }

    fn put_transfer(&self, height: u64, transfer: &TokenTransferRecord) -> Result<()> {
        let cf = self.get_cf("token_transfers")?;
        let key = encode_transfer_key(height, transfer.transaction_hash, transfer.log_index);
        let value = postcard::to_allocvec(transfer).context("Failed to serialize transfer")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put transfer")?;
        Ok(())
    }

    fn get_transfer(
        &self,
        height: u64,
        tx_hash: B256,
        log_index: u64,
    ) -> Result<Option<TokenTransferRecord>> {
        let cf = self.get_cf("token_transfers")?;
        let key = encode_transfer_key(height, tx_hash, log_index);
        match self.db.get_cf(cf, &key).context("Failed to get transfer")? {
            Some(bytes) => {
                let transfer =
                    postcard::from_bytes(&bytes).context("Failed to deserialize transfer")?;
                Ok(Some(transfer))
            }
            None => Ok(None),
        }
    }

    fn get_transfers_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, TokenTransferRecord)>> {
        let cf = self.get_cf("token_transfers")?;
        let start_key = encode_transfer_key(start, B256::ZERO, 0);
        let end_key = encode_transfer_key(end.saturating_add(1), B256::ZERO, 0);

        let mut transfers = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if key.as_ref() >= end_key.as_slice() {
                break;
            }
            let (height, _, _) =
                decode_transfer_key(&key).context("Failed to decode transfer key")?;
            let transfer: TokenTransferRecord =
                postcard::from_bytes(&value).context("Failed to deserialize transfer")?;
            transfers.push((height, transfer));
        }

        Ok(transfers)
    }

    fn delete_transfer(&self, height: u64, tx_hash: B256, log_index: u64) -> Result<()> {
        let cf = self.get_cf("token_transfers")?;
        let key = encode_transfer_key(height, tx_hash, log_index);
        self.db
            .delete_cf(cf, &key)
            .context("Failed to delete transfer")?;
        Ok(())
    }

    fn put_token_balance(
        &self,
        contract: Address,
        holder: Address,
        record: &TokenBalanceRecord,
    ) -> Result<()> {
        let cf = self.get_cf("token_balances")?;
        let key = encode_balance_key(contract, holder);
        let value = postcard::to_allocvec(record).context("Failed to serialize balance")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put token balance")?;
        Ok(())
    }

    fn get_token_balance(
        &self,
        contract: Address,
        holder: Address,
    ) -> Result<Option<TokenBalanceRecord>> {
        let cf = self.get_cf("token_balances")?;
        let key = encode_balance_key(contract, holder);
        match self
            .db
            .get_cf(cf, &key)
            .context("Failed to get token balance")?
        {
            Some(bytes) => {
                let record =
                    postcard::from_bytes(&bytes).context("Failed to deserialize balance")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn get_token_balances_for_contract(
        &self,
        contract: Address,
    ) -> Result<Vec<(Address, TokenBalanceRecord)>> {
        let cf = self.get_cf("token_balances")?;
        let start_key = encode_balance_key(contract, Address::ZERO);

        let mut balances = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            let (key_contract, holder) =
                decode_balance_key(&key).context("Failed to decode balance key")?;
            if key_contract != contract {
                break;
            }
            let record: TokenBalanceRecord =
                postcard::from_bytes(&value).context("Failed to deserialize balance")?;
            balances.push((holder, record));
        }

        Ok(balances)
    }

    fn put_collectible_contract(
        &self,
        contract: Address,
        record: &CollectibleContract,
    ) -> Result<()> {
        let cf = self.get_cf("collectible_contracts")?;
        let key = encode_collectible_contract_key(contract);
        let value =
            postcard::to_allocvec(record).context("Failed to serialize collectible contract")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put collectible contract")?;
        Ok(())
    }

    fn get_collectible_contract(&self, contract: Address) -> Result<Option<CollectibleContract>> {
        let cf = self.get_cf("collectible_contracts")?;
        let key = encode_collectible_contract_key(contract);
        match self
            .db
            .get_cf(cf, &key)
            .context("Failed to get collectible contract")?
        {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize collectible contract")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_collectible_token(
        &self,
        contract: Address,
        token_id: U256,
        record: &CollectibleTokenRecord,
    ) -> Result<()> {
        let cf = self.get_cf("collectible_tokens")?;
        let key = encode_collectible_token_key(contract, token_id);
        let value =
            postcard::to_allocvec(record).context("Failed to serialize collectible token")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put collectible token")?;
        Ok(())
    }

    fn get_collectible_token(
        &self,
        contract: Address,
        token_id: U256,
    ) -> Result<Option<CollectibleTokenRecord>> {
        let cf = self.get_cf("collectible_tokens")?;
        let key = encode_collectible_token_key(contract, token_id);
        match self
            .db
            .get_cf(cf, &key)
            .context("Failed to get collectible token")?
        {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize collectible token")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_collectible_balance(
        &self,
        contract: Address,
        owner: Address,
        record: &TokenBalanceRecord,
    ) -> Result<()> {
        let cf = self.get_cf("collectible_balances")?;
        let key = encode_balance_key(contract, owner);
        let value =
            postcard::to_allocvec(record).context("Failed to serialize collectible balance")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put collectible balance")?;
        Ok(())
    }

    fn get_collectible_balance(
        &self,
        contract: Address,
        owner: Address,
    ) -> Result<Option<TokenBalanceRecord>> {
        let cf = self.get_cf("collectible_balances")?;
        let key = encode_balance_key(contract, owner);
        match self
            .db
            .get_cf(cf, &key)
            .context("Failed to get collectible balance")?
        {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .context("Failed to deserialize collectible balance")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_filter(&self, filter: &FilterRegistration) -> Result<()> {
        let cf = self.get_cf("filters")?;
        let key = encode_filter_key(
            filter.contract_address,
            filter.topic_id,
            &filter.registration_id,
        );
        let value = postcard::to_allocvec(filter).context("Failed to serialize filter")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put filter")?;
        Ok(())
    }

    fn get_filter(
        &self,
        contract: Address,
        topic_id: B256,
        registration_id: &str,
    ) -> Result<Option<FilterRegistration>> {
        let cf = self.get_cf("filters")?;
        let key = encode_filter_key(contract, topic_id, registration_id);
        match self.db.get_cf(cf, &key).context("Failed to get filter")? {
            Some(bytes) => {
                let filter =
                    postcard::from_bytes(&bytes).context("Failed to deserialize filter")?;
                Ok(Some(filter))
            }
            None => Ok(None),
        }
    }

    fn get_filters_for_event(
        &self,
        contract: Address,
        topic_id: B256,
    ) -> Result<Vec<FilterRegistration>> {
        let cf = self.get_cf("filters")?;
        let prefix = encode_filter_prefix(contract, topic_id);

        let mut filters = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if !key.starts_with(&prefix) {
                break;
            }
            let filter: FilterRegistration =
                postcard::from_bytes(&value).context("Failed to deserialize filter")?;
            filters.push(filter);
        }

        Ok(filters)
    }

    fn put_registration(&self, reg: &NotificationRegistration) -> Result<()> {
        let cf = self.get_cf("registrations")?;
        let key = encode_registration_key(reg.eth_address, &reg.service, &reg.registration_id);
        let value = postcard::to_allocvec(reg).context("Failed to serialize registration")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put registration")?;
        Ok(())
    }

    fn get_registrations_for_address(
        &self,
        address: Address,
    ) -> Result<Vec<NotificationRegistration>> {
        let cf = self.get_cf("registrations")?;
        let prefix = encode_registration_prefix(address);

        let mut regs = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if !key.starts_with(&prefix) {
                break;
            }
            let reg: NotificationRegistration =
                postcard::from_bytes(&value).context("Failed to deserialize registration")?;
            regs.push(reg);
        }

        Ok(regs)
    }

    fn put_notification(&self, digest: B256, record: &NotificationRecord) -> Result<()> {
        let cf = self.get_cf("notifications")?;
        let key = encode_notification_key(digest);
        let value = postcard::to_allocvec(record).context("Failed to serialize notification")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put notification")?;
        Ok(())
    }

    fn get_notification(&self, digest: B256) -> Result<Option<NotificationRecord>> {
        let cf = self.get_cf("notifications")?;
        let key = encode_notification_key(digest);
        match self
            .db
            .get_cf(cf, &key)
            .context("Failed to get notification")?
        {
            Some(bytes) => {
                let record =
                    postcard::from_bytes(&bytes).context("Failed to deserialize notification")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_reconcile_failure(
        &self,
        contract: Address,
        holder: Address,
        failure: &ReconcileFailure,
    ) -> Result<()> {
        let cf = self.get_cf("reconcile_failures")?;
        let key = encode_failure_key(contract, holder);
        let value = postcard::to_allocvec(failure).context("Failed to serialize failure")?;
        self.db
            .put_cf(cf, &key, &value)
            .context("Failed to put reconcile failure")?;
        Ok(())
    }

    fn get_reconcile_failures(&self) -> Result<Vec<(Address, Address, ReconcileFailure)>> {
        let cf = self.get_cf("reconcile_failures")?;

        let mut failures = Vec::new();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            let (contract, holder) =
                decode_failure_key(&key).context("Failed to decode failure key")?;
            let failure: ReconcileFailure =
                postcard::from_bytes(&value).context("Failed to deserialize failure")?;
            failures.push((contract, holder, failure));
        }

        Ok(failures)
    }

    fn delete_reconcile_failure(&self, contract: Address, holder: Address) -> Result<()> {
        let cf = self.get_cf("reconcile_failures")?;
        let key = encode_failure_key(contract, holder);
        self.db
            .delete_cf(cf, &key)
            .context("Failed to delete reconcile failure")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{TxStatus, Visibility};
    use alloy_primitives::b256;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksLedgerStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksLedgerStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn test_address() -> Address {
        Address::from_slice(&hex::decode("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap())
    }

    fn test_address_2() -> Address {
        Address::from_slice(&hex::decode("dAC17F958D2ee523a2206206994597C13D831ec7").unwrap())
    }

    fn make_block(number: u64, hash: B256, parent_hash: B256) -> BlockRecord {
        BlockRecord {
            number,
            hash,
            parent_hash,
            timestamp: 1_600_000_000 + number,
            stale: false,
        }
    }

    fn make_tx(hash: B256, from: Address, nonce: u64, status: TxStatus) -> TransactionRecord {
        TransactionRecord {
            hash,
            from_address: from,
            to_address: Some(test_address_2()),
            nonce,
            value: U256::from(1000u64),
            gas: U256::from(21000u64),
            gas_price: U256::from(20_000_000_000u64),
            data: Vec::new(),
            signature: None,
            status,
            blocknumber: None,
            error_code: None,
            created: 0,
            updated: 0,
            sender_id: None,
        }
    }

    #[test]
    fn test_block_roundtrip_and_canonical() {
        let (store, _temp_dir) = create_test_store();
        let hash_a = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
        let hash_b = b256!("00000000000000000000000000000000000000000000000000000000000000bb");

        let mut block_a = make_block(100, hash_a, B256::ZERO);
        block_a.stale = true;
        let block_b = make_block(100, hash_b, B256::ZERO);

        store.put_block(&block_a).unwrap();
        store.put_block(&block_b).unwrap();

        let all = store.get_blocks_at(100).unwrap();
        assert_eq!(all.len(), 2);

        let canonical = store.get_canonical_block(100).unwrap().unwrap();
        assert_eq!(canonical.hash, hash_b);
        assert!(!canonical.stale);

        // No blocks at a different height
        assert!(store.get_blocks_at(101).unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_and_head() {
        let (store, _temp_dir) = create_test_store();

        assert_eq!(store.get_checkpoint().unwrap(), None);
        assert_eq!(store.get_head().unwrap(), None);

        store.set_checkpoint(100).unwrap();
        store.set_head(112).unwrap();

        assert_eq!(store.get_checkpoint().unwrap(), Some(100));
        assert_eq!(store.get_head().unwrap(), Some(112));
    }

    #[test]
    fn test_transaction_roundtrip() {
        let (store, _temp_dir) = create_test_store();
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000cc");
        let tx = make_tx(hash, test_address(), 5, TxStatus::New);

        store.put_transaction(&tx).unwrap();
        let retrieved = store.get_transaction(hash).unwrap().unwrap();
        assert_eq!(tx, retrieved);
    }

    #[test]
    fn test_sender_nonce_index() {
        let (store, _temp_dir) = create_test_store();
        let sender = test_address();
        let hash1 = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let hash2 = b256!("0000000000000000000000000000000000000000000000000000000000000002");
        let hash3 = b256!("0000000000000000000000000000000000000000000000000000000000000003");

        store.put_transaction(&make_tx(hash1, sender, 5, TxStatus::Error)).unwrap();
        store.put_transaction(&make_tx(hash2, sender, 5, TxStatus::Unconfirmed)).unwrap();
        store.put_transaction(&make_tx(hash3, sender, 6, TxStatus::New)).unwrap();

        let at_five = store.get_transactions_by_sender_nonce(sender, 5).unwrap();
        assert_eq!(at_five.len(), 2);
        let at_six = store.get_transactions_by_sender_nonce(sender, 6).unwrap();
        assert_eq!(at_six.len(), 1);
        assert_eq!(at_six[0].hash, hash3);

        // Another sender sees nothing
        let other = store
            .get_transactions_by_sender_nonce(test_address_2(), 5)
            .unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_tx_block_index_scan() {
        let (store, _temp_dir) = create_test_store();
        let hash1 = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let hash2 = b256!("0000000000000000000000000000000000000000000000000000000000000002");
        let hash3 = b256!("0000000000000000000000000000000000000000000000000000000000000003");

        store.put_tx_block_index(99, hash1).unwrap();
        store.put_tx_block_index(100, hash2).unwrap();
        store.put_tx_block_index(101, hash3).unwrap();

        let from_100 = store.get_tx_hashes_from(100).unwrap();
        assert_eq!(from_100, vec![(100, hash2), (101, hash3)]);

        store.delete_tx_block_index(100, hash2).unwrap();
        let from_100 = store.get_tx_hashes_from(100).unwrap();
        assert_eq!(from_100, vec![(101, hash3)]);
    }

    #[test]
    fn test_transfer_range_scan_in_chain_order() {
        let (store, _temp_dir) = create_test_store();
        let tx_hash = b256!("00000000000000000000000000000000000000000000000000000000000000dd");
        let contract = test_address_2();

        for (block, idx) in [(200u64, 0u64), (200, 1), (205, 0), (210, 2)] {
            let transfer = TokenTransferRecord {
                transaction_hash: tx_hash,
                log_index: idx,
                contract_address: contract,
                from_address: test_address(),
                to_address: test_address_2(),
                value: U256::from(block + idx),
                status: TxStatus::Confirmed,
            };
            store.put_transfer(block, &transfer).unwrap();
        }

        let transfers = store.get_transfers_in_range(200, 209).unwrap();
        assert_eq!(transfers.len(), 3);
        assert_eq!(transfers[0].0, 200);
        assert_eq!(transfers[1].0, 200);
        assert_eq!(transfers[2].0, 205);

        // Redelivery of the same (block, hash, index) overwrites
        let dup = TokenTransferRecord {
            transaction_hash: tx_hash,
            log_index: 0,
            contract_address: contract,
            from_address: test_address(),
            to_address: test_address_2(),
            value: U256::from(999u64),
            status: TxStatus::Confirmed,
        };
        store.put_transfer(200, &dup).unwrap();
        let transfers = store.get_transfers_in_range(200, 209).unwrap();
        assert_eq!(transfers.len(), 3);
    }

    #[test]
    fn test_token_balance_roundtrip() {
        let (store, _temp_dir) = create_test_store();
        let contract = test_address_2();
        let holder = test_address();

        assert!(store.get_token_balance(contract, holder).unwrap().is_none());

        let record = TokenBalanceRecord {
            balance: U256::from(50_000u64),
            blocknumber: 200,
            visibility: Visibility::IfPositive,
        };
        store.put_token_balance(contract, holder, &record).unwrap();
        let retrieved = store.get_token_balance(contract, holder).unwrap().unwrap();
        assert_eq!(record, retrieved);

        let all = store.get_token_balances_for_contract(contract).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, holder);
    }

    #[test]
    fn test_collectible_roundtrip() {
        let (store, _temp_dir) = create_test_store();
        let contract = test_address_2();

        let registry = CollectibleContract {
            kind: crate::records::CollectibleKind::Erc721,
            last_block: 0,
        };
        store.put_collectible_contract(contract, &registry).unwrap();
        assert_eq!(
            store.get_collectible_contract(contract).unwrap().unwrap(),
            registry
        );

        let token = CollectibleTokenRecord::new(test_address(), Some("ipfs://x".into()));
        store
            .put_collectible_token(contract, U256::from(7u64), &token)
            .unwrap();
        let retrieved = store
            .get_collectible_token(contract, U256::from(7u64))
            .unwrap()
            .unwrap();
        assert_eq!(retrieved.owner_address, test_address());
        assert!(store
            .get_collectible_token(contract, U256::from(8u64))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_filter_prefix_scan() {
        let (store, _temp_dir) = create_test_store();
        let contract = test_address_2();
        let topic = b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
        let other_topic =
            b256!("a34547120a941eab43859acf535a121237e5536fd476dccda8174fb1af6926ed");

        for (id, reg) in ["reg-a", "reg-b"].iter().enumerate() {
            store
                .put_filter(&FilterRegistration {
                    filter_id: id as u64,
                    registration_id: reg.to_string(),
                    contract_address: contract,
                    topic_id: topic,
                    topic: "Transfer(address,address,uint256)".into(),
                })
                .unwrap();
        }
        store
            .put_filter(&FilterRegistration {
                filter_id: 2,
                registration_id: "reg-c".into(),
                contract_address: contract,
                topic_id: other_topic,
                topic: "AssetCreated(address)".into(),
            })
            .unwrap();

        let matching = store.get_filters_for_event(contract, topic).unwrap();
        assert_eq!(matching.len(), 2);
        let other = store.get_filters_for_event(contract, other_topic).unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].registration_id, "reg-c");
    }

    #[test]
    fn test_registration_prefix_scan() {
        let (store, _temp_dir) = create_test_store();
        let addr = test_address();

        for (service, reg_id) in [("apn", "dev-1"), ("gcm", "dev-2"), ("ws", "dev-3")] {
            store
                .put_registration(&NotificationRegistration {
                    client_id: "client-1".into(),
                    service: service.into(),
                    registration_id: reg_id.into(),
                    eth_address: addr,
                })
                .unwrap();
        }

        let regs = store.get_registrations_for_address(addr).unwrap();
        assert_eq!(regs.len(), 3);
        assert!(store
            .get_registrations_for_address(test_address_2())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_reconcile_failure_roundtrip() {
        let (store, _temp_dir) = create_test_store();
        let contract = test_address_2();
        let holder = test_address();

        let failure = ReconcileFailure {
            block: 300,
            message: "balance underflow".into(),
        };
        store
            .put_reconcile_failure(contract, holder, &failure)
            .unwrap();

        let all = store.get_reconcile_failures().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, contract);
        assert_eq!(all[0].1, holder);
        assert_eq!(all[0].2, failure);

        store.delete_reconcile_failure(contract, holder).unwrap();
        assert!(store.get_reconcile_failures().unwrap().is_empty());
    }
}
