//! Record types for the ledger store
//!
//! These structs represent the data persisted by the synchronization engine.
//! They use postcard for binary serialization, which is compact and deterministic.
//! Status and type columns are closed enums so an unrecognized wire value is a
//! decode error, never a silently accepted state.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked transaction.
///
/// Wire/storage contract: exactly these five values, no others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// Accepted via the API, not yet handed to the broadcaster
    New,
    /// Accepted by the broadcaster, waiting on balance/nonce
    Queued,
    /// Seen in the pending pool or broadcast-acknowledged
    Unconfirmed,
    /// Included in a block that reached confirmation depth
    Confirmed,
    /// Terminal failure (see `TxErrorCode`)
    Error,
}

impl TxStatus {
    /// Storage/wire string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::New => "new",
            TxStatus::Queued => "queued",
            TxStatus::Unconfirmed => "unconfirmed",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Error => "error",
        }
    }

    /// Parse a storage/wire string. Anything unrecognized is an error.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "new" => Ok(TxStatus::New),
            "queued" => Ok(TxStatus::Queued),
            "unconfirmed" => Ok(TxStatus::Unconfirmed),
            "confirmed" => Ok(TxStatus::Confirmed),
            "error" => Ok(TxStatus::Error),
            other => anyhow::bail!("Unrecognized transaction status: {}", other),
        }
    }

    /// Whether a transition from `self` to `to` is allowed by the lifecycle
    /// state machine.
    ///
    /// `Confirmed -> Unconfirmed` is the reorg eviction edge; `Error` is
    /// terminal from any non-terminal state.
    pub fn can_transition(&self, to: TxStatus) -> bool {
        matches!(
            (self, to),
            (TxStatus::New, TxStatus::Queued)
                | (TxStatus::New, TxStatus::Unconfirmed)
                | (TxStatus::New, TxStatus::Error)
                | (TxStatus::Queued, TxStatus::Unconfirmed)
                | (TxStatus::Queued, TxStatus::Error)
                | (TxStatus::Unconfirmed, TxStatus::Confirmed)
                | (TxStatus::Unconfirmed, TxStatus::Error)
                | (TxStatus::Confirmed, TxStatus::Unconfirmed)
        )
    }

    /// Whether this status is terminal (ignoring reorg eviction).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Error)
    }
}

/// Terminal failure codes for transactions in `Error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxErrorCode {
    /// Superseded by a gas-price bump for the same (sender, nonce)
    Replaced,
    /// Signature does not recover to the claimed sender
    InvalidSignature,
    /// Evicted by a reorg and not re-included within the re-match window,
    /// or a nonce gap that never filled
    NonceTimeout,
    /// Rejected outright by the node on broadcast
    NodeRejected,
    /// Sender balance (including pending inbound) cannot cover value + fee
    InsufficientBalance,
}

/// Signature components carried on locally-submitted transactions.
///
/// Externally observed transactions may not carry these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

/// A tracked transaction, locally submitted or externally observed.
///
/// Identity is the hash once broadcast; `(from_address, nonce)` before that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: B256,
    pub from_address: Address,
    /// None for contract creation
    pub to_address: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas: U256,
    pub gas_price: U256,
    pub data: Vec<u8>,
    /// Present only for locally-submitted transactions
    pub signature: Option<TxSignature>,
    pub status: TxStatus,
    /// Containing block once included
    pub blocknumber: Option<u64>,
    pub error_code: Option<TxErrorCode>,
    /// Unix seconds the record was created
    pub created: u64,
    /// Unix seconds of the last status change
    pub updated: u64,
    /// Client that submitted the transaction, if any
    pub sender_id: Option<String>,
}

/// A block header as tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    /// Set when the block was superseded by a competing chain. Terminal.
    pub stale: bool,
}

/// Visibility of a token balance in client-facing views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Never,
    IfPositive,
    Always,
}

/// Per-(contract, address) fungible balance, derived by transfer replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalanceRecord {
    pub balance: U256,
    /// Highest block whose transfers are reflected in `balance`
    pub blocknumber: u64,
    pub visibility: Visibility,
}

impl TokenBalanceRecord {
    pub fn new(balance: U256, blocknumber: u64) -> Self {
        Self {
            balance,
            blocknumber,
            visibility: Visibility::IfPositive,
        }
    }
}

/// A single transfer event, one per log entry.
///
/// A batch-transfer transaction emits several of these, distinguished by
/// `log_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransferRecord {
    pub transaction_hash: B256,
    pub log_index: u64,
    pub contract_address: Address,
    pub from_address: Address,
    pub to_address: Address,
    pub value: U256,
    pub status: TxStatus,
}

/// Classification of a tracked collectible contract.
///
/// Type codes on the wire: 0 = special, 1 = erc721 with custom events,
/// 2 = fungible collectible, 721 = standard erc721.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectibleKind {
    Special,
    CustomErc721,
    Fungible,
    Erc721,
}

impl CollectibleKind {
    pub fn from_code(code: u16) -> anyhow::Result<Self> {
        match code {
            0 => Ok(CollectibleKind::Special),
            1 => Ok(CollectibleKind::CustomErc721),
            2 => Ok(CollectibleKind::Fungible),
            721 => Ok(CollectibleKind::Erc721),
            other => anyhow::bail!("Unrecognized collectible type code: {}", other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            CollectibleKind::Special => 0,
            CollectibleKind::CustomErc721 => 1,
            CollectibleKind::Fungible => 2,
            CollectibleKind::Erc721 => 721,
        }
    }

    /// Whether balances for this kind accumulate additively (fungible)
    /// rather than replacing a single owner.
    pub fn is_additive(&self) -> bool {
        matches!(self, CollectibleKind::Fungible)
    }
}

/// A tracked collectible contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectibleContract {
    pub kind: CollectibleKind,
    /// Highest block this contract's events have been processed through
    pub last_block: u64,
}

/// A single non-fungible token. Ownership is single-valued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectibleTokenRecord {
    pub owner_address: Address,
    pub token_uri: Option<String>,
    /// Raw icon bytes; access through `icon()` so callers never depend on
    /// the encoding
    image: Option<Vec<u8>>,
}

impl CollectibleTokenRecord {
    pub fn new(owner_address: Address, token_uri: Option<String>) -> Self {
        Self {
            owner_address,
            token_uri,
            image: None,
        }
    }

    /// Opaque icon bytes, if any were captured for this token.
    pub fn icon(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    pub fn set_icon(&mut self, bytes: Vec<u8>) {
        self.image = Some(bytes);
    }
}

/// A client-registered contract event filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRegistration {
    pub filter_id: u64,
    pub registration_id: String,
    pub contract_address: Address,
    /// Event signature topic hash
    pub topic_id: B256,
    /// Human-readable event signature, e.g. "Transfer(address,address,uint256)"
    pub topic: String,
}

/// A client device/service endpoint registered for an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRegistration {
    pub client_id: String,
    pub service: String,
    pub registration_id: String,
    pub eth_address: Address,
}

/// Delivery state of an outbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Pending,
    Delivered,
    /// Retries exhausted; surfaced for operator inspection, never retried
    Failed,
}

/// Record of a single outbound notification, keyed by idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub status: NotificationStatus,
    pub attempts: u32,
    pub created: u64,
}

/// An isolated balance computation failure, kept for the operator view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileFailure {
    pub block: u64,
    pub message: String,
}

/// Encode a U256 value as a fixed 32-byte big-endian byte array.
///
/// This ensures deterministic encoding for balances and other U256 fields.
pub fn encode_u256(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

/// Decode a 32-byte big-endian byte array into a U256 value.
pub fn decode_u256(bytes: &[u8]) -> Result<U256, anyhow::Error> {
    if bytes.len() != 32 {
        anyhow::bail!("U256 encoding must be exactly 32 bytes, got {}", bytes.len());
    }
    Ok(U256::from_be_slice(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u256_encoding_roundtrip() {
        let value = U256::from(123456789u64);
        let encoded = encode_u256(value);
        let decoded = decode_u256(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_u256_encoding_zero() {
        let value = U256::ZERO;
        let encoded = encode_u256(value);
        assert_eq!(encoded, [0u8; 32]);
        let decoded = decode_u256(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_status_strings_roundtrip() {
        for status in [
            TxStatus::New,
            TxStatus::Queued,
            TxStatus::Unconfirmed,
            TxStatus::Confirmed,
            TxStatus::Error,
        ] {
            assert_eq!(TxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TxStatus::parse("pending").is_err());
        assert!(TxStatus::parse("").is_err());
    }

    #[test]
    fn test_transition_table() {
        use TxStatus::*;

        // The forward path
        assert!(New.can_transition(Queued));
        assert!(Queued.can_transition(Unconfirmed));
        assert!(Unconfirmed.can_transition(Confirmed));

        // Externally observed transactions enter at unconfirmed directly
        assert!(New.can_transition(Unconfirmed));

        // Reorg eviction and re-confirmation
        assert!(Confirmed.can_transition(Unconfirmed));
        assert!(Unconfirmed.can_transition(Confirmed));

        // Error from any non-terminal state
        assert!(New.can_transition(Error));
        assert!(Queued.can_transition(Error));
        assert!(Unconfirmed.can_transition(Error));

        // Forbidden edges
        assert!(!Confirmed.can_transition(Error));
        assert!(!Error.can_transition(New));
        assert!(!Error.can_transition(Unconfirmed));
        assert!(!Confirmed.can_transition(Queued));
        assert!(!Unconfirmed.can_transition(Queued));
        assert!(!Queued.can_transition(New));
    }

    #[test]
    fn test_collectible_kind_codes() {
        assert_eq!(CollectibleKind::from_code(0).unwrap(), CollectibleKind::Special);
        assert_eq!(CollectibleKind::from_code(1).unwrap(), CollectibleKind::CustomErc721);
        assert_eq!(CollectibleKind::from_code(2).unwrap(), CollectibleKind::Fungible);
        assert_eq!(CollectibleKind::from_code(721).unwrap(), CollectibleKind::Erc721);
        assert!(CollectibleKind::from_code(20).is_err());

        assert!(CollectibleKind::Fungible.is_additive());
        assert!(!CollectibleKind::Erc721.is_additive());
        assert!(!CollectibleKind::Special.is_additive());
    }

    #[test]
    fn test_collectible_icon_accessor() {
        let owner = Address::ZERO;
        let mut token = CollectibleTokenRecord::new(owner, None);
        assert!(token.icon().is_none());
        token.set_icon(vec![0x89, 0x50, 0x4e, 0x47]);
        assert_eq!(token.icon().unwrap(), &[0x89, 0x50, 0x4e, 0x47]);
    }
}
