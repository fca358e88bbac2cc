//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data.
//! Heights are big-endian so RocksDB iteration order is chain order.

use alloy_primitives::{Address, B256, U256};
use anyhow::Result;

/// Encode a block key.
///
/// Format: byte 'B' (0x42) + height (8 bytes, big-endian) + hash (32 bytes)
/// Total length: 41 bytes
///
/// Several blocks can share a height (stale forks); the hash suffix keeps
/// them distinct while a prefix scan finds every block at a height.
pub fn encode_block_key(height: u64, hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(b'B');
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hash.as_slice());
    key
}

/// Decode a block key back into (height, hash).
pub fn decode_block_key(key: &[u8]) -> Result<(u64, B256)> {
    if key.len() != 41 || key[0] != b'B' {
        anyhow::bail!("Invalid block key: {} bytes", key.len());
    }
    let height = u64::from_be_bytes(key[1..9].try_into().expect("8 bytes for u64"));
    let hash = B256::from_slice(&key[9..41]);
    Ok((height, hash))
}

/// Encode a transaction key.
///
/// Format: byte 'T' (0x54) + tx hash (32 bytes)
/// Total length: 33 bytes
pub fn encode_tx_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'T');
    key.extend_from_slice(hash.as_slice());
    key
}

/// Encode a sender-nonce index key.
///
/// Format: byte 'N' (0x4E) + sender (20 bytes) + nonce (8 bytes, big-endian)
///         + tx hash (32 bytes)
/// Total length: 61 bytes
///
/// Several transactions may share a (sender, nonce) since superseded ones
/// stay in `Error`; the hash suffix keeps index entries distinct.
pub fn encode_sender_nonce_key(sender: Address, nonce: u64, hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(61);
    key.push(b'N');
    key.extend_from_slice(sender.as_slice());
    key.extend_from_slice(&nonce.to_be_bytes());
    key.extend_from_slice(hash.as_slice());
    key
}

/// Decode a sender-nonce index key back into (sender, nonce, hash).
pub fn decode_sender_nonce_key(key: &[u8]) -> Result<(Address, u64, B256)> {
    if key.len() != 61 || key[0] != b'N' {
        anyhow::bail!("Invalid sender-nonce key: {} bytes", key.len());
    }
    let sender = Address::from_slice(&key[1..21]);
    let nonce = u64::from_be_bytes(key[21..29].try_into().expect("8 bytes for u64"));
    let hash = B256::from_slice(&key[29..61]);
    Ok((sender, nonce, hash))
}

/// Encode a transactions-by-block index key.
///
/// Format: byte 'X' (0x58) + height (8 bytes, big-endian) + tx hash (32 bytes)
/// Total length: 41 bytes
pub fn encode_tx_block_key(height: u64, hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(b'X');
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hash.as_slice());
    key
}

/// Decode a transactions-by-block index key back into (height, hash).
pub fn decode_tx_block_key(key: &[u8]) -> Result<(u64, B256)> {
    if key.len() != 41 || key[0] != b'X' {
        anyhow::bail!("Invalid tx-by-block key: {} bytes", key.len());
    }
    let height = u64::from_be_bytes(key[1..9].try_into().expect("8 bytes for u64"));
    let hash = B256::from_slice(&key[9..41]);
    Ok((height, hash))
}

/// Encode a token transfer key.
///
/// Format: byte 'E' (0x45) + height (8 bytes, big-endian) + tx hash (32 bytes)
///         + log index (8 bytes, big-endian)
/// Total length: 49 bytes
///
/// Height-first ordering lets a range scan replay transfers in chain order;
/// the (hash, log index) suffix makes a redelivered event overwrite itself.
pub fn encode_transfer_key(height: u64, tx_hash: B256, log_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(49);
    key.push(b'E');
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(tx_hash.as_slice());
    key.extend_from_slice(&log_index.to_be_bytes());
    key
}

/// Decode a token transfer key back into (height, tx hash, log index).
pub fn decode_transfer_key(key: &[u8]) -> Result<(u64, B256, u64)> {
    if key.len() != 49 || key[0] != b'E' {
        anyhow::bail!("Invalid transfer key: {} bytes", key.len());
    }
    let height = u64::from_be_bytes(key[1..9].try_into().expect("8 bytes for u64"));
    let hash = B256::from_slice(&key[9..41]);
    let log_index = u64::from_be_bytes(key[41..49].try_into().expect("8 bytes for u64"));
    Ok((height, hash, log_index))
}

/// Encode a token balance key.
///
/// Format: byte 'L' (0x4C) + contract (20 bytes) + holder (20 bytes)
/// Total length: 41 bytes
pub fn encode_balance_key(contract: Address, holder: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(b'L');
    key.extend_from_slice(contract.as_slice());
    key.extend_from_slice(holder.as_slice());
    key
}

/// Decode a token balance key back into (contract, holder).
pub fn decode_balance_key(key: &[u8]) -> Result<(Address, Address)> {
    if key.len() != 41 || key[0] != b'L' {
        anyhow::bail!("Invalid balance key: {} bytes", key.len());
    }
    let contract = Address::from_slice(&key[1..21]);
    let holder = Address::from_slice(&key[21..41]);
    Ok((contract, holder))
}

/// Encode a collectible contract key.
///
/// Format: byte 'C' (0x43) + contract (20 bytes)
/// Total length: 21 bytes
pub fn encode_collectible_contract_key(contract: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'C');
    key.extend_from_slice(contract.as_slice());
    key
}

/// Encode a collectible token key.
///
/// Format: byte 'K' (0x4B) + contract (20 bytes) + token id (32 bytes, big-endian)
/// Total length: 53 bytes
pub fn encode_collectible_token_key(contract: Address, token_id: U256) -> Vec<u8> {
    let mut key = Vec::with_capacity(53);
    key.push(b'K');
    key.extend_from_slice(contract.as_slice());
    key.extend_from_slice(&token_id.to_be_bytes::<32>());
    key
}

/// Encode a filter registration key.
///
/// Format: byte 'F' (0x46) + contract (20 bytes) + topic id (32 bytes)
///         + registration id (variable, UTF-8)
///
/// A prefix scan over contract + topic id yields every matching registration;
/// the registration id suffix makes re-registration idempotent.
pub fn encode_filter_key(contract: Address, topic_id: B256, registration_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(53 + registration_id.len());
    key.push(b'F');
    key.extend_from_slice(contract.as_slice());
    key.extend_from_slice(topic_id.as_slice());
    key.extend_from_slice(registration_id.as_bytes());
    key
}

/// The prefix shared by all filter registrations for (contract, topic id).
pub fn encode_filter_prefix(contract: Address, topic_id: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(53);
    key.push(b'F');
    key.extend_from_slice(contract.as_slice());
    key.extend_from_slice(topic_id.as_slice());
    key
}

/// Encode a notification registration key.
///
/// Format: byte 'R' (0x52) + eth address (20 bytes) + service (variable)
///         + 0x00 + registration id (variable, UTF-8)
pub fn encode_registration_key(address: Address, service: &str, registration_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(22 + service.len() + registration_id.len());
    key.push(b'R');
    key.extend_from_slice(address.as_slice());
    key.extend_from_slice(service.as_bytes());
    key.push(0x00);
    key.extend_from_slice(registration_id.as_bytes());
    key
}

/// The prefix shared by all notification registrations for an address.
pub fn encode_registration_prefix(address: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'R');
    key.extend_from_slice(address.as_slice());
    key
}

/// Encode a notification delivery key (idempotency key).
///
/// Format: byte 'D' (0x44) + keccak digest (32 bytes)
/// Total length: 33 bytes
pub fn encode_notification_key(digest: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'D');
    key.extend_from_slice(digest.as_slice());
    key
}

/// Encode a reconcile failure key.
///
/// Format: byte 'G' (0x47) + contract (20 bytes) + holder (20 bytes)
/// Total length: 41 bytes
pub fn encode_failure_key(contract: Address, holder: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(b'G');
    key.extend_from_slice(contract.as_slice());
    key.extend_from_slice(holder.as_slice());
    key
}

/// Decode a reconcile failure key back into (contract, holder).
pub fn decode_failure_key(key: &[u8]) -> Result<(Address, Address)> {
    if key.len() != 41 || key[0] != b'G' {
        anyhow::bail!("Invalid failure key: {} bytes", key.len());
    }
    let contract = Address::from_slice(&key[1..21]);
    let holder = Address::from_slice(&key[21..41]);
    Ok((contract, holder))
}

/// Encode a meta key.
///
/// Format: byte 'M' (0x4D) + meta_id (1 byte)
/// Total length: 2 bytes
///
/// Meta IDs:
/// - 0x01: checkpoint (last acknowledged blocknumber)
/// - 0x02: head (highest ingested blocknumber)
pub fn encode_meta_key(meta_id: u8) -> Vec<u8> {
    vec![b'M', meta_id]
}

/// Meta row for the durable checkpoint.
pub const META_CHECKPOINT: u8 = 0x01;
/// Meta row for the ledger head.
pub const META_HEAD: u8 = 0x02;

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{b256, U256};

    fn test_address() -> Address {
        Address::from_slice(&hex::decode("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap())
    }

    #[test]
    fn test_block_key_roundtrip() {
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
        let key = encode_block_key(12345, hash);
        assert_eq!(key.len(), 41);
        assert_eq!(key[0], b'B');
        let (height, decoded_hash) = decode_block_key(&key).unwrap();
        assert_eq!(height, 12345);
        assert_eq!(decoded_hash, hash);
    }

    #[test]
    fn test_block_keys_order_by_height() {
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
        let low = encode_block_key(99, hash);
        let high = encode_block_key(100, hash);
        assert!(low < high);
    }

    #[test]
    fn test_sender_nonce_key_roundtrip() {
        let sender = test_address();
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000bb");
        let key = encode_sender_nonce_key(sender, 7, hash);
        assert_eq!(key.len(), 61);
        let (s, n, h) = decode_sender_nonce_key(&key).unwrap();
        assert_eq!(s, sender);
        assert_eq!(n, 7);
        assert_eq!(h, hash);
    }

    #[test]
    fn test_transfer_key_roundtrip() {
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000cc");
        let key = encode_transfer_key(200, hash, 3);
        assert_eq!(key.len(), 49);
        let (height, h, idx) = decode_transfer_key(&key).unwrap();
        assert_eq!(height, 200);
        assert_eq!(h, hash);
        assert_eq!(idx, 3);
    }

    #[test]
    fn test_balance_key_roundtrip() {
        let contract = test_address();
        let holder = Address::from_slice(
            &hex::decode("dAC17F958D2ee523a2206206994597C13D831ec7").unwrap(),
        );
        let key = encode_balance_key(contract, holder);
        assert_eq!(key.len(), 41);
        let (c, h) = decode_balance_key(&key).unwrap();
        assert_eq!(c, contract);
        assert_eq!(h, holder);
    }

    #[test]
    fn test_collectible_token_key_layout() {
        let contract = test_address();
        let key = encode_collectible_token_key(contract, U256::from(7u64));
        assert_eq!(key.len(), 53);
        assert_eq!(key[0], b'K');
        assert_eq!(&key[1..21], contract.as_slice());
    }

    #[test]
    fn test_filter_key_prefix_relation() {
        let contract = test_address();
        let topic = b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
        let prefix = encode_filter_prefix(contract, topic);
        let key = encode_filter_key(contract, topic, "reg-1");
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn test_meta_key_encoding() {
        let key = encode_meta_key(META_CHECKPOINT);
        assert_eq!(key.len(), 2);
        assert_eq!(key[0], b'M');
        assert_eq!(key[1], 0x01);
    }
}
