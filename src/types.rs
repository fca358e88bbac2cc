//! Ethereum JSON-RPC feed types
//!
//! Type definitions for blocks, transactions, and contract logs
//! delivered by Ethereum JSON-RPC endpoints.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Deserializer};

/// Block header plus full transaction details as delivered by the feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedBlock {
    /// Block number (hex string in JSON, parsed to u64)
    #[serde(rename = "number", deserialize_with = "deserialize_hex_u64")]
    pub number: u64,

    /// Block hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Parent block hash (hex string in JSON)
    #[serde(rename = "parentHash", deserialize_with = "deserialize_hex_b256")]
    pub parent_hash: B256,

    /// Block timestamp (Unix epoch seconds, hex string in JSON)
    #[serde(rename = "timestamp", deserialize_with = "deserialize_hex_u64")]
    pub timestamp: u64,

    /// List of transactions in the block
    #[serde(rename = "transactions", default)]
    pub transactions: Vec<FeedTransaction>,
}

/// Transaction as delivered by the feed (pending pool or block body).
#[derive(Debug, Clone, Deserialize)]
pub struct FeedTransaction {
    /// Transaction hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Sender address (hex string in JSON)
    #[serde(rename = "from", deserialize_with = "deserialize_hex_address")]
    pub from: Address,

    /// Recipient address (None for contract creation, hex string in JSON)
    #[serde(rename = "to", deserialize_with = "deserialize_hex_address_opt", default)]
    pub to: Option<Address>,

    /// Value transferred in wei (hex string in JSON)
    #[serde(rename = "value", deserialize_with = "deserialize_hex_u256")]
    pub value: U256,

    /// Gas limit (hex string in JSON)
    #[serde(rename = "gas", deserialize_with = "deserialize_hex_u256")]
    pub gas: U256,

    /// Gas price (hex string in JSON)
    #[serde(rename = "gasPrice", deserialize_with = "deserialize_hex_u256_opt", default)]
    pub gas_price: Option<U256>,

    /// Transaction input data (hex string in JSON, "0x" for simple transfers)
    #[serde(rename = "input", deserialize_with = "deserialize_hex_bytes")]
    pub input: Vec<u8>,

    /// Transaction nonce (hex string in JSON)
    #[serde(rename = "nonce", deserialize_with = "deserialize_hex_u64")]
    pub nonce: u64,

    /// Containing block number (None while still pending)
    #[serde(rename = "blockNumber", deserialize_with = "deserialize_hex_u64_opt", default)]
    pub block_number: Option<u64>,

    /// Signature recovery id (hex string in JSON, absent on some feeds)
    #[serde(rename = "v", deserialize_with = "deserialize_hex_u64_opt", default)]
    pub v: Option<u64>,

    /// Signature r component (hex string in JSON)
    #[serde(rename = "r", deserialize_with = "deserialize_hex_u256_opt", default)]
    pub r: Option<U256>,

    /// Signature s component (hex string in JSON)
    #[serde(rename = "s", deserialize_with = "deserialize_hex_u256_opt", default)]
    pub s: Option<U256>,
}

impl FeedTransaction {
    /// Check if this is a contract creation transaction (to is None).
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Check if the transaction has been included in a block.
    pub fn is_included(&self) -> bool {
        self.block_number.is_some()
    }
}

/// Log entry emitted by a contract during transaction execution.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEvent {
    /// Address of the contract that emitted the log
    #[serde(rename = "address", deserialize_with = "deserialize_hex_address")]
    pub address: Address,

    /// Indexed topics (topic0 = event signature, topics[1..] = indexed params)
    #[serde(rename = "topics", default)]
    pub topics: Vec<String>,

    /// Non-indexed event data (hex string)
    #[serde(rename = "data", deserialize_with = "deserialize_hex_bytes")]
    pub data: Vec<u8>,

    /// Hash of the transaction that emitted the log
    #[serde(rename = "transactionHash", deserialize_with = "deserialize_hex_b256")]
    pub transaction_hash: B256,

    /// Position of the log within the block
    #[serde(rename = "logIndex", deserialize_with = "deserialize_hex_u64")]
    pub log_index: u64,

    /// Block the log was emitted in
    #[serde(rename = "blockNumber", deserialize_with = "deserialize_hex_u64")]
    pub block_number: u64,
}

impl LogEvent {
    /// Parse the event signature topic (topics[0]) as a 32-byte hash.
    ///
    /// Returns None for anonymous events (no topics) or malformed hex.
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().and_then(|t| parse_topic(t).ok())
    }
}

/// Parse a 32-byte hex topic string into a B256.
pub fn parse_topic(topic: &str) -> anyhow::Result<B256> {
    let s = topic.strip_prefix("0x").unwrap_or(topic);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s)?;
    if bytes.len() != 32 {
        anyhow::bail!("Expected 32 bytes for topic, got {}", bytes.len());
    }
    Ok(B256::from_slice(&bytes))
}

/// Parse a 32-byte hex topic into an Address (last 20 bytes).
pub fn parse_address_from_topic(topic: &str) -> anyhow::Result<Address> {
    let s = topic.strip_prefix("0x").unwrap_or(topic);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s)?;
    if bytes.len() < 20 {
        anyhow::bail!("Topic too short for address");
    }
    let start = bytes.len().saturating_sub(20);
    Ok(Address::from_slice(&bytes[start..]))
}

// Hex deserialization helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
fn pad_hex_string(s: &str) -> String {
    if s.is_empty() {
        return s.to_string();
    }
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Deserialize a hex string to u64.
fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    u64::from_str_radix(s, 16).map_err(serde::de::Error::custom)
}

/// Deserialize an optional (or null) hex string to u64.
fn deserialize_hex_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) => {
            let s = s.strip_prefix("0x").unwrap_or(&s);
            if s.is_empty() {
                return Ok(Some(0));
            }
            u64::from_str_radix(s, 16)
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
        None => Ok(None),
    }
}

/// Deserialize a hex string to U256.
fn deserialize_hex_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        return Ok(U256::ZERO);
    }
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
    Ok(U256::from_be_slice(&bytes))
}

/// Deserialize an optional hex string to U256.
fn deserialize_hex_u256_opt<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) => {
            let s = s.strip_prefix("0x").unwrap_or(&s);
            if s.is_empty() {
                Ok(Some(U256::ZERO))
            } else {
                let s = pad_hex_string(&s);
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                Ok(Some(U256::from_be_slice(&bytes)))
            }
        }
        None => Ok(None),
    }
}

/// Deserialize a hex string to B256.
fn deserialize_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    let s = pad_hex_string(&s);
    let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
    if bytes.len() != 32 {
        return Err(serde::de::Error::custom(format!(
            "Expected 32 bytes for hash, got {}",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(&bytes))
}

/// Deserialize a hex string to Address.
fn deserialize_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    let s = pad_hex_string(&s);
    let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
    if bytes.len() != 20 {
        return Err(serde::de::Error::custom(format!(
            "Expected 20 bytes for address, got {}",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

/// Deserialize an optional hex string to Address.
fn deserialize_hex_address_opt<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    match s {
        Some(s) => {
            let s = s.strip_prefix("0x").unwrap_or(&s);
            if s.is_empty() {
                Ok(None)
            } else {
                let s = pad_hex_string(&s);
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                if bytes.len() != 20 {
                    return Err(serde::de::Error::custom(format!(
                        "Expected 20 bytes for address, got {}",
                        bytes.len()
                    )));
                }
                Ok(Some(Address::from_slice(&bytes)))
            }
        }
        None => Ok(None),
    }
}

/// Deserialize a hex string to bytes.
fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        Ok(Vec::new())
    } else {
        let s = pad_hex_string(&s);
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic() {
        let topic = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
        let parsed = parse_topic(topic).unwrap();
        assert_eq!(format!("0x{:x}", parsed), topic);
    }

    #[test]
    fn test_parse_topic_rejects_short() {
        assert!(parse_topic("0xdead").is_err());
    }

    #[test]
    fn test_parse_address_from_topic() {
        let topic = "0x00000000000000000000000070997970c51812dc3a010c7d01b50e0d17dc79c8";
        let addr = parse_address_from_topic(topic).unwrap();
        let expected = Address::from_slice(
            &hex::decode("70997970c51812dc3a010c7d01b50e0d17dc79c8").unwrap(),
        );
        assert_eq!(addr, expected);
    }

    #[test]
    fn test_block_deserialization() {
        let json = r#"{
            "number": "0x64",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "timestamp": "0x5f5e100",
            "transactions": []
        }"#;
        let block: FeedBlock = serde_json::from_str(json).unwrap();
        assert_eq!(block.number, 100);
        assert_eq!(block.timestamp, 0x5f5e100);
        assert!(block.transactions.is_empty());
    }

    #[test]
    fn test_transaction_deserialization_pending() {
        let json = r#"{
            "hash": "0x3333333333333333333333333333333333333333333333333333333333333333",
            "from": "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
            "to": null,
            "value": "0xde0b6b3a7640000",
            "gas": "0x5208",
            "gasPrice": "0x4a817c800",
            "input": "0x",
            "nonce": "0x5",
            "blockNumber": null
        }"#;
        let tx: FeedTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.nonce, 5);
        assert!(tx.is_contract_creation());
        assert!(!tx.is_included());
        assert_eq!(tx.value, U256::from(1_000_000_000_000_000_000u64));
    }
}
