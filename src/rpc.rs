//! JSON-RPC feed client
//!
//! Provides a typed interface to the Ethereum node feed the ledger follows.
//! Transport-level failures surface as transient feed errors so the caller
//! retries with backoff instead of mutating state.

use crate::error::SyncError;
use crate::types::{FeedBlock, FeedTransaction, LogEvent};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use serde_json::{json, Value};

/// JSON-RPC client for the node feed.
pub struct FeedClient {
    client: reqwest::Client,
    url: String,
}

impl FeedClient {
    /// Create a new feed client.
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::TransientFeed(format!("send failed: {}", e)))?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| SyncError::TransientFeed(format!("bad response body: {}", e)))?;

        // Check for RPC error
        if let Some(error) = json.get("error") {
            anyhow::bail!("RPC error: {}", error);
        }

        // Extract result
        json.get("result")
            .cloned()
            .context("RPC response missing 'result' field")
    }

    /// Get a block by number with full transaction details.
    ///
    /// `block` can be a hex block number or "finalized", "latest", etc.
    /// Returns None when the node does not have the block yet.
    pub async fn get_block_by_number(&self, block: &str) -> Result<Option<FeedBlock>> {
        let params = json!([block, true]);
        let result = self.call("eth_getBlockByNumber", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .context("Failed to deserialize block")
    }

    /// Get a block at a specific height.
    pub async fn get_block_at(&self, height: u64) -> Result<Option<FeedBlock>> {
        self.get_block_by_number(&format!("0x{:x}", height)).await
    }

    /// Get just the block number for a given block tag.
    ///
    /// This is more efficient than fetching the full block when you only
    /// need the number.
    pub async fn get_block_number(&self, block: &str) -> Result<u64> {
        let params = json!([block, false]);
        let result = self.call("eth_getBlockByNumber", params).await?;

        let number_str = result
            .get("number")
            .and_then(|v| v.as_str())
            .context("Block missing 'number' field")?;

        let number_str = number_str.strip_prefix("0x").unwrap_or(number_str);
        if number_str.is_empty() {
            anyhow::bail!("Block number is empty");
        }
        u64::from_str_radix(number_str, 16).context("Failed to parse block number")
    }

    /// Get all contract logs emitted in one block.
    pub async fn get_logs(&self, block: u64) -> Result<Vec<LogEvent>> {
        let block_str = format!("0x{:x}", block);
        let params = json!([{ "fromBlock": block_str, "toBlock": block_str }]);
        let result = self.call("eth_getLogs", params).await?;
        serde_json::from_value(result).context("Failed to deserialize logs")
    }

    /// Get a transaction by hash. None once dropped from the node's pool.
    pub async fn get_transaction_by_hash(&self, hash: B256) -> Result<Option<FeedTransaction>> {
        let hash_str = format!("0x{:x}", hash);
        let params = json!([hash_str]);
        let result = self.call("eth_getTransactionByHash", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .context("Failed to deserialize transaction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    #[test]
    fn test_address_formatting() {
        let addr_bytes = hex::decode("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap();
        let addr = Address::from_slice(&addr_bytes);
        assert_eq!(
            format!("0x{:x}", addr),
            "0x0742d35cc6634c0532925a3b844bc9e7595f0beb"
        );
    }

    #[test]
    fn test_block_tag_formatting() {
        assert_eq!(format!("0x{:x}", 255u64), "0xff");
        assert_eq!(format!("0x{:x}", 0u64), "0x0");
    }
}
