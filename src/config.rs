//! Engine configuration
//!
//! Handles loading the engine configuration from a JSON file.
//! Every field has a default so an empty object is a valid config.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_confirmation_depth() -> u64 {
    12
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_rematch_window() -> u32 {
    10
}

fn default_backfill_limit() -> u64 {
    64
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_sweep_interval_polls() -> u32 {
    12
}

/// Engine configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Descendant blocks required before a block's contents are final
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,

    /// Seconds between head polls when caught up
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Polls a reorg-evicted transaction may wait for re-inclusion
    #[serde(default = "default_rematch_window")]
    pub rematch_window: u32,

    /// Maximum heights walked backwards to repair a chain gap
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: u64,

    /// Outbound notification queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Polls between stale-transaction sweeps
    #[serde(default = "default_sweep_interval_polls")]
    pub sweep_interval_polls: u32,

    /// Wrapped-ether contract whose Deposit/Withdrawal events count as
    /// transfers (hex address), if any
    #[serde(default)]
    pub wrapped_ether: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: default_confirmation_depth(),
            poll_interval_secs: default_poll_interval_secs(),
            rematch_window: default_rematch_window(),
            backfill_limit: default_backfill_limit(),
            queue_capacity: default_queue_capacity(),
            sweep_interval_polls: default_sweep_interval_polls(),
            wrapped_ether: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: EngineConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.backfill_limit == 0 {
            anyhow::bail!("backfill_limit must be at least 1");
        }
        if let Some(addr) = &self.wrapped_ether {
            parse_address(addr).context("Invalid wrapped_ether address")?;
        }
        Ok(())
    }

    /// The wrapped-ether contract as an address, if configured.
    pub fn wrapped_ether_address(&self) -> Result<Option<Address>> {
        match &self.wrapped_ether {
            Some(s) => Ok(Some(parse_address(s)?)),
            None => Ok(None),
        }
    }
}

/// Pad an odd-length hex string with a leading zero.
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

/// Parse an address from a hex string, with or without 0x prefix.
pub fn parse_address(s: &str) -> Result<Address> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).with_context(|| format!("Invalid hex address: {}", s))?;

    if bytes.len() != 20 {
        anyhow::bail!(
            "Address must be 20 bytes (40 hex chars), got {} bytes",
            bytes.len()
        );
    }

    Ok(Address::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_from_empty_object() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{}}").unwrap();
        file.flush().unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.confirmation_depth, 12);
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.rematch_window, 10);
        assert!(config.wrapped_ether.is_none());
    }

    #[test]
    fn test_load_with_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "confirmation_depth": 6,
                "poll_interval_secs": 2,
                "wrapped_ether": "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"
            }}"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.confirmation_depth, 6);
        assert_eq!(config.poll_interval_secs, 2);
        let weth = config.wrapped_ether_address().unwrap().unwrap();
        assert_eq!(
            format!("0x{:x}", weth),
            "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"
        );
    }

    #[test]
    fn test_invalid_wrapped_ether_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "wrapped_ether": "0x1234" }}"#).unwrap();
        file.flush().unwrap();
        assert!(EngineConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "poll_interval_secs": 0 }}"#).unwrap();
        file.flush().unwrap();
        assert!(EngineConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_parse_address() {
        let addr1 = parse_address("0x0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap();
        let addr2 = parse_address("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap();
        assert_eq!(addr1, addr2);
        assert!(parse_address("0xdead").is_err());
    }
}
