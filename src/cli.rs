//! CLI implementation for ledgerctl
//!
//! Operator command-line interface over the ledger store: checkpoint,
//! blocks, transactions, balances, collectibles, and the reconciliation
//! failure view. All commands output pretty JSON.

use crate::config::parse_address;
use crate::records::{CollectibleContract, CollectibleKind, Visibility};
use crate::store::{LedgerStore, RocksLedgerStore};
use alloy_primitives::{B256, U256};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

/// Ledger store CLI tool
#[derive(Parser)]
#[command(name = "ledgerctl")]
#[command(about = "Ledger synchronization store CLI tool")]
pub struct Cli {
    /// Path to the RocksDB database directory
    #[arg(short, long, default_value = "./ledger_db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get the durable checkpoint (last acknowledged block)
    GetCheckpoint,
    /// Set the durable checkpoint (operator resync only)
    SetCheckpoint {
        /// Block number
        block: u64,
    },
    /// Get the ledger head (highest ingested block)
    GetHead,
    /// Show every block stored at a height, stale forks included
    GetBlock {
        /// Block number
        number: u64,
    },
    /// Get a tracked transaction by hash
    GetTransaction {
        /// Transaction hash (hex, with or without 0x prefix)
        hash: String,
    },
    /// Get a derived token balance
    GetBalance {
        /// Token contract address
        contract: String,
        /// Holder address
        address: String,
    },
    /// Get a fungible-collectible balance
    GetCollectibleBalance {
        /// Collectible contract address
        contract: String,
        /// Owner address
        address: String,
    },
    /// Get a collectible token's owner and metadata
    GetCollectible {
        /// Collectible contract address
        contract: String,
        /// Token id (hex or decimal)
        token_id: String,
    },
    /// Register a collectible contract with its type code
    AddCollectible {
        /// Collectible contract address
        contract: String,
        /// Type code: 0, 1, 2, or 721
        type_code: u16,
    },
    /// Set a token balance's client-facing visibility
    SetVisibility {
        /// Token contract address
        contract: String,
        /// Holder address
        address: String,
        /// One of: never, if-positive, always
        visibility: String,
    },
    /// List recorded balance reconciliation failures
    ListFailures,
    /// Clear a recorded reconciliation failure
    ClearFailure {
        /// Token contract address
        contract: String,
        /// Holder address
        address: String,
    },
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

/// Parse a hex string into a 32-byte hash (B256).
fn parse_hash(s: &str) -> Result<B256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).with_context(|| format!("Invalid hex hash: {}", s))?;
    if bytes.len() != 32 {
        anyhow::bail!("Hash must be 32 bytes (64 hex chars), got {} bytes", bytes.len());
    }
    Ok(B256::from_slice(&bytes))
}

/// Parse a token id from hex (0x-prefixed) or decimal.
fn parse_token_id(s: &str) -> Result<U256> {
    if let Some(hex_part) = s.strip_prefix("0x") {
        let hex_part = pad_hex_string(hex_part);
        let bytes = hex::decode(&hex_part).with_context(|| format!("Invalid hex token id: {}", s))?;
        if bytes.len() > 32 {
            anyhow::bail!("Token id too large (max 32 bytes), got {} bytes", bytes.len());
        }
        return Ok(U256::from_be_slice(&bytes));
    }
    s.parse::<u64>()
        .map(U256::from)
        .with_context(|| format!("Invalid decimal token id: {}", s))
}

fn parse_visibility(s: &str) -> Result<Visibility> {
    match s {
        "never" => Ok(Visibility::Never),
        "if-positive" => Ok(Visibility::IfPositive),
        "always" => Ok(Visibility::Always),
        other => anyhow::bail!("Unrecognized visibility: {}", other),
    }
}

fn visibility_str(v: Visibility) -> &'static str {
    match v {
        Visibility::Never => "never",
        Visibility::IfPositive => "if-positive",
        Visibility::Always => "always",
    }
}

/// Run the CLI command and print JSON output.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = RocksLedgerStore::open(&cli.db_path)
        .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?;

    let result = match cli.command {
        Commands::GetCheckpoint => match store.get_checkpoint()? {
            Some(block) => json!({ "checkpoint": block }),
            None => json!({ "checkpoint": null }),
        },
        Commands::SetCheckpoint { block } => {
            store.set_checkpoint(block)?;
            json!({ "status": "ok", "checkpoint": block })
        }
        Commands::GetHead => match store.get_head()? {
            Some(block) => json!({ "head": block }),
            None => json!({ "head": null }),
        },
        Commands::GetBlock { number } => {
            let blocks: Vec<_> = store
                .get_blocks_at(number)?
                .into_iter()
                .map(|b| {
                    json!({
                        "number": b.number,
                        "hash": format!("0x{:x}", b.hash),
                        "parent_hash": format!("0x{:x}", b.parent_hash),
                        "timestamp": b.timestamp,
                        "stale": b.stale,
                    })
                })
                .collect();
            json!({ "block": number, "entries": blocks })
        }
        Commands::GetTransaction { hash } => {
            let hash_val = parse_hash(&hash)?;
            match store.get_transaction(hash_val)? {
                Some(tx) => json!({
                    "hash": format!("0x{:x}", tx.hash),
                    "from": format!("0x{:x}", tx.from_address),
                    "to": tx.to_address.map(|a| format!("0x{:x}", a)),
                    "nonce": tx.nonce,
                    "value": format!("0x{:x}", tx.value),
                    "gas": format!("0x{:x}", tx.gas),
                    "gas_price": format!("0x{:x}", tx.gas_price),
                    "status": tx.status.as_str(),
                    "blocknumber": tx.blocknumber,
                    "error_code": tx.error_code.map(|c| format!("{:?}", c)),
                    "created": tx.created,
                    "updated": tx.updated,
                    "sender_id": tx.sender_id,
                }),
                None => json!({ "hash": format!("0x{:x}", hash_val), "transaction": null }),
            }
        }
        Commands::GetBalance { contract, address } => {
            let contract = parse_address(&contract)?;
            let address = parse_address(&address)?;
            match store.get_token_balance(contract, address)? {
                Some(record) => json!({
                    "contract": format!("0x{:x}", contract),
                    "address": format!("0x{:x}", address),
                    "balance": format!("0x{:x}", record.balance),
                    "blocknumber": record.blocknumber,
                    "visibility": visibility_str(record.visibility),
                }),
                None => json!({
                    "contract": format!("0x{:x}", contract),
                    "address": format!("0x{:x}", address),
                    "balance": null,
                }),
            }
        }
        Commands::GetCollectibleBalance { contract, address } => {
            let contract = parse_address(&contract)?;
            let address = parse_address(&address)?;
            match store.get_collectible_balance(contract, address)? {
                Some(record) => json!({
                    "contract": format!("0x{:x}", contract),
                    "address": format!("0x{:x}", address),
                    "balance": format!("0x{:x}", record.balance),
                    "blocknumber": record.blocknumber,
                }),
                None => json!({
                    "contract": format!("0x{:x}", contract),
                    "address": format!("0x{:x}", address),
                    "balance": null,
                }),
            }
        }
        Commands::GetCollectible { contract, token_id } => {
            let contract = parse_address(&contract)?;
            let token_id = parse_token_id(&token_id)?;
            match store.get_collectible_token(contract, token_id)? {
                Some(token) => json!({
                    "contract": format!("0x{:x}", contract),
                    "token_id": format!("0x{:x}", token_id),
                    "owner": format!("0x{:x}", token.owner_address),
                    "token_uri": token.token_uri,
                    "has_icon": token.icon().is_some(),
                }),
                None => json!({
                    "contract": format!("0x{:x}", contract),
                    "token_id": format!("0x{:x}", token_id),
                    "token": null,
                }),
            }
        }
        Commands::AddCollectible {
            contract,
            type_code,
        } => {
            let contract_addr = parse_address(&contract)?;
            let kind = CollectibleKind::from_code(type_code)?;
            store.put_collectible_contract(
                contract_addr,
                &CollectibleContract {
                    kind,
                    last_block: 0,
                },
            )?;
            json!({
                "status": "ok",
                "contract": format!("0x{:x}", contract_addr),
                "kind": format!("{:?}", kind),
            })
        }
        Commands::SetVisibility {
            contract,
            address,
            visibility,
        } => {
            let contract = parse_address(&contract)?;
            let address = parse_address(&address)?;
            let visibility = parse_visibility(&visibility)?;
            let mut record = store
                .get_token_balance(contract, address)?
                .context("No balance tracked for that (contract, address)")?;
            record.visibility = visibility;
            store.put_token_balance(contract, address, &record)?;
            json!({
                "status": "ok",
                "contract": format!("0x{:x}", contract),
                "address": format!("0x{:x}", address),
                "visibility": visibility_str(visibility),
            })
        }
        Commands::ListFailures => {
            let failures: Vec<_> = store
                .get_reconcile_failures()?
                .into_iter()
                .map(|(contract, holder, f)| {
                    json!({
                        "contract": format!("0x{:x}", contract),
                        "address": format!("0x{:x}", holder),
                        "block": f.block,
                        "message": f.message,
                    })
                })
                .collect();
            json!({ "failures": failures })
        }
        Commands::ClearFailure { contract, address } => {
            let contract = parse_address(&contract)?;
            let address = parse_address(&address)?;
            store.delete_reconcile_failure(contract, address)?;
            json!({
                "status": "ok",
                "contract": format!("0x{:x}", contract),
                "address": format!("0x{:x}", address),
            })
        }
    };

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hash() {
        let h = parse_hash("0x00000000000000000000000000000000000000000000000000000000000000aa")
            .unwrap();
        assert_eq!(h.as_slice()[31], 0xaa);
        assert!(parse_hash("0xdead").is_err());
    }

    #[test]
    fn test_parse_token_id() {
        assert_eq!(parse_token_id("7").unwrap(), U256::from(7u64));
        assert_eq!(parse_token_id("0x7").unwrap(), U256::from(7u64));
        assert_eq!(parse_token_id("0xff").unwrap(), U256::from(255u64));
        assert!(parse_token_id("notanumber").is_err());
    }

    #[test]
    fn test_parse_visibility() {
        assert_eq!(parse_visibility("never").unwrap(), Visibility::Never);
        assert_eq!(parse_visibility("if-positive").unwrap(), Visibility::IfPositive);
        assert_eq!(parse_visibility("always").unwrap(), Visibility::Always);
        assert!(parse_visibility("sometimes").is_err());
    }
}
