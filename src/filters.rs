//! Event filter matcher
//!
//! Matches contract log events against client-registered (contract, topic)
//! filters. Matching is exact equality, no wildcard topics; registration is
//! idempotent.

use crate::records::FilterRegistration;
use crate::store::LedgerStore;
use alloy_primitives::{keccak256, Address, B256};
use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Filter matcher over the ledger store.
pub struct FilterMatcher<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> FilterMatcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Derive the stable filter id for a registration triple.
    ///
    /// Content-derived so re-registration yields the same id with no
    /// counter state.
    fn filter_id(registration_id: &str, contract: Address, topic_id: B256) -> u64 {
        let mut buf = Vec::with_capacity(registration_id.len() + 52);
        buf.extend_from_slice(registration_id.as_bytes());
        buf.extend_from_slice(contract.as_slice());
        buf.extend_from_slice(topic_id.as_slice());
        let digest = keccak256(&buf);
        u64::from_be_bytes(digest[0..8].try_into().expect("8 bytes for u64"))
    }

    /// Register a filter for (contract, topic).
    ///
    /// Inserting a duplicate (registration_id, contract, topic_id) is a
    /// no-op success returning the existing registration, not an error.
    pub fn register(
        &self,
        registration_id: &str,
        contract: Address,
        topic_id: B256,
        topic: &str,
    ) -> Result<FilterRegistration> {
        if let Some(existing) = self.store.get_filter(contract, topic_id, registration_id)? {
            debug!(
                "Duplicate filter registration for ({}, {:?}, 0x{:x})",
                registration_id, contract, topic_id
            );
            return Ok(existing);
        }

        let filter = FilterRegistration {
            filter_id: Self::filter_id(registration_id, contract, topic_id),
            registration_id: registration_id.to_string(),
            contract_address: contract,
            topic_id,
            topic: topic.to_string(),
        };
        self.store.put_filter(&filter)?;
        Ok(filter)
    }

    /// Every registration id whose filter matches (contract, topic_id)
    /// exactly. Deduplicated; a pure function of current registrations.
    pub fn match_event(&self, contract: Address, topic_id: B256) -> Result<BTreeSet<String>> {
        let filters = self.store.get_filters_for_event(contract, topic_id)?;
        Ok(filters
            .into_iter()
            .map(|f| f.registration_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RocksLedgerStore;
    use alloy_primitives::b256;
    use tempfile::TempDir;

    fn create_matcher() -> (FilterMatcher<RocksLedgerStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RocksLedgerStore::open(temp_dir.path()).unwrap());
        (FilterMatcher::new(store), temp_dir)
    }

    fn contract() -> Address {
        Address::from_slice(&hex::decode("dAC17F958D2ee523a2206206994597C13D831ec7").unwrap())
    }

    fn transfer_topic() -> B256 {
        b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
    }

    #[test]
    fn test_register_and_match() {
        let (matcher, _tmp) = create_matcher();
        let topic = transfer_topic();

        matcher
            .register("reg-a", contract(), topic, "Transfer(address,address,uint256)")
            .unwrap();
        matcher
            .register("reg-b", contract(), topic, "Transfer(address,address,uint256)")
            .unwrap();

        let matched = matcher.match_event(contract(), topic).unwrap();
        assert_eq!(matched.len(), 2);
        assert!(matched.contains("reg-a"));
        assert!(matched.contains("reg-b"));
    }

    #[test]
    fn test_exact_match_only() {
        let (matcher, _tmp) = create_matcher();
        let topic = transfer_topic();
        let other_topic =
            b256!("a34547120a941eab43859acf535a121237e5536fd476dccda8174fb1af6926ed");
        let other_contract =
            Address::from_slice(&hex::decode("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap());

        matcher
            .register("reg-a", contract(), topic, "Transfer(address,address,uint256)")
            .unwrap();

        assert!(matcher.match_event(contract(), other_topic).unwrap().is_empty());
        assert!(matcher.match_event(other_contract, topic).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_registration_idempotent() {
        let (matcher, _tmp) = create_matcher();
        let topic = transfer_topic();

        let first = matcher
            .register("reg-a", contract(), topic, "Transfer(address,address,uint256)")
            .unwrap();
        let second = matcher
            .register("reg-a", contract(), topic, "Transfer(address,address,uint256)")
            .unwrap();
        assert_eq!(first, second);

        // Still a single match even after registering twice
        let matched = matcher.match_event(contract(), topic).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_match_is_pure_over_registrations() {
        let (matcher, _tmp) = create_matcher();
        let topic = transfer_topic();

        assert!(matcher.match_event(contract(), topic).unwrap().is_empty());
        matcher
            .register("reg-a", contract(), topic, "Transfer(address,address,uint256)")
            .unwrap();
        let once = matcher.match_event(contract(), topic).unwrap();
        let twice = matcher.match_event(contract(), topic).unwrap();
        assert_eq!(once, twice);
    }
}
