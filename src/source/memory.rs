//! In-memory chain data source
//!
//! Serves transfer history from a fixture instead of a network API. Used for
//! offline runs (`source.kind = "memory"`) and throughout the test suite,
//! where the recorded call counts show which addresses were expanded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::ChainDataSource;
use crate::error::{Error, Result};
use crate::types::{AddressMeta, Chain, TransferEvent, TransferPage};

/// Fixture file layout
#[derive(Debug, Deserialize)]
struct Fixture {
    chain: Chain,
    #[serde(default)]
    transfers: Vec<FixtureTransfer>,
    /// address -> owning program (null for a plain contract)
    #[serde(default)]
    contracts: HashMap<String, Option<String>>,
}

#[derive(Debug, Deserialize)]
struct FixtureTransfer {
    from: String,
    to: String,
    amount: f64,
    #[serde(default = "default_asset")]
    asset: String,
    tx_hash: String,
    #[serde(default)]
    block_height: Option<u64>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn default_asset() -> String {
    "USDC".to_string()
}

/// Chain data source backed by a fixed transfer set
pub struct MemorySource {
    chain: Chain,
    page_size: usize,
    /// recipient -> inbound transfers, most recent first
    inbound: HashMap<String, Vec<TransferEvent>>,
    contracts: HashMap<String, Option<String>>,
    failing_transfers: HashSet<String>,
    failing_meta: HashSet<String>,
    next_block: u64,
    transfer_calls: DashMap<String, usize>,
    meta_calls: DashMap<String, usize>,
}

impl MemorySource {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            page_size: 100,
            inbound: HashMap::new(),
            contracts: HashMap::new(),
            failing_transfers: HashSet::new(),
            failing_meta: HashSet::new(),
            next_block: 1,
            transfer_calls: DashMap::new(),
            meta_calls: DashMap::new(),
        }
    }

    /// Load a fixture file
    pub fn from_fixture(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    /// Parse fixture JSON
    pub fn from_json(raw: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(raw)?;
        let mut source = Self::new(fixture.chain);

        for t in fixture.transfers {
            let block_height = t.block_height.unwrap_or(source.next_block);
            let timestamp = t
                .timestamp
                .or_else(|| DateTime::from_timestamp(block_height as i64, 0))
                .unwrap_or_default();
            source.push(TransferEvent {
                chain: source.chain,
                asset: t.asset,
                from: t.from,
                to: t.to,
                amount: t.amount,
                tx_hash: t.tx_hash,
                block_height,
                timestamp,
            });
        }

        for (address, owner) in fixture.contracts {
            source = source.with_contract(&address, owner.as_deref());
        }

        Ok(source)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add a transfer; later transfers are more recent
    pub fn with_transfer(
        mut self,
        from: &str,
        to: &str,
        amount: f64,
        asset: &str,
        tx_hash: &str,
    ) -> Self {
        let block_height = self.next_block;
        self.push(TransferEvent {
            chain: self.chain,
            asset: asset.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            tx_hash: tx_hash.to_string(),
            block_height,
            timestamp: DateTime::from_timestamp(1_700_000_000 + block_height as i64, 0)
                .unwrap_or_default(),
        });
        self
    }

    /// Add a transfer with an explicit timestamp
    pub fn with_transfer_at(mut self, transfer: TransferEvent) -> Self {
        self.push(transfer);
        self
    }

    /// Mark `address` as a contract, optionally owned by `owner`
    pub fn with_contract(mut self, address: &str, owner: Option<&str>) -> Self {
        self.contracts.insert(
            self.chain.normalize_address(address),
            owner.map(str::to_string),
        );
        self
    }

    /// Make every transfer lookup for `address` fail
    pub fn fail_transfers(mut self, address: &str) -> Self {
        self.failing_transfers
            .insert(self.chain.normalize_address(address));
        self
    }

    /// Make every metadata lookup for `address` fail
    pub fn fail_meta(mut self, address: &str) -> Self {
        self.failing_meta.insert(self.chain.normalize_address(address));
        self
    }

    fn push(&mut self, transfer: TransferEvent) {
        self.next_block = self.next_block.max(transfer.block_height + 1);
        let recipient = self.chain.normalize_address(&transfer.to);
        let list = self.inbound.entry(recipient).or_default();
        list.push(transfer);
        list.sort_by(|a, b| b.block_height.cmp(&a.block_height));
    }

    /// Number of transfer-page requests made for `address`
    pub fn transfer_calls(&self, address: &str) -> usize {
        self.transfer_calls
            .get(&self.chain.normalize_address(address))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Number of metadata requests made for `address`
    pub fn meta_calls(&self, address: &str) -> usize {
        self.meta_calls
            .get(&self.chain.normalize_address(address))
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn total_transfer_calls(&self) -> usize {
        self.transfer_calls.iter().map(|e| *e.value()).sum()
    }

    pub fn transfer_count(&self) -> usize {
        self.inbound.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ChainDataSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn chain(&self) -> Chain {
        self.chain
    }

    async fn get_incoming_transfers(
        &self,
        address: &str,
        asset: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<TransferPage> {
        let address = self.chain.normalize_address(address);
        *self.transfer_calls.entry(address.clone()).or_insert(0) += 1;

        if self.failing_transfers.contains(&address) {
            return Err(Error::DataSource(format!(
                "transfer history unavailable for {}",
                address
            )));
        }

        let matching: Vec<&TransferEvent> = self
            .inbound
            .get(&address)
            .map(|list| {
                list.iter()
                    .filter(|t| asset.map_or(true, |a| t.asset.eq_ignore_ascii_case(a)))
                    .collect()
            })
            .unwrap_or_default();

        // Unparseable or out-of-range cursors restart from the newest page
        let offset = cursor
            .and_then(|c| c.parse::<usize>().ok())
            .filter(|o| *o < matching.len())
            .unwrap_or(0);
        let end = (offset + self.page_size).min(matching.len());

        Ok(TransferPage {
            transfers: matching[offset..end].iter().map(|t| (*t).clone()).collect(),
            next_cursor: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn get_address_meta(&self, address: &str) -> Result<AddressMeta> {
        let address = self.chain.normalize_address(address);
        *self.meta_calls.entry(address.clone()).or_insert(0) += 1;

        if self.failing_meta.contains(&address) {
            return Err(Error::DataSource(format!(
                "metadata unavailable for {}",
                address
            )));
        }

        Ok(match self.contracts.get(&address) {
            Some(owner) => AddressMeta {
                is_contract: true,
                program_owner: owner.clone(),
            },
            None => AddressMeta::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "chain": "polygon",
        "transfers": [
            {"from": "0xBB", "to": "0xAA", "amount": 500.0, "tx_hash": "tx1"},
            {"from": "0xcc", "to": "0xbb", "amount": 50.0, "asset": "USDT", "tx_hash": "tx2"}
        ],
        "contracts": {"0xDD": null, "0xee": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA"}
    }"#;

    #[tokio::test]
    async fn test_fixture_loading() {
        let source = MemorySource::from_json(FIXTURE).unwrap();
        assert_eq!(source.chain(), Chain::Polygon);
        assert_eq!(source.transfer_count(), 2);

        let page = source.get_incoming_transfers("0xaa", None, None).await.unwrap();
        assert_eq!(page.transfers.len(), 1);
        assert_eq!(page.transfers[0].asset, "USDC");
        assert!(page.next_cursor.is_none());

        let meta = source.get_address_meta("0xdd").await.unwrap();
        assert!(meta.is_contract);
        assert!(meta.program_owner.is_none());
        let meta = source.get_address_meta("0xEE").await.unwrap();
        assert!(meta.program_owner.is_some());
        assert!(!source.get_address_meta("0xaa").await.unwrap().is_contract);
    }

    #[tokio::test]
    async fn test_bad_cursor_returns_newest_page() {
        let source = MemorySource::new(Chain::Polygon)
            .with_page_size(1)
            .with_transfer("0xb", "0xa", 1.0, "USDC", "old")
            .with_transfer("0xc", "0xa", 2.0, "USDC", "new");

        let first = source.get_incoming_transfers("0xa", None, None).await.unwrap();
        assert_eq!(first.transfers[0].tx_hash, "new");
        assert_eq!(first.next_cursor.as_deref(), Some("1"));

        let stale = source
            .get_incoming_transfers("0xa", None, Some("garbage"))
            .await
            .unwrap();
        assert_eq!(stale.transfers[0].tx_hash, "new");
    }

    #[tokio::test]
    async fn test_failure_injection_and_call_counts() {
        let source = MemorySource::new(Chain::Polygon)
            .fail_transfers("0xA")
            .fail_meta("0xb");
        assert!(source.get_incoming_transfers("0xa", None, None).await.is_err());
        assert!(source.get_address_meta("0xb").await.is_err());
        assert_eq!(source.transfer_calls("0xa"), 1);
        assert_eq!(source.meta_calls("0xB"), 1);
        assert_eq!(source.transfer_calls("0xb"), 0);
    }

    #[tokio::test]
    async fn test_asset_hint_filters() {
        let source = MemorySource::from_json(FIXTURE).unwrap();
        let page = source
            .get_incoming_transfers("0xbb", Some("usdc"), None)
            .await
            .unwrap();
        assert!(page.transfers.is_empty());
    }
}
