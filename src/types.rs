//! Core data model shared by the tracer, cluster detector and adapters

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

lazy_static! {
    static ref EVM_ADDRESS: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap();
}

/// Supported chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Ethereum,
    Polygon,
    Arbitrum,
    Base,
    Optimism,
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 6] = [
        Chain::Ethereum,
        Chain::Polygon,
        Chain::Arbitrum,
        Chain::Base,
        Chain::Optimism,
        Chain::Solana,
    ];

    /// Is this an EVM chain (hex addresses, explorer API)
    pub fn is_evm(&self) -> bool {
        !matches!(self, Chain::Solana)
    }

    /// Numeric chain id for EVM chains
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Chain::Ethereum => Some(1),
            Chain::Polygon => Some(137),
            Chain::Arbitrum => Some(42161),
            Chain::Base => Some(8453),
            Chain::Optimism => Some(10),
            Chain::Solana => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Polygon => "polygon",
            Chain::Arbitrum => "arbitrum",
            Chain::Base => "base",
            Chain::Optimism => "optimism",
            Chain::Solana => "solana",
        }
    }

    /// Canonical form used for every map key and comparison.
    ///
    /// EVM addresses are case-insensitive (checksum casing is cosmetic);
    /// base58 Solana addresses are case-sensitive.
    pub fn normalize_address(&self, address: &str) -> String {
        let trimmed = address.trim();
        if self.is_evm() {
            trimmed.to_lowercase()
        } else {
            trimmed.to_string()
        }
    }

    /// Validate an address for this chain
    pub fn validate_address(&self, address: &str) -> Result<()> {
        let trimmed = address.trim();
        if self.is_evm() {
            if !EVM_ADDRESS.is_match(trimmed) {
                return Err(Error::InvalidAddress(format!(
                    "{} is not a valid {} address",
                    address, self
                )));
            }
            return Ok(());
        }

        let decoded = bs58::decode(trimmed)
            .into_vec()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?;
        if decoded.len() != 32 {
            return Err(Error::InvalidAddress(format!(
                "{} decodes to {} bytes, expected 32",
                address,
                decoded.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Ok(Chain::Ethereum),
            "polygon" | "matic" => Ok(Chain::Polygon),
            "arbitrum" | "arb" => Ok(Chain::Arbitrum),
            "base" => Ok(Chain::Base),
            "optimism" | "op" => Ok(Chain::Optimism),
            "solana" | "sol" => Ok(Chain::Solana),
            other => Err(Error::InvalidParameters(format!("unknown chain: {}", other))),
        }
    }
}

/// A single inbound token transfer, as reported by a chain data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub chain: Chain,
    /// Asset symbol (or mint/contract address when no symbol is known)
    pub asset: String,
    pub from: String,
    pub to: String,
    /// Amount in human units (decimals already applied)
    pub amount: f64,
    pub tx_hash: String,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
}

impl TransferEvent {
    /// Reject structurally broken events at the adapter boundary
    pub fn validate(&self) -> Result<()> {
        if self.from.trim().is_empty() || self.to.trim().is_empty() {
            return Err(Error::MalformedResponse(format!(
                "transfer {} is missing a counterparty",
                self.tx_hash
            )));
        }
        if self.tx_hash.trim().is_empty() {
            return Err(Error::MalformedResponse(
                "transfer without a transaction hash".to_string(),
            ));
        }
        if self.asset.trim().is_empty() {
            return Err(Error::MalformedResponse(format!(
                "transfer {} has no asset",
                self.tx_hash
            )));
        }
        if !self.amount.is_finite() {
            return Err(Error::MalformedResponse(format!(
                "transfer {} has non-finite amount",
                self.tx_hash
            )));
        }
        Ok(())
    }
}

/// One page of inbound transfers, most recent first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferPage {
    pub transfers: Vec<TransferEvent>,
    /// Opaque cursor for the next (older) page
    pub next_cursor: Option<String>,
}

/// Address metadata used when the static registry misses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMeta {
    pub is_contract: bool,
    /// Owning program (Solana) or deployer-side owner, when known
    pub program_owner: Option<String>,
}

/// Address classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    #[serde(rename = "EOA")]
    Eoa,
    #[serde(rename = "CEX")]
    Cex,
    Bridge,
    #[serde(rename = "DeFiProtocol")]
    DefiProtocol,
    Unknown,
}

impl Classification {
    /// Traversal stops at exchanges and bridges
    pub fn is_terminal(&self) -> bool {
        matches!(self, Classification::Cex | Classification::Bridge)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Eoa => "EOA",
            Classification::Cex => "CEX",
            Classification::Bridge => "Bridge",
            Classification::DefiProtocol => "DeFiProtocol",
            Classification::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "eoa" | "wallet" => Ok(Classification::Eoa),
            "cex" | "exchange" => Ok(Classification::Cex),
            "bridge" => Ok(Classification::Bridge),
            "defi" | "defiprotocol" | "defi_protocol" | "protocol" => {
                Ok(Classification::DefiProtocol)
            }
            "unknown" => Ok(Classification::Unknown),
            other => Err(Error::Config(format!("unknown classification: {}", other))),
        }
    }
}

/// A classified address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressNode {
    pub address: String,
    pub chain: Chain,
    pub classification: Classification,
    pub label: Option<String>,
    /// False when the metadata lookup failed and the node could not be resolved
    pub resolved: bool,
}

impl AddressNode {
    /// Label for display, falling back to the classification name
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.classification.to_string())
    }
}

/// Directed "funds" relation: `from` sent `amount` of `asset` to `to`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingEdge {
    pub to: String,
    pub from: String,
    pub asset: String,
    pub amount: f64,
    pub tx_hash: String,
    pub hop: u32,
}

/// A recognized source (exchange, bridge or protocol) found during a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHit {
    pub address: String,
    pub label: String,
    pub hop: u32,
    /// First transaction through which this source was reached
    #[serde(rename = "parent_tx", skip_serializing_if = "Option::is_none")]
    pub via_tx: Option<String>,
    /// Origin of bridged funds, bridges only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<BridgeOrigin>,
}

/// Where funds crossing a bridge came from, per the bridge's message index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeOrigin {
    pub protocol: String,
    pub source_chain_id: u16,
    pub source_chain: String,
    /// Contract that emitted the cross-chain message
    pub emitter_address: String,
    /// Wallet that sent the funds on the source chain, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Per-round statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HopSummary {
    pub hop: u32,
    pub addresses_expanded: usize,
    pub edges_admitted: usize,
    pub new_addresses: usize,
    pub sources_found: usize,
}

/// Outcome of one provenance trace. Immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct TraceResult {
    pub trace_id: String,
    pub start_address: String,
    pub chain: Chain,
    /// False when the start address was never classified or its lookup failed
    pub start_resolved: bool,
    pub hops_completed: u32,
    pub visited: BTreeSet<String>,
    pub funding_graph: BTreeMap<String, Vec<FundingEdge>>,
    pub cex_sources: Vec<SourceHit>,
    pub bridge_sources: Vec<SourceHit>,
    pub defi_interactions: Vec<SourceHit>,
    pub unresolved: Vec<String>,
    /// Discovered wallets that were never expanded (branch cap, hop limit, cancellation)
    pub unexpanded: Vec<String>,
    /// Expanded wallets with no admitted inbound funding
    pub unknown_origins: Vec<String>,
    pub totals_by_asset: BTreeMap<String, f64>,
    pub hop_summaries: Vec<HopSummary>,
    pub complete: bool,
}

impl TraceResult {
    pub fn edge_count(&self) -> usize {
        self.funding_graph.values().map(Vec::len).sum()
    }

    pub fn edges(&self) -> impl Iterator<Item = &FundingEdge> {
        self.funding_graph.values().flatten()
    }

    pub fn total_for(&self, asset: &str) -> f64 {
        self.totals_by_asset.get(asset).copied().unwrap_or(0.0)
    }
}

/// Group of tracked wallets funded by the same source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub source: String,
    pub source_classification: Classification,
    pub source_label: Option<String>,
    pub members: BTreeSet<String>,
    pub total_amount: f64,
    pub asset: String,
}

impl Cluster {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, wallet: &str) -> bool {
        self.members.contains(wallet)
    }
}

/// Admission rule applied to every inbound transfer.
///
/// Sub-threshold, self, non-positive and off-asset transfers are invisible
/// to the model: they produce no edge and count toward no total.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferFilter {
    pub min_amount: f64,
    pub asset: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl TransferFilter {
    pub fn new(min_amount: f64, asset: Option<String>) -> Self {
        Self {
            min_amount,
            asset,
            since: None,
        }
    }

    /// Does `transfer` count as funding of `recipient` (both normalized for `chain`)
    pub fn admits(&self, chain: Chain, transfer: &TransferEvent, recipient: &str) -> bool {
        let from = chain.normalize_address(&transfer.from);
        let to = chain.normalize_address(&transfer.to);

        if to != recipient || from == to || from.is_empty() {
            return false;
        }
        if !transfer.amount.is_finite() || transfer.amount <= 0.0 {
            return false;
        }
        if transfer.amount < self.min_amount {
            return false;
        }
        if let Some(asset) = &self.asset {
            if !transfer.asset.eq_ignore_ascii_case(asset) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if transfer.timestamp < since {
                return false;
            }
        }
        true
    }
}
