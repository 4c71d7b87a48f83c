//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::classifier::AddressRegistry;
use crate::cluster::{ClusterConfig, ClusterRequest};
use crate::report::ReportAssembler;
use crate::source::ThrottleConfig;
use crate::tracer::{TraceRequest, TracerConfig, MAX_HOPS_LIMIT};
use crate::types::{Chain, Classification};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Which chain data adapter to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Etherscan,
    Helius,
    Memory,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Etherscan => write!(f, "etherscan"),
            SourceKind::Helius => write!(f, "helius"),
            SourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// Chain data source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,

    #[serde(default = "default_chain")]
    pub chain: Chain,

    /// Explorer / Helius API key
    #[serde(default)]
    pub api_key: String,

    /// Override the REST endpoint
    #[serde(default)]
    pub base_url: Option<String>,

    /// Solana JSON-RPC endpoint (Helius only)
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Fixture file (memory only)
    #[serde(default)]
    pub fixture_path: Option<String>,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Sustained request rate shared by every trace
    #[serde(default = "default_requests_per_sec")]
    pub requests_per_sec: f64,

    /// Burst allowance above the sustained rate
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Rows per page requested from the provider
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Token contract -> symbol. Empty uses the adapter's defaults.
    #[serde(default)]
    pub tracked_tokens: HashMap<String, String>,
}

fn default_source_kind() -> SourceKind {
    SourceKind::Etherscan
}
fn default_chain() -> Chain {
    Chain::Polygon
}
fn default_timeout_ms() -> u64 {
    15_000
}
fn default_requests_per_sec() -> f64 {
    4.0 // free Etherscan tier allows 5/s
}
fn default_burst() -> u32 {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    250
}
fn default_page_size() -> u32 {
    100
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            chain: default_chain(),
            api_key: String::new(),
            base_url: None,
            rpc_url: None,
            fixture_path: None,
            timeout_ms: default_timeout_ms(),
            requests_per_sec: default_requests_per_sec(),
            burst: default_burst(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            page_size: default_page_size(),
            tracked_tokens: HashMap::new(),
        }
    }
}

impl SourceConfig {
    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            max_attempts: self.max_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

/// Default trace parameters
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    #[serde(default = "default_min_amount")]
    pub min_amount: f64,

    #[serde(default)]
    pub asset_filter: Option<String>,

    #[serde(default = "default_max_branch_per_hop")]
    pub max_branch_per_hop: usize,

    /// Time budget per trace, unbounded when unset
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_pages_per_address")]
    pub max_pages_per_address: usize,
}

fn default_max_hops() -> u32 {
    5
}
fn default_min_amount() -> f64 {
    100.0
}
fn default_max_branch_per_hop() -> usize {
    15
}
fn default_concurrency() -> usize {
    5
}
fn default_max_pages_per_address() -> usize {
    5
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            min_amount: default_min_amount(),
            asset_filter: None,
            max_branch_per_hop: default_max_branch_per_hop(),
            deadline_secs: None,
            concurrency: default_concurrency(),
            max_pages_per_address: default_max_pages_per_address(),
        }
    }
}

impl TraceConfig {
    pub fn tracer_config(&self) -> TracerConfig {
        TracerConfig {
            concurrency: self.concurrency,
            max_pages_per_address: self.max_pages_per_address,
        }
    }

    /// Request for `address` carrying the configured defaults
    pub fn request(&self, address: &str, chain: Chain) -> TraceRequest {
        TraceRequest {
            start_address: address.to_string(),
            chain,
            max_hops: self.max_hops,
            min_amount: self.min_amount,
            asset_filter: self.asset_filter.clone(),
            max_branch_per_hop: self.max_branch_per_hop,
            deadline: self.deadline_secs.map(Duration::from_secs),
        }
    }
}

/// Cluster scan settings
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_min_amount")]
    pub min_amount: f64,

    #[serde(default)]
    pub asset_filter: Option<String>,

    /// Only funding newer than this many hours counts
    #[serde(default)]
    pub lookback_hours: Option<u64>,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_max_pages_per_wallet")]
    pub max_pages_per_wallet: usize,
}

fn default_max_pages_per_wallet() -> usize {
    2
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            min_amount: default_min_amount(),
            asset_filter: None,
            lookback_hours: None,
            concurrency: default_concurrency(),
            max_pages_per_wallet: default_max_pages_per_wallet(),
        }
    }
}

impl ClusterSettings {
    pub fn detector_config(&self) -> ClusterConfig {
        ClusterConfig {
            concurrency: self.concurrency,
            max_pages_per_wallet: self.max_pages_per_wallet,
        }
    }

    pub fn request(&self) -> ClusterRequest {
        let mut request = ClusterRequest::new(self.min_amount);
        if let Some(asset) = &self.asset_filter {
            request = request.with_asset(asset.clone());
        }
        if let Some(hours) = self.lookback_hours {
            request = request.with_lookback_hours(hours);
        }
        request
    }
}

/// Shared cache sizing
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_classification_ttl_secs")]
    pub classification_ttl_secs: u64,

    #[serde(default = "default_transfer_ttl_secs")]
    pub transfer_ttl_secs: u64,
}

fn default_max_entries() -> usize {
    50_000
}
fn default_classification_ttl_secs() -> u64 {
    3600
}
fn default_transfer_ttl_secs() -> u64 {
    300
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            classification_ttl_secs: default_classification_ttl_secs(),
            transfer_ttl_secs: default_transfer_ttl_secs(),
        }
    }
}

impl CacheSettings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            classification_ttl_secs: self.classification_ttl_secs,
            transfer_ttl_secs: self.transfer_ttl_secs,
        }
    }
}

/// Funding-tree rendering limits
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_max_tree_depth")]
    pub max_tree_depth: usize,

    #[serde(default = "default_max_tree_lines")]
    pub max_tree_lines: usize,
}

fn default_max_tree_depth() -> usize {
    6
}
fn default_max_tree_lines() -> usize {
    400
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            max_tree_depth: default_max_tree_depth(),
            max_tree_lines: default_max_tree_lines(),
        }
    }
}

impl ReportConfig {
    pub fn assembler(&self) -> ReportAssembler {
        ReportAssembler::new(self.max_tree_depth, self.max_tree_lines)
    }
}

/// Known-address overrides
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Start from the built-in exchange/bridge/protocol tables
    #[serde(default = "default_include_defaults")]
    pub include_defaults: bool,

    #[serde(default)]
    pub entries: Vec<RegistryEntryConfig>,

    /// Extra token-program ids
    #[serde(default)]
    pub token_programs: Vec<String>,
}

fn default_include_defaults() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            include_defaults: default_include_defaults(),
            entries: Vec::new(),
            token_programs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntryConfig {
    pub chain: Chain,
    pub address: String,
    /// cex, bridge, defi, eoa or unknown
    pub classification: String,
    pub label: String,
}

impl RegistryConfig {
    /// Build the registry: defaults (optional) with configured entries on top
    pub fn build(&self) -> Result<AddressRegistry> {
        let mut overrides = AddressRegistry::empty();
        for entry in &self.entries {
            entry
                .chain
                .validate_address(&entry.address)
                .with_context(|| format!("Invalid registry entry {}", entry.address))?;
            let classification: Classification = entry
                .classification
                .parse()
                .with_context(|| format!("Invalid registry entry {}", entry.address))?;
            overrides.insert(entry.chain, &entry.address, classification, &entry.label);
        }
        for program in &self.token_programs {
            overrides.add_token_program(program);
        }

        let base = if self.include_defaults {
            AddressRegistry::with_defaults()
        } else {
            AddressRegistry::empty()
        };
        Ok(base.merge(overrides))
    }
}

/// Bridge origin lookup
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Ask Wormholescan where bridged funds came from
    #[serde(default)]
    pub wormhole_enabled: bool,

    #[serde(default = "default_wormhole_base_url")]
    pub wormhole_base_url: String,

    #[serde(default = "default_bridge_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_bridge_requests_per_sec")]
    pub requests_per_sec: f64,
}

fn default_wormhole_base_url() -> String {
    crate::source::wormhole::DEFAULT_BASE_URL.to_string()
}
fn default_bridge_timeout_ms() -> u64 {
    10_000
}
fn default_bridge_requests_per_sec() -> f64 {
    2.0
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            wormhole_enabled: false,
            wormhole_base_url: default_wormhole_base_url(),
            timeout_ms: default_bridge_timeout_ms(),
            requests_per_sec: default_bridge_requests_per_sec(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("source.kind", "etherscan")?
            .set_default("source.chain", "polygon")?
            .set_default("source.timeout_ms", default_timeout_ms() as i64)?
            .set_default("trace.max_hops", default_max_hops() as i64)?
            .set_default("trace.min_amount", default_min_amount())?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (PROVENANCE__SOURCE__API_KEY, ...)
            .add_source(
                config::Environment::with_prefix("PROVENANCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let source = &self.source;
        match source.kind {
            SourceKind::Etherscan => {
                if !source.chain.is_evm() {
                    anyhow::bail!("etherscan source cannot serve {}", source.chain);
                }
                if source.api_key.is_empty() {
                    anyhow::bail!("source.api_key is required for etherscan");
                }
            }
            SourceKind::Helius => {
                if source.chain != Chain::Solana {
                    anyhow::bail!("helius source only serves solana, got {}", source.chain);
                }
                let key_in_url = source
                    .rpc_url
                    .as_deref()
                    .map(|u| u.contains("api-key="))
                    .unwrap_or(false);
                if source.api_key.is_empty() && !key_in_url {
                    anyhow::bail!("source.api_key (or an rpc_url with api-key) is required for helius");
                }
            }
            SourceKind::Memory => {
                if source.fixture_path.is_none() {
                    anyhow::bail!("source.fixture_path is required for the memory source");
                }
            }
        }

        for (name, value) in [("base_url", &source.base_url), ("rpc_url", &source.rpc_url)] {
            if let Some(raw) = value {
                url::Url::parse(raw)
                    .with_context(|| format!("source.{} is not a valid URL", name))?;
            }
        }

        if source.timeout_ms == 0 {
            anyhow::bail!("source.timeout_ms must be positive");
        }
        if !(source.requests_per_sec > 0.0) {
            anyhow::bail!("source.requests_per_sec must be positive");
        }
        if source.burst == 0 || source.max_attempts == 0 || source.page_size == 0 {
            anyhow::bail!("source.burst, max_attempts and page_size must be at least 1");
        }

        let trace = &self.trace;
        if trace.max_hops > MAX_HOPS_LIMIT {
            anyhow::bail!("trace.max_hops cannot exceed {}", MAX_HOPS_LIMIT);
        }
        if !trace.min_amount.is_finite() || trace.min_amount < 0.0 {
            anyhow::bail!("trace.min_amount must be a non-negative number");
        }
        if trace.max_branch_per_hop == 0 {
            anyhow::bail!("trace.max_branch_per_hop must be at least 1");
        }
        if trace.concurrency == 0 || trace.max_pages_per_address == 0 {
            anyhow::bail!("trace.concurrency and max_pages_per_address must be at least 1");
        }

        let cluster = &self.cluster;
        if !cluster.min_amount.is_finite() || cluster.min_amount < 0.0 {
            anyhow::bail!("cluster.min_amount must be a non-negative number");
        }
        if cluster.concurrency == 0 || cluster.max_pages_per_wallet == 0 {
            anyhow::bail!("cluster.concurrency and max_pages_per_wallet must be at least 1");
        }

        for asset in [&trace.asset_filter, &cluster.asset_filter].into_iter().flatten() {
            if asset.trim().is_empty() {
                anyhow::bail!("asset_filter must not be empty when set");
            }
        }

        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be at least 1");
        }
        if self.report.max_tree_lines == 0 {
            anyhow::bail!("report.max_tree_lines must be at least 1");
        }

        let bridge = &self.bridge;
        if bridge.wormhole_enabled {
            url::Url::parse(&bridge.wormhole_base_url)
                .context("bridge.wormhole_base_url is not a valid URL")?;
            if bridge.timeout_ms == 0 || !(bridge.requests_per_sec > 0.0) {
                anyhow::bail!("bridge.timeout_ms and requests_per_sec must be positive");
            }
        }

        // Surfaces bad registry rows at load time
        self.registry.build()?;

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Source:
    kind: {}
    chain: {}
    api_key: {}
    base_url: {}
    rpc_url: {}
    fixture: {}
    timeout: {}ms
    rate: {}/s (burst {})
    max_attempts: {}
  Trace:
    max_hops: {}
    min_amount: {}
    asset_filter: {}
    max_branch_per_hop: {}
    deadline: {}
    concurrency: {}
  Cluster:
    min_amount: {}
    lookback_hours: {}
  Cache:
    max_entries: {}
    classification_ttl: {}s
    transfer_ttl: {}s
  Registry:
    include_defaults: {}
    entries: {}
  Bridge:
    wormhole: {}
"#,
            self.source.kind,
            self.source.chain,
            if self.source.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.source.base_url.as_deref().map(mask_url).unwrap_or_else(|| "(default)".into()),
            self.source.rpc_url.as_deref().map(mask_url).unwrap_or_else(|| "(default)".into()),
            self.source.fixture_path.as_deref().unwrap_or("(none)"),
            self.source.timeout_ms,
            self.source.requests_per_sec,
            self.source.burst,
            self.source.max_attempts,
            self.trace.max_hops,
            self.trace.min_amount,
            self.trace.asset_filter.as_deref().unwrap_or("(any)"),
            self.trace.max_branch_per_hop,
            self.trace
                .deadline_secs
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "(none)".into()),
            self.trace.concurrency,
            self.cluster.min_amount,
            self.cluster
                .lookback_hours
                .map(|h| h.to_string())
                .unwrap_or_else(|| "(all)".into()),
            self.cache.max_entries,
            self.cache.classification_ttl_secs,
            self.cache.transfer_ttl_secs,
            self.registry.include_defaults,
            self.registry.entries.len(),
            if self.bridge.wormhole_enabled {
                mask_url(&self.bridge.wormhole_base_url)
            } else {
                "(disabled)".to_string()
            },
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            trace: TraceConfig::default(),
            cluster: ClusterSettings::default(),
            cache: CacheSettings::default(),
            report: ReportConfig::default(),
            registry: RegistryConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.source.kind, SourceKind::Etherscan);
        assert_eq!(config.source.chain, Chain::Polygon);
        assert_eq!(config.trace.max_hops, 5);
        assert_eq!(config.trace.min_amount, 100.0);
        assert_eq!(config.trace.max_branch_per_hop, 15);
        assert_eq!(config.report.max_tree_depth, 6);
        // Etherscan without a key is rejected
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[source]
kind = "memory"
chain = "polygon"
fixture_path = "demos/polygon_fixture.json"

[trace]
max_hops = 3
asset_filter = "USDC"
deadline_secs = 30

[cluster]
lookback_hours = 48

[[registry.entries]]
chain = "polygon"
address = "0x1111111111111111111111111111111111111111"
classification = "cex"
label = "Exchange1"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.source.kind, SourceKind::Memory);
        assert_eq!(config.trace.max_hops, 3);
        assert_eq!(config.trace.max_branch_per_hop, 15);
        assert_eq!(config.cluster.lookback_hours, Some(48));
        assert!(!config.bridge.wormhole_enabled);

        let request = config.trace.request("0xabc", Chain::Polygon);
        assert_eq!(request.deadline, Some(Duration::from_secs(30)));
        assert_eq!(request.asset_filter.as_deref(), Some("USDC"));

        let registry = config.registry.build().unwrap();
        let hit = registry
            .lookup(Chain::Polygon, "0x1111111111111111111111111111111111111111")
            .unwrap();
        assert_eq!(hit.classification, Classification::Cex);
        // Defaults still present
        assert!(registry.len(Chain::Polygon) > 1);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.source.api_key = "key".to_string();
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.trace.max_hops = 21;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.source.kind = SourceKind::Helius;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.registry.entries.push(RegistryEntryConfig {
            chain: Chain::Polygon,
            address: "0x1111111111111111111111111111111111111111".to_string(),
            classification: "casino".to_string(),
            label: "?".to_string(),
        });
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.bridge.wormhole_enabled = true;
        bad.bridge.wormhole_base_url = "not a url".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.trace.asset_filter = Some("  ".to_string());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_masked_display_hides_secrets() {
        let mut config = Config::default();
        config.source.api_key = "super-secret".to_string();
        config.source.rpc_url = Some("https://mainnet.helius-rpc.com/?api-key=super-secret".into());
        let shown = config.masked_display();
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("https://mainnet.helius-rpc.com/?***"));
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(
            mask_url("https://api.example.com"),
            "https://api.example.com"
        );
    }
}
