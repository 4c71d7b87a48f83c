//! CLI command implementations

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{ProvenanceCache, RateLimiters};
use crate::classifier::AddressClassifier;
use crate::cluster::ClusterDetector;
use crate::config::{Config, SourceKind};
use crate::report::TraceReport;
use crate::source::{
    BridgeResolver, ChainDataSource, EtherscanSource, HeliusSource, MemorySource,
    ThrottledSource, WormholeClient,
};
use crate::tracer::{ProvenanceTracer, TraceRequest};
use crate::types::AddressNode;

const HELIUS_REST_URL: &str = "https://api.helius.xyz";

/// Per-invocation overrides for the configured trace defaults
#[derive(Debug, Clone, Default)]
pub struct TraceOverrides {
    pub max_hops: Option<u32>,
    pub min_amount: Option<f64>,
    pub asset: Option<String>,
    pub max_branch: Option<usize>,
    pub deadline_secs: Option<u64>,
}

impl TraceOverrides {
    fn apply(&self, mut request: TraceRequest) -> TraceRequest {
        if let Some(max_hops) = self.max_hops {
            request = request.with_max_hops(max_hops);
        }
        if let Some(min_amount) = self.min_amount {
            request = request.with_min_amount(min_amount);
        }
        if let Some(asset) = &self.asset {
            request = request.with_asset(asset.clone());
        }
        if let Some(max_branch) = self.max_branch {
            request = request.with_max_branch(max_branch);
        }
        if let Some(secs) = self.deadline_secs {
            request = request.with_deadline(Duration::from_secs(secs));
        }
        request
    }
}

/// Shared components wired from configuration
pub struct Engine {
    pub source: Arc<dyn ChainDataSource>,
    pub classifier: Arc<AddressClassifier>,
    pub cache: Arc<ProvenanceCache>,
    pub bridge: Option<Arc<dyn BridgeResolver>>,
}

impl Engine {
    pub fn from_config(config: &Config) -> Result<Self> {
        let cache = Arc::new(ProvenanceCache::with_config(config.cache.cache_config()));
        let limiters = RateLimiters::new();
        let source = build_source(config, cache.clone(), &limiters)?;

        let registry = Arc::new(config.registry.build()?);
        info!(
            chain = %config.source.chain,
            known_addresses = registry.len(config.source.chain),
            "Address registry loaded"
        );

        let classifier = Arc::new(AddressClassifier::new(
            registry,
            source.clone(),
            cache.clone(),
        ));

        let bridge = build_bridge_resolver(config, &limiters)?;

        Ok(Self {
            source,
            classifier,
            cache,
            bridge,
        })
    }

    pub fn tracer(&self, config: &Config) -> ProvenanceTracer {
        let tracer = ProvenanceTracer::new(
            self.source.clone(),
            self.classifier.clone(),
            config.trace.tracer_config(),
        );
        match &self.bridge {
            Some(resolver) => tracer.with_bridge_resolver(resolver.clone()),
            None => tracer,
        }
    }

    pub fn detector(&self, config: &Config) -> ClusterDetector {
        ClusterDetector::new(
            config.cluster.detector_config(),
            self.source.clone(),
            self.classifier.clone(),
        )
    }
}

/// Wormhole origin lookup, when enabled
pub fn build_bridge_resolver(
    config: &Config,
    limiters: &RateLimiters,
) -> Result<Option<Arc<dyn BridgeResolver>>> {
    let settings = &config.bridge;
    if !settings.wormhole_enabled {
        return Ok(None);
    }

    let burst = settings.requests_per_sec.ceil().max(1.0) as u32;
    let client = WormholeClient::new()
        .context("Failed to create Wormhole client")?
        .with_base_url(settings.wormhole_base_url.clone())
        .with_timeout(Duration::from_millis(settings.timeout_ms))
        .with_limiter(limiters.for_provider("wormhole", burst, settings.requests_per_sec));
    info!(base_url = %settings.wormhole_base_url, "Wormhole origin lookup enabled");

    Ok(Some(Arc::new(client)))
}

/// Build the configured adapter behind the shared limiter, retry and cache
pub fn build_source(
    config: &Config,
    cache: Arc<ProvenanceCache>,
    limiters: &RateLimiters,
) -> Result<Arc<dyn ChainDataSource>> {
    let settings = &config.source;
    let timeout = Duration::from_millis(settings.timeout_ms);

    let inner: Arc<dyn ChainDataSource> = match settings.kind {
        SourceKind::Etherscan => {
            let mut source = EtherscanSource::new(settings.chain, settings.api_key.clone())
                .context("Failed to create Etherscan source")?
                .with_page_size(settings.page_size)
                .with_timeout(timeout);
            if let Some(url) = &settings.base_url {
                source = source.with_base_url(url.clone());
            }
            if !settings.tracked_tokens.is_empty() {
                source = source.with_tracked_tokens(settings.tracked_tokens.clone());
            }
            Arc::new(source)
        }
        SourceKind::Helius => {
            let source = if settings.api_key.is_empty() {
                let rpc_url = settings
                    .rpc_url
                    .as_deref()
                    .context("Helius source needs api_key or rpc_url")?;
                HeliusSource::from_rpc_url(rpc_url)
                    .context("rpc_url does not carry an api-key")?
            } else if settings.base_url.is_some() || settings.rpc_url.is_some() {
                let rpc_url = settings.rpc_url.clone().unwrap_or_else(|| {
                    format!(
                        "https://mainnet.helius-rpc.com/?api-key={}",
                        settings.api_key
                    )
                });
                HeliusSource::with_urls(
                    settings.api_key.clone(),
                    settings
                        .base_url
                        .clone()
                        .unwrap_or_else(|| HELIUS_REST_URL.to_string()),
                    rpc_url,
                )
            } else {
                HeliusSource::new(settings.api_key.clone())
            };
            Arc::new(
                source
                    .with_page_limit(settings.page_size)
                    .with_timeout(timeout),
            )
        }
        SourceKind::Memory => {
            let path = settings
                .fixture_path
                .as_deref()
                .context("Memory source needs fixture_path")?;
            let source = MemorySource::from_fixture(path)
                .with_context(|| format!("Failed to load fixture {}", path))?;
            if source.chain() != settings.chain {
                anyhow::bail!(
                    "fixture {} is for {}, config says {}",
                    path,
                    source.chain(),
                    settings.chain
                );
            }
            Arc::new(source)
        }
    };

    let limiter = limiters.for_provider(inner.name(), settings.burst, settings.requests_per_sec);
    info!(
        provider = inner.name(),
        chain = %inner.chain(),
        requests_per_sec = settings.requests_per_sec,
        "Chain data source ready"
    );

    Ok(Arc::new(ThrottledSource::new(
        inner,
        limiter,
        cache,
        settings.throttle(),
    )))
}

/// Trace the funding provenance of one address
pub async fn trace(
    config: &Config,
    address: &str,
    overrides: &TraceOverrides,
    output: Option<&Path>,
) -> Result<()> {
    let engine = Engine::from_config(config)?;
    let request = overrides.apply(config.trace.request(address, config.source.chain));

    // Ctrl-C stops the trace; whatever was gathered is still reported
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping trace");
                cancel.cancel();
            }
        })
    };

    let report = run_trace(&engine, config, &request, cancel).await;
    watcher.abort();
    let report = report?;

    info!(
        trace_id = %report.trace_id,
        hops = report.hops_analyzed,
        cex = report.cex_sources.len(),
        bridges = report.bridge_sources.len(),
        unresolved = report.unresolved.len(),
        complete = report.complete,
        "Trace finished"
    );
    let stats = engine.cache.stats();
    info!(
        hit_rate = %format!("{:.1}%", stats.hit_rate() * 100.0),
        "Cache usage"
    );

    write_output(&report, output)
}

/// Run one trace and assemble its report
pub async fn run_trace(
    engine: &Engine,
    config: &Config,
    request: &TraceRequest,
    cancel: CancellationToken,
) -> Result<TraceReport> {
    let result = match engine.tracer(config).trace_with_cancel(request, cancel).await {
        Ok(result) => result,
        Err(e) if e.is_rejection() => return Err(e).context("Trace request rejected"),
        Err(e) => return Err(e).context("Trace failed"),
    };
    Ok(config.report.assembler().assemble_trace(&result))
}

/// Detect wallets that share a funding source
pub async fn clusters(
    config: &Config,
    mut wallets: Vec<String>,
    wallets_file: Option<&Path>,
    min_amount: Option<f64>,
    lookback_hours: Option<u64>,
    output: Option<&Path>,
) -> Result<()> {
    if let Some(path) = wallets_file {
        wallets.extend(read_wallets_file(path)?);
    }
    if wallets.len() < 2 {
        anyhow::bail!("at least two wallets are needed to find clusters");
    }

    let mut request = config.cluster.request();
    if let Some(min_amount) = min_amount {
        request.min_amount = min_amount;
    }
    if let Some(hours) = lookback_hours {
        request = request.with_lookback_hours(hours);
    }

    let engine = Engine::from_config(config)?;
    info!(wallets = wallets.len(), "Scanning for shared funding sources");
    let clusters = engine
        .detector(config)
        .detect_clusters(&wallets, &request)
        .await
        .context("Cluster request rejected")?;

    let reports = config.report.assembler().assemble_clusters(&clusters);
    info!(clusters = reports.len(), "Cluster scan finished");
    write_output(&reports, output)
}

/// Classify one or more addresses
pub async fn classify(config: &Config, addresses: &[String], output: Option<&Path>) -> Result<()> {
    let engine = Engine::from_config(config)?;
    let chain = config.source.chain;

    let mut nodes: Vec<AddressNode> = Vec::with_capacity(addresses.len());
    for address in addresses {
        chain
            .validate_address(address)
            .with_context(|| format!("Cannot classify {}", address))?;
        nodes.push(engine.classifier.classify(address, chain).await);
    }

    write_output(&nodes, output)
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// One address per line; blank lines and `#` comments are skipped
pub fn read_wallets_file(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read wallets file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Pretty JSON to `output`, or stdout when not given
pub fn write_output<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{}", json),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chain;
    use std::io::Write;

    fn addr(c: char) -> String {
        format!("0x{}", c.to_string().repeat(40))
    }

    fn memory_config(fixture: &Path) -> Config {
        let mut config = Config::default();
        config.source.kind = SourceKind::Memory;
        config.source.fixture_path = Some(fixture.display().to_string());
        config.source.requests_per_sec = 1000.0;
        config.source.burst = 100;
        config
    }

    fn fixture_file() -> tempfile::NamedTempFile {
        let (a, b, c, d) = (addr('a'), addr('b'), addr('c'), addr('d'));
        let json = serde_json::json!({
            "chain": "polygon",
            "transfers": [
                {"from": b, "to": a, "amount": 500.0, "tx_hash": "tx1"},
                {"from": c, "to": b, "amount": 50.0, "tx_hash": "tx2"},
                {"from": d, "to": b, "amount": 200.0, "tx_hash": "tx3"}
            ]
        });
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json).unwrap();
        file
    }

    #[tokio::test]
    async fn test_engine_from_memory_config() {
        let fixture = fixture_file();
        let mut config = memory_config(fixture.path());
        config.registry.entries.push(crate::config::RegistryEntryConfig {
            chain: Chain::Polygon,
            address: addr('d'),
            classification: "cex".to_string(),
            label: "Exchange1".to_string(),
        });

        let engine = Engine::from_config(&config).unwrap();
        let request = TraceOverrides {
            max_hops: Some(3),
            ..Default::default()
        }
        .apply(config.trace.request(&addr('a'), Chain::Polygon));

        let report = run_trace(&engine, &config, &request, CancellationToken::new())
            .await
            .unwrap();
        assert!(report.complete);
        assert_eq!(report.hops_analyzed, 2);
        assert_eq!(report.cex_sources.len(), 1);
        assert_eq!(report.cex_sources[0].label, "Exchange1");
        assert_eq!(report.total_inflow.get("USDC"), Some(&700.0));
    }

    #[tokio::test]
    async fn test_example_config_and_demo_fixture() {
        let config = Config::load("config.example.toml").unwrap();
        let engine = Engine::from_config(&config).unwrap();

        let request = config.trace.request(&addr('1'), Chain::Polygon);
        let report = run_trace(&engine, &config, &request, CancellationToken::new())
            .await
            .unwrap();
        assert!(report.complete);
        assert_eq!(report.cex_sources.len(), 1);
        assert_eq!(report.cex_sources[0].label, "Binance 14");
        assert_eq!(report.cex_sources[0].hop, 2);

        let clusters = engine
            .detector(&config)
            .detect_clusters(&[addr('1'), addr('5')], &config.cluster.request())
            .await
            .unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].source, addr('2'));
    }

    #[tokio::test]
    async fn test_invalid_start_is_rejected() {
        let fixture = fixture_file();
        let config = memory_config(fixture.path());
        let engine = Engine::from_config(&config).unwrap();
        let request = config.trace.request("not-an-address", Chain::Polygon);
        let err = run_trace(&engine, &config, &request, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn test_bridge_resolver_wiring() {
        let fixture = fixture_file();
        let mut config = memory_config(fixture.path());
        assert!(Engine::from_config(&config).unwrap().bridge.is_none());

        config.bridge.wormhole_enabled = true;
        let engine = Engine::from_config(&config).unwrap();
        let resolver = engine.bridge.as_ref().unwrap();
        assert_eq!(resolver.protocol(), "wormhole");
    }

    #[test]
    fn test_fixture_chain_must_match() {
        let fixture = fixture_file();
        let mut config = memory_config(fixture.path());
        config.source.chain = Chain::Ethereum;
        assert!(Engine::from_config(&config).is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let base = TraceRequest::new(addr('a'), Chain::Polygon);
        let request = TraceOverrides {
            min_amount: Some(5.0),
            asset: Some("USDT".to_string()),
            deadline_secs: Some(10),
            ..Default::default()
        }
        .apply(base);
        assert_eq!(request.min_amount, 5.0);
        assert_eq!(request.max_hops, 5);
        assert_eq!(request.asset_filter.as_deref(), Some("USDT"));
        assert_eq!(request.deadline, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_read_wallets_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# watched whales").unwrap();
        writeln!(file, "{}", addr('a')).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  {}  ", addr('b')).unwrap();

        let wallets = read_wallets_file(file.path()).unwrap();
        assert_eq!(wallets, vec![addr('a'), addr('b')]);
    }

    #[test]
    fn test_write_output_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_output(&vec!["x", "y"], Some(&path)).unwrap();
        let written: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, vec!["x", "y"]);
    }
}
