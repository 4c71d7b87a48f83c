//! Wallet clustering by common funding source
//!
//! Groups tracked wallets that received funds from the same sender. A
//! source that funded two or more of the input wallets above the threshold
//! forms a cluster; the set is treated as one coordinated actor.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::AddressClassifier;
use crate::error::{Error, Result};
use crate::source::{fetch_incoming, ChainDataSource};
use crate::types::{Cluster, TransferFilter};

/// Configuration for cluster detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Parallel wallet fetches
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Transfer pages fetched per wallet
    #[serde(default = "default_max_pages_per_wallet")]
    pub max_pages_per_wallet: usize,
}

fn default_concurrency() -> usize {
    5
}
fn default_max_pages_per_wallet() -> usize {
    2
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_pages_per_wallet: default_max_pages_per_wallet(),
        }
    }
}

/// Parameters of one cluster scan
#[derive(Debug, Clone)]
pub struct ClusterRequest {
    pub min_amount: f64,
    pub asset_filter: Option<String>,
    /// Ignore funding older than this
    pub since: Option<DateTime<Utc>>,
}

impl ClusterRequest {
    pub fn new(min_amount: f64) -> Self {
        Self {
            min_amount,
            asset_filter: None,
            since: None,
        }
    }

    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.asset_filter = Some(asset.into());
        self
    }

    /// Only consider funding received in the last `hours`
    pub fn with_lookback_hours(mut self, hours: u64) -> Self {
        self.since = Some(Utc::now() - Duration::hours(hours as i64));
        self
    }

    fn filter(&self) -> TransferFilter {
        TransferFilter {
            since: self.since,
            ..TransferFilter::new(self.min_amount, self.asset_filter.clone())
        }
    }
}

impl Default for ClusterRequest {
    fn default() -> Self {
        Self::new(100.0)
    }
}

/// Funding aggregated per (source, asset)
#[derive(Default)]
struct FundingGroup {
    members: BTreeSet<String>,
    total: f64,
}

/// Common-funding-source cluster detector
pub struct ClusterDetector {
    config: ClusterConfig,
    source: Arc<dyn ChainDataSource>,
    classifier: Arc<AddressClassifier>,
}

impl ClusterDetector {
    pub fn new(
        config: ClusterConfig,
        source: Arc<dyn ChainDataSource>,
        classifier: Arc<AddressClassifier>,
    ) -> Self {
        Self {
            config,
            source,
            classifier,
        }
    }

    /// Find funding sources shared by at least two of `wallets`.
    ///
    /// Wallets whose history cannot be fetched are skipped. Clusters are
    /// ordered by member count, then total amount (both descending), then
    /// source address.
    pub async fn detect_clusters(
        &self,
        wallets: &[String],
        request: &ClusterRequest,
    ) -> Result<Vec<Cluster>> {
        if !request.min_amount.is_finite() || request.min_amount < 0.0 {
            return Err(Error::InvalidParameters(format!(
                "min_amount must be a non-negative number, got {}",
                request.min_amount
            )));
        }

        let chain = self.source.chain();
        let mut tracked = BTreeSet::new();
        for wallet in wallets {
            chain.validate_address(wallet)?;
            tracked.insert(chain.normalize_address(wallet));
        }

        info!(
            wallets = tracked.len(),
            chain = %chain,
            min_amount = request.min_amount,
            "Scanning for common funding sources"
        );

        let filter = request.filter();
        let concurrency = self.config.concurrency.max(1);
        let histories: Vec<_> = stream::iter(tracked.iter())
            .map(|wallet| async move {
                let history = fetch_incoming(
                    self.source.as_ref(),
                    wallet,
                    request.asset_filter.as_deref(),
                    self.config.max_pages_per_wallet,
                )
                .await;
                (wallet, history)
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut groups: BTreeMap<(String, String), FundingGroup> = BTreeMap::new();
        for (wallet, history) in histories {
            let transfers = match history {
                Ok(transfers) => transfers,
                Err(e) => {
                    warn!(wallet = %wallet, error = %e, "Skipping wallet, history unavailable");
                    continue;
                }
            };

            for transfer in transfers {
                if !filter.admits(chain, &transfer, wallet) {
                    continue;
                }
                let source = chain.normalize_address(&transfer.from);
                let group = groups.entry((source, transfer.asset)).or_default();
                group.members.insert(wallet.clone());
                group.total += transfer.amount;
            }
        }

        let shared: Vec<((String, String), FundingGroup)> = groups
            .into_iter()
            .filter(|(_, group)| group.members.len() >= 2)
            .collect();

        let nodes: Vec<_> = stream::iter(shared.iter())
            .map(|((source, _), _)| self.classifier.classify(source, chain))
            .buffered(concurrency)
            .collect()
            .await;

        let mut clusters: Vec<Cluster> = shared
            .into_iter()
            .zip(nodes)
            .map(|(((source, asset), group), node)| Cluster {
                source,
                source_classification: node.classification,
                source_label: node.label,
                members: group.members,
                total_amount: group.total,
                asset,
            })
            .collect();

        clusters.sort_by(|a, b| {
            b.size()
                .cmp(&a.size())
                .then_with(|| b.total_amount.total_cmp(&a.total_amount))
                .then_with(|| a.source.cmp(&b.source))
        });

        for cluster in &clusters {
            debug!(
                source = %cluster.source,
                classification = %cluster.source_classification,
                members = cluster.size(),
                total = cluster.total_amount,
                asset = %cluster.asset,
                "Cluster found"
            );
        }
        info!(clusters = clusters.len(), "Cluster scan finished");

        Ok(clusters)
    }
}

/// Wallets sharing any cluster with `wallet` (excluding itself)
pub fn related_wallets(clusters: &[Cluster], wallet: &str) -> BTreeSet<String> {
    clusters
        .iter()
        .filter(|c| c.contains(wallet))
        .flat_map(|c| c.members.iter())
        .filter(|w| w.as_str() != wallet)
        .cloned()
        .collect()
}
