//! Multi-hop funding provenance tracer
//!
//! Walks inbound transfer history backward from a wallet, one hop per
//! round, until it reaches exchanges or bridges, runs out of funders, hits
//! the hop limit, or is cancelled.
//!
//! Round `h` expands the frontier built by round `h - 1`. Funders found in
//! round `h` are marked visited on first sight, classified right away and
//! carry hop `h`. Exchanges and bridges are recorded and never expanded;
//! DeFi protocols are recorded and keep expanding.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::AddressClassifier;
use crate::error::{Error, Result};
use crate::source::{fetch_incoming, BridgeResolver, ChainDataSource};
use crate::types::{
    AddressNode, Chain, Classification, FundingEdge, HopSummary, SourceHit, TraceResult,
    TransferEvent, TransferFilter,
};

/// Hard ceiling on `max_hops`
pub const MAX_HOPS_LIMIT: u32 = 20;

/// Parameters of one trace
#[derive(Debug, Clone)]
pub struct TraceRequest {
    pub start_address: String,
    pub chain: Chain,
    pub max_hops: u32,
    /// Transfers below this amount are ignored entirely
    pub min_amount: f64,
    /// Only follow this asset (symbol, case-insensitive)
    pub asset_filter: Option<String>,
    /// Funders kept per round, largest contributors first
    pub max_branch_per_hop: usize,
    /// Wall-clock budget measured from the start of the trace
    pub deadline: Option<Duration>,
}

impl TraceRequest {
    pub fn new(start_address: impl Into<String>, chain: Chain) -> Self {
        Self {
            start_address: start_address.into(),
            chain,
            max_hops: 5,
            min_amount: 100.0,
            asset_filter: None,
            max_branch_per_hop: 15,
            deadline: None,
        }
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_min_amount(mut self, min_amount: f64) -> Self {
        self.min_amount = min_amount;
        self
    }

    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.asset_filter = Some(asset.into());
        self
    }

    pub fn with_max_branch(mut self, max_branch_per_hop: usize) -> Self {
        self.max_branch_per_hop = max_branch_per_hop;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Reject malformed requests before any traversal
    pub fn validate(&self) -> Result<()> {
        self.chain.validate_address(&self.start_address)?;

        if self.max_hops > MAX_HOPS_LIMIT {
            return Err(Error::InvalidParameters(format!(
                "max_hops {} exceeds limit {}",
                self.max_hops, MAX_HOPS_LIMIT
            )));
        }
        if !self.min_amount.is_finite() || self.min_amount < 0.0 {
            return Err(Error::InvalidParameters(format!(
                "min_amount must be a non-negative number, got {}",
                self.min_amount
            )));
        }
        if self.max_branch_per_hop == 0 {
            return Err(Error::InvalidParameters(
                "max_branch_per_hop must be at least 1".to_string(),
            ));
        }
        if let Some(asset) = &self.asset_filter {
            if asset.trim().is_empty() {
                return Err(Error::InvalidParameters(
                    "asset_filter must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn filter(&self) -> TransferFilter {
        TransferFilter::new(
            self.min_amount,
            self.asset_filter.as_ref().map(|a| a.trim().to_string()),
        )
    }
}

/// Tracer settings shared by every trace
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Parallel source calls within a round
    pub concurrency: usize,
    /// Transfer pages fetched per address
    pub max_pages_per_address: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_pages_per_address: 5,
        }
    }
}

/// Backward funding tracer over one chain data source
pub struct ProvenanceTracer {
    source: Arc<dyn ChainDataSource>,
    classifier: Arc<AddressClassifier>,
    config: TracerConfig,
    bridge_resolver: Option<Arc<dyn BridgeResolver>>,
}

impl ProvenanceTracer {
    pub fn new(
        source: Arc<dyn ChainDataSource>,
        classifier: Arc<AddressClassifier>,
        config: TracerConfig,
    ) -> Self {
        Self {
            source,
            classifier,
            config,
            bridge_resolver: None,
        }
    }

    /// Look up where funds entered each bridge found by a trace
    pub fn with_bridge_resolver(mut self, resolver: Arc<dyn BridgeResolver>) -> Self {
        self.bridge_resolver = Some(resolver);
        self
    }

    /// Trace without external cancellation
    pub async fn trace(&self, request: &TraceRequest) -> Result<TraceResult> {
        self.trace_with_cancel(request, CancellationToken::new()).await
    }

    /// Trace until done, cancelled, or past the request deadline.
    ///
    /// Only request validation fails the call. Source errors mark the
    /// affected address unresolved, and cancellation returns what was
    /// gathered with `complete == false`.
    pub async fn trace_with_cancel(
        &self,
        request: &TraceRequest,
        cancel: CancellationToken,
    ) -> Result<TraceResult> {
        request.validate()?;
        if request.chain != self.source.chain() {
            return Err(Error::InvalidParameters(format!(
                "trace requested on {} but the source serves {}",
                request.chain,
                self.source.chain()
            )));
        }

        let mut session = TraceSession::new(request, cancel);
        info!(
            trace_id = %session.trace_id,
            start = %session.start,
            chain = %request.chain,
            max_hops = request.max_hops,
            min_amount = request.min_amount,
            "Starting provenance trace"
        );

        if session.should_stop() {
            session.complete = false;
            return Ok(session.finish());
        }

        let start_node = self.classifier.classify(&session.start, request.chain).await;
        session.start_resolved = start_node.resolved;
        if !start_node.resolved {
            // Expanded anyway as Unknown
            warn!(trace_id = %session.trace_id, "Start address could not be classified");
        }

        match start_node.classification {
            Classification::Cex | Classification::Bridge => {
                session.record_source(&start_node, 0, None);
                return Ok(session.finish());
            }
            Classification::DefiProtocol => session.record_source(&start_node, 0, None),
            _ => {}
        }

        let mut frontier = vec![start_node];
        let concurrency = self.config.concurrency.max(1);

        for hop in 1..=request.max_hops {
            if frontier.is_empty() {
                break;
            }
            session.begin_round(hop);
            let mut summary = HopSummary {
                hop,
                ..Default::default()
            };

            // Fetch inbound history for the whole frontier
            let mut candidates: HashMap<String, Candidate> = HashMap::new();
            let mut fetched = 0;
            for chunk in frontier.chunks(concurrency) {
                if session.should_stop() {
                    break;
                }
                let results: Vec<Result<Vec<TransferEvent>>> = stream::iter(chunk)
                    .map(|node| {
                        fetch_incoming(
                            self.source.as_ref(),
                            &node.address,
                            request.asset_filter.as_deref(),
                            self.config.max_pages_per_address,
                        )
                    })
                    .buffered(concurrency)
                    .collect()
                    .await;

                for (node, result) in chunk.iter().zip(results) {
                    session.absorb(node, result, hop, &mut candidates, &mut summary);
                }
                fetched += chunk.len();
            }
            summary.addresses_expanded = fetched;

            if fetched < frontier.len() {
                // Interrupted mid-round
                session.complete = false;
                session.leave_unexpanded(&frontier[fetched..]);
                session.abandon_candidates(candidates);
                session.hop_summaries.push(summary);
                break;
            }
            session.hops_completed = hop;

            // Classify newly discovered funders, largest contributors first
            let mut ranked: Vec<(String, Candidate)> = candidates.into_iter().collect();
            ranked.sort_by(|(a_addr, a), (b_addr, b)| {
                b.amount.total_cmp(&a.amount).then_with(|| a_addr.cmp(b_addr))
            });
            summary.new_addresses = ranked.len();
            for (address, _) in &ranked {
                session.visited.insert(address.clone());
            }

            let mut queue = Vec::new();
            let mut classified = 0;
            for chunk in ranked.chunks(concurrency) {
                if session.should_stop() {
                    break;
                }
                let nodes: Vec<AddressNode> = stream::iter(chunk)
                    .map(|(address, _)| self.classifier.classify(address, request.chain))
                    .buffered(concurrency)
                    .collect()
                    .await;

                for (node, (_, candidate)) in nodes.into_iter().zip(chunk) {
                    if !node.resolved {
                        session.unresolved.push(node.address.clone());
                        continue;
                    }
                    if node.classification.is_terminal()
                        || node.classification == Classification::DefiProtocol
                    {
                        session.record_source(&node, hop, Some(candidate.first_tx.clone()));
                        summary.sources_found += 1;
                    }
                    if !node.classification.is_terminal() {
                        queue.push(node);
                    }
                }
                classified += chunk.len();
            }

            if classified < ranked.len() {
                session.complete = false;
                for (address, _) in &ranked[classified..] {
                    session.unexpanded.push(address.clone());
                }
            }

            // Branch selection: queue is already ranked
            if queue.len() > request.max_branch_per_hop {
                let pruned = queue.split_off(request.max_branch_per_hop);
                debug!(
                    trace_id = %session.trace_id,
                    hop,
                    pruned = pruned.len(),
                    "Branch cap reached"
                );
                session.leave_unexpanded(&pruned);
            }

            debug!(
                trace_id = %session.trace_id,
                hop,
                expanded = summary.addresses_expanded,
                edges = summary.edges_admitted,
                new = summary.new_addresses,
                sources = summary.sources_found,
                "Round complete"
            );
            session.hop_summaries.push(summary);
            frontier = queue;

            if !session.complete {
                // Interrupted while classifying; queued funders are never fetched
                session.leave_unexpanded(&frontier);
                break;
            }
        }

        // Hop limit reached with funders still queued
        if session.complete && session.hops_completed == request.max_hops {
            session.leave_unexpanded(&frontier);
        }

        if let Some(resolver) = &self.bridge_resolver {
            resolve_bridge_origins(resolver.as_ref(), &mut session).await;
        }

        let result = session.finish();
        info!(
            trace_id = %result.trace_id,
            hops = result.hops_completed,
            visited = result.visited.len(),
            edges = result.edge_count(),
            cex = result.cex_sources.len(),
            bridges = result.bridge_sources.len(),
            complete = result.complete,
            "Trace finished"
        );
        Ok(result)
    }
}

/// Attach the bridge's source chain and sender to each bridge hit.
/// Bridges stay terminal; this only annotates them.
async fn resolve_bridge_origins(resolver: &dyn BridgeResolver, session: &mut TraceSession) {
    let pending: Vec<(usize, String)> = session
        .bridge_sources
        .iter()
        .enumerate()
        .filter_map(|(i, hit)| hit.via_tx.clone().map(|tx| (i, tx)))
        .collect();

    for (index, tx_hash) in pending {
        if session.should_stop() {
            break;
        }
        match resolver.resolve(&tx_hash).await {
            Ok(Some(origin)) => {
                debug!(
                    trace_id = %session.trace_id,
                    tx_hash = %tx_hash,
                    source_chain = %origin.source_chain,
                    "Bridge origin resolved"
                );
                session.bridge_sources[index].origin = Some(origin);
            }
            Ok(None) => {
                debug!(trace_id = %session.trace_id, tx_hash = %tx_hash, "No bridge message for transaction");
            }
            Err(e) => {
                warn!(
                    trace_id = %session.trace_id,
                    protocol = resolver.protocol(),
                    tx_hash = %tx_hash,
                    error = %e,
                    "Bridge origin lookup failed"
                );
            }
        }
    }
}

/// Aggregate contribution of one newly seen funder within a round
struct Candidate {
    amount: f64,
    first_tx: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Running { hop: u32 },
    Done,
}

/// Mutable state of one trace invocation. Consumed by `finish`.
struct TraceSession {
    trace_id: String,
    start: String,
    chain: Chain,
    phase: Phase,
    filter: TransferFilter,
    cancel: CancellationToken,
    deadline: Option<Instant>,

    visited: BTreeSet<String>,
    funding_graph: BTreeMap<String, Vec<FundingEdge>>,
    cex_sources: Vec<SourceHit>,
    bridge_sources: Vec<SourceHit>,
    defi_interactions: Vec<SourceHit>,
    unresolved: Vec<String>,
    unexpanded: Vec<String>,
    unknown_origins: Vec<String>,
    totals_by_asset: BTreeMap<String, f64>,
    hop_summaries: Vec<HopSummary>,
    start_resolved: bool,
    hops_completed: u32,
    complete: bool,
}

impl TraceSession {
    fn new(request: &TraceRequest, cancel: CancellationToken) -> Self {
        let start = request.chain.normalize_address(&request.start_address);
        let mut visited = BTreeSet::new();
        visited.insert(start.clone());

        Self {
            trace_id: Uuid::new_v4().to_string(),
            start,
            chain: request.chain,
            phase: Phase::Ready,
            filter: request.filter(),
            cancel,
            deadline: request.deadline.map(|d| Instant::now() + d),
            visited,
            funding_graph: BTreeMap::new(),
            cex_sources: Vec::new(),
            bridge_sources: Vec::new(),
            defi_interactions: Vec::new(),
            unresolved: Vec::new(),
            unexpanded: Vec::new(),
            unknown_origins: Vec::new(),
            totals_by_asset: BTreeMap::new(),
            hop_summaries: Vec::new(),
            start_resolved: false,
            hops_completed: 0,
            complete: true,
        }
    }

    fn current_hop(&self) -> u32 {
        match self.phase {
            Phase::Running { hop } => hop,
            Phase::Ready | Phase::Done => 0,
        }
    }

    fn should_stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            debug!(trace_id = %self.trace_id, hop = self.current_hop(), "Trace cancelled");
            return true;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                debug!(trace_id = %self.trace_id, hop = self.current_hop(), "Trace deadline passed");
                return true;
            }
        }
        false
    }

    fn begin_round(&mut self, hop: u32) {
        self.phase = Phase::Running { hop };
    }

    /// Fold one frontier address's history into the graph
    fn absorb(
        &mut self,
        node: &AddressNode,
        result: Result<Vec<TransferEvent>>,
        hop: u32,
        candidates: &mut HashMap<String, Candidate>,
        summary: &mut HopSummary,
    ) {
        let transfers = match result {
            Ok(transfers) => transfers,
            Err(e) => {
                if e.is_data_source() {
                    warn!(
                        trace_id = %self.trace_id,
                        hop,
                        address = %node.address,
                        error = %e,
                        "Inbound history unavailable"
                    );
                } else {
                    error!(
                        trace_id = %self.trace_id,
                        hop,
                        address = %node.address,
                        error = %e,
                        "Unexpected error reading inbound history"
                    );
                }
                // Protocols stay in defi_interactions only
                if node.classification != Classification::DefiProtocol {
                    self.unresolved.push(node.address.clone());
                }
                return;
            }
        };

        let mut admitted = 0;
        for transfer in transfers {
            if !self.filter.admits(self.chain, &transfer, &node.address) {
                continue;
            }
            let from = self.chain.normalize_address(&transfer.from);

            *self
                .totals_by_asset
                .entry(transfer.asset.clone())
                .or_insert(0.0) += transfer.amount;

            if !self.visited.contains(&from) {
                let candidate = candidates.entry(from.clone()).or_insert_with(|| Candidate {
                    amount: 0.0,
                    first_tx: transfer.tx_hash.clone(),
                });
                candidate.amount += transfer.amount;
            }

            self.funding_graph
                .entry(node.address.clone())
                .or_default()
                .push(FundingEdge {
                    to: node.address.clone(),
                    from,
                    asset: transfer.asset,
                    amount: transfer.amount,
                    tx_hash: transfer.tx_hash,
                    hop,
                });
            admitted += 1;
        }

        summary.edges_admitted += admitted;
        if admitted == 0
            && node.address != self.start
            && node.classification != Classification::DefiProtocol
        {
            self.unknown_origins.push(node.address.clone());
        }
    }

    fn record_source(&mut self, node: &AddressNode, hop: u32, via_tx: Option<String>) {
        let hit = SourceHit {
            address: node.address.clone(),
            label: node.display_label(),
            hop,
            via_tx,
            origin: None,
        };
        match node.classification {
            Classification::Cex => self.cex_sources.push(hit),
            Classification::Bridge => self.bridge_sources.push(hit),
            Classification::DefiProtocol => self.defi_interactions.push(hit),
            Classification::Eoa | Classification::Unknown => {}
        }
    }

    /// Queued wallets that will not be expanded. Protocols are already listed.
    fn leave_unexpanded(&mut self, nodes: &[AddressNode]) {
        self.unexpanded.extend(
            nodes
                .iter()
                .filter(|n| n.classification != Classification::DefiProtocol)
                .map(|n| n.address.clone()),
        );
    }

    /// Funders discovered in an interrupted round: seen but never classified
    fn abandon_candidates(&mut self, candidates: HashMap<String, Candidate>) {
        let mut addresses: Vec<String> = candidates.into_keys().collect();
        addresses.sort();
        for address in addresses {
            self.visited.insert(address.clone());
            self.unexpanded.push(address);
        }
    }

    fn finish(mut self) -> TraceResult {
        self.phase = Phase::Done;
        debug!(trace_id = %self.trace_id, phase = ?self.phase, "Session closed");

        TraceResult {
            trace_id: self.trace_id,
            start_address: self.start,
            chain: self.chain,
            start_resolved: self.start_resolved,
            hops_completed: self.hops_completed,
            visited: self.visited,
            funding_graph: self.funding_graph,
            cex_sources: self.cex_sources,
            bridge_sources: self.bridge_sources,
            defi_interactions: self.defi_interactions,
            unresolved: self.unresolved,
            unexpanded: self.unexpanded,
            unknown_origins: self.unknown_origins,
            totals_by_asset: self.totals_by_asset,
            hop_summaries: self.hop_summaries,
            complete: self.complete,
        }
    }
}
