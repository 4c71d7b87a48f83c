//! Report assembly
//!
//! Converts trace and cluster results into the external JSON schema and
//! renders the funding tree as indented text.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::{Cluster, HopSummary, SourceHit, TraceResult};

/// Trace result as emitted to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReport {
    pub trace_id: String,
    pub start_address: String,
    pub chain: String,
    pub start_resolved: bool,
    pub hops_analyzed: u32,
    pub cex_sources: Vec<SourceHit>,
    pub bridge_sources: Vec<SourceHit>,
    pub defi_sources: Vec<SourceHit>,
    pub unresolved: Vec<String>,
    pub unexpanded: Vec<String>,
    pub unknown_sources: Vec<String>,
    pub total_inflow: BTreeMap<String, f64>,
    pub hops: Vec<HopSummary>,
    pub funding_tree: String,
    pub complete: bool,
}

/// One cluster as emitted to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReport {
    pub source: String,
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_label: Option<String>,
    pub wallets: Vec<String>,
    pub count: usize,
    pub total_amount: f64,
    pub asset: String,
}

/// Funder of one node in the tree, aggregated per (funder, asset)
struct Branch {
    from: String,
    asset: String,
    amount: f64,
    hop: u32,
}

struct Frame {
    address: String,
    detail: Option<String>,
    depth: usize,
    prefix: String,
    is_last: bool,
}

/// Builds reports with bounded tree rendering
#[derive(Debug, Clone)]
pub struct ReportAssembler {
    pub max_tree_depth: usize,
    pub max_tree_lines: usize,
}

impl Default for ReportAssembler {
    fn default() -> Self {
        Self {
            max_tree_depth: 6,
            max_tree_lines: 400,
        }
    }
}

impl ReportAssembler {
    pub fn new(max_tree_depth: usize, max_tree_lines: usize) -> Self {
        Self {
            max_tree_depth,
            max_tree_lines: max_tree_lines.max(1),
        }
    }

    pub fn assemble_trace(&self, result: &TraceResult) -> TraceReport {
        TraceReport {
            trace_id: result.trace_id.clone(),
            start_address: result.start_address.clone(),
            chain: result.chain.to_string(),
            start_resolved: result.start_resolved,
            hops_analyzed: result.hops_completed,
            cex_sources: result.cex_sources.clone(),
            bridge_sources: result.bridge_sources.clone(),
            defi_sources: result.defi_interactions.clone(),
            unresolved: result.unresolved.clone(),
            unexpanded: result.unexpanded.clone(),
            unknown_sources: result.unknown_origins.clone(),
            total_inflow: result.totals_by_asset.clone(),
            hops: result.hop_summaries.clone(),
            funding_tree: self.render_funding_tree(result),
            complete: result.complete,
        }
    }

    pub fn assemble_clusters(&self, clusters: &[Cluster]) -> Vec<ClusterReport> {
        clusters
            .iter()
            .map(|cluster| ClusterReport {
                source: cluster.source.clone(),
                source_type: cluster.source_classification.to_string(),
                source_label: cluster.source_label.clone(),
                wallets: cluster.members.iter().cloned().collect(),
                count: cluster.size(),
                total_amount: cluster.total_amount,
                asset: cluster.asset.clone(),
            })
            .collect()
    }

    /// Render the funding graph as a tree rooted at the start address.
    ///
    /// Each address is descended at most once; later occurrences are marked
    /// "(seen)". Output stops at `max_tree_depth` levels and
    /// `max_tree_lines` lines.
    pub fn render_funding_tree(&self, result: &TraceResult) -> String {
        let tags = source_tags(result);
        let mut lines = vec![format!(
            "{}{}",
            result.start_address,
            tag_suffix(&tags, &result.start_address)
        )];
        let mut seen = HashSet::new();
        seen.insert(result.start_address.clone());

        let mut stack = Vec::new();
        push_children(&mut stack, result, &result.start_address, 1, String::new());

        while let Some(frame) = stack.pop() {
            if lines.len() >= self.max_tree_lines {
                lines.push(format!("... truncated at {} lines", self.max_tree_lines));
                break;
            }

            let connector = if frame.is_last { "└── " } else { "├── " };
            let mut line = format!("{}{}{}", frame.prefix, connector, frame.address);
            if let Some(detail) = &frame.detail {
                line.push_str(&format!(" ({})", detail));
            }
            line.push_str(&tag_suffix(&tags, &frame.address));

            if !seen.insert(frame.address.clone()) {
                line.push_str(" (seen)");
                lines.push(line);
                continue;
            }
            lines.push(line);

            if frame.depth >= self.max_tree_depth {
                continue;
            }
            let child_prefix = format!(
                "{}{}",
                frame.prefix,
                if frame.is_last { "    " } else { "│   " }
            );
            push_children(&mut stack, result, &frame.address, frame.depth + 1, child_prefix);
        }

        lines.join("\n")
    }
}

/// Push funders of `address` so the largest is popped first
fn push_children(
    stack: &mut Vec<Frame>,
    result: &TraceResult,
    address: &str,
    depth: usize,
    prefix: String,
) {
    let Some(edges) = result.funding_graph.get(address) else {
        return;
    };

    let mut branches: Vec<Branch> = Vec::new();
    for edge in edges {
        match branches
            .iter_mut()
            .find(|b| b.from == edge.from && b.asset == edge.asset)
        {
            Some(branch) => branch.amount += edge.amount,
            None => branches.push(Branch {
                from: edge.from.clone(),
                asset: edge.asset.clone(),
                amount: edge.amount,
                hop: edge.hop,
            }),
        }
    }
    branches.sort_by(|a, b| {
        b.amount
            .total_cmp(&a.amount)
            .then_with(|| a.from.cmp(&b.from))
    });

    let count = branches.len();
    for (i, branch) in branches.into_iter().enumerate().rev() {
        stack.push(Frame {
            address: branch.from,
            detail: Some(format!(
                "{:.2} {}, hop {}",
                branch.amount, branch.asset, branch.hop
            )),
            depth,
            prefix: prefix.clone(),
            is_last: i + 1 == count,
        });
    }
}

fn source_tags(result: &TraceResult) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    let groups = [
        ("CEX", &result.cex_sources),
        ("Bridge", &result.bridge_sources),
        ("DeFi", &result.defi_interactions),
    ];
    for (kind, hits) in groups {
        for hit in hits {
            let tag = match &hit.origin {
                Some(origin) => format!("[{}: {} from {}]", kind, hit.label, origin.source_chain),
                None => format!("[{}: {}]", kind, hit.label),
            };
            tags.insert(hit.address.clone(), tag);
        }
    }
    for address in &result.unresolved {
        tags.insert(address.clone(), "[unresolved]".to_string());
    }
    for address in &result.unknown_origins {
        tags.insert(address.clone(), "[unknown origin]".to_string());
    }
    tags
}

fn tag_suffix(tags: &HashMap<String, String>, address: &str) -> String {
    tags.get(address)
        .map(|tag| format!(" {}", tag))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BridgeOrigin, Chain, Classification, FundingEdge};
    use std::collections::BTreeSet;

    fn edge(to: &str, from: &str, amount: f64, hop: u32) -> FundingEdge {
        FundingEdge {
            to: to.to_string(),
            from: from.to_string(),
            asset: "USDC".to_string(),
            amount,
            tx_hash: format!("{}-{}", from, to),
            hop,
        }
    }

    fn result(edges: Vec<FundingEdge>) -> TraceResult {
        let mut funding_graph: BTreeMap<String, Vec<FundingEdge>> = BTreeMap::new();
        let mut visited = BTreeSet::new();
        visited.insert("A".to_string());
        for e in edges {
            visited.insert(e.from.clone());
            funding_graph.entry(e.to.clone()).or_default().push(e);
        }
        TraceResult {
            trace_id: "t-1".to_string(),
            start_address: "A".to_string(),
            chain: Chain::Polygon,
            start_resolved: true,
            hops_completed: 2,
            visited,
            funding_graph,
            cex_sources: vec![SourceHit {
                address: "D".to_string(),
                label: "Exchange1".to_string(),
                hop: 2,
                via_tx: Some("D-B".to_string()),
                origin: None,
            }],
            bridge_sources: Vec::new(),
            defi_interactions: Vec::new(),
            unresolved: Vec::new(),
            unexpanded: Vec::new(),
            unknown_origins: Vec::new(),
            totals_by_asset: BTreeMap::from([("USDC".to_string(), 700.0)]),
            hop_summaries: Vec::new(),
            complete: true,
        }
    }

    #[test]
    fn test_tree_shape() {
        let result = result(vec![
            edge("A", "B", 500.0, 1),
            edge("A", "C", 150.0, 1),
            edge("B", "D", 200.0, 2),
        ]);
        let tree = ReportAssembler::default().render_funding_tree(&result);
        let lines: Vec<&str> = tree.lines().collect();

        assert_eq!(lines[0], "A");
        assert_eq!(lines[1], "├── B (500.00 USDC, hop 1)");
        assert_eq!(lines[2], "│   └── D (200.00 USDC, hop 2) [CEX: Exchange1]");
        assert_eq!(lines[3], "└── C (150.00 USDC, hop 1)");
    }

    #[test]
    fn test_cycles_terminate() {
        let result = result(vec![
            edge("A", "B", 500.0, 1),
            edge("B", "C", 300.0, 2),
            edge("C", "A", 200.0, 3),
            edge("C", "B", 100.0, 3),
        ]);
        let tree = ReportAssembler::default().render_funding_tree(&result);
        assert_eq!(tree.lines().count(), 5);
        assert_eq!(tree.matches("(seen)").count(), 2);
    }

    #[test]
    fn test_depth_and_line_caps() {
        let chain: Vec<FundingEdge> = (0..20)
            .map(|i| {
                let to = if i == 0 { "A".to_string() } else { format!("N{}", i) };
                edge(&to, &format!("N{}", i + 1), 100.0, i + 1)
            })
            .collect();
        let result = result(chain);

        let shallow = ReportAssembler::new(3, 400).render_funding_tree(&result);
        assert_eq!(shallow.lines().count(), 4);

        let short = ReportAssembler::new(50, 5).render_funding_tree(&result);
        assert_eq!(short.lines().count(), 6);
        assert!(short.ends_with("... truncated at 5 lines"));
    }

    #[test]
    fn test_trace_report_schema() {
        let result = result(vec![edge("A", "B", 500.0, 1), edge("B", "D", 200.0, 2)]);
        let report = ReportAssembler::default().assemble_trace(&result);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["hops_analyzed"], 2);
        assert_eq!(json["chain"], "polygon");
        assert_eq!(json["total_inflow"]["USDC"], 700.0);
        assert_eq!(json["cex_sources"][0]["parent_tx"], "D-B");
        assert_eq!(json["cex_sources"][0]["label"], "Exchange1");
        assert!(json["defi_sources"].as_array().unwrap().is_empty());
        assert!(json["unknown_sources"].is_array());
        assert_eq!(json["complete"], true);
        assert_eq!(json["start_resolved"], true);
        assert!(json["cex_sources"][0].get("origin").is_none());
        assert!(json["funding_tree"].as_str().unwrap().starts_with('A'));
    }

    #[test]
    fn test_bridge_origin_in_report() {
        let mut result = result(vec![edge("A", "B", 500.0, 1), edge("B", "W", 300.0, 2)]);
        result.bridge_sources.push(SourceHit {
            address: "W".to_string(),
            label: "Wormhole Portal".to_string(),
            hop: 2,
            via_tx: Some("W-B".to_string()),
            origin: Some(BridgeOrigin {
                protocol: "wormhole".to_string(),
                source_chain_id: 1,
                source_chain: "solana".to_string(),
                emitter_address: "GhBd6sozvfR9F2YwHVj2tAKgKEcGhHpPHoLWiHM4pZKD".to_string(),
                sender: None,
                sequence: Some("42".to_string()),
                timestamp: None,
            }),
        });

        let assembler = ReportAssembler::default();
        let tree = assembler.render_funding_tree(&result);
        assert!(tree.contains("W (300.00 USDC, hop 2) [Bridge: Wormhole Portal from solana]"));

        let json = serde_json::to_value(assembler.assemble_trace(&result)).unwrap();
        let origin = &json["bridge_sources"][0]["origin"];
        assert_eq!(origin["source_chain"], "solana");
        assert_eq!(origin["source_chain_id"], 1);
        assert_eq!(origin["sequence"], "42");
        assert!(origin.get("sender").is_none());
    }

    #[test]
    fn test_cluster_report_schema() {
        let cluster = Cluster {
            source: "S".to_string(),
            source_classification: Classification::Cex,
            source_label: Some("Exchange1".to_string()),
            members: BTreeSet::from(["W2".to_string(), "W1".to_string()]),
            total_amount: 800.0,
            asset: "USDC".to_string(),
        };
        let reports = ReportAssembler::default().assemble_clusters(&[cluster]);
        let json = serde_json::to_value(&reports).unwrap();

        assert_eq!(json[0]["source_type"], "CEX");
        assert_eq!(json[0]["count"], 2);
        assert_eq!(json[0]["wallets"][0], "W1");
        assert_eq!(json[0]["source_label"], "Exchange1");
    }
}
