//! Wormholescan lookup for bridge hops
//!
//! A trace stops at a bridge, but the bridge's payout transaction can be
//! matched to the cross-chain message that caused it. `/operations?txHash=`
//! accepts either side of a transfer and names the sender; `/vaas?txHash=`
//! only knows the emitting transaction and is used as a fallback.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::TokenBucket;
use crate::error::{Error, Result};
use crate::types::BridgeOrigin;

pub const DEFAULT_BASE_URL: &str = "https://api.wormholescan.io/api/v1";

/// Resolves a bridge payout transaction to where the funds came from
#[async_trait]
pub trait BridgeResolver: Send + Sync {
    fn protocol(&self) -> &'static str;

    /// `Ok(None)` when the transaction is not a known bridge transfer
    async fn resolve(&self, tx_hash: &str) -> Result<Option<BridgeOrigin>>;
}

/// Wormhole chain id to display name
pub fn wormhole_chain_name(chain_id: u16) -> String {
    let name = match chain_id {
        1 => "solana",
        2 => "ethereum",
        4 => "bsc",
        5 => "polygon",
        6 => "avalanche",
        7 => "oasis",
        10 => "fantom",
        13 => "klaytn",
        14 => "celo",
        16 => "moonbeam",
        21 => "sui",
        22 => "aptos",
        23 => "arbitrum",
        24 => "optimism",
        30 => "base",
        other => return format!("unknown ({})", other),
    };
    name.to_string()
}

/// Wormholescan REST client
pub struct WormholeClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    limiter: Option<Arc<TokenBucket>>,
}

impl WormholeClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            limiter: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Draw every request from a shared token bucket
    pub fn with_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn get(&self, path: &str, tx_hash: &str) -> Result<String> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(&[("txHash", tx_hash)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::DataSourceTimeout(self.timeout.as_millis() as u64)
                } else {
                    Error::DataSource(format!("Wormholescan request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimitExceeded(format!("Wormholescan HTTP {}", status)));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(String::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::DataSource(format!(
                "Wormholescan API error {}: {}",
                status, body
            )));
        }

        response
            .text()
            .await
            .map_err(|e| Error::DataSource(format!("Wormholescan body read failed: {}", e)))
    }
}

#[async_trait]
impl BridgeResolver for WormholeClient {
    fn protocol(&self) -> &'static str {
        "wormhole"
    }

    async fn resolve(&self, tx_hash: &str) -> Result<Option<BridgeOrigin>> {
        let body = self.get("operations", tx_hash).await?;
        if let Some(origin) = parse_operations(&body)? {
            return Ok(Some(origin));
        }

        debug!(tx_hash, "No Wormhole operation, trying VAA index");
        let body = self.get("vaas", tx_hash).await?;
        parse_vaas(&body)
    }
}

// ============ Wormholescan API Response Types ============

#[derive(Debug, Deserialize)]
struct OperationsResponse {
    #[serde(default)]
    operations: Vec<Operation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    emitter_chain: u16,
    emitter_address: EmitterAddress,
    #[serde(default)]
    sequence: Option<serde_json::Value>,
    #[serde(default)]
    source_chain: Option<OperationSide>,
    #[serde(default)]
    content: Option<OperationContent>,
}

#[derive(Debug, Deserialize)]
struct EmitterAddress {
    #[serde(default)]
    hex: Option<String>,
    #[serde(default)]
    native: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationSide {
    #[serde(default)]
    chain_id: Option<u16>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    from: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationContent {
    // Wormholescan's spelling
    #[serde(default)]
    standarized_properties: Option<StandardProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StandardProperties {
    #[serde(default)]
    from_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VaasResponse {
    #[serde(default)]
    data: Vec<Vaa>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Vaa {
    emitter_chain: u16,
    emitter_addr: String,
    #[serde(default)]
    emitter_native_addr: Option<String>,
    #[serde(default)]
    sequence: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<String>,
}

fn sequence_string(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// First operation of an `/operations` response
pub fn parse_operations(body: &str) -> Result<Option<BridgeOrigin>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let response: OperationsResponse = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("Wormholescan operations: {}", e)))?;

    let Some(op) = response.operations.into_iter().next() else {
        return Ok(None);
    };

    let (side_chain, timestamp, side_from) = match op.source_chain {
        Some(side) => (side.chain_id, side.timestamp, side.from),
        None => (None, None, None),
    };
    let source_chain_id = side_chain.unwrap_or(op.emitter_chain);
    let sender = non_empty(side_from).or_else(|| {
        non_empty(
            op.content
                .and_then(|c| c.standarized_properties)
                .and_then(|p| p.from_address),
        )
    });
    let emitter_address = non_empty(op.emitter_address.native)
        .or_else(|| non_empty(op.emitter_address.hex))
        .ok_or_else(|| {
            Error::MalformedResponse("Wormholescan operation has no emitter".to_string())
        })?;

    Ok(Some(BridgeOrigin {
        protocol: "wormhole".to_string(),
        source_chain_id,
        source_chain: wormhole_chain_name(source_chain_id),
        emitter_address,
        sender,
        sequence: sequence_string(op.sequence),
        timestamp,
    }))
}

/// First VAA of a `/vaas` response. VAAs do not name the sender.
pub fn parse_vaas(body: &str) -> Result<Option<BridgeOrigin>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let response: VaasResponse = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("Wormholescan vaas: {}", e)))?;

    Ok(response.data.into_iter().next().map(|vaa| BridgeOrigin {
        protocol: "wormhole".to_string(),
        source_chain_id: vaa.emitter_chain,
        source_chain: wormhole_chain_name(vaa.emitter_chain),
        emitter_address: non_empty(vaa.emitter_native_addr).unwrap_or(vaa.emitter_addr),
        sender: None,
        sequence: sequence_string(vaa.sequence),
        timestamp: vaa.timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operations() {
        let body = r#"{
            "operations": [{
                "id": "1/ec7372995d5cc8732397fb0ad35c0121e0eaa90d26f828a534cab54391b3a4f5/581230",
                "emitterChain": 1,
                "emitterAddress": {
                    "hex": "ec7372995d5cc8732397fb0ad35c0121e0eaa90d26f828a534cab54391b3a4f5",
                    "native": "GhBd6sozvfR9F2YwHVj2tAKgKEcGhHpPHoLWiHM4pZKD"
                },
                "sequence": "581230",
                "content": {
                    "standarizedProperties": {
                        "fromChain": 1,
                        "fromAddress": "ignored-when-source-side-has-sender",
                        "toChain": 5,
                        "toAddress": "0x1111111111111111111111111111111111111111"
                    }
                },
                "sourceChain": {
                    "chainId": 1,
                    "timestamp": "2024-05-01T12:00:00Z",
                    "transaction": {"txHash": "5hQ...sig"},
                    "from": "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU",
                    "status": "confirmed"
                },
                "targetChain": {
                    "chainId": 5,
                    "transaction": {"txHash": "0xabc"},
                    "to": "0x1111111111111111111111111111111111111111"
                }
            }]
        }"#;

        let origin = parse_operations(body).unwrap().unwrap();
        assert_eq!(origin.protocol, "wormhole");
        assert_eq!(origin.source_chain_id, 1);
        assert_eq!(origin.source_chain, "solana");
        assert_eq!(origin.emitter_address, "GhBd6sozvfR9F2YwHVj2tAKgKEcGhHpPHoLWiHM4pZKD");
        assert_eq!(
            origin.sender.as_deref(),
            Some("7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU")
        );
        assert_eq!(origin.sequence.as_deref(), Some("581230"));
        assert_eq!(origin.timestamp.as_deref(), Some("2024-05-01T12:00:00Z"));
    }

    #[test]
    fn test_parse_operations_sender_fallback() {
        let body = r#"{
            "operations": [{
                "emitterChain": 2,
                "emitterAddress": {"hex": "0000000000000000000000003ee18b2214aff97000d974cf647e7c347e8fa585"},
                "sequence": 77,
                "content": {"standarizedProperties": {"fromAddress": "0x2222222222222222222222222222222222222222"}}
            }]
        }"#;

        let origin = parse_operations(body).unwrap().unwrap();
        assert_eq!(origin.source_chain, "ethereum");
        assert_eq!(
            origin.sender.as_deref(),
            Some("0x2222222222222222222222222222222222222222")
        );
        assert_eq!(origin.sequence.as_deref(), Some("77"));
        assert!(origin.timestamp.is_none());
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert!(parse_operations(r#"{"operations": []}"#).unwrap().is_none());
        assert!(parse_operations("").unwrap().is_none());
        assert!(parse_vaas(r#"{"data": [], "pagination": {"next": ""}}"#)
            .unwrap()
            .is_none());
        assert!(matches!(
            parse_operations("<html>"),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_vaas() {
        let body = r#"{
            "data": [{
                "sequence": 105224,
                "id": "5/0000000000000000000000005a58505a96d1dbf8df91cb21b54419fc36e93fde/105224",
                "version": 1,
                "emitterChain": 5,
                "emitterAddr": "0000000000000000000000005a58505a96d1dbf8df91cb21b54419fc36e93fde",
                "guardianSetIndex": 4,
                "vaa": "AQAAAAQNAA==",
                "timestamp": "2024-03-02T08:15:00Z",
                "txHash": "0xdef"
            }],
            "pagination": {"next": ""}
        }"#;

        let origin = parse_vaas(body).unwrap().unwrap();
        assert_eq!(origin.source_chain_id, 5);
        assert_eq!(origin.source_chain, "polygon");
        assert_eq!(
            origin.emitter_address,
            "0000000000000000000000005a58505a96d1dbf8df91cb21b54419fc36e93fde"
        );
        assert_eq!(origin.sequence.as_deref(), Some("105224"));
        assert!(origin.sender.is_none());
    }

    #[test]
    fn test_chain_names() {
        assert_eq!(wormhole_chain_name(30), "base");
        assert_eq!(wormhole_chain_name(999), "unknown (999)");
    }
}
