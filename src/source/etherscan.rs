//! Etherscan V2 multichain explorer adapter
//!
//! Transfers come from `account/tokentx` (newest first, `page`/`offset`
//! pagination, the cursor is the page number). Contract detection uses
//! `proxy/eth_getCode`.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::ChainDataSource;
use crate::error::{Error, Result};
use crate::types::{AddressMeta, Chain, TransferEvent, TransferPage};

pub const DEFAULT_BASE_URL: &str = "https://api.etherscan.io/v2/api";

/// Native USDC on Polygon PoS
pub const POLYGON_USDC: &str = "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359";
/// Bridged USDC.e on Polygon PoS
pub const POLYGON_USDC_BRIDGED: &str = "0x2791bca1f2de4661ed88a30c99a7a9449aa84174";

const DEFAULT_PAGE_SIZE: u32 = 100;

/// Token contracts followed by default on each chain (contract -> symbol)
pub fn default_tracked_tokens(chain: Chain) -> HashMap<String, String> {
    match chain {
        Chain::Polygon => HashMap::from([
            (POLYGON_USDC.to_string(), "USDC".to_string()),
            (POLYGON_USDC_BRIDGED.to_string(), "USDC".to_string()),
        ]),
        _ => HashMap::new(),
    }
}

/// EVM chain data source backed by the Etherscan V2 API
pub struct EtherscanSource {
    client: Client,
    chain: Chain,
    chain_id: u64,
    api_key: String,
    base_url: String,
    page_size: u32,
    /// Lowercase contract -> symbol. Empty means every token is followed.
    tracked_tokens: HashMap<String, String>,
    timeout: Duration,
}

impl EtherscanSource {
    pub fn new(chain: Chain, api_key: impl Into<String>) -> Result<Self> {
        let chain_id = chain.chain_id().ok_or_else(|| {
            Error::Config(format!("{} is not served by the Etherscan API", chain))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            chain,
            chain_id,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            tracked_tokens: default_tracked_tokens(chain),
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, 10_000);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the tracked-token allowlist (contract -> symbol)
    pub fn with_tracked_tokens(mut self, tokens: HashMap<String, String>) -> Self {
        self.tracked_tokens = tokens
            .into_iter()
            .map(|(contract, symbol)| (contract.to_lowercase(), symbol))
            .collect();
        self
    }

    async fn call(&self, params: &[(&str, String)]) -> Result<String> {
        let chain_id = self.chain_id.to_string();
        let mut query: Vec<(&str, &str)> =
            vec![("chainid", chain_id.as_str()), ("apikey", self.api_key.as_str())];
        query.extend(params.iter().map(|(k, v)| (*k, v.as_str())));

        let response = self
            .client
            .get(&self.base_url)
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::DataSourceTimeout(self.timeout.as_millis() as u64)
                } else {
                    Error::DataSource(format!("Etherscan request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimitExceeded(format!("Etherscan HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::DataSource(format!(
                "Etherscan API error {}: {}",
                status, body
            )));
        }

        response
            .text()
            .await
            .map_err(|e| Error::DataSource(format!("Etherscan body read failed: {}", e)))
    }
}

#[async_trait]
impl ChainDataSource for EtherscanSource {
    fn name(&self) -> &'static str {
        "etherscan"
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
        let page = cursor
            .and_then(|c| c.parse::<u32>().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);

        debug!(address = %address, page, "Fetching tokentx page");

        let body = self
            .call(&[
                ("module", "account".to_string()),
                ("action", "tokentx".to_string()),
                ("address", address.clone()),
                ("page", page.to_string()),
                ("offset", self.page_size.to_string()),
                ("sort", "desc".to_string()),
            ])
            .await?;

        let (transfers, raw_count) =
            parse_token_transfers(self.chain, &body, &address, &self.tracked_tokens, asset)?;

        Ok(TransferPage {
            transfers,
            next_cursor: (raw_count >= self.page_size as usize).then(|| (page + 1).to_string()),
        })
    }

    async fn get_address_meta(&self, address: &str) -> Result<AddressMeta> {
        let body = self
            .call(&[
                ("module", "proxy".to_string()),
                ("action", "eth_getCode".to_string()),
                ("address", self.chain.normalize_address(address)),
                ("tag", "latest".to_string()),
            ])
            .await?;

        Ok(AddressMeta {
            is_contract: parse_code_response(&body)?,
            program_owner: None,
        })
    }
}

// ============ Etherscan API Response Types ============

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<ProxyError>,
}

#[derive(Debug, Deserialize)]
struct ProxyError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenTx {
    block_number: String,
    time_stamp: String,
    hash: String,
    from: String,
    to: String,
    contract_address: String,
    value: String,
    #[serde(default)]
    token_symbol: String,
    token_decimal: String,
}

/// Map a status "0" envelope to the right error (or to "no data")
fn check_envelope(response: &ApiResponse) -> Result<bool> {
    if let Some(error) = &response.error {
        return Err(Error::DataSource(format!("Etherscan proxy error: {}", error.message)));
    }
    if response.status.as_deref() != Some("0") {
        return Ok(true);
    }

    let message = response.message.clone().unwrap_or_default();
    let detail = response.result.as_str().unwrap_or_default();
    if message.contains("No transactions found") || detail.contains("No transactions found") {
        return Ok(false);
    }
    let text = format!("{} {}", message, detail);
    if text.to_lowercase().contains("rate limit") {
        return Err(Error::RateLimitExceeded(text.trim().to_string()));
    }
    Err(Error::DataSource(format!("Etherscan: {}", text.trim())))
}

/// Parse a `tokentx` body into inbound transfers for `address`.
///
/// Returns the transfers plus the raw row count, which drives pagination.
fn parse_token_transfers(
    chain: Chain,
    body: &str,
    address: &str,
    tracked_tokens: &HashMap<String, String>,
    asset: Option<&str>,
) -> Result<(Vec<TransferEvent>, usize)> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("tokentx envelope: {}", e)))?;
    if !check_envelope(&response)? {
        return Ok((Vec::new(), 0));
    }

    let rows: Vec<TokenTx> = serde_json::from_value(response.result)
        .map_err(|e| Error::MalformedResponse(format!("tokentx rows: {}", e)))?;
    let raw_count = rows.len();

    let mut transfers = Vec::new();
    for row in rows {
        if chain.normalize_address(&row.to) != address {
            continue;
        }

        let contract = row.contract_address.to_lowercase();
        let symbol = if tracked_tokens.is_empty() {
            if row.token_symbol.is_empty() {
                contract.clone()
            } else {
                row.token_symbol.clone()
            }
        } else {
            match tracked_tokens.get(&contract) {
                Some(symbol) => symbol.clone(),
                None => continue,
            }
        };
        if let Some(wanted) = asset {
            if !symbol.eq_ignore_ascii_case(wanted) {
                continue;
            }
        }

        let amount = scale_amount(&row.value, &row.token_decimal)?;
        let block_height = row
            .block_number
            .parse::<u64>()
            .map_err(|_| Error::MalformedResponse(format!("bad block number in {}", row.hash)))?;
        let timestamp = row
            .time_stamp
            .parse::<i64>()
            .ok()
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .ok_or_else(|| Error::MalformedResponse(format!("bad timestamp in {}", row.hash)))?;

        transfers.push(TransferEvent {
            chain,
            asset: symbol,
            from: chain.normalize_address(&row.from),
            to: address.to_string(),
            amount,
            tx_hash: row.hash,
            block_height,
            timestamp,
        });
    }

    Ok((transfers, raw_count))
}

/// Raw integer amount / 10^decimals
fn scale_amount(value: &str, decimals: &str) -> Result<f64> {
    let raw = value
        .parse::<f64>()
        .map_err(|_| Error::MalformedResponse(format!("bad token value {:?}", value)))?;
    let decimals = decimals
        .parse::<i32>()
        .map_err(|_| Error::MalformedResponse(format!("bad token decimals {:?}", decimals)))?;
    Ok(raw / 10f64.powi(decimals))
}

/// Parse an `eth_getCode` body; any deployed bytecode means a contract
fn parse_code_response(body: &str) -> Result<bool> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("eth_getCode envelope: {}", e)))?;
    check_envelope(&response)?;

    let code = response
        .result
        .as_str()
        .ok_or_else(|| Error::MalformedResponse("eth_getCode result is not a string".into()))?;
    if !code.starts_with("0x") {
        warn!(code, "Unexpected eth_getCode payload");
        return Err(Error::MalformedResponse(format!("eth_getCode returned {:?}", code)));
    }
    Ok(!code.trim_start_matches("0x").trim_start_matches('0').is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    const TOKENTX: &str = r#"{
        "status": "1",
        "message": "OK",
        "result": [
            {
                "blockNumber": "60000002",
                "timeStamp": "1714000000",
                "hash": "0xin",
                "from": "0x28C6C06298D514DB089934071355E5743BF21D60",
                "to": "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                "contractAddress": "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359",
                "value": "2500000000",
                "tokenSymbol": "USDC",
                "tokenDecimal": "6"
            },
            {
                "blockNumber": "60000001",
                "timeStamp": "1713999990",
                "hash": "0xout",
                "from": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "to": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                "contractAddress": "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359",
                "value": "1000000",
                "tokenSymbol": "USDC",
                "tokenDecimal": "6"
            },
            {
                "blockNumber": "60000000",
                "timeStamp": "1713999980",
                "hash": "0xspam",
                "from": "0xcccccccccccccccccccccccccccccccccccccccc",
                "to": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "contractAddress": "0xdddddddddddddddddddddddddddddddddddddddd",
                "value": "999000000000000000000",
                "tokenSymbol": "SPAM",
                "tokenDecimal": "18"
            }
        ]
    }"#;

    #[test]
    fn test_parse_inbound_tracked_only() {
        let tracked = default_tracked_tokens(Chain::Polygon);
        let (transfers, raw) =
            parse_token_transfers(Chain::Polygon, TOKENTX, WALLET, &tracked, None).unwrap();

        assert_eq!(raw, 3);
        assert_eq!(transfers.len(), 1);
        let t = &transfers[0];
        assert_eq!(t.from, "0x28c6c06298d514db089934071355e5743bf21d60");
        assert_eq!(t.asset, "USDC");
        assert!((t.amount - 2500.0).abs() < 1e-9);
        assert_eq!(t.block_height, 60000002);
        assert_eq!(t.timestamp.timestamp(), 1714000000);
    }

    #[test]
    fn test_parse_without_allowlist_uses_symbols() {
        let (transfers, _) =
            parse_token_transfers(Chain::Polygon, TOKENTX, WALLET, &HashMap::new(), Some("spam"))
                .unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].asset, "SPAM");
        assert!((transfers[0].amount - 999.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_transactions_is_empty_page() {
        let body = r#"{"status":"0","message":"No transactions found","result":[]}"#;
        let (transfers, raw) =
            parse_token_transfers(Chain::Polygon, body, WALLET, &HashMap::new(), None).unwrap();
        assert!(transfers.is_empty());
        assert_eq!(raw, 0);
    }

    #[test]
    fn test_rate_limit_and_errors() {
        let body = r#"{"status":"0","message":"NOTOK","result":"Max rate limit reached"}"#;
        let err = parse_token_transfers(Chain::Polygon, body, WALLET, &HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded(_)));

        let body = r#"{"status":"0","message":"NOTOK","result":"Invalid API Key"}"#;
        let err = parse_token_transfers(Chain::Polygon, body, WALLET, &HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::DataSource(_)));

        let err = parse_token_transfers(Chain::Polygon, "<html>", WALLET, &HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn test_parse_get_code() {
        assert!(!parse_code_response(r#"{"jsonrpc":"2.0","id":1,"result":"0x"}"#).unwrap());
        assert!(parse_code_response(r#"{"jsonrpc":"2.0","id":1,"result":"0x6080604052"}"#).unwrap());
        assert!(parse_code_response(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}"#
        )
        .is_err());
    }

    #[test]
    fn test_non_evm_chain_rejected() {
        assert!(EtherscanSource::new(Chain::Solana, "key").is_err());
        assert!(EtherscanSource::new(Chain::Polygon, "key").is_ok());
    }
}
