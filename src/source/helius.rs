//! Helius adapter for Solana
//!
//! Provides:
//! - Inbound SOL and SPL token transfers from the enhanced-transactions API
//! - Account metadata (executable flag, owning program) via Solana RPC

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::account::Account;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::ChainDataSource;
use crate::error::{Error, Result};
use crate::types::{AddressMeta, Chain, TransferEvent, TransferPage};

pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";

const LAMPORTS_PER_SOL: f64 = 1e9;

/// Symbol for well-known mints, otherwise the mint itself
fn mint_symbol(mint: &str) -> String {
    match mint {
        USDC_MINT => "USDC".to_string(),
        USDT_MINT => "USDT".to_string(),
        other => other.to_string(),
    }
}

/// Solana chain data source backed by Helius
pub struct HeliusSource {
    /// HTTP client
    client: Client,
    /// RPC client for account lookups
    rpc: RpcClient,
    /// API key
    api_key: String,
    /// Base URL for REST API
    rest_base_url: String,
    /// Transactions per page
    page_limit: u32,
    /// Request timeout
    timeout: Duration,
}

impl HeliusSource {
    /// Create a new Helius source
    pub fn new(api_key: String) -> Self {
        let rpc_url = format!("https://mainnet.helius-rpc.com/?api-key={}", api_key);
        Self::with_urls(api_key, "https://api.helius.xyz".to_string(), rpc_url)
    }

    /// Create with explicit REST and RPC endpoints
    pub fn with_urls(api_key: String, rest_base_url: String, rpc_url: String) -> Self {
        let timeout = Duration::from_secs(10);
        Self {
            client: Client::new(),
            rpc: RpcClient::new_with_timeout_and_commitment(
                rpc_url,
                timeout,
                CommitmentConfig::confirmed(),
            ),
            api_key,
            rest_base_url,
            page_limit: 100,
            timeout,
        }
    }

    /// Create from RPC URL (extracts API key)
    pub fn from_rpc_url(rpc_url: &str) -> Option<Self> {
        // e.g. "https://mainnet.helius-rpc.com/?api-key=xxx"
        let key_start = rpc_url.find("api-key=")?;
        let key = rpc_url[key_start + 8..].split('&').next()?;
        if key.is_empty() {
            return None;
        }
        Some(Self::with_urls(
            key.to_string(),
            "https://api.helius.xyz".to_string(),
            rpc_url.to_string(),
        ))
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.clamp(1, 100);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn api_key(&self) -> &str {
        &self.api_key
    }
}

#[async_trait]
impl ChainDataSource for HeliusSource {
    fn name(&self) -> &'static str {
        "helius"
    }

    fn chain(&self) -> Chain {
        Chain::Solana
    }

    async fn get_incoming_transfers(
        &self,
        address: &str,
        asset: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<TransferPage> {
        let address = address.trim();
        let mut url = format!(
            "{}/v0/addresses/{}/transactions?api-key={}&limit={}",
            self.rest_base_url,
            address,
            self.api_key(),
            self.page_limit
        );
        // A cursor that is not a signature is ignored: newest page
        if let Some(before) = cursor.filter(|c| is_signature(c)) {
            url.push_str("&before=");
            url.push_str(before);
        }

        debug!(address, cursor, "Fetching enhanced transactions");

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::DataSourceTimeout(self.timeout.as_millis() as u64)
                } else {
                    Error::DataSource(format!("Helius request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimitExceeded(format!("Helius HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::DataSource(format!("Helius API error {}: {}", status, body)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::DataSource(format!("Helius body read failed: {}", e)))?;

        let parsed = parse_transactions(&body, address, asset)?;
        let next_cursor = if parsed.raw_count >= self.page_limit as usize {
            parsed.last_signature
        } else {
            None
        };

        Ok(TransferPage {
            transfers: parsed.transfers,
            next_cursor,
        })
    }

    async fn get_address_meta(&self, address: &str) -> Result<AddressMeta> {
        let pubkey = Pubkey::from_str(address.trim())
            .map_err(|e| Error::MalformedResponse(format!("{}: {}", address, e)))?;

        let response = tokio::time::timeout(
            self.timeout,
            self.rpc
                .get_account_with_commitment(&pubkey, CommitmentConfig::confirmed()),
        )
        .await
        .map_err(|_| Error::DataSourceTimeout(self.timeout.as_millis() as u64))??;

        Ok(meta_from_account(response.value.as_ref()))
    }
}

/// Contract-ness of a Solana account: programs and anything not owned by
/// the system program (token accounts, PDAs) count as contracts.
fn meta_from_account(account: Option<&Account>) -> AddressMeta {
    match account {
        // Never-funded address: a plain wallet
        None => AddressMeta::default(),
        Some(account) => AddressMeta {
            is_contract: account.executable || account.owner != system_program::id(),
            program_owner: Some(account.owner.to_string()),
        },
    }
}

/// Base58 that decodes to a 64-byte signature
fn is_signature(value: &str) -> bool {
    bs58::decode(value)
        .into_vec()
        .map(|bytes| bytes.len() == 64)
        .unwrap_or(false)
}

#[derive(Debug)]
struct ParsedPage {
    transfers: Vec<TransferEvent>,
    last_signature: Option<String>,
    raw_count: usize,
}

fn parse_transactions(body: &str, address: &str, asset: Option<&str>) -> Result<ParsedPage> {
    let transactions: Vec<HeliusTransaction> = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("Failed to parse Helius response: {}", e)))?;

    let mut transfers = Vec::new();
    for tx in &transactions {
        let timestamp = tx
            .timestamp
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_default();

        let mut push = |from: &str, symbol: String, amount: f64| {
            if asset.map_or(false, |a| !symbol.eq_ignore_ascii_case(a)) {
                return;
            }
            transfers.push(TransferEvent {
                chain: Chain::Solana,
                asset: symbol,
                from: from.to_string(),
                to: address.to_string(),
                amount,
                tx_hash: tx.signature.clone(),
                block_height: tx.slot.unwrap_or(0),
                timestamp,
            });
        };

        // Only incoming transfers (TO this wallet)
        for native in tx.native_transfers.iter().flatten() {
            if native.to_user_account.as_deref() != Some(address) {
                continue;
            }
            if let Some(from) = native.from_user_account.as_deref() {
                push(from, "SOL".to_string(), native.amount as f64 / LAMPORTS_PER_SOL);
            }
        }

        for token in tx.token_transfers.iter().flatten() {
            if token.to_user_account.as_deref() != Some(address) {
                continue;
            }
            if let Some(from) = token.from_user_account.as_deref() {
                push(from, mint_symbol(&token.mint), token.token_amount);
            }
        }
    }

    Ok(ParsedPage {
        transfers,
        last_signature: transactions.last().map(|tx| tx.signature.clone()),
        raw_count: transactions.len(),
    })
}

// ============ Helius API Response Types ============

#[derive(Debug, Deserialize)]
struct HeliusTransaction {
    signature: String,
    timestamp: Option<i64>,
    slot: Option<u64>,
    #[serde(rename = "nativeTransfers")]
    native_transfers: Option<Vec<NativeTransfer>>,
    #[serde(rename = "tokenTransfers")]
    token_transfers: Option<Vec<TokenTransfer>>,
}

#[derive(Debug, Deserialize)]
struct NativeTransfer {
    #[serde(rename = "fromUserAccount")]
    from_user_account: Option<String>,
    #[serde(rename = "toUserAccount")]
    to_user_account: Option<String>,
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct TokenTransfer {
    #[serde(rename = "fromUserAccount")]
    from_user_account: Option<String>,
    #[serde(rename = "toUserAccount")]
    to_user_account: Option<String>,
    mint: String,
    #[serde(rename = "tokenAmount")]
    token_amount: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    const FUNDER: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    fn page() -> String {
        format!(
            r#"[
                {{
                    "signature": "sig-newest",
                    "timestamp": 1714000000,
                    "slot": 260000000,
                    "type": "TRANSFER",
                    "nativeTransfers": [
                        {{"fromUserAccount": "{funder}", "toUserAccount": "{wallet}", "amount": 2500000000}},
                        {{"fromUserAccount": "{wallet}", "toUserAccount": "{funder}", "amount": 5000}}
                    ],
                    "tokenTransfers": [
                        {{"fromUserAccount": "{funder}", "toUserAccount": "{wallet}", "mint": "{usdc}", "tokenAmount": 1200.5}}
                    ]
                }},
                {{
                    "signature": "sig-oldest",
                    "timestamp": 1713990000,
                    "nativeTransfers": null,
                    "tokenTransfers": [
                        {{"fromUserAccount": "{funder}", "toUserAccount": "{wallet}", "mint": "SomeMint111", "tokenAmount": 7.0}}
                    ]
                }}
            ]"#,
            funder = FUNDER,
            wallet = WALLET,
            usdc = USDC_MINT
        )
    }

    #[test]
    fn test_parse_incoming_only() {
        let parsed = parse_transactions(&page(), WALLET, None).unwrap();
        assert_eq!(parsed.raw_count, 2);
        assert_eq!(parsed.last_signature.as_deref(), Some("sig-oldest"));
        assert_eq!(parsed.transfers.len(), 3);

        let sol = &parsed.transfers[0];
        assert_eq!(sol.asset, "SOL");
        assert!((sol.amount - 2.5).abs() < 1e-9);
        assert_eq!(sol.from, FUNDER);
        assert_eq!(sol.block_height, 260000000);

        assert_eq!(parsed.transfers[1].asset, "USDC");
        assert_eq!(parsed.transfers[2].asset, "SomeMint111");
    }

    #[test]
    fn test_parse_asset_hint() {
        let parsed = parse_transactions(&page(), WALLET, Some("usdc")).unwrap();
        assert_eq!(parsed.transfers.len(), 1);
        assert!((parsed.transfers[0].amount - 1200.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_malformed() {
        let err = parse_transactions(r#"{"error":"bad"}"#, WALLET, None).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn test_account_meta() {
        assert_eq!(meta_from_account(None), AddressMeta::default());

        let wallet = Account {
            lamports: 1,
            owner: system_program::id(),
            ..Default::default()
        };
        assert!(!meta_from_account(Some(&wallet)).is_contract);

        let token_account = Account {
            lamports: 1,
            owner: spl_token::id(),
            ..Default::default()
        };
        let meta = meta_from_account(Some(&token_account));
        assert!(meta.is_contract);
        assert_eq!(meta.program_owner, Some(spl_token::id().to_string()));
    }

    #[test]
    fn test_signature_cursor_check() {
        assert!(!is_signature("sig-oldest"));
        assert!(!is_signature(FUNDER)); // 32-byte pubkey, not a signature
        let sig = bs58::encode([7u8; 64]).into_string();
        assert!(is_signature(&sig));
    }

    #[test]
    fn test_from_rpc_url() {
        let url = "https://mainnet.helius-rpc.com/?api-key=test123";
        let source = HeliusSource::from_rpc_url(url);
        assert!(source.is_some());
        assert_eq!(source.unwrap().api_key, "test123");
    }

    #[test]
    fn test_from_rpc_url_no_key() {
        let url = "https://api.mainnet-beta.solana.com";
        assert!(HeliusSource::from_rpc_url(url).is_none());
    }
}
