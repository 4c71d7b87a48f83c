//! Chain data sources
//!
//! A `ChainDataSource` answers two questions for one chain: which transfers
//! came into an address, and what kind of account the address is. Chain
//! quirks stay inside the adapters; the tracer only sees this trait.

pub mod etherscan;
pub mod helius;
pub mod memory;
pub mod throttled;
pub mod wormhole;

pub use etherscan::EtherscanSource;
pub use helius::HeliusSource;
pub use memory::MemorySource;
pub use throttled::{ThrottleConfig, ThrottledSource};
pub use wormhole::{BridgeResolver, WormholeClient};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::types::{AddressMeta, Chain, TransferEvent, TransferPage};

/// Inbound-transfer history and address metadata for one chain
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    /// Provider name, used for rate-limit and cache keys
    fn name(&self) -> &'static str;

    /// Chain this source serves
    fn chain(&self) -> Chain;

    /// One page of transfers into `address`, most recent first.
    ///
    /// A stale, unparseable or absent cursor returns the most recent page.
    async fn get_incoming_transfers(
        &self,
        address: &str,
        asset: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<TransferPage>;

    /// Account metadata for `address`
    async fn get_address_meta(&self, address: &str) -> Result<AddressMeta>;
}

/// Page through inbound history until exhausted or `max_pages` is reached.
///
/// Any page failure fails the whole fetch; partial history is never returned.
pub async fn fetch_incoming(
    source: &dyn ChainDataSource,
    address: &str,
    asset: Option<&str>,
    max_pages: usize,
) -> Result<Vec<TransferEvent>> {
    let mut transfers = Vec::new();
    let mut cursor: Option<String> = None;

    for page_no in 0..max_pages.max(1) {
        let page = source
            .get_incoming_transfers(address, asset, cursor.as_deref())
            .await?;
        transfers.extend(page.transfers);

        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => {
                debug!(address, pages = page_no + 1, "Inbound history exhausted");
                return Ok(transfers);
            }
        }
    }

    debug!(address, max_pages, "Page cap reached");
    Ok(transfers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn source(count: usize) -> MemorySource {
        let mut source = MemorySource::new(Chain::Polygon).with_page_size(2);
        for i in 0..count {
            source = source.with_transfer(
                &format!("0x{:040x}", i + 1),
                A,
                100.0 + i as f64,
                "USDC",
                &format!("0xtx{}", i),
            );
        }
        source
    }

    #[tokio::test]
    async fn test_fetch_all_pages() {
        let source = source(5);
        let transfers = fetch_incoming(&source, A, None, 10).await.unwrap();
        assert_eq!(transfers.len(), 5);
        assert_eq!(source.transfer_calls(A), 3);
    }

    #[tokio::test]
    async fn test_fetch_respects_page_cap() {
        let source = source(5);
        let transfers = fetch_incoming(&source, A, None, 2).await.unwrap();
        assert_eq!(transfers.len(), 4);
        assert_eq!(source.transfer_calls(A), 2);
    }

    #[tokio::test]
    async fn test_fetch_fails_atomically() {
        let source = source(5).fail_transfers(A);
        assert!(fetch_incoming(&source, A, None, 3).await.is_err());
    }
}
