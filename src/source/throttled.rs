//! Rate-limited, cached, retrying wrapper around any chain data source

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::ChainDataSource;
use crate::cache::{ProvenanceCache, TokenBucket};
use crate::error::{Error, Result};
use crate::types::{AddressMeta, Chain, TransferPage};

/// Per-call limits applied by `ThrottledSource`
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Hard bound on a single adapter call
    pub timeout: Duration,
    /// Attempts per call, including the first
    pub max_attempts: u32,
    /// Initial backoff delay between attempts
    pub retry_base_delay: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
        }
    }
}

/// Decorator that every traced call goes through.
///
/// Each attempt draws a token from the provider's shared bucket and is
/// bounded by the configured timeout. Rate-limit and timeout failures are
/// retried with exponential backoff. Transfer pages are cached and every
/// event is validated before it leaves the adapter boundary.
pub struct ThrottledSource {
    inner: Arc<dyn ChainDataSource>,
    limiter: Arc<TokenBucket>,
    cache: Arc<ProvenanceCache>,
    config: ThrottleConfig,
}

impl ThrottledSource {
    pub fn new(
        inner: Arc<dyn ChainDataSource>,
        limiter: Arc<TokenBucket>,
        cache: Arc<ProvenanceCache>,
        config: ThrottleConfig,
    ) -> Self {
        Self {
            inner,
            limiter,
            cache,
            config,
        }
    }

    /// Run `op` under the limiter and timeout, retrying retryable failures
    async fn guarded<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.config.max_attempts.max(1);
        let timeout = self.config.timeout;

        let policy = ExponentialBackoff {
            initial_interval: self.config.retry_base_delay,
            max_interval: self.config.retry_base_delay * 8,
            max_elapsed_time: None,
            ..Default::default()
        };

        let limiter = &self.limiter;
        let attempts = &attempts;
        let op = &op;
        retry(policy, || async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if !limiter.try_acquire().await {
                let available = limiter.available().await;
                debug!(what, available, "Waiting for rate limit budget");
                limiter.acquire().await;
            }

            let outcome = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::DataSourceTimeout(timeout.as_millis() as u64)),
            };

            match outcome {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(what, attempt, max_attempts, error = %e, "Retrying data source call");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }
}

#[async_trait]
impl ChainDataSource for ThrottledSource {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn chain(&self) -> Chain {
        self.inner.chain()
    }

    async fn get_incoming_transfers(
        &self,
        address: &str,
        asset: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<TransferPage> {
        let key = ProvenanceCache::transfer_key(self.name(), self.chain(), address, asset, cursor);
        if let Some(page) = self.cache.get_transfers(&key) {
            debug!(address, "Transfer page cache hit");
            return Ok(page);
        }

        let page = self
            .guarded("get_incoming_transfers", || {
                self.inner.get_incoming_transfers(address, asset, cursor)
            })
            .await?;

        for transfer in &page.transfers {
            transfer.validate()?;
            if transfer.chain != self.chain() {
                return Err(Error::MalformedResponse(format!(
                    "transfer {} is on {} but the source serves {}",
                    transfer.tx_hash,
                    transfer.chain,
                    self.chain()
                )));
            }
        }

        self.cache.set_transfers(key, page.clone());
        Ok(page)
    }

    async fn get_address_meta(&self, address: &str) -> Result<AddressMeta> {
        self.guarded("get_address_meta", || self.inner.get_address_meta(address))
            .await
    }
}
