pub mod blockchair;
pub mod blockcypher;
pub mod limiter;

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Config, ProviderConfig};
use blockchair::BlockchairApi;
use blockcypher::BlockCypherApi;
use limiter::TokenBucket;

/// One transaction slot (input or output) as reported by a provider.
/// Coinbase inputs and non-standard scripts carry no address.
#[derive(Debug, Clone, PartialEq)]
pub struct TxSlot {
    pub address: Option<String>,
    pub value: u64, // satoshis
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockTx {
    pub txid: String,
    pub inputs: Vec<TxSlot>,
    pub outputs: Vec<TxSlot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockData {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub time: DateTime<Utc>,
    pub transactions: Vec<BlockTx>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressSummary {
    pub address: String,
    pub balance: u64, // satoshis
    pub tx_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Provider-level failure; any variant triggers fallback to the next provider.
#[derive(Debug)]
pub enum ProviderError {
    Network(String),
    RateLimited,
    InvalidResponse(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Network(e) => write!(f, "network error: {e}"),
            ProviderError::RateLimited => write!(f, "rate limit exceeded"),
            ProviderError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// All providers in the pool failed one logical call.
/// Transient: callers abandon the current cycle and retry at the next tick.
#[derive(Debug)]
pub struct ProviderExhausted {
    pub call: &'static str,
}

impl std::fmt::Display for ProviderExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all providers failed for {}", self.call)
    }
}

impl std::error::Error for ProviderExhausted {}

/// Whether a call may wait on the rate limiter or must be refused instantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Blocking,
    BestEffort,
}

/// Capability interface for one upstream data source.
#[allow(async_fn_in_trait)]
pub trait BlockchainApi {
    fn name(&self) -> &'static str;
    async fn latest_height(&self) -> Result<u64, ProviderError>;
    async fn block(&self, height: u64) -> Result<BlockData, ProviderError>;
    async fn address_info(&self, address: &str) -> Result<AddressSummary, ProviderError>;
}

/// The concrete upstream sources, dispatched by variant.
pub enum UpstreamApi {
    Blockchair(BlockchairApi),
    BlockCypher(BlockCypherApi),
}

impl BlockchainApi for UpstreamApi {
    fn name(&self) -> &'static str {
        match self {
            UpstreamApi::Blockchair(api) => api.name(),
            UpstreamApi::BlockCypher(api) => api.name(),
        }
    }

    async fn latest_height(&self) -> Result<u64, ProviderError> {
        match self {
            UpstreamApi::Blockchair(api) => api.latest_height().await,
            UpstreamApi::BlockCypher(api) => api.latest_height().await,
        }
    }

    async fn block(&self, height: u64) -> Result<BlockData, ProviderError> {
        match self {
            UpstreamApi::Blockchair(api) => api.block(height).await,
            UpstreamApi::BlockCypher(api) => api.block(height).await,
        }
    }

    async fn address_info(&self, address: &str) -> Result<AddressSummary, ProviderError> {
        match self {
            UpstreamApi::Blockchair(api) => api.address_info(address).await,
            UpstreamApi::BlockCypher(api) => api.address_info(address).await,
        }
    }
}

/// One upstream source behind its token bucket and per-call timeout.
pub struct RateLimitedProvider<A> {
    api: A,
    limiter: TokenBucket,
    timeout: Duration,
}

impl<A: BlockchainApi> RateLimitedProvider<A> {
    pub fn new(api: A, limiter: TokenBucket, timeout: Duration) -> Self {
        Self { api, limiter, timeout }
    }

    pub fn name(&self) -> &'static str {
        self.api.name()
    }

    async fn admit(&self, mode: FetchMode) -> Result<(), ProviderError> {
        match mode {
            FetchMode::Blocking => {
                self.limiter.acquire().await;
                Ok(())
            }
            FetchMode::BestEffort => {
                if self.limiter.try_acquire() {
                    Ok(())
                } else {
                    Err(ProviderError::RateLimited)
                }
            }
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            // A timeout falls back exactly like a network error.
            Err(_) => Err(ProviderError::Network(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }

    pub async fn latest_height(&self, mode: FetchMode) -> Result<u64, ProviderError> {
        self.admit(mode).await?;
        self.bounded(self.api.latest_height()).await
    }

    pub async fn block(&self, height: u64, mode: FetchMode) -> Result<BlockData, ProviderError> {
        self.admit(mode).await?;
        self.bounded(self.api.block(height)).await
    }

    pub async fn address_info(
        &self,
        address: &str,
        mode: FetchMode,
    ) -> Result<AddressSummary, ProviderError> {
        self.admit(mode).await?;
        self.bounded(self.api.address_info(address)).await
    }
}

/// Fixed-priority provider list with fallback: one attempt per provider per
/// logical call, no same-provider retry.
pub struct ProviderPool<A> {
    providers: Vec<RateLimitedProvider<A>>,
}

impl<A: BlockchainApi> ProviderPool<A> {
    pub fn new(providers: Vec<RateLimitedProvider<A>>) -> Self {
        Self { providers }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub async fn latest_height(&self) -> Result<u64, ProviderExhausted> {
        for (i, provider) in self.providers.iter().enumerate() {
            match provider.latest_height(FetchMode::Blocking).await {
                Ok(height) => {
                    if i > 0 {
                        info!(provider = provider.name(), "latest_height served by fallback");
                    }
                    return Ok(height);
                }
                Err(e) => {
                    debug!(provider = provider.name(), "latest_height failed: {e}, trying next");
                }
            }
        }
        Err(ProviderExhausted { call: "latest_height" })
    }

    pub async fn block(&self, height: u64) -> Result<BlockData, ProviderExhausted> {
        for (i, provider) in self.providers.iter().enumerate() {
            match provider.block(height, FetchMode::Blocking).await {
                Ok(block) => {
                    if i > 0 {
                        info!(provider = provider.name(), height, "block served by fallback");
                    }
                    return Ok(block);
                }
                Err(e) => {
                    debug!(provider = provider.name(), height, "block fetch failed: {e}, trying next");
                }
            }
        }
        Err(ProviderExhausted { call: "block" })
    }

    pub async fn address_info(
        &self,
        address: &str,
        mode: FetchMode,
    ) -> Result<AddressSummary, ProviderExhausted> {
        for (i, provider) in self.providers.iter().enumerate() {
            match provider.address_info(address, mode).await {
                Ok(info) => {
                    if i > 0 {
                        debug!(provider = provider.name(), "address_info served by fallback");
                    }
                    return Ok(info);
                }
                Err(e) => {
                    debug!(provider = provider.name(), "address_info failed: {e}, trying next");
                }
            }
        }
        Err(ProviderExhausted { call: "address_info" })
    }
}

fn rate_limited(api: UpstreamApi, cfg: &ProviderConfig, timeout: Duration) -> RateLimitedProvider<UpstreamApi> {
    RateLimitedProvider::new(api, TokenBucket::new(cfg.burst, cfg.rate_limit), timeout)
}

/// Build the production pool. Providers configured with an API key take
/// priority over keyless ones; Blockchair leads on ties.
pub fn pool_from_config(config: &Config) -> ProviderPool<UpstreamApi> {
    let timeout = Duration::from_secs(config.monitor.provider_timeout_secs);
    let chair_cfg = &config.providers.blockchair;
    let cypher_cfg = &config.providers.blockcypher;

    let mut keyed = Vec::new();
    let mut keyless = Vec::new();
    if chair_cfg.enabled {
        let api = UpstreamApi::Blockchair(BlockchairApi::new(chair_cfg.api_key.clone()));
        if chair_cfg.api_key.is_some() {
            keyed.push(rate_limited(api, chair_cfg, timeout));
        } else {
            keyless.push(rate_limited(api, chair_cfg, timeout));
        }
    }
    if cypher_cfg.enabled {
        let api = UpstreamApi::BlockCypher(BlockCypherApi::new(cypher_cfg.api_key.clone()));
        if cypher_cfg.api_key.is_some() {
            keyed.push(rate_limited(api, cypher_cfg, timeout));
        } else {
            keyless.push(rate_limited(api, cypher_cfg, timeout));
        }
    }
    keyed.extend(keyless);

    let order: Vec<&str> = keyed.iter().map(|p| p.name()).collect();
    info!(providers = ?order, "provider pool initialized");
    ProviderPool::new(keyed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted upstream: either fails every call with a fixed error kind or
    /// answers with canned values, counting calls either way.
    struct ScriptedApi {
        name: &'static str,
        fail_with: Option<fn() -> ProviderError>,
        calls: Mutex<u32>,
    }

    impl ScriptedApi {
        fn ok(name: &'static str) -> Self {
            Self { name, fail_with: None, calls: Mutex::new(0) }
        }

        fn failing(name: &'static str, make: fn() -> ProviderError) -> Self {
            Self { name, fail_with: Some(make), calls: Mutex::new(0) }
        }

        fn record(&self) -> Result<(), ProviderError> {
            *self.calls.lock().unwrap() += 1;
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl BlockchainApi for ScriptedApi {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn latest_height(&self) -> Result<u64, ProviderError> {
            self.record()?;
            Ok(850_000)
        }

        async fn block(&self, height: u64) -> Result<BlockData, ProviderError> {
            self.record()?;
            Ok(BlockData {
                height,
                hash: format!("{}-{height}", self.name),
                parent_hash: format!("{}-{}", self.name, height - 1),
                time: Utc::now(),
                transactions: vec![],
            })
        }

        async fn address_info(&self, address: &str) -> Result<AddressSummary, ProviderError> {
            self.record()?;
            Ok(AddressSummary {
                address: address.to_string(),
                balance: 42,
                tx_count: 7,
                last_activity: None,
            })
        }
    }

    fn wide_open(api: ScriptedApi) -> RateLimitedProvider<ScriptedApi> {
        RateLimitedProvider::new(api, TokenBucket::new(100.0, 100.0), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn rate_limited_primary_falls_back_to_secondary() {
        let pool = ProviderPool::new(vec![
            wide_open(ScriptedApi::failing("primary", || ProviderError::RateLimited)),
            wide_open(ScriptedApi::ok("secondary")),
        ]);
        let info = pool.address_info("1Abc", FetchMode::Blocking).await.unwrap();
        assert_eq!(info.balance, 42);
    }

    #[tokio::test]
    async fn all_failing_yields_exhausted() {
        let pool = ProviderPool::new(vec![
            wide_open(ScriptedApi::failing("primary", || {
                ProviderError::Network("down".into())
            })),
            wide_open(ScriptedApi::failing("secondary", || {
                ProviderError::InvalidResponse("garbage".into())
            })),
        ]);
        let err = pool.latest_height().await.unwrap_err();
        assert_eq!(err.call, "latest_height");
    }

    #[tokio::test]
    async fn no_same_provider_retry_within_one_call() {
        let pool = ProviderPool::new(vec![wide_open(ScriptedApi::failing("only", || {
            ProviderError::Network("down".into())
        }))]);
        assert!(pool.block(1).await.is_err());
        assert_eq!(pool.providers[0].api.calls(), 1);
    }

    #[tokio::test]
    async fn healthy_primary_shields_secondary() {
        let pool = ProviderPool::new(vec![
            wide_open(ScriptedApi::ok("primary")),
            wide_open(ScriptedApi::ok("secondary")),
        ]);
        pool.latest_height().await.unwrap();
        pool.latest_height().await.unwrap();
        assert_eq!(pool.providers[0].api.calls(), 2);
        assert_eq!(pool.providers[1].api.calls(), 0);
    }

    #[tokio::test]
    async fn best_effort_rejects_without_waiting() {
        let provider = RateLimitedProvider::new(
            ScriptedApi::ok("only"),
            TokenBucket::new(1.0, 0.001),
            Duration::from_secs(5),
        );
        // First call consumes the only token.
        provider.latest_height(FetchMode::BestEffort).await.unwrap();
        let err = provider
            .latest_height(FetchMode::BestEffort)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited));
        // The upstream was never contacted for the refused call.
        assert_eq!(provider.api.calls(), 1);
    }

    #[tokio::test]
    async fn pool_priority_follows_api_keys() {
        let mut config = Config::default();
        config.providers.blockcypher.api_key = Some("key".into());
        let pool = pool_from_config(&config);
        assert_eq!(pool.provider_count(), 2);
        assert_eq!(pool.providers[0].name(), "blockcypher");
        assert_eq!(pool.providers[1].name(), "blockchair");
    }

    #[tokio::test]
    async fn pool_skips_disabled_providers() {
        let mut config = Config::default();
        config.providers.blockchair.enabled = false;
        let pool = pool_from_config(&config);
        assert_eq!(pool.provider_count(), 1);
        assert_eq!(pool.providers[0].name(), "blockcypher");
    }
}
