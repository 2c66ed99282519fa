use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::core::registry::WatchedAddressRegistry;
use crate::core::{ActivityEvent, SATS_PER_BTC, short_addr};
use crate::db::SharedDatabase;
use crate::providers::{
    AddressSummary, BlockData, BlockchainApi, FetchMode, ProviderExhausted, ProviderPool,
};

#[derive(Debug)]
pub enum MonitorError {
    /// Transient: the cycle is abandoned and retried at the next tick.
    Provider(ProviderExhausted),
    /// The monitor must not advance past the affected block.
    Persistence(rusqlite::Error),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Provider(e) => write!(f, "{e}"),
            MonitorError::Persistence(e) => write!(f, "persistence error: {e}"),
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<ProviderExhausted> for MonitorError {
    fn from(e: ProviderExhausted) -> Self {
        MonitorError::Provider(e)
    }
}

impl From<rusqlite::Error> for MonitorError {
    fn from(e: rusqlite::Error) -> Self {
        MonitorError::Persistence(e)
    }
}

/// Polls for new blocks, intersects their addresses with the registry, and
/// commits the resulting activity events atomically with the height advance.
/// Blocks are processed strictly sequentially by height.
pub struct BlockMonitor<A> {
    pool: ProviderPool<A>,
    registry: WatchedAddressRegistry,
    db: SharedDatabase,
    config: MonitorConfig,
    events_tx: mpsc::UnboundedSender<Vec<ActivityEvent>>,
    last_seen_height: u64,
    /// Bootstrap height; rewinds never go below it.
    floor_height: u64,
    /// Hashes of recently committed blocks for parent linkage checks.
    recent_hashes: HashMap<u64, String>,
    /// Height whose parent mismatch triggered the current rewind, if any.
    rewind_trigger: Option<u64>,
}

impl<A: BlockchainApi> BlockMonitor<A> {
    /// Resume from the last committed height, or baseline at the current tip.
    /// Failure here is fatal: the monitor cannot run without a baseline.
    pub async fn bootstrap(
        pool: ProviderPool<A>,
        registry: WatchedAddressRegistry,
        db: SharedDatabase,
        config: MonitorConfig,
        events_tx: mpsc::UnboundedSender<Vec<ActivityEvent>>,
    ) -> Result<Self, MonitorError> {
        let (height, tip) = match db.load_monitor_state()? {
            Some((height, tip)) => {
                info!(height, "resuming from last committed height");
                (height, (!tip.is_empty()).then_some(tip))
            }
            None => {
                let height = pool.latest_height().await?;
                info!(height, "no committed state, baselining at current tip");
                (height, None)
            }
        };
        let mut recent_hashes = HashMap::new();
        if let Some(tip) = tip {
            recent_hashes.insert(height, tip);
        }
        Ok(Self {
            pool,
            registry,
            db,
            config,
            events_tx,
            last_seen_height: height,
            floor_height: height,
            recent_hashes,
            rewind_trigger: None,
        })
    }

    pub fn last_seen_height(&self) -> u64 {
        self.last_seen_height
    }

    /// Drive the poll loop until shutdown. An in-flight block commit always
    /// completes; shutdown is honored between cycles and between blocks.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.poll_interval_secs,
            watched = self.registry.len(),
            "block monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            match self.cycle(Some(&shutdown)).await {
                Ok(()) => {}
                Err(MonitorError::Provider(e)) => {
                    warn!("poll cycle abandoned: {e}, retrying next tick");
                }
                Err(MonitorError::Persistence(e)) => {
                    error!("block commit failed after retries: {e}; height not advanced");
                }
            }
        }
        info!(height = self.last_seen_height(), "block monitor stopped");
    }

    /// Run exactly one poll cycle.
    async fn cycle(
        &mut self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<(), MonitorError> {
        let latest = self.pool.latest_height().await?;
        if latest <= self.last_seen_height {
            debug!(latest, "no new blocks");
            return Ok(());
        }

        let backlog = latest - self.last_seen_height;
        if backlog > self.config.max_catchup_blocks {
            let resume = latest - self.config.max_catchup_blocks;
            warn!(
                gap_start = self.last_seen_height + 1,
                gap_end = resume,
                skipped = resume - self.last_seen_height,
                "catch-up window exceeded, skipping blocks"
            );
            self.last_seen_height = resume;
            // The gap breaks parent linkage with anything we have stored.
            self.recent_hashes.clear();
        }

        info!(
            from = self.last_seen_height + 1,
            to = latest,
            "new blocks detected"
        );
        while self.last_seen_height < latest {
            if let Some(shutdown) = shutdown {
                if *shutdown.borrow() {
                    info!("shutdown requested, stopping mid catch-up");
                    break;
                }
            }
            self.advance_one().await?;
        }
        Ok(())
    }

    /// Fetch and process the next block, handling reorg rewinds.
    async fn advance_one(&mut self) -> Result<(), MonitorError> {
        let height = self.last_seen_height + 1;
        let block = self.pool.block(height).await?;

        if let Some(expected) = self.recent_hashes.get(&(height - 1)) {
            if block.parent_hash != *expected {
                if self.rewind_trigger.is_some() {
                    error!(
                        height,
                        lookback = self.config.reorg_lookback,
                        "unresolved reorg deeper than lookback, adopting new chain"
                    );
                    self.rewind_trigger = None;
                } else {
                    let base = height
                        .saturating_sub(self.config.reorg_lookback + 1)
                        .max(self.floor_height);
                    warn!(height, rewind_to = base + 1, "chain reorg detected, rewinding");
                    self.rewind_trigger = Some(height);
                    self.recent_hashes.retain(|&h, _| h <= base);
                    self.last_seen_height = base;
                    return Ok(());
                }
            }
        }

        self.process_block(block).await
    }

    /// Match, fetch details, and commit one block. Event order within the
    /// block is deterministic; events are appended only after all detail
    /// fetches for the block have completed.
    async fn process_block(&mut self, block: BlockData) -> Result<(), MonitorError> {
        let height = block.height;
        let matched: HashSet<String> = candidate_addresses(&block)
            .into_iter()
            .filter(|a| self.registry.contains(a))
            .map(str::to_string)
            .collect();

        let mut events = Vec::new();
        let mut summaries = HashMap::new();
        if !matched.is_empty() {
            warn!(
                height,
                matched = matched.len(),
                "🚨 watched address activity detected"
            );
            events = build_events(&block, &matched, &self.registry);
            summaries = self.refresh_details(&matched).await;
        }

        self.commit_with_backoff(height, &block.hash, &events).await?;

        // Registry refresh only after the events are durably committed.
        for address in &matched {
            let balance = summaries.get(address.as_str()).map(|s| s.balance);
            if let Some(summary) = summaries.get(address.as_str()) {
                debug!(
                    address = short_addr(address),
                    balance = summary.balance,
                    tx_count = summary.tx_count,
                    last_seen = ?summary.last_activity,
                    "address detail refreshed"
                );
            }
            if let Some(updated) = self.registry.record_activity(address, block.time, balance) {
                if let Err(e) = self.db.upsert_watched_address(&updated) {
                    warn!(
                        address = short_addr(address),
                        "failed to persist registry update: {e}"
                    );
                }
            }
        }

        self.last_seen_height = height;
        self.recent_hashes.insert(height, block.hash.clone());
        let min_keep = height.saturating_sub(self.config.reorg_lookback + 1);
        self.recent_hashes.retain(|&h, _| h >= min_keep);
        if let Some(trigger) = self.rewind_trigger {
            if height >= trigger {
                self.rewind_trigger = None;
            }
        }

        if !events.is_empty() {
            let total_btc =
                events.iter().map(|e| e.amount).sum::<u64>() as f64 / SATS_PER_BTC;
            info!(height, events = events.len(), total_btc, "committed activity events");
            let _ = self.events_tx.send(events);
        }
        Ok(())
    }

    async fn commit_with_backoff(
        &self,
        height: u64,
        hash: &str,
        events: &[ActivityEvent],
    ) -> Result<(), MonitorError> {
        let mut attempt = 0u32;
        loop {
            match self.db.commit_block(height, hash, events) {
                Ok(inserted) => {
                    if inserted < events.len() {
                        debug!(
                            height,
                            already_present = events.len() - inserted,
                            "re-committed block, duplicate events ignored"
                        );
                    }
                    return Ok(());
                }
                Err(e) if attempt < self.config.commit_retry_limit => {
                    attempt += 1;
                    let backoff = Duration::from_millis(250 * 2u64.pow(attempt.min(6)));
                    error!(height, attempt, "block commit failed: {e}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(MonitorError::Persistence(e)),
            }
        }
    }

    /// Best-effort address detail refresh with bounded parallelism. A refused
    /// or failed fetch skips the registry refresh but never drops the event.
    async fn refresh_details(
        &self,
        addresses: &HashSet<String>,
    ) -> HashMap<String, AddressSummary> {
        // `iter().cloned()` hands each async block an owned `String` rather than
        // a borrow of the set element. A closure returning a future that borrows
        // its `&String` argument forces a higher-ranked `FnOnce` bound rustc
        // cannot prove, which surfaces as a spurious `Send` error on the spawned
        // `run` future. Owning the address sidesteps it; behavior is unchanged.
        stream::iter(addresses.iter().cloned().map(|address| async move {
            match self
                .pool
                .address_info(&address, FetchMode::BestEffort)
                .await
            {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!(
                        address = short_addr(&address),
                        "address detail refresh skipped: {e}"
                    );
                    None
                }
            }
        }))
        .buffer_unordered(self.config.detail_fetch_concurrency.max(1))
        .filter_map(|summary| async move { summary })
        .map(|summary| (summary.address.clone(), summary))
        .collect()
        .await
    }
}

/// All addresses referenced by any transaction input or output in the block.
fn candidate_addresses(block: &BlockData) -> HashSet<&str> {
    let mut addresses = HashSet::new();
    for tx in &block.transactions {
        for slot in tx.inputs.iter().chain(tx.outputs.iter()) {
            if let Some(address) = slot.address.as_deref() {
                addresses.insert(address);
            }
        }
    }
    addresses
}

/// One event per (transaction, matched address), amount summed over the
/// address's inputs and outputs in that transaction. Dormancy is taken from
/// the registry state *before* the post-commit refresh.
fn build_events(
    block: &BlockData,
    matched: &HashSet<String>,
    registry: &WatchedAddressRegistry,
) -> Vec<ActivityEvent> {
    let mut events = Vec::new();
    for tx in &block.transactions {
        let mut moved: HashMap<&str, u64> = HashMap::new();
        for slot in tx.inputs.iter().chain(tx.outputs.iter()) {
            if let Some(address) = slot.address.as_deref() {
                if matched.contains(address) {
                    *moved.entry(address).or_insert(0) += slot.value;
                }
            }
        }
        let mut moved: Vec<(&str, u64)> = moved.into_iter().collect();
        moved.sort();
        for (address, amount) in moved {
            let dormancy = registry
                .get(address)
                .map(|w| w.dormancy_days(block.time))
                .unwrap_or(0);
            events.push(ActivityEvent {
                address: address.to_string(),
                tx_id: tx.txid.clone(),
                block_height: block.height,
                amount,
                observed_at: block.time,
                dormancy_days_at_event: dormancy,
            });
        }
    }
    events
}
