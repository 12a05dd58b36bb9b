//! Source chain watcher
//!
//! Scans confirmed blocks in strictly ascending height order, picks out
//! transactions that call the bridge contract's `lock` or `burn`, and hands
//! each block's matches to an [`EventSink`]. The watermark (highest fully
//! processed height) is persisted only after the sink accepted the block, so
//! a crash replays at most the block that was in flight.

use async_trait::async_trait;
use peggy_core::store::{namespaced_key, StateStore, StoreError, WATERMARK_PREFIX};
use peggy_core::{EventKind, RawEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics;
use crate::retry::{Backoff, RetryConfig};
use crate::rpc::{ChainBlock, ChainReadError, SourceChain};

/// Consumer of matched events, one confirmed block at a time.
///
/// Returning an error makes the watcher retry the same block later.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle_block(&self, height: u64, events: Vec<RawEvent>) -> eyre::Result<()>;
}

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("chain read failed: {0}")]
    ChainRead(#[from] ChainReadError),

    #[error("watermark store failed: {0}")]
    Store(#[from] StoreError),

    #[error("event sink rejected block {height}: {reason}")]
    Sink { height: u64, reason: String },
}

/// Static watcher parameters
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub chain_id: u64,
    pub bridge_contract: [u8; 20],
    pub lock_selector: [u8; 4],
    pub burn_selector: [u8; 4],
    pub confirmation_depth: u64,
    pub poll_interval: Duration,
    pub start_block: Option<u64>,
    pub retry: RetryConfig,
}

impl WatcherSettings {
    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        Ok(Self {
            chain_id: config.evm.chain_id,
            bridge_contract: config.evm.bridge_bytes()?,
            lock_selector: config.evm.lock_selector,
            burn_selector: config.evm.burn_selector,
            confirmation_depth: config.watcher.confirmation_depth,
            poll_interval: config.watcher.poll_interval(),
            start_block: config.watcher.start_block,
            retry: RetryConfig::from_watcher(&config.watcher),
        })
    }
}

fn watermark_key(chain_id: u64) -> Vec<u8> {
    namespaced_key(WATERMARK_PREFIX, chain_id.to_string().as_bytes())
}

/// Highest fully processed height of `chain_id`, stored big-endian
pub async fn load_watermark(store: &dyn StateStore, chain_id: u64) -> Result<Option<u64>, StoreError> {
    let key = watermark_key(chain_id);
    match store.get(&key).await? {
        None => Ok(None),
        Some(raw) => {
            let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| StoreError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: format!("watermark must be 8 bytes, got {}", raw.len()),
            })?;
            Ok(Some(u64::from_be_bytes(bytes)))
        }
    }
}

/// Watches one source chain
pub struct ChainWatcher {
    settings: WatcherSettings,
    chain: Arc<dyn SourceChain>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn EventSink>,
    chain_label: String,
    /// Next height to scan, once known
    next_height: Option<u64>,
}

impl ChainWatcher {
    pub fn new(
        settings: WatcherSettings,
        chain: Arc<dyn SourceChain>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let chain_label = settings.chain_id.to_string();
        Self {
            settings,
            chain,
            store,
            sink,
            chain_label,
            next_height: None,
        }
    }

    fn watermark_key(&self) -> Vec<u8> {
        watermark_key(self.settings.chain_id)
    }

    /// Highest fully processed height, if any block was ever processed
    pub async fn watermark(&self) -> Result<Option<u64>, StoreError> {
        load_watermark(self.store.as_ref(), self.settings.chain_id).await
    }

    async fn store_watermark(&self, height: u64) -> Result<(), StoreError> {
        self.store
            .set(&self.watermark_key(), height.to_be_bytes().to_vec())
            .await
    }

    /// Resolve the first height to scan: after the watermark, else the
    /// configured start block, else the current confirmed tip.
    async fn resolve_start(&self, head: u64) -> Result<u64, StoreError> {
        if let Some(mark) = self.watermark().await? {
            return Ok(mark.saturating_add(1));
        }
        Ok(self
            .settings
            .start_block
            .unwrap_or_else(|| head.saturating_sub(self.settings.confirmation_depth)))
    }

    /// Bridge calls in `block`, in transaction order
    pub fn match_events(&self, block: &ChainBlock) -> Vec<RawEvent> {
        block
            .transactions
            .iter()
            .filter(|tx| tx.to == Some(self.settings.bridge_contract))
            .filter_map(|tx| {
                let selector = tx.input.get(..4)?;
                let kind = if selector == self.settings.lock_selector {
                    EventKind::Lock
                } else if selector == self.settings.burn_selector {
                    EventKind::Burn
                } else {
                    return None;
                };
                Some(RawEvent {
                    kind,
                    tx_hash: tx.hash,
                    block_height: block.height,
                    tx_index: tx.index,
                    from: tx.from,
                    input: tx.input.clone(),
                })
            })
            .collect()
    }

    /// Scan every block that is confirmed but not yet processed.
    ///
    /// Returns the number of blocks processed. On error the watermark stays at
    /// the last block the sink accepted.
    pub async fn poll_once(&mut self) -> Result<u64, WatcherError> {
        self.scan(None).await
    }

    /// Like [`Self::poll_once`], but stops between blocks once `shutdown` is set
    async fn scan(&mut self, shutdown: Option<&watch::Receiver<bool>>) -> Result<u64, WatcherError> {
        let head = self.chain.head_height().await?;
        let next = match self.next_height {
            Some(h) => h,
            None => {
                let start = self.resolve_start(head).await?;
                info!(chain_id = self.settings.chain_id, start, head, "Watcher starting");
                self.next_height = Some(start);
                start
            }
        };

        let depth = self.settings.confirmation_depth;
        let mut height = next;
        let mut processed = 0;
        // height h is confirmed once head >= h + depth
        while head >= height.saturating_add(depth) {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                info!(next = height, head, "Shutdown requested; leaving backlog for restart");
                break;
            }
            let block = self.chain.block(height).await?;
            let events = self.match_events(&block);
            for event in &events {
                metrics::record_event_matched(&self.chain_label, event.kind.as_str());
            }
            if !events.is_empty() {
                debug!(height, matched = events.len(), "Matched bridge calls");
            }

            self.sink
                .handle_block(height, events)
                .await
                .map_err(|e| WatcherError::Sink {
                    height,
                    reason: e.to_string(),
                })?;

            self.store_watermark(height).await?;
            metrics::record_block_scanned(&self.chain_label, height);
            processed += 1;
            height += 1;
            self.next_height = Some(height);
        }

        Ok(processed)
    }

    /// Poll until `shutdown` flips to true.
    ///
    /// Failed polls back off exponentially; the block in flight is retried.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        let mut backoff = Backoff::new(self.settings.retry.clone());
        info!(
            chain_id = self.settings.chain_id,
            bridge = %hex::encode(self.settings.bridge_contract),
            confirmation_depth = self.settings.confirmation_depth,
            "Chain watcher running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.scan(Some(&shutdown)).await {
                Ok(processed) => {
                    backoff.reset();
                    metrics::set_consecutive_failures(&self.chain_label, 0);
                    metrics::record_successful_poll(&self.chain_label);
                    if processed > 0 {
                        debug!(processed, next = ?self.next_height, "Poll complete");
                    }
                    self.settings.poll_interval
                }
                Err(e) => {
                    if matches!(e, WatcherError::ChainRead(_)) {
                        metrics::record_chain_read_error(&self.chain_label);
                    }
                    let delay = backoff.next_delay();
                    metrics::set_consecutive_failures(&self.chain_label, backoff.attempts());
                    if let WatcherError::Store(_) = e {
                        error!(error = %e, retry_in = ?delay, "Watcher poll failed");
                    } else {
                        warn!(error = %e, retry_in = ?delay, attempt = backoff.attempts(), "Watcher poll failed");
                    }
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(chain_id = self.settings.chain_id, watermark = ?self.next_height.and_then(|h| h.checked_sub(1)), "Chain watcher stopped");
        Ok(())
    }
}
