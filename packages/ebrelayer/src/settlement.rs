//! Settlement hand-off for certified records
//!
//! Every Certified prophecy or withdraw request is published to a
//! [`Broadcaster`] exactly once per store: the [`SettlementGate`] writes a
//! `settled/` marker after a successful publish and skips any record that
//! already carries one.

use async_trait::async_trait;
use peggy_core::keccak256;
use peggy_core::oracle::prophecy::Prophecy;
use peggy_core::oracle::KeyedLocks;
use peggy_core::store::{namespaced_key, StateStore, SETTLED_PREFIX};
use peggy_core::MultisigBundle;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bounded_cache::{BoundedCache, DEFAULT_SETTLED_CACHE_SIZE, DEFAULT_SETTLED_CACHE_TTL_SECS};
use crate::metrics;

/// A certified record ready for the destination chain
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Settlement {
    /// Ethereum -> Cosmos: mint or unlock on the Cosmos side
    Prophecy { prophecy: Prophecy },
    /// Cosmos -> Ethereum: multisig bundle for `submitWithdraw`
    Withdraw { bundle: MultisigBundle },
}

impl Settlement {
    pub fn kind(&self) -> &'static str {
        match self {
            Settlement::Prophecy { .. } => "prophecy",
            Settlement::Withdraw { .. } => "withdraw",
        }
    }

    pub fn id(&self) -> [u8; 32] {
        match self {
            Settlement::Prophecy { prophecy } => prophecy.id,
            Settlement::Withdraw { bundle } => bundle.withdraw_id.0,
        }
    }

    fn marker_key(&self) -> Vec<u8> {
        let mut id = Vec::with_capacity(self.kind().len() + 1 + 32);
        id.extend_from_slice(self.kind().as_bytes());
        id.push(b'/');
        id.extend_from_slice(&self.id());
        namespaced_key(SETTLED_PREFIX, &id)
    }
}

/// Downstream consumer of certified records
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, settlement: &Settlement) -> eyre::Result<()>;
}

/// Logs settlements; used when no settlement endpoint is configured
#[derive(Debug, Default)]
pub struct LogBroadcaster;

#[async_trait]
impl Broadcaster for LogBroadcaster {
    async fn publish(&self, settlement: &Settlement) -> eyre::Result<()> {
        match settlement {
            Settlement::Prophecy { prophecy } => info!(
                claim_id = %hex::encode(prophecy.id),
                receiver = %prophecy.payload.receiver,
                symbol = %prophecy.payload.symbol,
                amount = %prophecy.payload.amount,
                signatures = prophecy.signatures.len(),
                "Prophecy certified"
            ),
            Settlement::Withdraw { bundle } => info!(
                withdraw_id = %bundle.withdraw_id,
                destination = %hex::encode(bundle.destination),
                denom = %bundle.coin.denom,
                amount = %bundle.coin.amount,
                signers = bundle.signers.len(),
                "Withdraw bundle ready"
            ),
        }
        Ok(())
    }
}

/// POSTs each settlement as JSON
pub struct HttpBroadcaster {
    url: String,
    client: Client,
}

impl HttpBroadcaster {
    pub fn new(url: impl Into<String>, timeout: Duration) -> eyre::Result<Self> {
        Ok(Self {
            url: url.into(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl Broadcaster for HttpBroadcaster {
    async fn publish(&self, settlement: &Settlement) -> eyre::Result<()> {
        self.client
            .post(&self.url)
            .json(settlement)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Publishes each certified record at most once per store
pub struct SettlementGate {
    store: Arc<dyn StateStore>,
    broadcaster: Arc<dyn Broadcaster>,
    settled: Mutex<BoundedCache<Vec<u8>>>,
    in_flight: KeyedLocks,
}

impl SettlementGate {
    pub fn new(store: Arc<dyn StateStore>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            settled: Mutex::new(BoundedCache::new(
                DEFAULT_SETTLED_CACHE_SIZE,
                DEFAULT_SETTLED_CACHE_TTL_SECS,
            )),
            in_flight: KeyedLocks::new(),
        }
    }

    pub async fn is_settled(&self, settlement: &Settlement) -> eyre::Result<bool> {
        let key = settlement.marker_key();
        if self.settled.lock().await.contains(&key) {
            return Ok(true);
        }
        Ok(self.store.get(&key).await?.is_some())
    }

    /// Publish unless already settled. Returns whether a publish happened.
    ///
    /// Racing notifications for one record serialize on that record's key;
    /// different records publish concurrently.
    pub async fn settle(&self, settlement: &Settlement) -> eyre::Result<bool> {
        let key = settlement.marker_key();
        let _guard = self.in_flight.lock(keccak256(&key)).await;

        if self.is_settled(settlement).await? {
            self.settled.lock().await.insert(key);
            return Ok(false);
        }

        let kind = settlement.kind();
        if let Err(e) = self.broadcaster.publish(settlement).await {
            metrics::record_settlement(kind, false);
            return Err(e);
        }
        metrics::record_settlement(kind, true);

        let stamp = chrono::Utc::now().timestamp().to_be_bytes().to_vec();
        self.store.set(&key, stamp).await?;
        self.settled.lock().await.insert(key);
        debug!(kind, id = %hex::encode(settlement.id()), "Settlement published");
        Ok(true)
    }
}
