//! Prophecies: aggregated validator claims about observed Ethereum events

use std::sync::Arc;
use tokio::sync::broadcast;

use super::{AddOutcome, AggregateError, Aggregation, AggregationSummary, Aggregator, Payload, Supermajority};
use crate::claim::Claim;
use crate::registry::ValidatorRegistry;
use crate::store::{StateStore, PROPHECY_PREFIX};
use crate::types::{ClaimId, ValidatorSignature};

impl Payload for Claim {
    fn payload_hash(&self) -> [u8; 32] {
        Claim::payload_hash(self)
    }
}

/// Certified prophecy, as delivered to subscribers
pub type Prophecy = Aggregation<Claim>;

/// Aggregates claims per [`ClaimId`]
pub struct ProphecyAggregator {
    inner: Aggregator<Claim>,
}

impl ProphecyAggregator {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<dyn ValidatorRegistry>,
        threshold: Supermajority,
    ) -> Self {
        Self {
            inner: Aggregator::new("prophecy", PROPHECY_PREFIX, store, registry, threshold),
        }
    }

    /// Merge a validator's signed claim.
    ///
    /// `height` is the height whose validator set admits the signer; the first
    /// accepted claim pins it as the record's power snapshot.
    pub async fn add_claim(
        &self,
        claim: Claim,
        signature: ValidatorSignature,
        height: u64,
    ) -> Result<AddOutcome<Claim>, AggregateError> {
        self.inner.add(claim.id.0, claim, signature, height).await
    }

    pub async fn query(&self, id: &ClaimId) -> Result<Option<AggregationSummary<Claim>>, AggregateError> {
        self.inner.query(&id.0).await
    }

    pub async fn get(&self, id: &ClaimId) -> Result<Option<Prophecy>, AggregateError> {
        self.inner.get(&id.0).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Prophecy> {
        self.inner.subscribe()
    }

    /// Fail Pending prophecies pinned at or before `cutoff_height`
    pub async fn sweep_expired(&self, cutoff_height: u64) -> Result<Vec<ClaimId>, AggregateError> {
        Ok(self
            .inner
            .sweep_expired(cutoff_height)
            .await?
            .into_iter()
            .map(ClaimId)
            .collect())
    }

    pub async fn recover_pending(&self) -> Result<usize, AggregateError> {
        self.inner.recover_pending().await
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }
}
