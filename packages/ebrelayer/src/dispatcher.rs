//! Submission routing
//!
//! Every signed claim or withdraw co-signature, whether produced by this
//! node's watcher or received over HTTP, enters through [`Dispatcher::submit`].
//! Certified records are forwarded to the [`SettlementGate`] by background
//! tasks subscribed to the aggregators.

use peggy_core::oracle::prophecy::Prophecy;
use peggy_core::oracle::withdraw::WithdrawRequest;
use peggy_core::store::{StateStore, PROPHECY_PREFIX, WITHDRAW_PREFIX};
use peggy_core::{
    AddOutcome, AggregateError, Claim, ClaimId, Disposition, MultisigBundle, Power,
    ProphecyAggregator, Status, ValidatorSignature, WithdrawAggregator, WithdrawId,
    WithdrawPayload,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::settlement::{Settlement, SettlementGate};

/// A validator's signed vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Submission {
    Claim {
        claim: Claim,
        signature: ValidatorSignature,
        /// Height whose validator set admits the signer
        height: u64,
    },
    Withdraw {
        request: WithdrawPayload,
        signature: ValidatorSignature,
        height: u64,
    },
}

impl Submission {
    pub fn kind(&self) -> &'static str {
        match self {
            Submission::Claim { .. } => "prophecy",
            Submission::Withdraw { .. } => "withdraw",
        }
    }
}

/// Acknowledgement for an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub kind: String,
    pub id: String,
    pub status: Status,
    pub disposition: Disposition,
    pub accumulated_power: Power,
    pub total_power: Power,
}

impl SubmissionReceipt {
    fn from_outcome<P>(kind: &str, id: String, outcome: &AddOutcome<P>) -> Self {
        Self {
            kind: kind.to_string(),
            id,
            status: outcome.status,
            disposition: outcome.disposition,
            accumulated_power: outcome.accumulated_power,
            total_power: outcome.total_power,
        }
    }
}

pub struct Dispatcher {
    prophecies: Arc<ProphecyAggregator>,
    withdrawals: Arc<WithdrawAggregator>,
    store: Arc<dyn StateStore>,
    gate: Arc<SettlementGate>,
}

impl Dispatcher {
    pub fn new(
        prophecies: Arc<ProphecyAggregator>,
        withdrawals: Arc<WithdrawAggregator>,
        store: Arc<dyn StateStore>,
        gate: Arc<SettlementGate>,
    ) -> Self {
        Self {
            prophecies,
            withdrawals,
            store,
            gate,
        }
    }

    pub fn prophecies(&self) -> &Arc<ProphecyAggregator> {
        &self.prophecies
    }

    pub fn withdrawals(&self) -> &Arc<WithdrawAggregator> {
        &self.withdrawals
    }

    /// Route a submission to its aggregator
    pub async fn submit(&self, submission: Submission) -> Result<SubmissionReceipt, AggregateError> {
        let kind = submission.kind();
        let result = match submission {
            Submission::Claim {
                claim,
                signature,
                height,
            } => {
                let id = claim.id.to_hex();
                self.prophecies
                    .add_claim(claim, signature, height)
                    .await
                    .map(|out| {
                        if out.certified.is_some() {
                            metrics::record_certification(kind);
                        }
                        SubmissionReceipt::from_outcome(kind, id, &out)
                    })
            }
            Submission::Withdraw {
                request,
                signature,
                height,
            } => {
                let id = request.id.to_hex();
                self.withdrawals
                    .add_withdraw_signature(request, signature, height)
                    .await
                    .map(|out| {
                        if out.bundle.is_some() {
                            metrics::record_certification(kind);
                        }
                        SubmissionReceipt::from_outcome(kind, id, &out.outcome)
                    })
            }
        };

        match &result {
            Ok(receipt) => {
                metrics::record_submission(kind, receipt.disposition.as_str());
                debug!(
                    kind,
                    id = %receipt.id,
                    status = receipt.status.as_str(),
                    disposition = receipt.disposition.as_str(),
                    accumulated_power = receipt.accumulated_power,
                    total_power = receipt.total_power,
                    "Submission accepted"
                );
            }
            Err(e) => {
                metrics::record_rejection(kind, e.reason());
                if e.is_fatal() {
                    error!(kind, error = %e, "Submission failed");
                } else {
                    warn!(kind, error = %e, "Submission rejected");
                }
            }
        }
        self.refresh_pending_gauges();
        result
    }

    fn refresh_pending_gauges(&self) {
        metrics::set_pending("prophecy", self.prophecies.pending_count());
        metrics::set_pending("withdraw", self.withdrawals.pending_count());
    }

    /// Fail Pending prophecies pinned at or before the Ethereum `cutoff_height`.
    ///
    /// Withdraw requests are pinned at Cosmos heights, which share no scale
    /// with the Ethereum watermark, so they stay Pending until certified.
    pub async fn sweep_expired(&self, cutoff_height: u64) -> Result<Vec<ClaimId>, AggregateError> {
        let expired = self.prophecies.sweep_expired(cutoff_height).await?;
        metrics::record_expired("prophecy", expired.len());
        self.refresh_pending_gauges();
        if !expired.is_empty() {
            info!(cutoff_height, prophecies = expired.len(), "Expired pending prophecies");
        }
        Ok(expired)
    }

    /// Publish every Certified record that has no settlement marker yet.
    ///
    /// Covers notifications lost to a crash or a lagging subscriber.
    pub async fn resettle_certified(&self) -> eyre::Result<usize> {
        let mut published = 0;

        for key in self.store.keys_with_prefix(PROPHECY_PREFIX).await? {
            let Some(id) = id_from_key(&key, PROPHECY_PREFIX) else {
                continue;
            };
            if let Some(record) = self.prophecies.get(&ClaimId(id)).await? {
                if record.status == Status::Certified
                    && self.gate.settle(&Settlement::Prophecy { prophecy: record }).await?
                {
                    published += 1;
                }
            }
        }

        for key in self.store.keys_with_prefix(WITHDRAW_PREFIX).await? {
            let Some(id) = id_from_key(&key, WITHDRAW_PREFIX) else {
                continue;
            };
            if let Some(bundle) = self.withdrawals.export_bundle(&WithdrawId(id)).await? {
                if self.gate.settle(&Settlement::Withdraw { bundle }).await? {
                    published += 1;
                }
            }
        }

        if published > 0 {
            info!(published, "Re-published unsettled certified records");
        }
        Ok(published)
    }

    /// Forward certification notifications to the settlement gate until shutdown
    pub fn spawn_settlement_forwarders(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let prophecy_task = forward(
            "prophecy",
            self.prophecies.subscribe(),
            self.gate.clone(),
            shutdown.clone(),
            |record: Prophecy| Settlement::Prophecy { prophecy: record },
        );
        let withdraw_task = forward(
            "withdraw",
            self.withdrawals.subscribe(),
            self.gate.clone(),
            shutdown,
            |record: WithdrawRequest| Settlement::Withdraw {
                bundle: MultisigBundle::from_request(&record),
            },
        );
        vec![prophecy_task, withdraw_task]
    }
}

fn id_from_key(key: &[u8], prefix: &[u8]) -> Option<[u8; 32]> {
    key.strip_prefix(prefix)?.try_into().ok()
}

fn forward<R, F>(
    kind: &'static str,
    mut rx: broadcast::Receiver<R>,
    gate: Arc<SettlementGate>,
    mut shutdown: watch::Receiver<bool>,
    to_settlement: F,
) -> JoinHandle<()>
where
    R: Clone + Send + 'static,
    F: Fn(R) -> Settlement + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(record) => {
                        let settlement = to_settlement(record);
                        if let Err(e) = gate.settle(&settlement).await {
                            // picked up again by the periodic resettle pass
                            warn!(kind, id = %hex::encode(settlement.id()), error = %e, "Settlement publish failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(kind, skipped, "Settlement forwarder lagged; resettle pass will catch up");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(kind, "Settlement forwarder stopped");
    })
}
