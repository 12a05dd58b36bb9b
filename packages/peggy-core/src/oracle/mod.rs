//! Vote aggregation
//!
//! [`Aggregator`] is the keyed voting state machine shared by prophecies
//! (observed Ethereum events) and withdraw requests (Cosmos-side withdrawals
//! co-signed by validators):
//!
//! ```text
//! (none) --first valid signature--> Pending --supermajority--> Certified
//!                                      |
//!                                      +------timeout sweep--> Failed
//! ```
//!
//! Every submission for a key runs load, check, persist under that key's lock,
//! so the Certified transition happens at most once per key no matter how many
//! submissions race. The supermajority denominator is the total power of the
//! validator set at the height of the first accepted signature, pinned in the
//! record for its whole life.

pub mod keyed_lock;
pub mod prophecy;
pub mod withdraw;

pub use keyed_lock::KeyedLocks;
pub use prophecy::ProphecyAggregator;
pub use withdraw::{MultisigBundle, WithdrawAggregator, WithdrawError, WithdrawPayload};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::registry::{RegistryError, ValidatorRegistry};
use crate::signer::{verify_signature, SignatureError};
use crate::store::{namespaced_key, StateStore, StoreError};
use crate::types::{hex_array, Power, Status, ValidatorId, ValidatorSignature};

/// Capacity of the certification notification channel
const NOTIFY_CAPACITY: usize = 1024;

/// Something validators vote on
pub trait Payload:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Hash that validators sign
    fn payload_hash(&self) -> [u8; 32];

    /// Stateless checks run before any state is touched
    fn validate_basic(&self) -> Result<(), AggregateError> {
        Ok(())
    }
}

/// Certification threshold as a fraction of total power.
///
/// Reached when `accumulated * denominator > total * numerator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supermajority {
    pub numerator: u64,
    pub denominator: u64,
}

impl Default for Supermajority {
    fn default() -> Self {
        Self {
            numerator: 2,
            denominator: 3,
        }
    }
}

impl Supermajority {
    pub fn new(numerator: u64, denominator: u64) -> Result<Self, String> {
        if numerator == 0 || denominator == 0 || numerator >= denominator {
            return Err(format!(
                "supermajority must satisfy 0 < numerator < denominator, got {}/{}",
                numerator, denominator
            ));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Parse `"num/den"`
    pub fn parse(s: &str) -> Result<Self, String> {
        let (num, den) = s
            .split_once('/')
            .ok_or_else(|| format!("expected 'num/den', got '{}'", s))?;
        let num = num.trim().parse().map_err(|e| format!("numerator: {}", e))?;
        let den = den.trim().parse().map_err(|e| format!("denominator: {}", e))?;
        Self::new(num, den)
    }

    pub fn is_reached(&self, accumulated: Power, total: Power) -> bool {
        if total == 0 {
            return false;
        }
        (accumulated as u128) * (self.denominator as u128)
            > (total as u128) * (self.numerator as u128)
    }
}

impl fmt::Display for Supermajority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Per-submission failures. None of these mutate stored state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("validator {validator} is not in the validator set at height {height}")]
    UnknownValidator { validator: ValidatorId, height: u64 },

    #[error("validator {validator} already signed a different payload")]
    Equivocation { validator: ValidatorId },

    #[error("payload from validator {validator} does not match the recorded payload")]
    PayloadMismatch { validator: ValidatorId },

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("invalid withdraw request: {0}")]
    InvalidWithdraw(#[from] WithdrawError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AggregateError {
    /// Short label for metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            AggregateError::UnknownValidator { .. } => "unknown_validator",
            AggregateError::Equivocation { .. } => "equivocation",
            AggregateError::PayloadMismatch { .. } => "payload_mismatch",
            AggregateError::InvalidSignature(_) => "invalid_signature",
            AggregateError::InvalidWithdraw(_) => "invalid_withdraw",
            AggregateError::Registry(_) => "registry",
            AggregateError::Store(_) => "store",
            AggregateError::Serialization(_) => "serialization",
        }
    }

    /// Errors that indicate a broken process rather than a bad submission
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AggregateError::Store(_) | AggregateError::Serialization(_)
        )
    }
}

/// What happened to an accepted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// New signature counted
    Recorded,
    /// Same validator, same payload: no-op
    Duplicate,
    /// Record already Certified or Failed: no-op
    AlreadyFinal,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Recorded => "recorded",
            Disposition::Duplicate => "duplicate",
            Disposition::AlreadyFinal => "already_final",
        }
    }
}

/// Persisted aggregation record for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
pub struct Aggregation<P> {
    #[serde(with = "hex_array")]
    pub id: [u8; 32],
    /// First-seen payload; authoritative for the life of the record
    pub payload: P,
    #[serde(with = "hex_array")]
    pub payload_hash: [u8; 32],
    /// Height whose validator set supplies every signer's power and the total
    pub pinned_height: u64,
    pub total_power: Power,
    /// One signature per validator, all over `payload_hash`
    pub signatures: BTreeMap<ValidatorId, ValidatorSignature>,
    pub accumulated_power: Power,
    pub status: Status,
}

impl<P: Payload> Aggregation<P> {
    pub fn summary(&self) -> AggregationSummary<P> {
        AggregationSummary {
            id: self.id,
            status: self.status,
            accumulated_power: self.accumulated_power,
            total_power: self.total_power,
            signature_count: self.signatures.len(),
            pinned_height: self.pinned_height,
            payload: self.payload.clone(),
        }
    }
}

/// Query view of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "P: Payload")]
pub struct AggregationSummary<P> {
    #[serde(with = "hex_array")]
    pub id: [u8; 32],
    pub status: Status,
    pub accumulated_power: Power,
    pub total_power: Power,
    pub signature_count: usize,
    pub pinned_height: u64,
    pub payload: P,
}

/// Result of an accepted submission
#[derive(Debug, Clone)]
pub struct AddOutcome<P> {
    pub status: Status,
    pub disposition: Disposition,
    pub accumulated_power: Power,
    pub total_power: Power,
    /// Full record, present only on the submission that certified it
    pub certified: Option<Aggregation<P>>,
}

/// Keyed vote aggregator over a durable store
pub struct Aggregator<P: Payload> {
    kind: &'static str,
    prefix: &'static [u8],
    store: Arc<dyn StateStore>,
    registry: Arc<dyn ValidatorRegistry>,
    threshold: Supermajority,
    locks: KeyedLocks,
    pending: Mutex<HashSet<[u8; 32]>>,
    notify: broadcast::Sender<Aggregation<P>>,
}

impl<P: Payload> Aggregator<P> {
    pub fn new(
        kind: &'static str,
        prefix: &'static [u8],
        store: Arc<dyn StateStore>,
        registry: Arc<dyn ValidatorRegistry>,
        threshold: Supermajority,
    ) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            kind,
            prefix,
            store,
            registry,
            threshold,
            locks: KeyedLocks::new(),
            pending: Mutex::new(HashSet::new()),
            notify,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn threshold(&self) -> Supermajority {
        self.threshold
    }

    /// Receive one message per key when it becomes Certified
    pub fn subscribe(&self) -> broadcast::Receiver<Aggregation<P>> {
        self.notify.subscribe()
    }

    fn key(&self, id: &[u8; 32]) -> Vec<u8> {
        namespaced_key(self.prefix, id)
    }

    async fn load(&self, id: &[u8; 32]) -> Result<Option<Aggregation<P>>, AggregateError> {
        let Some(bytes) = self.store.get(&self.key(id)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| AggregateError::Serialization(format!("decode {}: {}", hex::encode(id), e)))
    }

    async fn persist(&self, record: &Aggregation<P>) -> Result<(), AggregateError> {
        let bytes = serde_json::to_vec(record).map_err(|e| {
            AggregateError::Serialization(format!("encode {}: {}", hex::encode(record.id), e))
        })?;
        self.store.set(&self.key(&record.id), bytes).await?;
        Ok(())
    }

    fn track_pending(&self, id: [u8; 32], pending: bool) {
        let mut set = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    /// Merge one validator's signature for `id`.
    ///
    /// `height` selects the validator set used to admit the signer and, for the
    /// first accepted signature, the set pinned into the new record.
    pub async fn add(
        &self,
        id: [u8; 32],
        payload: P,
        mut signature: ValidatorSignature,
        height: u64,
    ) -> Result<AddOutcome<P>, AggregateError> {
        let _guard = self.locks.lock(id).await;

        let existing = self.load(&id).await?;

        if let Some(record) = &existing {
            if record.status.is_terminal() {
                debug!(
                    kind = self.kind,
                    id = %hex::encode(id),
                    validator = %signature.validator,
                    status = %record.status,
                    "Submission after terminal status ignored"
                );
                return Ok(AddOutcome {
                    status: record.status,
                    disposition: Disposition::AlreadyFinal,
                    accumulated_power: record.accumulated_power,
                    total_power: record.total_power,
                    certified: None,
                });
            }
        }

        payload.validate_basic()?;
        let payload_hash = payload.payload_hash();
        verify_signature(&signature, &payload_hash)?;

        let validator = signature.validator;
        let set = self.registry.current_set(height).await?;
        let submitted_power = set
            .power_of(&validator)
            .ok_or(AggregateError::UnknownValidator { validator, height })?;

        let mut record = match existing {
            None => Aggregation {
                id,
                payload,
                payload_hash,
                pinned_height: height,
                total_power: set.total_power(),
                signatures: BTreeMap::new(),
                accumulated_power: 0,
                status: Status::Pending,
            },
            Some(record) => {
                if record.signatures.contains_key(&validator) {
                    if record.payload_hash != payload_hash {
                        warn!(
                            kind = self.kind,
                            id = %hex::encode(id),
                            validator = %validator,
                            "Equivocation: validator signed a different payload"
                        );
                        return Err(AggregateError::Equivocation { validator });
                    }
                    return Ok(AddOutcome {
                        status: record.status,
                        disposition: Disposition::Duplicate,
                        accumulated_power: record.accumulated_power,
                        total_power: record.total_power,
                        certified: None,
                    });
                }
                if record.payload_hash != payload_hash {
                    warn!(
                        kind = self.kind,
                        id = %hex::encode(id),
                        validator = %validator,
                        "Payload mismatch against recorded payload"
                    );
                    return Err(AggregateError::PayloadMismatch { validator });
                }
                record
            }
        };

        // Power always comes from the pinned snapshot
        let power = if record.pinned_height == height {
            submitted_power
        } else {
            self.registry
                .current_set(record.pinned_height)
                .await?
                .power_of(&validator)
                .ok_or(AggregateError::UnknownValidator {
                    validator,
                    height: record.pinned_height,
                })?
        };

        signature.power = power;
        record.signatures.insert(validator, signature);
        record.accumulated_power = record.accumulated_power.saturating_add(power);

        let newly_certified = self
            .threshold
            .is_reached(record.accumulated_power, record.total_power);
        if newly_certified {
            record.status = Status::Certified;
        }

        self.persist(&record).await?;
        self.track_pending(id, !newly_certified);

        debug!(
            kind = self.kind,
            id = %hex::encode(id),
            validator = %validator,
            power,
            accumulated = record.accumulated_power,
            total = record.total_power,
            "Signature recorded"
        );

        let certified = if newly_certified {
            info!(
                kind = self.kind,
                id = %hex::encode(id),
                accumulated = record.accumulated_power,
                total = record.total_power,
                signatures = record.signatures.len(),
                threshold = %self.threshold,
                "Certified"
            );
            // No receivers is fine; the outcome is also returned to the caller
            let _ = self.notify.send(record.clone());
            Some(record.clone())
        } else {
            None
        };

        Ok(AddOutcome {
            status: record.status,
            disposition: Disposition::Recorded,
            accumulated_power: record.accumulated_power,
            total_power: record.total_power,
            certified,
        })
    }

    /// Full record for `id`
    pub async fn get(&self, id: &[u8; 32]) -> Result<Option<Aggregation<P>>, AggregateError> {
        self.load(id).await
    }

    /// Status, power and payload for `id`
    pub async fn query(&self, id: &[u8; 32]) -> Result<Option<AggregationSummary<P>>, AggregateError> {
        Ok(self.load(id).await?.map(|r| r.summary()))
    }

    /// Move a Pending record to Failed if it was pinned at or before `cutoff_height`.
    ///
    /// Returns true when the record transitioned.
    pub async fn expire(&self, id: [u8; 32], cutoff_height: u64) -> Result<bool, AggregateError> {
        let _guard = self.locks.lock(id).await;

        let Some(mut record) = self.load(&id).await? else {
            self.track_pending(id, false);
            return Ok(false);
        };
        if record.status != Status::Pending {
            self.track_pending(id, false);
            return Ok(false);
        }
        if record.pinned_height > cutoff_height {
            return Ok(false);
        }

        record.status = Status::Failed;
        self.persist(&record).await?;
        self.track_pending(id, false);

        info!(
            kind = self.kind,
            id = %hex::encode(id),
            pinned_height = record.pinned_height,
            accumulated = record.accumulated_power,
            total = record.total_power,
            "Expired without supermajority"
        );
        Ok(true)
    }

    /// Fail every Pending record pinned at or before `cutoff_height`
    pub async fn sweep_expired(&self, cutoff_height: u64) -> Result<Vec<[u8; 32]>, AggregateError> {
        let candidates: Vec<[u8; 32]> = {
            let set = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            set.iter().copied().collect()
        };

        let mut expired = Vec::new();
        for id in candidates {
            if self.expire(id, cutoff_height).await? {
                expired.push(id);
            }
        }
        Ok(expired)
    }

    /// Rebuild the in-memory pending index from the store.
    ///
    /// Called once at startup so the timeout sweep covers records created
    /// before a restart.
    pub async fn recover_pending(&self) -> Result<usize, AggregateError> {
        let keys = self.store.keys_with_prefix(self.prefix).await?;
        let mut count = 0;
        for key in keys {
            let raw = &key[self.prefix.len()..];
            if raw.len() != 32 {
                continue;
            }
            let mut id = [0u8; 32];
            id.copy_from_slice(raw);
            if let Some(record) = self.load(&id).await? {
                if record.status == Status::Pending {
                    self.track_pending(id, true);
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Number of records known to be Pending
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for aggregator tests

    use super::*;
    use crate::registry::{StaticRegistry, ValidatorPower};
    use crate::signer::{ClaimSigner, LocalKeySigner};
    use k256::ecdsa::SigningKey;

    /// Deterministic signer from a small seed
    pub fn signer(seed: u8) -> LocalKeySigner {
        let mut bytes = [0u8; 32];
        bytes[31] = seed;
        bytes[0] = 0x11;
        let key = SigningKey::from_slice(&bytes).expect("valid test key");
        LocalKeySigner::from_signing_key(key)
    }

    pub fn registry_for(signers: &[&LocalKeySigner], power: Power) -> StaticRegistry {
        StaticRegistry::new(
            signers
                .iter()
                .map(|s| ValidatorPower {
                    validator: s.validator(),
                    power,
                })
                .collect(),
        )
    }
}
