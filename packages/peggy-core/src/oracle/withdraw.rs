//! Withdraw requests: validator co-signatures for Cosmos -> Ethereum releases
//!
//! Validators build a [`WithdrawPayload`] locally from a withdrawal intent on
//! the Cosmos chain and sign its hash. Once a supermajority has signed, the
//! record is exported as a [`MultisigBundle`] carrying ready-to-send calldata
//! for the bridge contract's `submitWithdraw`.

use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::sol_types::SolCall;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use super::{AddOutcome, AggregateError, Aggregation, AggregationSummary, Aggregator, Payload, Supermajority};
use crate::contracts::submitWithdrawCall;
use crate::hash::{address_to_bytes32, append_dynamic, compute_withdraw_id, keccak256, u128_word, u64_word};
use crate::registry::ValidatorRegistry;
use crate::store::{StateStore, WITHDRAW_PREFIX};
use crate::types::{hex_array, hex_bytes, Coin, Power, ValidatorId, ValidatorSignature, WithdrawId};

/// Stateless withdraw request validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WithdrawError {
    #[error("invalid ethereum address: {0}")]
    InvalidEthereumAddress(String),

    #[error("invalid coin denom '{0}'")]
    InvalidCoin(String),

    #[error("zero value withdraw")]
    ZeroValueWithdraw,

    #[error("withdraw id {got} does not match nonce {nonce} on chain '{chain_id}'")]
    IdMismatch {
        got: WithdrawId,
        nonce: u64,
        chain_id: String,
    },
}

/// Cosmos denoms: a letter followed by 2 to 15 letters or digits
pub fn is_valid_denom(denom: &str) -> bool {
    let bytes = denom.as_bytes();
    (3..=16).contains(&bytes.len())
        && bytes[0].is_ascii_alphabetic()
        && bytes[1..].iter().all(u8::is_ascii_alphanumeric)
}

/// What validators co-sign for one withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawPayload {
    pub id: WithdrawId,
    /// Ethereum recipient
    #[serde(with = "hex_array")]
    pub destination: [u8; 20],
    pub coin: Coin,
    /// Withdrawal intent nonce on the Cosmos chain
    pub nonce: u64,
}

impl WithdrawPayload {
    pub fn new(cosmos_chain_id: &str, destination: [u8; 20], coin: Coin, nonce: u64) -> Self {
        Self {
            id: compute_withdraw_id(cosmos_chain_id, nonce),
            destination,
            coin,
            nonce,
        }
    }

    /// `abi.encode(bytes32 id, address destination, string denom, uint256 amount, uint64 nonce)`
    pub fn canonical_bytes(&self) -> Vec<u8> {
        const HEAD_WORDS: usize = 5;
        let mut out = Vec::with_capacity(HEAD_WORDS * 32 + 64);
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&address_to_bytes32(&self.destination));
        out.extend_from_slice(&u64_word((HEAD_WORDS * 32) as u64));
        out.extend_from_slice(&u128_word(self.coin.amount));
        out.extend_from_slice(&u64_word(self.nonce));
        append_dynamic(&mut out, self.coin.denom.as_bytes());
        out
    }
}

impl Payload for WithdrawPayload {
    fn payload_hash(&self) -> [u8; 32] {
        keccak256(&self.canonical_bytes())
    }

    fn validate_basic(&self) -> Result<(), AggregateError> {
        if self.destination == [0u8; 20] {
            return Err(WithdrawError::InvalidEthereumAddress(
                crate::address_codec::encode_evm_address(&self.destination),
            )
            .into());
        }
        if !is_valid_denom(&self.coin.denom) {
            return Err(WithdrawError::InvalidCoin(self.coin.denom.clone()).into());
        }
        if self.coin.is_zero() {
            return Err(WithdrawError::ZeroValueWithdraw.into());
        }
        Ok(())
    }
}

/// Certified withdraw request
pub type WithdrawRequest = Aggregation<WithdrawPayload>;

/// Ready-to-broadcast multisignature bundle for the Ethereum bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigBundle {
    pub withdraw_id: WithdrawId,
    #[serde(with = "hex_array")]
    pub message_hash: [u8; 32],
    #[serde(with = "hex_array")]
    pub destination: [u8; 20],
    pub coin: Coin,
    pub nonce: u64,
    /// Signers in ascending validator id order, matching `signatures`
    pub signers: Vec<ValidatorId>,
    pub signatures: Vec<HexSignature>,
    pub signed_power: Power,
    pub total_power: Power,
    /// ABI-encoded `submitWithdraw` call
    #[serde(with = "hex_bytes")]
    pub calldata: Vec<u8>,
}

/// One 65-byte signature, hex encoded in JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexSignature(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl MultisigBundle {
    pub fn from_request(request: &WithdrawRequest) -> Self {
        let payload = &request.payload;
        // BTreeMap iteration is ascending by validator id
        let signers: Vec<ValidatorId> = request.signatures.keys().copied().collect();
        let raw: Vec<Vec<u8>> = request
            .signatures
            .values()
            .map(|s| s.signature.clone())
            .collect();

        let calldata = submitWithdrawCall {
            withdrawId: FixedBytes::from(*payload.id.as_bytes()),
            destination: Address::from(payload.destination),
            denom: payload.coin.denom.clone(),
            amount: U256::from(payload.coin.amount),
            nonce: payload.nonce,
            signatures: raw.iter().map(|s| Bytes::from(s.clone())).collect(),
        }
        .abi_encode();

        Self {
            withdraw_id: payload.id,
            message_hash: request.payload_hash,
            destination: payload.destination,
            coin: payload.coin.clone(),
            nonce: payload.nonce,
            signers,
            signatures: raw.into_iter().map(HexSignature).collect(),
            signed_power: request.accumulated_power,
            total_power: request.total_power,
            calldata,
        }
    }
}

/// Result of [`WithdrawAggregator::add_withdraw_signature`]
#[derive(Debug, Clone)]
pub struct WithdrawOutcome {
    pub outcome: AddOutcome<WithdrawPayload>,
    /// Present only on the submission that certified the request
    pub bundle: Option<MultisigBundle>,
}

/// Aggregates withdraw co-signatures per [`WithdrawId`]
pub struct WithdrawAggregator {
    cosmos_chain_id: String,
    inner: Aggregator<WithdrawPayload>,
}

impl WithdrawAggregator {
    pub fn new(
        cosmos_chain_id: impl Into<String>,
        store: Arc<dyn StateStore>,
        registry: Arc<dyn ValidatorRegistry>,
        threshold: Supermajority,
    ) -> Self {
        Self {
            cosmos_chain_id: cosmos_chain_id.into(),
            inner: Aggregator::new("withdraw", WITHDRAW_PREFIX, store, registry, threshold),
        }
    }

    pub fn cosmos_chain_id(&self) -> &str {
        &self.cosmos_chain_id
    }

    pub async fn add_withdraw_signature(
        &self,
        request: WithdrawPayload,
        signature: ValidatorSignature,
        height: u64,
    ) -> Result<WithdrawOutcome, AggregateError> {
        let expected = compute_withdraw_id(&self.cosmos_chain_id, request.nonce);
        if request.id != expected {
            return Err(WithdrawError::IdMismatch {
                got: request.id,
                nonce: request.nonce,
                chain_id: self.cosmos_chain_id.clone(),
            }
            .into());
        }

        let outcome = self.inner.add(request.id.0, request, signature, height).await?;
        let bundle = outcome.certified.as_ref().map(MultisigBundle::from_request);
        Ok(WithdrawOutcome { outcome, bundle })
    }

    pub async fn query(&self, id: &WithdrawId) -> Result<Option<AggregationSummary<WithdrawPayload>>, AggregateError> {
        self.inner.query(&id.0).await
    }

    pub async fn get(&self, id: &WithdrawId) -> Result<Option<WithdrawRequest>, AggregateError> {
        self.inner.get(&id.0).await
    }

    /// Bundle for an already Certified request
    pub async fn export_bundle(&self, id: &WithdrawId) -> Result<Option<MultisigBundle>, AggregateError> {
        Ok(self
            .inner
            .get(&id.0)
            .await?
            .filter(|r| r.status == crate::types::Status::Certified)
            .map(|r| MultisigBundle::from_request(&r)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WithdrawRequest> {
        self.inner.subscribe()
    }

    pub async fn recover_pending(&self) -> Result<usize, AggregateError> {
        self.inner.recover_pending().await
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }
}
