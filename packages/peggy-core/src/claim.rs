//! Claim construction from raw bridge transactions
//!
//! A [`RawEvent`] is one matched transaction handed over by the chain watcher.
//! [`ClaimBuilder`] decodes its call arguments, derives the deterministic
//! [`ClaimId`] and produces the canonical [`Claim`] every honest validator
//! computes identically for the same event.

use alloy::primitives::U256;
use alloy::sol_types::SolCall;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::address_codec::validate_cosmos_address;
use crate::contracts::lockCall;
use crate::hash::{
    address_to_bytes32, append_dynamic, compute_claim_id, keccak256, u128_word, u64_word,
};
use crate::signer::{ClaimSigner, SignatureError};
use crate::types::{hex_array, hex_bytes, ClaimId, EventKind, ValidatorSignature};

/// Bits reserved for the transaction index inside an event nonce
pub const TX_INDEX_BITS: u32 = 24;

/// Claim construction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("signing failed: {0}")]
    Signing(#[from] SignatureError),
}

/// A matched bridge transaction as emitted by the chain watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub kind: EventKind,
    #[serde(with = "hex_array")]
    pub tx_hash: [u8; 32],
    pub block_height: u64,
    pub tx_index: u64,
    /// Transaction sender
    #[serde(with = "hex_array")]
    pub from: [u8; 20],
    /// Full call data, selector included
    #[serde(with = "hex_bytes")]
    pub input: Vec<u8>,
}

impl RawEvent {
    /// Position of the transaction on the source chain: `height << 24 | tx_index`
    pub fn event_nonce(&self) -> Result<u64, ClaimError> {
        if self.tx_index >= (1 << TX_INDEX_BITS) {
            return Err(ClaimError::MalformedPayload(format!(
                "tx index {} out of range",
                self.tx_index
            )));
        }
        if self.block_height >= (1 << (64 - TX_INDEX_BITS)) {
            return Err(ClaimError::MalformedPayload(format!(
                "block height {} out of range",
                self.block_height
            )));
        }
        Ok((self.block_height << TX_INDEX_BITS) | self.tx_index)
    }
}

/// Canonical claim about one bridge event.
///
/// Immutable once built; [`Claim::canonical_bytes`] is the exact byte string
/// validators sign (via its keccak256 hash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub kind: EventKind,
    pub source_chain_id: u64,
    #[serde(with = "hex_array")]
    pub bridge_contract: [u8; 20],
    pub nonce: u64,
    #[serde(with = "hex_array")]
    pub sender: [u8; 20],
    /// bech32 Cosmos recipient
    pub receiver: String,
    pub symbol: String,
    pub amount: u128,
}

impl Claim {
    /// ABI-style encoding with a fixed field order:
    ///
    /// `(bytes32 id, uint8 kind, uint256 chainId, address bridge, uint64 nonce,
    ///   address sender, string receiver, string symbol, uint256 amount)`
    pub fn canonical_bytes(&self) -> Vec<u8> {
        const HEAD_WORDS: usize = 9;
        let mut head = Vec::with_capacity(HEAD_WORDS * 32);
        let mut tail = Vec::new();

        head.extend_from_slice(self.id.as_bytes());
        head.extend_from_slice(&u64_word(self.kind.tag() as u64));
        head.extend_from_slice(&u64_word(self.source_chain_id));
        head.extend_from_slice(&address_to_bytes32(&self.bridge_contract));
        head.extend_from_slice(&u64_word(self.nonce));
        head.extend_from_slice(&address_to_bytes32(&self.sender));

        // dynamic fields: offsets are relative to the start of the head
        head.extend_from_slice(&u64_word((HEAD_WORDS * 32 + tail.len()) as u64));
        append_dynamic(&mut tail, self.receiver.as_bytes());
        head.extend_from_slice(&u64_word((HEAD_WORDS * 32 + tail.len()) as u64));
        append_dynamic(&mut tail, self.symbol.as_bytes());

        head.extend_from_slice(&u128_word(self.amount));

        head.extend_from_slice(&tail);
        head
    }

    /// keccak256 of the canonical bytes
    pub fn payload_hash(&self) -> [u8; 32] {
        keccak256(&self.canonical_bytes())
    }
}

/// Builds canonical claims for one (source chain, bridge contract) pair
#[derive(Debug, Clone)]
pub struct ClaimBuilder {
    source_chain_id: u64,
    bridge_contract: [u8; 20],
    receiver_prefix: Option<String>,
}

impl ClaimBuilder {
    pub fn new(source_chain_id: u64, bridge_contract: [u8; 20]) -> Self {
        Self {
            source_chain_id,
            bridge_contract,
            receiver_prefix: None,
        }
    }

    /// Require Cosmos receivers to carry this bech32 prefix
    pub fn with_receiver_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.receiver_prefix = Some(prefix.into());
        self
    }

    pub fn source_chain_id(&self) -> u64 {
        self.source_chain_id
    }

    pub fn bridge_contract(&self) -> &[u8; 20] {
        &self.bridge_contract
    }

    /// Decode a matched transaction into a canonical claim.
    ///
    /// `lock` and `burn` share the `(bytes recipient, string symbol, uint256 amount)`
    /// layout; the selector has already been matched by the watcher.
    pub fn build(&self, event: &RawEvent) -> Result<Claim, ClaimError> {
        if event.input.len() < 4 {
            return Err(ClaimError::MalformedPayload(format!(
                "call data too short: {} bytes",
                event.input.len()
            )));
        }

        let args = lockCall::abi_decode_raw(&event.input[4..], true)
            .map_err(|e| ClaimError::MalformedPayload(format!("undecodable arguments: {}", e)))?;

        let receiver = String::from_utf8(args.recipient.to_vec())
            .map_err(|_| ClaimError::MalformedPayload("recipient is not UTF-8".to_string()))?;
        validate_cosmos_address(&receiver, self.receiver_prefix.as_deref())
            .map_err(|e| ClaimError::MalformedPayload(format!("recipient: {}", e)))?;

        if args.symbol.is_empty() {
            return Err(ClaimError::MalformedPayload("empty symbol".to_string()));
        }

        if args.amount.is_zero() {
            return Err(ClaimError::MalformedPayload("zero amount".to_string()));
        }
        if args.amount > U256::from(u128::MAX) {
            return Err(ClaimError::MalformedPayload(format!(
                "amount {} exceeds 128 bits",
                args.amount
            )));
        }
        let amount: u128 = args.amount.to::<u128>();

        let nonce = event.event_nonce()?;
        let id = compute_claim_id(self.source_chain_id, &self.bridge_contract, nonce);

        debug!(
            claim_id = %id,
            kind = %event.kind,
            block = event.block_height,
            tx_index = event.tx_index,
            "Built claim"
        );

        Ok(Claim {
            id,
            kind: event.kind,
            source_chain_id: self.source_chain_id,
            bridge_contract: self.bridge_contract,
            nonce,
            sender: event.from,
            receiver,
            symbol: args.symbol,
            amount,
        })
    }

    /// Sign a claim's payload hash with this validator's key
    pub fn sign(&self, claim: &Claim, signer: &dyn ClaimSigner) -> Result<ValidatorSignature, ClaimError> {
        Ok(signer.sign_hash(&claim.payload_hash())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_codec::encode_bech32_address;
    use crate::contracts::burnCall;
    use crate::signer::{verify_signature, LocalKeySigner};
    use alloy::primitives::Bytes;

    const BRIDGE: [u8; 20] = [0x42; 20];

    fn receiver() -> String {
        encode_bech32_address(&[7u8; 20], "cosmos").unwrap()
    }

    fn lock_input(recipient: &str, symbol: &str, amount: U256) -> Vec<u8> {
        lockCall {
            recipient: Bytes::from(recipient.as_bytes().to_vec()),
            symbol: symbol.to_string(),
            amount,
        }
        .abi_encode()
    }

    fn event(input: Vec<u8>) -> RawEvent {
        RawEvent {
            kind: EventKind::Lock,
            tx_hash: [1u8; 32],
            block_height: 100,
            tx_index: 3,
            from: [0xaa; 20],
            input,
        }
    }

    #[test]
    fn test_build_lock_claim() {
        let builder = ClaimBuilder::new(1, BRIDGE);
        let claim = builder
            .build(&event(lock_input(&receiver(), "eth", U256::from(1000u64))))
            .unwrap();

        assert_eq!(claim.kind, EventKind::Lock);
        assert_eq!(claim.receiver, receiver());
        assert_eq!(claim.symbol, "eth");
        assert_eq!(claim.amount, 1000);
        assert_eq!(claim.sender, [0xaa; 20]);
        assert_eq!(claim.nonce, (100 << 24) | 3);
        assert_eq!(claim.id, compute_claim_id(1, &BRIDGE, claim.nonce));
    }

    #[test]
    fn test_build_burn_claim_uses_same_layout() {
        let input = burnCall {
            recipient: Bytes::from(receiver().into_bytes()),
            symbol: "peggyatom".to_string(),
            amount: U256::from(5u64),
        }
        .abi_encode();
        let mut ev = event(input);
        ev.kind = EventKind::Burn;

        let claim = ClaimBuilder::new(1, BRIDGE).build(&ev).unwrap();
        assert_eq!(claim.kind, EventKind::Burn);
        assert_eq!(claim.symbol, "peggyatom");
    }

    #[test]
    fn test_identical_events_give_identical_claims() {
        let builder_a = ClaimBuilder::new(1, BRIDGE);
        let builder_b = ClaimBuilder::new(1, BRIDGE);
        let ev = event(lock_input(&receiver(), "eth", U256::from(1u64)));

        let a = builder_a.build(&ev).unwrap();
        let b = builder_b.build(&ev).unwrap();
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.payload_hash(), b.payload_hash());
    }

    #[test]
    fn test_canonical_bytes_change_with_any_field() {
        let builder = ClaimBuilder::new(1, BRIDGE);
        let base = builder
            .build(&event(lock_input(&receiver(), "eth", U256::from(10u64))))
            .unwrap();

        let mut other = base.clone();
        other.amount = 11;
        assert_ne!(base.payload_hash(), other.payload_hash());

        let mut other = base.clone();
        other.symbol = "eth2".to_string();
        assert_ne!(base.payload_hash(), other.payload_hash());

        let mut other = base.clone();
        other.kind = EventKind::Burn;
        assert_ne!(base.payload_hash(), other.payload_hash());
    }

    #[test]
    fn test_malformed_payloads() {
        let builder = ClaimBuilder::new(1, BRIDGE);

        let short = event(vec![0x01, 0x02]);
        assert!(matches!(builder.build(&short), Err(ClaimError::MalformedPayload(_))));

        let mut garbage = lockCall::SELECTOR.to_vec();
        garbage.extend_from_slice(&[0xffu8; 7]);
        assert!(matches!(builder.build(&event(garbage)), Err(ClaimError::MalformedPayload(_))));

        let bad_receiver = event(lock_input("not-bech32", "eth", U256::from(1u64)));
        assert!(matches!(builder.build(&bad_receiver), Err(ClaimError::MalformedPayload(_))));

        let zero = event(lock_input(&receiver(), "eth", U256::ZERO));
        assert!(matches!(builder.build(&zero), Err(ClaimError::MalformedPayload(_))));

        let huge = event(lock_input(&receiver(), "eth", U256::MAX));
        assert!(matches!(builder.build(&huge), Err(ClaimError::MalformedPayload(_))));
    }

    #[test]
    fn test_receiver_prefix_enforced() {
        let builder = ClaimBuilder::new(1, BRIDGE).with_receiver_prefix("terra");
        let ev = event(lock_input(&receiver(), "eth", U256::from(1u64)));
        assert!(matches!(builder.build(&ev), Err(ClaimError::MalformedPayload(_))));
    }

    #[test]
    fn test_tx_index_out_of_range() {
        let mut ev = event(lock_input(&receiver(), "eth", U256::from(1u64)));
        ev.tx_index = 1 << TX_INDEX_BITS;
        assert!(matches!(ev.event_nonce(), Err(ClaimError::MalformedPayload(_))));
    }

    #[test]
    fn test_sign_claim() {
        let signer = LocalKeySigner::from_private_key(
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        let builder = ClaimBuilder::new(1, BRIDGE);
        let claim = builder
            .build(&event(lock_input(&receiver(), "eth", U256::from(1u64))))
            .unwrap();

        let sig = builder.sign(&claim, &signer).unwrap();
        verify_signature(&sig, &claim.payload_hash()).unwrap();
    }
}
