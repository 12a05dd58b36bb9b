//! Common types for claim aggregation
//!
//! Identifiers, statuses and the per-validator signature record shared by the
//! prophecy and withdraw aggregators, the claim builder and the relayer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address_codec::{parse_evm_address, AddressError};

/// Voting power of a validator (or a sum of validators)
pub type Power = u64;

// ============================================================================
// Identifiers
// ============================================================================

/// Parse a 0x-prefixed (or bare) hex string into exactly 32 bytes
fn parse_bytes32(hex_str: &str) -> Result<[u8; 32], AddressError> {
    let raw = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(raw).map_err(|e| AddressError::InvalidHex(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(AddressError::InvalidLength {
            expected: 32,
            got: bytes.len(),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Deterministic identifier of one observed bridge event.
///
/// Derived from (source chain id, bridge contract, event nonce) so every
/// honest validator arrives at the same key. See [`crate::hash::compute_claim_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimId(pub [u8; 32]);

impl ClaimId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, AddressError> {
        parse_bytes32(hex_str).map(ClaimId)
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifier of an outbound withdrawal request.
///
/// Derived from (Cosmos chain id, withdrawal intent nonce). See
/// [`crate::hash::compute_withdraw_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WithdrawId(pub [u8; 32]);

impl WithdrawId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, AddressError> {
        parse_bytes32(hex_str).map(WithdrawId)
    }
}

impl fmt::Display for WithdrawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Validator identity: the Ethereum address of the validator's signing key.
///
/// Ordered so signature sets and validator tables iterate deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidatorId(pub [u8; 20]);

impl ValidatorId {
    /// Create from a 0x-prefixed hex address
    pub fn from_hex(addr: &str) -> Result<Self, AddressError> {
        parse_evm_address(addr).map(ValidatorId)
    }

    pub fn as_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

/// Identifiers serialize as 0x-prefixed hex strings (usable as JSON map keys)
macro_rules! hex_string_serde {
    ($ty:ident, $to:ident) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.$to())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $ty::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_string_serde!(ClaimId, to_hex);
hex_string_serde!(WithdrawId, to_hex);
hex_string_serde!(ValidatorId, as_hex);

// ============================================================================
// Claim / request payload pieces
// ============================================================================

/// Kind of bridge event observed on the Ethereum side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Native Ethereum asset locked in the bridge (mint a pegged token on Cosmos)
    Lock,
    /// Pegged Cosmos asset burned on Ethereum (release the original on Cosmos)
    Burn,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Lock => "lock",
            EventKind::Burn => "burn",
        }
    }

    /// Stable numeric tag used in the canonical claim encoding
    pub fn tag(&self) -> u8 {
        match self {
            EventKind::Lock => 1,
            EventKind::Burn => 2,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single coin: denomination and amount in base units
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: u128,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: u128) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

// ============================================================================
// Aggregation state
// ============================================================================

/// Aggregation status of a prophecy or withdraw request.
///
/// `Certified` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Certified,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Certified => "certified",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One validator's signature over a payload hash.
///
/// `public_key` is the SEC1-compressed secp256k1 key (33 bytes), `signature`
/// is `r || s || v` (65 bytes). `power` is filled in by the aggregator from the
/// validator registry; whatever the submitter puts there is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSignature {
    pub validator: ValidatorId,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub power: Power,
}

/// Serde helper: `Vec<u8>` as a 0x-prefixed hex string
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

/// Serde helper: `[u8; N]` as a 0x-prefixed hex string
pub mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|b: Vec<u8>| {
            serde::de::Error::custom(format!("expected {} bytes, got {}", N, b.len()))
        })
    }
}
