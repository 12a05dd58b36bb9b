//! Validator signing and signature verification
//!
//! Validators sign the keccak256 payload hash directly (no Ethereum message
//! prefix) with secp256k1. The signature is 65 bytes `r || s || v` with
//! `v = 27 + recovery_id` so the Ethereum contract can `ecrecover` it.
//! The validator identity is the Ethereum address of the signing key:
//! `keccak256(uncompressed_public_key[1..])[12..32]`.

use alloy::signers::local::PrivateKeySigner;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

use crate::hash::keccak256;
use crate::types::{ValidatorId, ValidatorSignature};

/// Signature creation and verification errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("empty signature")]
    EmptySignature,

    #[error("malformed public key: {0}")]
    MalformedPublicKey(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("public key does not belong to validator {validator}")]
    KeyMismatch { validator: ValidatorId },

    #[error("signature does not verify for validator {validator}")]
    VerificationFailed { validator: ValidatorId },
}

/// Derive the Ethereum-style validator identity of a verifying key
pub fn validator_id_of(key: &VerifyingKey) -> ValidatorId {
    let point = key.to_encoded_point(false);
    // 0x04 || x || y
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut id = [0u8; 20];
    id.copy_from_slice(&hash[12..32]);
    ValidatorId(id)
}

/// Capability to sign payload hashes as one validator
pub trait ClaimSigner: Send + Sync {
    /// Identity this signer signs as
    fn validator(&self) -> ValidatorId;

    /// Sign a 32-byte payload hash
    fn sign_hash(&self, hash: &[u8; 32]) -> Result<ValidatorSignature, SignatureError>;
}

/// Signer backed by an in-process secp256k1 key
pub struct LocalKeySigner {
    key: SigningKey,
    validator: ValidatorId,
    public_key: Vec<u8>,
}

impl LocalKeySigner {
    /// Load from a hex private key (with or without 0x prefix)
    pub fn from_private_key(private_key: &str) -> Result<Self, SignatureError> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| SignatureError::InvalidKey(format!("{}", e)))?;
        Ok(Self::from_signing_key(signer.credential().clone()))
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        let verifying = *key.verifying_key();
        let validator = validator_id_of(&verifying);
        let public_key = verifying.to_encoded_point(true).as_bytes().to_vec();
        Self {
            key,
            validator,
            public_key,
        }
    }

    /// SEC1-compressed public key
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("validator", &self.validator)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl ClaimSigner for LocalKeySigner {
    fn validator(&self) -> ValidatorId {
        self.validator
    }

    fn sign_hash(&self, hash: &[u8; 32]) -> Result<ValidatorSignature, SignatureError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash)
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;

        let mut bytes = Vec::with_capacity(65);
        bytes.extend_from_slice(&signature.to_bytes());
        bytes.push(27 + recovery_id.to_byte());

        Ok(ValidatorSignature {
            validator: self.validator,
            public_key: self.public_key.clone(),
            signature: bytes,
            power: 0,
        })
    }
}

/// Check that `sig` was produced by the validator it names, over `hash`.
///
/// The public key must derive the claimed validator id and the `r || s`
/// part must verify against it. The trailing `v` byte is optional.
pub fn verify_signature(sig: &ValidatorSignature, hash: &[u8; 32]) -> Result<(), SignatureError> {
    if sig.signature.is_empty() {
        return Err(SignatureError::EmptySignature);
    }

    let key = VerifyingKey::from_sec1_bytes(&sig.public_key)
        .map_err(|e| SignatureError::MalformedPublicKey(e.to_string()))?;

    if validator_id_of(&key) != sig.validator {
        return Err(SignatureError::KeyMismatch {
            validator: sig.validator,
        });
    }

    let rs = match sig.signature.len() {
        64 | 65 => &sig.signature[..64],
        n => {
            return Err(SignatureError::MalformedSignature(format!(
                "expected 64 or 65 bytes, got {}",
                n
            )))
        }
    };
    let signature =
        Signature::from_slice(rs).map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;

    key.verify_prehash(hash, &signature)
        .map_err(|_| SignatureError::VerificationFailed {
            validator: sig.validator,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Anvil account #0
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    #[test]
    fn test_validator_id_matches_ethereum_address() {
        let signer = LocalKeySigner::from_private_key(TEST_KEY).unwrap();
        assert_eq!(signer.validator().as_hex(), TEST_ADDRESS);
        assert_eq!(signer.public_key().len(), 33);
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = LocalKeySigner::from_private_key(TEST_KEY).unwrap();
        let hash = keccak256(b"payload");
        let sig = signer.sign_hash(&hash).unwrap();

        assert_eq!(sig.signature.len(), 65);
        assert!(sig.signature[64] == 27 || sig.signature[64] == 28);
        verify_signature(&sig, &hash).unwrap();
    }

    #[test]
    fn test_verify_rejects_other_hash() {
        let signer = LocalKeySigner::from_private_key(TEST_KEY).unwrap();
        let sig = signer.sign_hash(&keccak256(b"payload")).unwrap();

        let err = verify_signature(&sig, &keccak256(b"other")).unwrap_err();
        assert!(matches!(err, SignatureError::VerificationFailed { .. }));
    }

    #[test]
    fn test_verify_rejects_foreign_key() {
        let signer = LocalKeySigner::from_private_key(TEST_KEY).unwrap();
        let hash = keccak256(b"payload");
        let mut sig = signer.sign_hash(&hash).unwrap();
        sig.validator = ValidatorId([9u8; 20]);

        let err = verify_signature(&sig, &hash).unwrap_err();
        assert!(matches!(err, SignatureError::KeyMismatch { .. }));
    }

    #[test]
    fn test_verify_rejects_empty_signature() {
        let signer = LocalKeySigner::from_private_key(TEST_KEY).unwrap();
        let hash = keccak256(b"payload");
        let mut sig = signer.sign_hash(&hash).unwrap();
        sig.signature.clear();

        assert_eq!(verify_signature(&sig, &hash), Err(SignatureError::EmptySignature));
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(LocalKeySigner::from_private_key("0x1234").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let signer = LocalKeySigner::from_private_key(TEST_KEY).unwrap();
        let debug = format!("{:?}", signer);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"));
    }
}
