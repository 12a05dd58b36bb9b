//! Hash computation for claim and withdrawal identities
//!
//! Identities are keccak256 over Solidity `abi.encode` layouts so that the
//! bridge contract can recompute them on chain:
//!
//! ```solidity
//! claimId    = keccak256(abi.encode(uint256 chainId, address bridge, uint64 nonce))
//! withdrawId = keccak256(abi.encode(string cosmosChainId, uint64 nonce))
//! ```

use tiny_keccak::{Hasher, Keccak};

use crate::types::{ClaimId, WithdrawId};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Left-pad a big-endian integer into a 32-byte ABI word
pub fn u128_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Left-pad a u64 into a 32-byte ABI word
pub fn u64_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Convert an EVM address to bytes32 (left-padded with zeros)
pub fn address_to_bytes32(addr: &[u8; 20]) -> [u8; 32] {
    let mut result = [0u8; 32];
    result[12..32].copy_from_slice(addr);
    result
}

/// Append the ABI tail encoding of a dynamic `bytes`/`string` value:
/// a length word followed by the data right-padded to a 32-byte boundary.
pub fn append_dynamic(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&u64_word(data.len() as u64));
    out.extend_from_slice(data);
    let rem = data.len() % 32;
    if rem != 0 {
        out.extend(std::iter::repeat(0u8).take(32 - rem));
    }
}

/// Padded length of a dynamic value's tail (length word + padded data)
pub fn dynamic_tail_len(data_len: usize) -> usize {
    32 + data_len.div_ceil(32) * 32
}

/// Compute the claim id for an observed Ethereum event
///
/// Layout: 3 words (96 bytes).
pub fn compute_claim_id(source_chain_id: u64, bridge_contract: &[u8; 20], event_nonce: u64) -> ClaimId {
    let mut data = [0u8; 96];

    // uint256 chainId
    data[0..32].copy_from_slice(&u64_word(source_chain_id));

    // address bridge
    data[32..64].copy_from_slice(&address_to_bytes32(bridge_contract));

    // uint64 nonce
    data[64..96].copy_from_slice(&u64_word(event_nonce));

    ClaimId(keccak256(&data))
}

/// Compute the withdraw id for a Cosmos-side withdrawal intent
///
/// Layout: head (string offset, nonce) followed by the string tail.
pub fn compute_withdraw_id(cosmos_chain_id: &str, intent_nonce: u64) -> WithdrawId {
    let mut data = Vec::with_capacity(64 + dynamic_tail_len(cosmos_chain_id.len()));

    // offset of the string tail: two head words
    data.extend_from_slice(&u64_word(64));
    data.extend_from_slice(&u64_word(intent_nonce));
    append_dynamic(&mut data, cosmos_chain_id.as_bytes());

    WithdrawId(keccak256(&data))
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256() {
        let result = keccak256(b"hello");
        assert_eq!(
            bytes32_to_hex(&result),
            "0x1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }

    #[test]
    fn test_claim_id_deterministic() {
        let bridge = [0x11u8; 20];
        let a = compute_claim_id(1, &bridge, 42);
        let b = compute_claim_id(1, &bridge, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn test_claim_id_separates_inputs() {
        let bridge = [0x11u8; 20];
        let base = compute_claim_id(1, &bridge, 42);

        assert_ne!(base, compute_claim_id(2, &bridge, 42));
        assert_ne!(base, compute_claim_id(1, &[0x22u8; 20], 42));
        assert_ne!(base, compute_claim_id(1, &bridge, 43));
    }

    #[test]
    fn test_claim_id_matches_manual_layout() {
        let bridge = [0xaau8; 20];
        let mut expected = Vec::new();
        expected.extend_from_slice(&u64_word(5));
        expected.extend_from_slice(&[0u8; 12]);
        expected.extend_from_slice(&bridge);
        expected.extend_from_slice(&u64_word(7));
        assert_eq!(compute_claim_id(5, &bridge, 7).0, keccak256(&expected));
    }

    #[test]
    fn test_withdraw_id_deterministic_and_distinct() {
        let a = compute_withdraw_id("peggy", 1);
        assert_eq!(a, compute_withdraw_id("peggy", 1));
        assert_ne!(a, compute_withdraw_id("peggy", 2));
        assert_ne!(a, compute_withdraw_id("peggy-2", 1));
    }

    #[test]
    fn test_append_dynamic_padding() {
        let mut out = Vec::new();
        append_dynamic(&mut out, b"peggy");
        assert_eq!(out.len(), 64);
        assert_eq!(out[31], 5);
        assert_eq!(&out[32..37], b"peggy");
        assert!(out[37..].iter().all(|b| *b == 0));
        assert_eq!(dynamic_tail_len(5), 64);
        assert_eq!(dynamic_tail_len(32), 64);
        assert_eq!(dynamic_tail_len(33), 96);
        assert_eq!(dynamic_tail_len(0), 32);
    }
}
