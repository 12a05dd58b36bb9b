//! Address encoding for both sides of the bridge
//!
//! Ethereum addresses are 20 raw bytes rendered as 0x-prefixed hex. Cosmos
//! account addresses are the same 20 raw bytes rendered as bech32 with a
//! chain-specific human-readable prefix (e.g. `cosmos1...`).

use bech32::{self, FromBase32, ToBase32, Variant};
use thiserror::Error;

/// Errors produced while parsing or encoding addresses
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("invalid bech32 address: {0}")]
    InvalidBech32(String),

    #[error("unexpected bech32 prefix: expected '{expected}', got '{got}'")]
    UnexpectedPrefix { expected: String, got: String },
}

/// Parse a 0x-prefixed hex EVM address to 20 bytes
pub fn parse_evm_address(addr: &str) -> Result<[u8; 20], AddressError> {
    let hex_str = addr.strip_prefix("0x").unwrap_or(addr);

    if hex_str.len() != 40 {
        return Err(AddressError::InvalidLength {
            expected: 20,
            got: hex_str.len() / 2,
        });
    }

    let bytes = hex::decode(hex_str).map_err(|e| AddressError::InvalidHex(e.to_string()))?;

    let mut result = [0u8; 20];
    result.copy_from_slice(&bytes);
    Ok(result)
}

/// Encode 20 bytes to EVM hex string with 0x prefix
pub fn encode_evm_address(bytes: &[u8; 20]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode a bech32 address to raw 20 bytes
///
/// Returns (raw_bytes, hrp) where hrp is the human-readable prefix
pub fn decode_bech32_address(addr: &str) -> Result<([u8; 20], String), AddressError> {
    let (hrp, data, _variant) =
        bech32::decode(addr).map_err(|e| AddressError::InvalidBech32(e.to_string()))?;

    let bytes =
        Vec::<u8>::from_base32(&data).map_err(|e| AddressError::InvalidBech32(e.to_string()))?;

    if bytes.len() != 20 {
        return Err(AddressError::InvalidLength {
            expected: 20,
            got: bytes.len(),
        });
    }

    let mut result = [0u8; 20];
    result.copy_from_slice(&bytes);
    Ok((result, hrp))
}

/// Encode raw 20 bytes to a bech32 address with given prefix
pub fn encode_bech32_address(bytes: &[u8; 20], hrp: &str) -> Result<String, AddressError> {
    bech32::encode(hrp, bytes.to_base32(), Variant::Bech32)
        .map_err(|e| AddressError::InvalidBech32(e.to_string()))
}

/// Validate a Cosmos recipient address.
///
/// When `expected_hrp` is given the prefix must match it exactly.
pub fn validate_cosmos_address(addr: &str, expected_hrp: Option<&str>) -> Result<[u8; 20], AddressError> {
    let (raw, hrp) = decode_bech32_address(addr)?;
    if let Some(expected) = expected_hrp {
        if hrp != expected {
            return Err(AddressError::UnexpectedPrefix {
                expected: expected.to_string(),
                got: hrp,
            });
        }
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evm_address_parse() {
        let raw = parse_evm_address("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        assert_eq!(
            encode_evm_address(&raw),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );

        assert!(parse_evm_address("0x1234").is_err());
        assert!(parse_evm_address("0xzz9Fd6e51aad88F6F4ce6aB8827279cffFb92266").is_err());
    }

    #[test]
    fn test_bech32_roundtrip() {
        let terra_addr = "terra1x46rqay4d3cssq8gxxvqz8xt6nwlz4td20k38v";
        let (raw, hrp) = decode_bech32_address(terra_addr).unwrap();
        assert_eq!(hrp, "terra");
        assert_eq!(encode_bech32_address(&raw, "terra").unwrap(), terra_addr);
    }

    #[test]
    fn test_validate_cosmos_address_prefix() {
        let addr = encode_bech32_address(&[7u8; 20], "cosmos").unwrap();
        assert_eq!(validate_cosmos_address(&addr, Some("cosmos")).unwrap(), [7u8; 20]);
        assert_eq!(validate_cosmos_address(&addr, None).unwrap(), [7u8; 20]);

        let err = validate_cosmos_address(&addr, Some("terra")).unwrap_err();
        assert!(matches!(err, AddressError::UnexpectedPrefix { .. }));
    }

    #[test]
    fn test_invalid_bech32() {
        assert!(decode_bech32_address("not-an-address").is_err());
        // Flip the last checksum character
        assert!(decode_bech32_address("terra1x46rqay4d3cssq8gxxvqz8xt6nwlz4td20k38w").is_err());
    }
}
