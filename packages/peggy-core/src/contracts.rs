//! Ethereum bridge contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the calls the
//! relayer needs to understand (`lock`, `burn`) or produce (`submitWithdraw`).

#![allow(clippy::too_many_arguments)]

use alloy::sol;
use alloy::sol_types::SolCall;

sol! {
    /// Peggy bridge contract interface
    contract PeggyBridge {
        /// Lock a native Ethereum asset for minting on the Cosmos side.
        /// `recipient` carries the bech32 Cosmos address as UTF-8 bytes.
        function lock(bytes recipient, string symbol, uint256 amount) external payable;

        /// Burn a pegged Cosmos asset to release it on the Cosmos side
        function burn(bytes recipient, string symbol, uint256 amount) external;

        /// Release funds on Ethereum for a certified Cosmos-side withdrawal
        function submitWithdraw(
            bytes32 withdrawId,
            address destination,
            string denom,
            uint256 amount,
            uint64 nonce,
            bytes[] signatures
        ) external;
    }
}

pub use PeggyBridge::{burnCall, lockCall, submitWithdrawCall};

/// Canonical signature of the `lock` method
pub const LOCK_SIGNATURE: &str = "lock(bytes,string,uint256)";

/// Canonical signature of the `burn` method
pub const BURN_SIGNATURE: &str = "burn(bytes,string,uint256)";

/// Default selector for `lock`
pub fn lock_selector() -> [u8; 4] {
    lockCall::SELECTOR
}

/// Default selector for `burn`
pub fn burn_selector() -> [u8; 4] {
    burnCall::SELECTOR
}

/// Compute a 4-byte method selector from a Solidity signature string
pub fn selector_for(signature: &str) -> [u8; 4] {
    let hash = crate::hash::keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_match_signatures() {
        assert_eq!(lock_selector(), selector_for(LOCK_SIGNATURE));
        assert_eq!(burn_selector(), selector_for(BURN_SIGNATURE));
        assert_ne!(lock_selector(), burn_selector());
    }

    #[test]
    fn test_known_selector() {
        // transfer(address,uint256)
        assert_eq!(
            selector_for("transfer(address,uint256)"),
            [0xa9, 0x05, 0x9c, 0xbb]
        );
    }
}
