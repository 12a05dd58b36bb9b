//! Peggy-Core: claim aggregation for the Peggy Ethereum <-> Cosmos bridge
//!
//! This crate holds everything validators must agree on bit-for-bit:
//!
//! - **Types** - claim/withdraw ids, validator ids, statuses, signatures
//! - **Hash Computation** - claim and withdraw ids matching the bridge contract
//! - **Claims** - decoding matched `lock`/`burn` calls into canonical claims
//! - **Signing** - secp256k1 signing and verification of payload hashes
//! - **Validator Registry** - validator sets and voting power by height
//! - **State Store** - keyed persistence seam for aggregation records
//! - **Oracle** - the prophecy and withdraw voting state machines
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! peggy-core = { path = "../peggy-core" }
//! ```

pub mod address_codec;
pub mod claim;
pub mod contracts;
pub mod hash;
pub mod oracle;
pub mod redact;
pub mod registry;
pub mod signer;
pub mod store;
pub mod types;

// Re-export commonly used items at the crate root
pub use address_codec::{
    decode_bech32_address, encode_bech32_address, encode_evm_address, parse_evm_address,
    validate_cosmos_address, AddressError,
};

pub use hash::{bytes32_to_hex, compute_claim_id, compute_withdraw_id, keccak256};

pub use claim::{Claim, ClaimBuilder, ClaimError, RawEvent};
pub use oracle::{
    AddOutcome, AggregateError, Aggregation, AggregationSummary, Disposition, MultisigBundle,
    ProphecyAggregator, Supermajority, WithdrawAggregator, WithdrawError, WithdrawPayload,
};
pub use registry::{RegistryError, StaticRegistry, ValidatorPower, ValidatorRegistry, ValidatorSet};
pub use signer::{verify_signature, ClaimSigner, LocalKeySigner, SignatureError};
pub use store::{MemoryStore, StateStore, StoreError};
pub use types::{ClaimId, Coin, EventKind, Power, Status, ValidatorId, ValidatorSignature, WithdrawId};
