//! Watcher-to-aggregator bridge for this node's own votes

use async_trait::async_trait;
use peggy_core::{ClaimBuilder, ClaimError, ClaimSigner, RawEvent};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::dispatcher::{Dispatcher, Submission};
use crate::metrics;
use crate::watchers::EventSink;

/// Builds, signs, and submits a claim for every matched event.
///
/// Events whose call data does not decode, and claims the signer cannot sign,
/// are logged and dropped; they never stall the watcher. A store failure inside the aggregator fails the block so
/// the watcher retries it.
pub struct LocalClaimSink {
    builder: ClaimBuilder,
    signer: Arc<dyn ClaimSigner>,
    dispatcher: Arc<Dispatcher>,
    chain_label: String,
}

impl LocalClaimSink {
    pub fn new(builder: ClaimBuilder, signer: Arc<dyn ClaimSigner>, dispatcher: Arc<Dispatcher>) -> Self {
        let chain_label = builder.source_chain_id().to_string();
        Self {
            builder,
            signer,
            dispatcher,
            chain_label,
        }
    }
}

#[async_trait]
impl EventSink for LocalClaimSink {
    async fn handle_block(&self, height: u64, events: Vec<RawEvent>) -> eyre::Result<()> {
        for event in events {
            let claim = match self.builder.build(&event) {
                Ok(claim) => claim,
                Err(ClaimError::MalformedPayload(reason)) => {
                    metrics::record_malformed_payload(&self.chain_label);
                    warn!(
                        tx_hash = %hex::encode(event.tx_hash),
                        height,
                        tx_index = event.tx_index,
                        reason = %reason,
                        "Dropping malformed bridge call"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let signature = match self.builder.sign(&claim, self.signer.as_ref()) {
                Ok(signature) => signature,
                Err(e) => {
                    metrics::record_sign_failure(&self.chain_label);
                    error!(
                        claim_id = %claim.id,
                        height,
                        tx_index = event.tx_index,
                        error = %e,
                        "Skipping claim this validator could not sign"
                    );
                    continue;
                }
            };
            info!(
                claim_id = %claim.id,
                kind = claim.kind.as_str(),
                nonce = claim.nonce,
                receiver = %claim.receiver,
                symbol = %claim.symbol,
                amount = %claim.amount,
                "Signing claim"
            );

            let submission = Submission::Claim {
                claim,
                signature,
                height,
            };
            if let Err(e) = self.dispatcher.submit(submission).await {
                if e.is_fatal() {
                    return Err(e.into());
                }
                // already logged and counted by the dispatcher
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::{LogBroadcaster, SettlementGate};
    use alloy::primitives::{Bytes, U256};
    use alloy::sol_types::SolCall;
    use peggy_core::address_codec::encode_bech32_address;
    use peggy_core::contracts::lockCall;
    use peggy_core::store::StateStore;
    use peggy_core::{
        EventKind, LocalKeySigner, MemoryStore, ProphecyAggregator, SignatureError, StaticRegistry,
        Status, Supermajority, ValidatorId, ValidatorPower, ValidatorSignature, WithdrawAggregator,
    };
    use std::sync::Mutex;

    const BRIDGE: [u8; 20] = [0x42; 20];

    fn event(tx_index: u64, input: Vec<u8>) -> RawEvent {
        RawEvent {
            kind: EventKind::Lock,
            tx_hash: [tx_index as u8; 32],
            block_height: 9,
            tx_index,
            from: [0xaa; 20],
            input,
        }
    }

    /// Signs as `inner` except for the one refused payload hash
    struct FlakySigner {
        inner: LocalKeySigner,
        refused: Mutex<Option<[u8; 32]>>,
    }

    impl ClaimSigner for FlakySigner {
        fn validator(&self) -> ValidatorId {
            self.inner.validator()
        }

        fn sign_hash(&self, hash: &[u8; 32]) -> Result<ValidatorSignature, SignatureError> {
            let refused = self.refused.lock().unwrap_or_else(|e| e.into_inner());
            if refused.as_ref() == Some(hash) {
                return Err(SignatureError::SigningFailed("key unavailable".to_string()));
            }
            self.inner.sign_hash(hash)
        }
    }

    fn local_signer() -> LocalKeySigner {
        LocalKeySigner::from_private_key(&format!("0x55{}01", "00".repeat(30))).unwrap()
    }

    fn lock_input(amount: u64) -> Vec<u8> {
        lockCall {
            recipient: Bytes::from(encode_bech32_address(&[7u8; 20], "cosmos").unwrap().into_bytes()),
            symbol: "eth".to_string(),
            amount: U256::from(amount),
        }
        .abi_encode()
    }

    fn dispatcher_for(validator: ValidatorId) -> Arc<Dispatcher> {
        let registry = Arc::new(StaticRegistry::new(vec![ValidatorPower {
            validator,
            power: 10,
        }]));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ProphecyAggregator::new(
                store.clone(),
                registry.clone(),
                Supermajority::default(),
            )),
            Arc::new(WithdrawAggregator::new(
                "peggy-test",
                store.clone(),
                registry,
                Supermajority::default(),
            )),
            store.clone(),
            Arc::new(SettlementGate::new(store, Arc::new(LogBroadcaster))),
        ));
        dispatcher
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped_and_rest_submitted() {
        let signer = Arc::new(local_signer());
        let dispatcher = dispatcher_for(signer.validator());
        let builder = ClaimBuilder::new(1, BRIDGE);
        let sink = LocalClaimSink::new(builder.clone(), signer, dispatcher.clone());

        let good = event(2, lock_input(10));
        let truncated = event(1, lockCall::SELECTOR.to_vec());

        sink.handle_block(9, vec![truncated, good.clone()]).await.unwrap();

        let id = builder.build(&good).unwrap().id;
        let summary = dispatcher.prophecies().query(&id).await.unwrap().unwrap();
        assert_eq!(summary.status, Status::Certified);
        assert_eq!(summary.signature_count, 1);
    }

    #[tokio::test]
    async fn test_sign_failure_skips_only_that_claim() {
        let builder = ClaimBuilder::new(1, BRIDGE);
        let refused = event(1, lock_input(5));
        let signed = event(2, lock_input(6));
        let refused_claim = builder.build(&refused).unwrap();

        let signer = Arc::new(FlakySigner {
            inner: local_signer(),
            refused: Mutex::new(Some(refused_claim.payload_hash())),
        });
        let dispatcher = dispatcher_for(signer.validator());
        let sink = LocalClaimSink::new(builder.clone(), signer, dispatcher.clone());

        sink.handle_block(9, vec![refused, signed.clone()]).await.unwrap();

        assert!(dispatcher.prophecies().query(&refused_claim.id).await.unwrap().is_none());
        let id = builder.build(&signed).unwrap().id;
        let summary = dispatcher.prophecies().query(&id).await.unwrap().unwrap();
        assert_eq!(summary.status, Status::Certified);
    }
}
