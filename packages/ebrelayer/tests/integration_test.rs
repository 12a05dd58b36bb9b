//! HTTP API integration tests
//!
//! Serves the relayer API on an ephemeral port over an in-memory store and
//! drives it with reqwest: peer submissions, status queries, and bundle export.
//!
//! Run with: cargo test --test integration_test -- --nocapture
//!
//! The `#[ignore]`d test at the bottom additionally needs PostgreSQL at
//! DATABASE_URL.

use ebrelayer::api::{router, AppState};
use ebrelayer::db::PgStateStore;
use ebrelayer::dispatcher::{Dispatcher, Submission, SubmissionReceipt};
use ebrelayer::settlement::{LogBroadcaster, SettlementGate};
use peggy_core::oracle::Payload;
use peggy_core::store::StateStore;
use peggy_core::{
    compute_claim_id, Claim, ClaimSigner, Coin, EventKind, LocalKeySigner, MemoryStore,
    ProphecyAggregator, StaticRegistry, Status, Supermajority, ValidatorPower, WithdrawAggregator,
    WithdrawPayload,
};
use serde_json::Value;
use std::sync::Arc;

const COSMOS_CHAIN_ID: &str = "peggy-it";

mod helpers {
    use super::*;

    pub fn signer(seed: u8) -> LocalKeySigner {
        LocalKeySigner::from_private_key(&format!("0x44{}{:02x}", "00".repeat(30), seed)).unwrap()
    }

    pub struct TestRelayer {
        pub base_url: String,
        pub client: reqwest::Client,
        pub signers: Vec<LocalKeySigner>,
        pub dispatcher: Arc<Dispatcher>,
    }

    /// Start the API over `store` with four equal-power validators
    pub async fn start(store: Arc<dyn StateStore>) -> TestRelayer {
        let signers: Vec<LocalKeySigner> = (1..=4).map(signer).collect();
        let registry = Arc::new(StaticRegistry::new(
            signers
                .iter()
                .map(|s| ValidatorPower {
                    validator: s.validator(),
                    power: 25,
                })
                .collect(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ProphecyAggregator::new(
                store.clone(),
                registry.clone(),
                Supermajority::default(),
            )),
            Arc::new(WithdrawAggregator::new(
                COSMOS_CHAIN_ID,
                store.clone(),
                registry,
                Supermajority::default(),
            )),
            store.clone(),
            Arc::new(SettlementGate::new(store.clone(), Arc::new(LogBroadcaster))),
        ));

        let app = router(AppState {
            dispatcher: dispatcher.clone(),
            store,
            chain_id: 1,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestRelayer {
            base_url: format!("http://{}", addr),
            client: reqwest::Client::new(),
            signers,
            dispatcher,
        }
    }

    impl TestRelayer {
        pub async fn submit(&self, submission: &Submission) -> reqwest::Response {
            self.client
                .post(format!("{}/submissions", self.base_url))
                .json(submission)
                .send()
                .await
                .unwrap()
        }

        pub async fn get(&self, path: &str) -> reqwest::Response {
            self.client
                .get(format!("{}{}", self.base_url, path))
                .send()
                .await
                .unwrap()
        }
    }

    pub fn claim(nonce: u64, amount: u128) -> Claim {
        Claim {
            id: compute_claim_id(1, &[0x42; 20], nonce),
            kind: EventKind::Lock,
            source_chain_id: 1,
            bridge_contract: [0x42; 20],
            nonce,
            sender: [0xaa; 20],
            receiver: "cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu".to_string(),
            symbol: "eth".to_string(),
            amount,
        }
    }
}

use helpers::*;

#[tokio::test]
async fn test_health_reports_queues() {
    let relayer = start(Arc::new(MemoryStore::new())).await;

    let resp = relayer.get("/health").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["chain_id"], 1);
    assert!(body["watermark"].is_null());
    assert_eq!(body["pending_prophecies"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let relayer = start(Arc::new(MemoryStore::new())).await;
    let resp = relayer.get("/metrics").await;
    assert_eq!(resp.status(), 200);
    let _ = resp.text().await.unwrap();
}

#[tokio::test]
async fn test_claim_certifies_over_http() {
    let relayer = start(Arc::new(MemoryStore::new())).await;
    let c = claim(11, 500);

    let mut statuses = Vec::new();
    for s in &relayer.signers {
        let resp = relayer
            .submit(&Submission::Claim {
                claim: c.clone(),
                signature: s.sign_hash(&c.payload_hash()).unwrap(),
                height: 1,
            })
            .await;
        assert_eq!(resp.status(), 200);
        let receipt: SubmissionReceipt = resp.json().await.unwrap();
        statuses.push(receipt.status);
    }
    // 75 of 100 is the first total above two thirds; the fourth is a no-op
    assert_eq!(
        statuses,
        vec![Status::Pending, Status::Pending, Status::Certified, Status::Certified]
    );

    let resp = relayer.get(&format!("/prophecies/{}", c.id)).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "certified");
    assert_eq!(body["accumulated_power"], 75);
    assert_eq!(body["total_power"], 100);
    assert_eq!(body["signature_count"], 3);
}

#[tokio::test]
async fn test_rejections_map_to_client_errors() {
    let relayer = start(Arc::new(MemoryStore::new())).await;
    let c = claim(12, 1);
    let forged = claim(12, 2);

    relayer
        .submit(&Submission::Claim {
            claim: c.clone(),
            signature: relayer.signers[0].sign_hash(&c.payload_hash()).unwrap(),
            height: 1,
        })
        .await;

    // same validator, different payload
    let resp = relayer
        .submit(&Submission::Claim {
            claim: forged.clone(),
            signature: relayer.signers[0].sign_hash(&forged.payload_hash()).unwrap(),
            height: 1,
        })
        .await;
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "equivocation");

    // signature over a different payload than the one submitted
    let resp = relayer
        .submit(&Submission::Claim {
            claim: c.clone(),
            signature: relayer.signers[1].sign_hash(&forged.payload_hash()).unwrap(),
            height: 1,
        })
        .await;
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "invalid_signature");

    let summary = relayer.dispatcher.prophecies().query(&c.id).await.unwrap().unwrap();
    assert_eq!(summary.signature_count, 1);
}

#[tokio::test]
async fn test_unknown_and_malformed_ids() {
    let relayer = start(Arc::new(MemoryStore::new())).await;

    let resp = relayer.get(&format!("/prophecies/0x{}", "00".repeat(32))).await;
    assert_eq!(resp.status(), 404);

    let resp = relayer.get("/prophecies/not-hex").await;
    assert_eq!(resp.status(), 400);

    let resp = relayer.get("/withdrawals/0x1234").await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_withdraw_bundle_export() {
    let relayer = start(Arc::new(MemoryStore::new())).await;
    let request = WithdrawPayload::new(COSMOS_CHAIN_ID, [0x11; 20], Coin::new("stake", 1_000), 3);
    let hash = request.payload_hash();

    let path = format!("/withdrawals/{}/bundle", request.id);
    for s in &relayer.signers[..2] {
        let resp = relayer
            .submit(&Submission::Withdraw {
                request: request.clone(),
                signature: s.sign_hash(&hash).unwrap(),
                height: 1,
            })
            .await;
        assert_eq!(resp.status(), 200);
    }
    assert_eq!(relayer.get(&path).await.status(), 404);

    relayer
        .submit(&Submission::Withdraw {
            request: request.clone(),
            signature: relayer.signers[2].sign_hash(&hash).unwrap(),
            height: 1,
        })
        .await;

    let resp = relayer.get(&path).await;
    assert_eq!(resp.status(), 200);
    let bundle: Value = resp.json().await.unwrap();
    assert_eq!(bundle["signed_power"], 75);
    assert_eq!(bundle["signatures"].as_array().unwrap().len(), 3);
    assert!(bundle["calldata"].as_str().unwrap().len() > 10);

    let resp = relayer.get(&format!("/withdrawals/{}", request.id)).await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "certified");
}

#[tokio::test]
async fn test_withdraw_with_wrong_chain_id_rejected() {
    let relayer = start(Arc::new(MemoryStore::new())).await;
    let request = WithdrawPayload::new("other-chain", [0x11; 20], Coin::new("stake", 5), 1);

    let resp = relayer
        .submit(&Submission::Withdraw {
            request: request.clone(),
            signature: relayer.signers[0].sign_hash(&request.payload_hash()).unwrap(),
            height: 1,
        })
        .await;
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "invalid_withdraw");
}

#[tokio::test]
#[ignore = "requires PostgreSQL at DATABASE_URL"]
async fn test_state_survives_restart_on_postgres() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
    let nonce = chrono::Utc::now().timestamp_millis() as u64;
    let c = claim(nonce, 42);

    {
        let relayer = start(Arc::new(PgStateStore::connect(&url).await.unwrap())).await;
        let resp = relayer
            .submit(&Submission::Claim {
                claim: c.clone(),
                signature: relayer.signers[0].sign_hash(&c.payload_hash()).unwrap(),
                height: 1,
            })
            .await;
        assert_eq!(resp.status(), 200);
    }

    let relayer = start(Arc::new(PgStateStore::connect(&url).await.unwrap())).await;
    assert!(relayer.dispatcher.prophecies().recover_pending().await.unwrap() >= 1);
    let summary = relayer.dispatcher.prophecies().query(&c.id).await.unwrap().unwrap();
    assert_eq!(summary.status, Status::Pending);
    assert_eq!(summary.accumulated_power, 25);
}
