//! HTTP API
//!
//! - GET  /health                    - Liveness plus watcher and queue status
//! - GET  /metrics                   - Prometheus metrics
//! - GET  /prophecies/{id}           - Prophecy status by claim id
//! - GET  /withdrawals/{id}          - Withdraw request status by withdraw id
//! - GET  /withdrawals/{id}/bundle   - Multisig bundle of a certified withdraw
//! - POST /submissions               - Signed claim or withdraw co-signature from a peer

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use peggy_core::store::StateStore;
use peggy_core::{AggregateError, ClaimId, WithdrawId};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::dispatcher::{Dispatcher, Submission};
use crate::metrics;
use crate::watchers::load_watermark;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn StateStore>,
    pub chain_id: u64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub chain_id: u64,
    pub watermark: Option<u64>,
    pub pending_prophecies: usize,
    pub pending_withdrawals: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    reason: &'static str,
}

fn error_response(status: StatusCode, reason: &'static str, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
            reason,
        }),
    )
        .into_response()
}

fn aggregate_error_response(e: AggregateError) -> Response {
    let status = if e.is_fatal() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    error_response(status, e.reason(), e)
}

async fn health(State(state): State<AppState>) -> Response {
    match load_watermark(state.store.as_ref(), state.chain_id).await {
        Ok(watermark) => Json(HealthResponse {
            status: "healthy".to_string(),
            chain_id: state.chain_id,
            watermark,
            pending_prophecies: state.dispatcher.prophecies().pending_count(),
            pending_withdrawals: state.dispatcher.withdrawals().pending_count(),
        })
        .into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, "store", e),
    }
}

async fn prometheus_metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response(),
    }
}

async fn get_prophecy(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match ClaimId::from_hex(&id) {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_id", e),
    };
    match state.dispatcher.prophecies().query(&id).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", format!("no prophecy {}", id)),
        Err(e) => aggregate_error_response(e),
    }
}

async fn get_withdrawal(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match WithdrawId::from_hex(&id) {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_id", e),
    };
    match state.dispatcher.withdrawals().query(&id).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", format!("no withdraw request {}", id)),
        Err(e) => aggregate_error_response(e),
    }
}

async fn get_withdrawal_bundle(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match WithdrawId::from_hex(&id) {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_id", e),
    };
    match state.dispatcher.withdrawals().export_bundle(&id).await {
        Ok(Some(bundle)) => Json(bundle).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_certified",
            format!("withdraw request {} is unknown or not certified", id),
        ),
        Err(e) => aggregate_error_response(e),
    }
}

async fn post_submission(State(state): State<AppState>, Json(submission): Json<Submission>) -> Response {
    match state.dispatcher.submit(submission).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => aggregate_error_response(e),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/prophecies/{id}", get(get_prophecy))
        .route("/withdrawals/{id}", get(get_withdrawal))
        .route("/withdrawals/{id}/bundle", get(get_withdrawal_bundle))
        .route("/submissions", post(post_submission))
        .with_state(state)
}

/// Serve the API until `shutdown` flips to true
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    metrics::UP.set(1.0);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    metrics::UP.set(0.0);
    Ok(())
}
