//! Prometheus metrics for the Peggy relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge, GaugeVec,
    TextEncoder,
};

lazy_static! {
    // Chain watcher
    pub static ref BLOCKS_SCANNED: CounterVec = register_counter_vec!(
        "peggy_relayer_blocks_scanned_total",
        "Total number of confirmed blocks scanned",
        &["chain"]
    ).unwrap();

    pub static ref WATERMARK: GaugeVec = register_gauge_vec!(
        "peggy_relayer_watermark",
        "Highest fully processed block",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_MATCHED: CounterVec = register_counter_vec!(
        "peggy_relayer_events_matched_total",
        "Bridge calls matched in scanned blocks",
        &["chain", "kind"]
    ).unwrap();

    pub static ref CHAIN_READ_ERRORS: CounterVec = register_counter_vec!(
        "peggy_relayer_chain_read_errors_total",
        "Failed reads against the source chain",
        &["chain"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "peggy_relayer_consecutive_failures",
        "Consecutive failed watcher polls",
        &["chain"]
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "peggy_relayer_last_successful_poll_timestamp",
        "Unix timestamp of last successful poll",
        &["chain"]
    ).unwrap();

    // Claim building
    pub static ref MALFORMED_PAYLOADS: CounterVec = register_counter_vec!(
        "peggy_relayer_malformed_payloads_total",
        "Matched events dropped because their call data did not decode",
        &["chain"]
    ).unwrap();

    pub static ref SIGN_FAILURES: CounterVec = register_counter_vec!(
        "peggy_relayer_sign_failures_total",
        "Claims skipped because this validator could not sign them",
        &["chain"]
    ).unwrap();

    // Aggregation
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "peggy_relayer_submissions_total",
        "Accepted submissions by outcome",
        &["kind", "disposition"]
    ).unwrap();

    pub static ref REJECTIONS: CounterVec = register_counter_vec!(
        "peggy_relayer_rejections_total",
        "Rejected submissions by reason",
        &["kind", "reason"]
    ).unwrap();

    pub static ref CERTIFICATIONS: CounterVec = register_counter_vec!(
        "peggy_relayer_certifications_total",
        "Records that reached a supermajority",
        &["kind"]
    ).unwrap();

    pub static ref EXPIRED: CounterVec = register_counter_vec!(
        "peggy_relayer_expired_total",
        "Pending records failed by the timeout sweep",
        &["kind"]
    ).unwrap();

    pub static ref PENDING: GaugeVec = register_gauge_vec!(
        "peggy_relayer_pending",
        "Records currently Pending",
        &["kind"]
    ).unwrap();

    // Settlement
    pub static ref SETTLEMENTS: CounterVec = register_counter_vec!(
        "peggy_relayer_settlements_total",
        "Certified records handed to the settlement broadcaster",
        &["kind", "status"]
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "peggy_relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

/// Record a block scanned and the new watermark
pub fn record_block_scanned(chain: &str, height: u64) {
    BLOCKS_SCANNED.with_label_values(&[chain]).inc();
    WATERMARK.with_label_values(&[chain]).set(height as f64);
}

pub fn record_event_matched(chain: &str, kind: &str) {
    EVENTS_MATCHED.with_label_values(&[chain, kind]).inc();
}

pub fn record_chain_read_error(chain: &str) {
    CHAIN_READ_ERRORS.with_label_values(&[chain]).inc();
}

/// Update consecutive failures
pub fn set_consecutive_failures(chain: &str, count: u32) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[chain])
        .set(count as f64);
}

/// Record last successful poll
pub fn record_successful_poll(chain: &str) {
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[chain])
        .set(chrono::Utc::now().timestamp() as f64);
}

pub fn record_malformed_payload(chain: &str) {
    MALFORMED_PAYLOADS.with_label_values(&[chain]).inc();
}

pub fn record_sign_failure(chain: &str) {
    SIGN_FAILURES.with_label_values(&[chain]).inc();
}

pub fn record_submission(kind: &str, disposition: &str) {
    SUBMISSIONS.with_label_values(&[kind, disposition]).inc();
}

pub fn record_rejection(kind: &str, reason: &str) {
    REJECTIONS.with_label_values(&[kind, reason]).inc();
}

pub fn record_certification(kind: &str) {
    CERTIFICATIONS.with_label_values(&[kind]).inc();
}

pub fn record_expired(kind: &str, count: usize) {
    EXPIRED.with_label_values(&[kind]).inc_by(count as f64);
}

pub fn set_pending(kind: &str, count: usize) {
    PENDING.with_label_values(&[kind]).set(count as f64);
}

/// Record a settlement hand-off
pub fn record_settlement(kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    SETTLEMENTS.with_label_values(&[kind, status]).inc();
}

/// Render the default registry in the text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
