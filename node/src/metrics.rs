//! # Prometheus Metrics
//!
//! Operational metrics for a device or the authority, scraped at
//! `/metrics` on the node's HTTP port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use tally_ledger::SyncOutcome;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are `Arc`s internally) so it can be
/// shared across request handlers and background tasks.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Transactions committed to this node's ledger.
    pub payments_applied_total: IntCounter,
    /// Transactions refused before commit, by reason.
    pub payments_rejected_total: IntCounterVec,
    /// Sync runs that reached a verdict or found the authority unreachable.
    pub sync_runs_total: IntCounter,
    /// Entries the authority accepted.
    pub synced_total: IntCounter,
    /// Entries the authority rejected.
    pub authority_rejected_total: IntCounter,
    /// Sync runs that ended with the authority unreachable.
    pub sync_unreachable_total: IntCounter,
    /// Entries still waiting for the authority.
    pub pending_transactions: IntGauge,
    /// Peers with a live session.
    pub connected_peers: IntGauge,
    /// Duration of explicit sync requests in seconds.
    pub sync_duration_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("tally".into()), None)?;

        let payments_applied_total = IntCounter::new(
            "payments_applied_total",
            "Transactions committed to the local ledger",
        )?;
        registry.register(Box::new(payments_applied_total.clone()))?;

        let payments_rejected_total = IntCounterVec::new(
            Opts::new(
                "payments_rejected_total",
                "Transactions refused before commit, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(payments_rejected_total.clone()))?;

        let sync_runs_total = IntCounter::new("sync_runs_total", "Completed sync runs")?;
        registry.register(Box::new(sync_runs_total.clone()))?;

        let synced_total = IntCounter::new("synced_total", "Entries accepted by the authority")?;
        registry.register(Box::new(synced_total.clone()))?;

        let authority_rejected_total = IntCounter::new(
            "authority_rejected_total",
            "Entries rejected by the authority",
        )?;
        registry.register(Box::new(authority_rejected_total.clone()))?;

        let sync_unreachable_total = IntCounter::new(
            "sync_unreachable_total",
            "Sync runs that could not reach the authority",
        )?;
        registry.register(Box::new(sync_unreachable_total.clone()))?;

        let pending_transactions = IntGauge::new(
            "pending_transactions",
            "Entries not yet acknowledged by the authority",
        )?;
        registry.register(Box::new(pending_transactions.clone()))?;

        let connected_peers = IntGauge::new("connected_peers", "Peers with a live session")?;
        registry.register(Box::new(connected_peers.clone()))?;

        let sync_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sync_duration_seconds",
                "Wall time of explicit sync requests in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(sync_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            payments_applied_total,
            payments_rejected_total,
            sync_runs_total,
            synced_total,
            authority_rejected_total,
            sync_unreachable_total,
            pending_transactions,
            connected_peers,
            sync_duration_seconds,
        })
    }

    /// Fold the result of one sync run into the counters.
    pub fn record_sync(&self, outcome: &SyncOutcome) {
        self.sync_runs_total.inc();
        self.synced_total.inc_by(outcome.synced.len() as u64);
        self.authority_rejected_total.inc_by(outcome.failed.len() as u64);
        if outcome.unreachable {
            self.sync_unreachable_total.inc();
        }
    }

    pub fn record_rejection(&self, reason: &str) {
        self.payments_rejected_total.with_label_values(&[reason]).inc();
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics handle passed to axum handlers through app state.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Renders `metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails.
pub fn render(metrics: &NodeMetrics) -> Response {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
