//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_transactions_total` - Committed transactions by kind
//! - `ledger_idempotent_replays_total` - Submits answered from the log
//! - `ledger_conflict_retries_total` - Commit attempts lost to contention
//! - `ledger_submit_duration_seconds` - Histogram of submit latencies
//! - `ledger_notifications_dropped_total` - Updates dropped by the notifier
//! - `ledger_accounts_created_total` - Accounts created (first-touch or registered)

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed transactions by kind
    pub transactions_total: IntCounterVec,

    /// Submits short-circuited by the idempotency guard
    pub idempotent_replays_total: IntCounter,

    /// Commit attempts that lost the same-account race
    pub conflict_retries_total: IntCounter,

    /// Submit latency histogram
    pub submit_duration: Histogram,

    /// Balance updates dropped by the notifier
    pub notifications_dropped_total: IntCounter,

    /// Accounts created
    pub accounts_created_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transactions_total = IntCounterVec::new(
            Opts::new(
                "ledger_transactions_total",
                "Committed transactions by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        let idempotent_replays_total = IntCounter::with_opts(Opts::new(
            "ledger_idempotent_replays_total",
            "Submits answered from the transaction log",
        ))?;
        registry.register(Box::new(idempotent_replays_total.clone()))?;

        let conflict_retries_total = IntCounter::with_opts(Opts::new(
            "ledger_conflict_retries_total",
            "Commit attempts lost to same-account contention",
        ))?;
        registry.register(Box::new(conflict_retries_total.clone()))?;

        let submit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_submit_duration_seconds",
                "Histogram of submit latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(submit_duration.clone()))?;

        let notifications_dropped_total = IntCounter::with_opts(Opts::new(
            "ledger_notifications_dropped_total",
            "Balance updates dropped by the change notifier",
        ))?;
        registry.register(Box::new(notifications_dropped_total.clone()))?;

        let accounts_created_total = IntCounter::with_opts(Opts::new(
            "ledger_accounts_created_total",
            "Accounts created, first-touch or registered",
        ))?;
        registry.register(Box::new(accounts_created_total.clone()))?;

        Ok(Self {
            transactions_total,
            idempotent_replays_total,
            conflict_retries_total,
            submit_duration,
            notifications_dropped_total,
            accounts_created_total,
            registry,
        })
    }

    /// Record a committed transaction
    pub fn record_transaction(&self, kind: &str) {
        self.transactions_total.with_label_values(&[kind]).inc();
    }

    /// Record an idempotent replay
    pub fn record_idempotent_replay(&self) {
        self.idempotent_replays_total.inc();
    }

    /// Record a lost commit race
    pub fn record_conflict_retry(&self) {
        self.conflict_retries_total.inc();
    }

    /// Record submit latency
    pub fn record_submit_duration(&self, duration_seconds: f64) {
        self.submit_duration.observe(duration_seconds);
    }

    /// Record a dropped notification
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped_total.inc();
    }

    /// Record account creation
    pub fn record_account_created(&self) {
        self.accounts_created_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
