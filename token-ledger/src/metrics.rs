//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `ledger_debits_total` - Debits committed
//! - `ledger_credits_total` - Credits committed
//! - `ledger_replays_total` - Idempotent replays served
//! - `ledger_rejections_total` - Debits rejected for insufficient balance
//! - `ledger_conflicts_total` - Optimistic commit conflicts retried
//! - `ledger_inconsistencies_total` - Detected ledger/pool drift (alert on any)
//! - `ledger_pools_expired_total` / `ledger_tokens_expired_total` - Sweep output
//! - `ledger_rollovers_total` - Rollovers committed
//! - `ledger_debit_duration_seconds` - Debit latency histogram

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Debits committed
    pub debits_total: IntCounter,

    /// Credits committed
    pub credits_total: IntCounter,

    /// Idempotent replays served
    pub replays_total: IntCounter,

    /// Insufficient-balance rejections
    pub rejections_total: IntCounter,

    /// Optimistic commit conflicts (each one is a retry)
    pub conflicts_total: IntCounter,

    /// Detected ledger/pool inconsistencies
    pub inconsistencies_total: IntCounter,

    /// Pools zeroed by the expiration sweep
    pub pools_expired_total: IntCounter,

    /// Tokens written off by the expiration sweep
    pub tokens_expired_total: IntCounter,

    /// Rollovers committed
    pub rollovers_total: IntCounter,

    /// Debit latency histogram
    pub debit_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let debits_total = IntCounter::new("ledger_debits_total", "Debits committed")?;
        registry.register(Box::new(debits_total.clone()))?;

        let credits_total = IntCounter::new("ledger_credits_total", "Credits committed")?;
        registry.register(Box::new(credits_total.clone()))?;

        let replays_total =
            IntCounter::new("ledger_replays_total", "Idempotent replays served")?;
        registry.register(Box::new(replays_total.clone()))?;

        let rejections_total = IntCounter::new(
            "ledger_rejections_total",
            "Debits rejected for insufficient balance",
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let conflicts_total = IntCounter::new(
            "ledger_conflicts_total",
            "Optimistic commit conflicts retried",
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let inconsistencies_total = IntCounter::new(
            "ledger_inconsistencies_total",
            "Detected ledger/pool drift",
        )?;
        registry.register(Box::new(inconsistencies_total.clone()))?;

        let pools_expired_total = IntCounter::new(
            "ledger_pools_expired_total",
            "Pools zeroed by the expiration sweep",
        )?;
        registry.register(Box::new(pools_expired_total.clone()))?;

        let tokens_expired_total = IntCounter::new(
            "ledger_tokens_expired_total",
            "Tokens written off by the expiration sweep",
        )?;
        registry.register(Box::new(tokens_expired_total.clone()))?;

        let rollovers_total = IntCounter::new("ledger_rollovers_total", "Rollovers committed")?;
        registry.register(Box::new(rollovers_total.clone()))?;

        let debit_duration = Histogram::with_opts(
            HistogramOpts::new("ledger_debit_duration_seconds", "Debit latency").buckets(vec![
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0,
            ]),
        )?;
        registry.register(Box::new(debit_duration.clone()))?;

        Ok(Self {
            debits_total,
            credits_total,
            replays_total,
            rejections_total,
            conflicts_total,
            inconsistencies_total,
            pools_expired_total,
            tokens_expired_total,
            rollovers_total,
            debit_duration,
            registry,
        })
    }

    /// Record a committed debit with its latency
    pub fn record_debit(&self, duration_seconds: f64) {
        self.debits_total.inc();
        self.debit_duration.observe(duration_seconds);
    }

    /// Record a committed credit
    pub fn record_credit(&self) {
        self.credits_total.inc();
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    /// Record an insufficient-balance rejection
    pub fn record_rejection(&self) {
        self.rejections_total.inc();
    }

    /// Record an optimistic commit conflict
    pub fn record_conflict(&self) {
        self.conflicts_total.inc();
    }

    /// Record a detected ledger/pool inconsistency
    pub fn record_inconsistency(&self) {
        self.inconsistencies_total.inc();
    }

    /// Record an expiration sweep's output
    pub fn record_pools_expired(&self, pools: usize, tokens: i64) {
        self.pools_expired_total.inc_by(pools as u64);
        self.tokens_expired_total.inc_by(tokens.max(0) as u64);
    }

    /// Record a committed rollover
    pub fn record_rollover(&self) {
        self.rollovers_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.debits_total.get(), 0);
        assert_eq!(metrics.credits_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        // Two collectors must not collide (each ledger owns its registry)
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_credit();
        assert_eq!(a.credits_total.get(), 1);
        assert_eq!(b.credits_total.get(), 0);
    }

    #[test]
    fn test_record_debit() {
        let metrics = Metrics::new().unwrap();
        metrics.record_debit(0.002);
        metrics.record_debit(0.004);
        assert_eq!(metrics.debits_total.get(), 2);
    }

    #[test]
    fn test_record_sweep_output() {
        let metrics = Metrics::new().unwrap();
        metrics.record_pools_expired(3, 42);
        assert_eq!(metrics.pools_expired_total.get(), 3);
        assert_eq!(metrics.tokens_expired_total.get(), 42);
    }
}
