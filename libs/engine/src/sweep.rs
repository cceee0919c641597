//! Background expiry sweeper.
//!
//! Scans already drop expired entries lazily, so the sweeper exists to
//! bound memory between probes, not for correctness. Each cycle expires the
//! arena, both sparse indexes, the match table, and the request table
//! against the store's current watermark.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::store::{GraphStore, SweepCounts};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Interval between sweep cycles.
    /// Default: 1 second
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

impl SweepConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Counters accumulated across sweep cycles.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    pub edges_expired: AtomicU64,
    pub index_slots_expired: AtomicU64,
    pub matches_expired: AtomicU64,
    pub requests_expired: AtomicU64,
    pub cycles_completed: AtomicU64,
}

impl SweepMetrics {
    pub fn snapshot(&self) -> SweepMetricsSnapshot {
        SweepMetricsSnapshot {
            edges_expired: self.edges_expired.load(Ordering::Relaxed),
            index_slots_expired: self.index_slots_expired.load(Ordering::Relaxed),
            matches_expired: self.matches_expired.load(Ordering::Relaxed),
            requests_expired: self.requests_expired.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, counts: SweepCounts) {
        self.edges_expired.fetch_add(counts.edges as u64, Ordering::Relaxed);
        self.index_slots_expired
            .fetch_add(counts.index_slots as u64, Ordering::Relaxed);
        self.matches_expired
            .fetch_add(counts.matches as u64, Ordering::Relaxed);
        self.requests_expired
            .fetch_add(counts.requests as u64, Ordering::Relaxed);
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of sweep metrics.
#[derive(Debug, Clone, Default)]
pub struct SweepMetricsSnapshot {
    pub edges_expired: u64,
    pub index_slots_expired: u64,
    pub matches_expired: u64,
    pub requests_expired: u64,
    pub cycles_completed: u64,
}

// ============================================================================
// Sweeper
// ============================================================================

pub struct Sweeper {
    store: Arc<GraphStore>,
    config: SweepConfig,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<SweepMetrics>,
}

impl Sweeper {
    pub fn new(store: Arc<GraphStore>, config: SweepConfig) -> Self {
        Sweeper {
            store,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(SweepMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &Arc<SweepMetrics> {
        &self.metrics
    }

    /// Signal shutdown to the worker.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run one sweep cycle inline.
    pub fn run_cycle(&self) -> SweepCounts {
        let counts = self.store.sweep_expired();
        self.metrics.record(counts);
        counts
    }

    /// Spawn the background worker. It stops at the next interval boundary
    /// after `shutdown()` or once the store terminates.
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if shutdown.load(Ordering::SeqCst) || store.is_terminated() {
                    tracing::debug!("sweeper stopping");
                    return;
                }
                let counts = store.sweep_expired();
                if counts != SweepCounts::default() {
                    tracing::debug!(?counts, "sweep cycle expired entries");
                }
                metrics.record(counts);
            }
        })
    }
}
