//! Pipeline counters.
//!
//! Every increment is kept in a local atomic (read back by tests and the
//! `check` command) and forwarded to the `metrics` facade so whatever
//! recorder the binary installs can export it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub const DEFAULT_PREFIX: &str = "event_exporter_";

#[derive(Debug)]
struct Names {
    processed: String,
    discarded: String,
    watch_errors: String,
    send_errors: String,
    cache_hits: String,
    cache_misses: String,
    build_info: String,
}

impl Names {
    fn with_prefix(prefix: &str) -> Self {
        Self {
            processed: format!("{prefix}events_sent"),
            discarded: format!("{prefix}events_discarded"),
            watch_errors: format!("{prefix}watch_errors"),
            send_errors: format!("{prefix}send_event_errors"),
            cache_hits: format!("{prefix}kube_api_read_cache_hits"),
            cache_misses: format!("{prefix}kube_api_read_cache_misses"),
            build_info: format!("{prefix}build_info"),
        }
    }
}

#[derive(Debug)]
pub struct ExporterMetrics {
    names: Names,
    events_processed: AtomicU64,
    events_discarded: AtomicU64,
    watch_errors: AtomicU64,
    send_errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub events_discarded: u64,
    pub watch_errors: u64,
    pub send_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl Default for ExporterMetrics {
    fn default() -> Self { Self::new(DEFAULT_PREFIX) }
}

impl ExporterMetrics {
    pub fn new(prefix: &str) -> Self {
        Self {
            names: Names::with_prefix(prefix),
            events_processed: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            watch_errors: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Constant gauge labelled with the running version.
    pub fn publish_build_info(&self) {
        metrics::gauge!(self.names.build_info.clone(), 1.0, "version" => env!("CARGO_PKG_VERSION"));
    }

    pub fn event_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(self.names.processed.clone(), 1u64);
    }

    pub fn event_discarded(&self) {
        self.events_discarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(self.names.discarded.clone(), 1u64);
    }

    pub fn watch_error(&self) {
        self.watch_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(self.names.watch_errors.clone(), 1u64);
    }

    pub fn send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(self.names.send_errors.clone(), 1u64);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(self.names.cache_hits.clone(), 1u64);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(self.names.cache_misses.clone(), 1u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            watch_errors: self.watch_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}
