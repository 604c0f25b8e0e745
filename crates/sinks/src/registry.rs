use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use evex_core::{EnhancedEvent, ExporterMetrics, ReceiverRegistry, RegistryError, Sink};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    /// Concurrent sends allowed per receiver; further sends queue for a permit.
    pub max_inflight_per_receiver: usize,
    /// Registry-level bound on one send; adapters may apply their own.
    pub send_timeout: Option<Duration>,
}

impl Default for RegistryOptions {
    fn default() -> Self { Self { max_inflight_per_receiver: 64, send_timeout: None } }
}

struct Binding {
    sink: Arc<dyn Sink>,
    permits: Arc<Semaphore>,
}

/// Name -> sink bindings with concurrent, isolated delivery.
///
/// Every `send_event` becomes its own task, so one event fanned out to several
/// receivers is delivered in parallel and a failing receiver only costs its own
/// attempt. Nothing is retried here.
pub struct Receivers {
    bindings: HashMap<String, Binding>,
    tracker: TaskTracker,
    closed: AtomicBool,
    opts: RegistryOptions,
    metrics: Arc<ExporterMetrics>,
}

impl Receivers {
    pub fn new(opts: RegistryOptions, metrics: Arc<ExporterMetrics>) -> Self {
        Self { bindings: HashMap::new(), tracker: TaskTracker::new(), closed: AtomicBool::new(false), opts, metrics }
    }

    pub fn contains(&self, name: &str) -> bool { self.bindings.contains_key(name) }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Deliveries spawned and not yet finished.
    pub fn inflight(&self) -> usize { self.tracker.len() }
}

#[async_trait::async_trait]
impl ReceiverRegistry for Receivers {
    fn register(&mut self, name: &str, sink: Arc<dyn Sink>) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        if self.bindings.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        let permits = Arc::new(Semaphore::new(self.opts.max_inflight_per_receiver.max(1)));
        self.bindings.insert(name.to_string(), Binding { sink, permits });
        debug!(receiver = %name, "receiver registered");
        Ok(())
    }

    fn send_event(&self, name: &str, event: &Arc<EnhancedEvent>) {
        if self.closed.load(Ordering::SeqCst) {
            self.metrics.send_error();
            warn!(receiver = %name, "registry closed; event not sent");
            return;
        }
        let Some(binding) = self.bindings.get(name) else {
            self.metrics.send_error();
            warn!(receiver = %name, "no receiver registered under this name");
            return;
        };
        let sink = Arc::clone(&binding.sink);
        let permits = Arc::clone(&binding.permits);
        let event = Arc::clone(event);
        let metrics = Arc::clone(&self.metrics);
        let timeout = self.opts.send_timeout;
        let receiver = name.to_string();
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else { return };
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, sink.send(&event)).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow!("send timed out after {limit:?}")),
                },
                None => sink.send(&event).await,
            };
            match outcome {
                Ok(()) => trace!(receiver = %receiver, name = %event.record.metadata.name, "event sent"),
                Err(e) => {
                    metrics.send_error();
                    error!(receiver = %receiver, error = %e, "failed to send event");
                }
            }
        });
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker.close();
        debug!(inflight = self.tracker.len(), "draining receivers");
        self.tracker.wait().await;
        for (name, binding) in &self.bindings {
            binding.sink.close().await;
            debug!(receiver = %name, "receiver closed");
        }
    }
}
