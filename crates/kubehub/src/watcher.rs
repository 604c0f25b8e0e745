//! Event watcher: list+watch `core/v1 Event`, filter stale observations,
//! enrich the rest and hand them to the pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use evex_core::{EnhancedEvent, EventHandler, EventRecord, ExporterMetrics, MetadataSource, RawEvent};
use evex_store::ObjectMetadataCache;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{raw_event_from, DynamicMetadataSource};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Watch a single namespace; `None` watches all.
    pub namespace: Option<String>,
    /// Older observations are discarded; `None` keeps everything.
    pub max_event_age: Option<Duration>,
    /// Skip involved-object lookups entirely.
    pub omit_lookup: bool,
    pub cache_size: usize,
    /// Upper bound for [`EventWatcher::stop`].
    pub stop_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            max_event_age: Some(Duration::from_secs(5)),
            omit_lookup: false,
            cache_size: 1024,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-observation logic, independent of the watch stream.
pub struct EventProcessor {
    max_event_age: Option<Duration>,
    metadata: Option<Arc<dyn MetadataSource>>,
    handler: EventHandler,
    metrics: Arc<ExporterMetrics>,
    start_time: DateTime<Utc>,
}

impl EventProcessor {
    /// `metadata: None` passes involved objects through unresolved.
    pub fn new(
        max_event_age: Option<Duration>,
        metadata: Option<Arc<dyn MetadataSource>>,
        handler: EventHandler,
        metrics: Arc<ExporterMetrics>,
    ) -> Self {
        Self { max_event_age, metadata, handler, metrics, start_time: Utc::now() }
    }

    pub fn start_time(&self) -> DateTime<Utc> { self.start_time }

    /// Observations stamped before this instant are initial replay; discarding
    /// them is not worth a warning.
    pub fn set_start_time(&mut self, t: DateTime<Utc>) { self.start_time = t; }

    /// Age filter. Counts and logs the discard. An event with no timestamp at
    /// all is treated as stale.
    pub fn is_discarded(&self, record: &EventRecord, now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.max_event_age else { return false };
        let ts = record.last_activity();
        let age = ts.map(|ts| (now - ts).to_std().unwrap_or(Duration::ZERO));
        if matches!(age, Some(age) if age <= max_age) {
            return false;
        }
        self.metrics.event_discarded();
        let ns = record.metadata.namespace.as_deref().unwrap_or("");
        if ts.map(|ts| ts > self.start_time).unwrap_or(false) {
            warn!(age = ?age, ns = %ns, name = %record.metadata.name, "event discarded as older than max event age");
        } else {
            debug!(age = ?age, ns = %ns, name = %record.metadata.name, "discarded stale event from initial sync");
        }
        true
    }

    /// Process one add/update observation.
    pub async fn on_event(&self, raw: RawEvent) {
        if self.is_discarded(&raw.record, Utc::now()) {
            return;
        }
        debug!(
            msg = %raw.record.message,
            ns = ?raw.record.metadata.namespace,
            reason = %raw.record.reason,
            involved = %raw.involved_object.name,
            "received event"
        );
        self.metrics.event_processed();

        let ev = match &self.metadata {
            None => EnhancedEvent::unresolved(raw),
            Some(source) => match source.object_metadata(&raw.involved_object).await {
                Ok(meta) => EnhancedEvent::with_metadata(raw, meta),
                Err(e) if e.is_not_found() => {
                    debug!(error = %e, "involved object not found, likely deleted");
                    EnhancedEvent::deleted(raw)
                }
                Err(e) => {
                    error!(error = %e, "failed to get involved object metadata");
                    EnhancedEvent::unresolved(raw)
                }
            },
        };
        (self.handler)(ev);
    }

    pub async fn on_kube_event(&self, ev: &Event) {
        self.on_event(raw_event_from(ev)).await
    }
}

type WatchStream = BoxStream<'static, Result<watcher::Event<Event>, watcher::Error>>;

/// Opens a new watch stream for each start.
pub(crate) type StreamFactory = Box<dyn Fn() -> WatchStream + Send + Sync>;

/// Long-running consumer of the event stream.
pub struct EventWatcher {
    source: StreamFactory,
    processor: Arc<EventProcessor>,
    metrics: Arc<ExporterMetrics>,
    stop_timeout: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EventWatcher {
    /// Wire a watcher with the dynamic metadata reader behind the LRU cache,
    /// unless lookups are disabled.
    pub fn new(client: Client, cfg: &WatcherConfig, metrics: Arc<ExporterMetrics>, handler: EventHandler) -> Self {
        let metadata: Option<Arc<dyn MetadataSource>> = if cfg.omit_lookup {
            None
        } else {
            let source = Arc::new(DynamicMetadataSource::new(client.clone()));
            Some(Arc::new(ObjectMetadataCache::new(source, cfg.cache_size, Arc::clone(&metrics))))
        };
        let processor = EventProcessor::new(cfg.max_event_age, metadata, handler, Arc::clone(&metrics));
        Self::with_processor(client, cfg, processor, metrics)
    }

    pub fn with_processor(client: Client, cfg: &WatcherConfig, processor: EventProcessor, metrics: Arc<ExporterMetrics>) -> Self {
        let api: Api<Event> = match cfg.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Api::namespaced(client, ns),
            _ => Api::all(client),
        };
        let source: StreamFactory =
            Box::new(move || watcher::watcher(api.clone(), watcher::Config::default()).default_backoff().boxed());
        Self::from_parts(source, processor, metrics, cfg.stop_timeout)
    }

    pub(crate) fn from_parts(source: StreamFactory, processor: EventProcessor, metrics: Arc<ExporterMetrics>, stop_timeout: Duration) -> Self {
        Self {
            source,
            processor: Arc::new(processor),
            metrics,
            stop_timeout,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn processor(&self) -> &Arc<EventProcessor> { &self.processor }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Begin consuming in the background.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("event watcher already started");
            return;
        }
        // A token cancelled by an earlier stop would end the new consumer at once.
        self.cancel = CancellationToken::new();
        let stream = (self.source)();
        let processor = Arc::clone(&self.processor);
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(consume(stream, processor, metrics, cancel)));
    }

    /// Ask the consumer to finish and wait for it, at most `stop_timeout`.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        let Some(mut task) = self.task.take() else { return };
        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "event watcher task ended abnormally"),
            Err(_) => {
                warn!(timeout = ?self.stop_timeout, "event watcher did not stop in time; aborting");
                task.abort();
            }
        }
    }
}

/// Drain the watch stream in delivery order until cancelled or exhausted.
/// Stream errors are counted; the backoff wrapper re-establishes the watch.
pub(crate) async fn consume<S>(stream: S, processor: Arc<EventProcessor>, metrics: Arc<ExporterMetrics>, cancel: CancellationToken)
where
    S: Stream<Item = Result<watcher::Event<Event>, watcher::Error>> + Send,
{
    futures::pin_mut!(stream);
    info!("event watcher started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(watcher::Event::Applied(ev))) => processor.on_kube_event(&ev).await,
            Some(Ok(watcher::Event::Restarted(list))) => {
                debug!(count = list.len(), "event watch (re)listed");
                for ev in list.iter() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    processor.on_kube_event(ev).await;
                }
            }
            Some(Ok(watcher::Event::Deleted(_))) => {}
            Some(Err(e)) => {
                metrics.watch_error();
                warn!(error = %e, "event watch error");
            }
            None => {
                warn!("event watch stream ended");
                break;
            }
        }
    }
    info!("event watcher stopped");
}
