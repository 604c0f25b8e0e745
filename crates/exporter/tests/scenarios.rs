use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use evex_core::{EnhancedEvent, ExporterMetrics, MetadataError, MetadataSource, ObjectMetadata, ObjectRef, RawEvent, ReceiverRegistry, RegistryError, Sink};
use evex_kubehub::EventProcessor;
use evex_route::{Route, RouteSpec, Router};

#[derive(Default)]
struct Recording {
    sent: Mutex<Vec<(String, EnhancedEvent)>>,
}

#[async_trait::async_trait]
impl ReceiverRegistry for Recording {
    fn register(&mut self, _name: &str, _sink: Arc<dyn Sink>) -> Result<(), RegistryError> { Ok(()) }
    fn send_event(&self, name: &str, event: &Arc<EnhancedEvent>) {
        self.sent.lock().unwrap().push((name.to_string(), (**event).clone()));
    }
    async fn close(&self) {}
}

struct Gone;

#[async_trait::async_trait]
impl MetadataSource for Gone {
    async fn object_metadata(&self, r: &ObjectRef) -> Result<ObjectMetadata, MetadataError> {
        Err(MetadataError::NotFound(r.cache_key().to_string()))
    }
}

#[derive(Clone, Default)]
struct LogBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

fn web_1_failed(age_secs: i64) -> RawEvent {
    let mut raw = RawEvent::default();
    raw.record.metadata.name = "web-1.17a".into();
    raw.record.metadata.namespace = Some("default".into());
    raw.record.reason = "Failed".into();
    raw.record.last_timestamp = Some(Utc::now() - chrono::Duration::seconds(age_secs));
    raw.involved_object = ObjectRef {
        api_version: "v1".into(),
        kind: "Pod".into(),
        namespace: Some("default".into()),
        name: "web-1".into(),
        ..Default::default()
    };
    raw
}

fn console_pipeline(
    max_age_secs: u64,
    metadata: Option<Arc<dyn MetadataSource>>,
) -> (EventProcessor, Arc<Recording>, Arc<ExporterMetrics>) {
    let spec: RouteSpec = serde_yaml::from_str("receivers: [console]").unwrap();
    let registry = Arc::new(Recording::default());
    let router = Arc::new(Router::new(Route::compile(&spec).unwrap(), registry.clone()));
    let metrics = Arc::new(ExporterMetrics::default());
    let processor = EventProcessor::new(Some(Duration::from_secs(max_age_secs)), metadata, router.handler(), Arc::clone(&metrics));
    (processor, registry, metrics)
}

#[tokio::test]
async fn fresh_event_reaches_console_once() {
    let (p, registry, metrics) = console_pipeline(300, None);
    p.on_event(web_1_failed(10)).await;

    let sent = registry.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "console");
    assert_eq!(sent[0].1.record.reason, "Failed");
    assert_eq!(sent[0].1.involved_object.reference.name, "web-1");
    let s = metrics.snapshot();
    assert_eq!(s.events_discarded, 0);
    assert_eq!(s.events_processed, 1);
}

#[tokio::test]
async fn stale_replayed_event_is_discarded_quietly() {
    let (mut p, registry, metrics) = console_pipeline(5, None);
    p.set_start_time(Utc::now());

    let buf = LogBuf::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();
    {
        let _guard = tracing::subscriber::set_default(subscriber);
        p.on_event(web_1_failed(10)).await;
    }

    assert!(registry.sent.lock().unwrap().is_empty());
    assert_eq!(metrics.snapshot().events_discarded, 1);
    let logs = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert!(!logs.contains("WARN"), "{logs}");
}

#[tokio::test]
async fn missing_object_still_reaches_routing() {
    let (p, registry, _) = console_pipeline(300, Some(Arc::new(Gone) as Arc<dyn MetadataSource>));
    p.on_event(web_1_failed(1)).await;

    let sent = registry.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let io = &sent[0].1.involved_object;
    assert!(io.deleted);
    assert!(io.labels.is_empty() && io.annotations.is_empty() && io.owner_references.is_empty());
}
