//! evex kubehub: event watcher and control plane wiring.

#![forbid(unsafe_code)]

mod dynamic;
mod watcher;

pub use dynamic::DynamicMetadataSource;
pub use watcher::{EventProcessor, EventWatcher, WatcherConfig};

use evex_core::{EventMeta, EventRecord, EventSeries, EventSource, ObjectRef, RawEvent};
use k8s_openapi::api::core::v1::Event;

/// Copy a `core/v1 Event` into the pipeline's own representation.
/// `metadata.managedFields` is server bookkeeping and is not carried over.
pub fn raw_event_from(ev: &Event) -> RawEvent {
    let meta = &ev.metadata;
    let io = &ev.involved_object;
    RawEvent {
        record: EventRecord {
            metadata: EventMeta {
                name: meta.name.clone().unwrap_or_default(),
                namespace: meta.namespace.clone(),
                uid: meta.uid.clone(),
                resource_version: meta.resource_version.clone(),
                creation_timestamp: meta.creation_timestamp.as_ref().map(|t| t.0),
                labels: meta.labels.clone().unwrap_or_default(),
                annotations: meta.annotations.clone().unwrap_or_default(),
            },
            message: ev.message.clone().unwrap_or_default(),
            reason: ev.reason.clone().unwrap_or_default(),
            type_: ev.type_.clone().unwrap_or_default(),
            action: ev.action.clone(),
            source: ev
                .source
                .as_ref()
                .map(|s| EventSource { component: s.component.clone(), host: s.host.clone() })
                .unwrap_or_default(),
            reporting_component: ev.reporting_component.clone(),
            reporting_instance: ev.reporting_instance.clone(),
            first_timestamp: ev.first_timestamp.as_ref().map(|t| t.0),
            last_timestamp: ev.last_timestamp.as_ref().map(|t| t.0),
            event_time: ev.event_time.as_ref().map(|t| t.0),
            series: ev.series.as_ref().map(|s| EventSeries {
                count: s.count.unwrap_or(0),
                last_observed_time: s.last_observed_time.as_ref().map(|t| t.0),
            }),
            count: ev.count.unwrap_or(0),
        },
        involved_object: ObjectRef {
            api_version: io.api_version.clone().unwrap_or_default(),
            kind: io.kind.clone().unwrap_or_default(),
            namespace: io.namespace.clone(),
            name: io.name.clone().unwrap_or_default(),
            uid: io.uid.clone(),
            resource_version: io.resource_version.clone(),
            field_path: io.field_path.clone(),
        },
    }
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(reference: &ObjectRef) -> String {
    format!("{}/{}", reference.api_version, reference.kind)
}
