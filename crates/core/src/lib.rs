//! evex core types: raw and enriched events, involved-object metadata, and the
//! traits the watcher, cache, router and delivery layer meet at.

#![forbid(unsafe_code)]

pub mod counters;
pub mod path;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use crate::counters::{ExporterMetrics, MetricsSnapshot};

/// Labels and annotations. Ordered so serialized events are deterministic.
pub type StringMap = BTreeMap<String, String>;

/// Reference to the object an event concerns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
}

impl ObjectRef {
    /// Split `apiVersion` into `(group, version)`; the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone().unwrap_or_default(),
            name: self.name.clone(),
        }
    }
}

/// Identity of an involved object for metadata memoization. The UID is left
/// out: only one live object exists per kind/namespace/name at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version, self.kind, self.name)
        } else {
            write!(f, "{}/{} {}/{}", self.api_version, self.kind, self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

/// Resolved metadata of an involved object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    #[serde(default)]
    pub labels: StringMap,
    #[serde(default)]
    pub annotations: StringMap,
    #[serde(default)]
    pub owner_references: SmallVec<[OwnerRef; 1]>,
    /// Object is gone or carries a deletion timestamp.
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub labels: StringMap,
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub annotations: StringMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Aggregation state of a repeating event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventSeries {
    #[serde(default)]
    pub count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_time: Option<DateTime<Utc>>,
}

/// Everything an event carries apart from its involved object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(default)]
    pub metadata: EventMeta,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<EventSeries>,
    #[serde(default)]
    pub count: i32,
}

impl EventRecord {
    /// Most recent activity: series observation, then last timestamp, then
    /// event time, then first timestamp.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.series
            .as_ref()
            .and_then(|s| s.last_observed_time)
            .or(self.last_timestamp)
            .or(self.event_time)
            .or(self.first_timestamp)
    }

    /// Repeat count, preferring the series count when one is present.
    pub fn effective_count(&self) -> i32 {
        match &self.series {
            Some(s) if s.count > 0 => s.count,
            _ => self.count,
        }
    }
}

/// An event as observed on the control plane stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(flatten)]
    pub record: EventRecord,
    #[serde(default)]
    pub involved_object: ObjectRef,
}

/// Involved object reference plus whatever metadata could be resolved for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvolvedObject {
    #[serde(flatten)]
    pub reference: ObjectRef,
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub labels: StringMap,
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub annotations: StringMap,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub owner_references: SmallVec<[OwnerRef; 1]>,
    #[serde(default)]
    pub deleted: bool,
}

/// A raw event enriched with its involved object's metadata. Immutable once
/// built; shared across delivery tasks behind an `Arc`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedEvent {
    #[serde(flatten)]
    pub record: EventRecord,
    pub involved_object: InvolvedObject,
}

impl EnhancedEvent {
    /// Pass the involved object through without metadata.
    pub fn unresolved(raw: RawEvent) -> Self {
        Self {
            record: raw.record,
            involved_object: InvolvedObject { reference: raw.involved_object, ..Default::default() },
        }
    }

    /// Involved object known to be gone; metadata left empty.
    pub fn deleted(raw: RawEvent) -> Self {
        let mut ev = Self::unresolved(raw);
        ev.involved_object.deleted = true;
        ev
    }

    pub fn with_metadata(raw: RawEvent, meta: ObjectMetadata) -> Self {
        Self {
            record: raw.record,
            involved_object: InvolvedObject {
                reference: raw.involved_object,
                labels: meta.labels,
                annotations: meta.annotations,
                owner_references: meta.owner_references,
                deleted: meta.deleted,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        // String-keyed maps only; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Failures resolving an involved object's metadata.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("resource kind not served: {0}")]
    UnknownKind(String),
    #[error("metadata lookup failed: {0}")]
    Backend(String),
}

impl MetadataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound(_))
    }
}

/// Resolves involved-object metadata. Implemented by the control plane reader
/// and by the memoizing cache layered over it.
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    async fn object_metadata(&self, reference: &ObjectRef) -> Result<ObjectMetadata, MetadataError>;
}

/// A delivery destination. One `send` is one attempt; the outcome is binary.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, event: &EnhancedEvent) -> anyhow::Result<()>;

    /// Release held resources (connection pools, buffers).
    async fn close(&self) {}
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("receiver name must not be empty")]
    EmptyName,
    #[error("receiver already registered: {0}")]
    Duplicate(String),
    #[error("registry is closed")]
    Closed,
}

/// Named destinations the router sends to.
#[async_trait::async_trait]
pub trait ReceiverRegistry: Send + Sync {
    /// Bind `name` to `sink`. Names are bound once, before routing starts.
    fn register(&mut self, name: &str, sink: Arc<dyn Sink>) -> Result<(), RegistryError>;

    /// Dispatch without waiting for delivery.
    fn send_event(&self, name: &str, event: &Arc<EnhancedEvent>);

    /// Drain in-flight deliveries and close every sink.
    async fn close(&self);
}

/// Receives each enriched, non-discarded event.
pub type EventHandler = Arc<dyn Fn(EnhancedEvent) + Send + Sync>;

pub mod prelude {
    pub use super::{
        CacheKey, EnhancedEvent, EventHandler, EventMeta, EventRecord, EventSeries, EventSource,
        ExporterMetrics, InvolvedObject, MetadataError, MetadataSource, ObjectMetadata, ObjectRef,
        OwnerRef, RawEvent, ReceiverRegistry, RegistryError, Sink, StringMap,
    };
}
