//! Metadata reads for arbitrary involved-object kinds via `DynamicObject`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use evex_core::{MetadataError, MetadataSource, ObjectMetadata, ObjectRef, OwnerRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use tracing::debug;

use crate::gvk_key;

/// Reads involved objects straight from the apiserver. Resolved API resources
/// are remembered per kind; object metadata is not (see `evex_store`).
pub struct DynamicMetadataSource {
    client: Client,
    resources: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl DynamicMetadataSource {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(HashMap::new()) }
    }

    fn resources(&self) -> MutexGuard<'_, HashMap<String, (ApiResource, bool)>> {
        self.resources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn api_resource(&self, reference: &ObjectRef) -> Result<(ApiResource, bool), MetadataError> {
        let key = gvk_key(reference);
        let cached = self.resources().get(&key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let (group, version) = reference.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await.map_err(|e| classify(e, &key))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %key, plural = %ar.plural, namespaced, "resolved api resource");
        self.resources().insert(key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }
}

fn classify(err: kube::Error, what: &str) -> MetadataError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => MetadataError::NotFound(what.to_string()),
        kube::Error::Discovery(e) => MetadataError::UnknownKind(format!("{what}: {e}")),
        other => MetadataError::Backend(format!("{what}: {other}")),
    }
}

pub(crate) fn metadata_from(meta: &ObjectMeta) -> ObjectMetadata {
    ObjectMetadata {
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        owner_references: meta
            .owner_references
            .iter()
            .flatten()
            .map(|o| OwnerRef {
                api_version: o.api_version.clone(),
                kind: o.kind.clone(),
                name: o.name.clone(),
                uid: o.uid.clone(),
                controller: o.controller,
            })
            .collect(),
        deleted: meta.deletion_timestamp.is_some(),
    }
}

#[async_trait::async_trait]
impl MetadataSource for DynamicMetadataSource {
    async fn object_metadata(&self, reference: &ObjectRef) -> Result<ObjectMetadata, MetadataError> {
        let (ar, namespaced) = self.api_resource(reference).await?;
        let api: Api<DynamicObject> = match reference.namespace.as_deref() {
            Some(ns) if namespaced && !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let what = reference.cache_key().to_string();
        match api.get_opt(&reference.name).await {
            Ok(Some(obj)) => Ok(metadata_from(&obj.metadata)),
            Ok(None) => Err(MetadataError::NotFound(what)),
            Err(e) => Err(classify(e, &what)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use std::collections::BTreeMap;

    #[test]
    fn extracts_labels_owners_and_deletion() {
        let meta = ObjectMeta {
            labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: "web-6d4".into(),
                uid: "rs-uid".into(),
                controller: Some(true),
                ..Default::default()
            }]),
            deletion_timestamp: Some(Time(chrono::Utc::now())),
            ..Default::default()
        };
        let m = metadata_from(&meta);
        assert_eq!(m.labels.get("app").map(String::as_str), Some("web"));
        assert!(m.annotations.is_empty());
        assert_eq!(m.owner_references.len(), 1);
        assert_eq!(m.owner_references[0].kind, "ReplicaSet");
        assert_eq!(m.owner_references[0].controller, Some(true));
        assert!(m.deleted);
    }

    #[test]
    fn not_found_api_error_is_distinguished() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "pods \"web-1\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(classify(err, "v1/Pod default/web-1").is_not_found());
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert!(matches!(classify(err, "x"), MetadataError::Backend(_)));
    }
}
