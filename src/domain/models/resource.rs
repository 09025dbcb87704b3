//! Declarative resource plumbing shared by every kind.
//!
//! Resources have the shape `{apiVersion, kind, metadata, spec, status?}`.
//! Controllers write only `status`; spec changes come from users through the
//! store's `update` path.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const API_VERSION: &str = "mitos.dev/v1";

pub(crate) fn api_version_default() -> String {
    API_VERSION.to_string()
}

/// Reference to the resource that owns (and cascades deletion to) this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
}

/// Standard object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: "default".to_string(),
            uid: None,
            owner_references: Vec::new(),
            labels: BTreeMap::new(),
            creation_timestamp: None,
        }
    }
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// `namespace/name` key used for reconcile queues and caches.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner_references.push(owner);
        self
    }
}

/// Implemented by every typed resource so the store and reconciler can be
/// generic over kinds.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Overwrite this object's status subresource with `other`'s. Lets the
    /// store keep spec writes and status writes from clobbering each other.
    fn copy_status_from(&mut self, other: &Self);

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn namespace(&self) -> &str {
        &self.meta().namespace
    }

    fn key(&self) -> String {
        self.meta().key()
    }
}

/// Declare the boilerplate `Resource` impl for a `{metadata, spec, status}`
/// struct.
macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl crate::domain::models::resource::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &crate::domain::models::resource::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut crate::domain::models::resource::ObjectMeta {
                &mut self.metadata
            }

            fn copy_status_from(&mut self, other: &Self) {
                self.status = other.status.clone();
            }
        }
    };
}

pub(crate) use impl_resource;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_key() {
        let meta = ObjectMeta::named("worker-0", "prod");
        assert_eq!(meta.key(), "prod/worker-0");
    }

    #[test]
    fn test_default_namespace() {
        let meta: ObjectMeta = serde_json::from_value(serde_json::json!({ "name": "x" })).unwrap();
        assert_eq!(meta.namespace, "default");
    }
}
