//! ResourceStore port - declarative CRUD + watch over typed resources.
//!
//! Controllers never mutate specs; they write only through
//! [`set_status`](ResourceStore::set_status). Watch streams deliver the full
//! object on every change, so reconcilers can treat each event as a level
//! trigger rather than an edge.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::errors::StoreError;
use crate::domain::models::Resource;

/// One change notification on a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// Created or updated (spec or status).
    Applied(T),
    Deleted(T),
}

impl<T: Resource> WatchEvent<T> {
    pub fn resource(&self) -> &T {
        match self {
            Self::Applied(r) | Self::Deleted(r) => r,
        }
    }

    /// `namespace/name` of the affected resource.
    pub fn key(&self) -> String {
        self.resource().key()
    }
}

/// Typed store for one resource kind.
#[async_trait]
pub trait ResourceStore<T: Resource>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError>;

    /// List all resources, optionally restricted to a namespace.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError>;

    /// List resources carrying `labels[key] == value`.
    async fn list_labeled(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<Vec<T>, StoreError>;

    async fn create(&self, resource: T) -> Result<T, StoreError>;

    /// Replace the stored object (spec-level change; bumps the watch stream).
    async fn update(&self, resource: T) -> Result<T, StoreError>;

    /// Delete and return the object if present. Deletion cascades to
    /// resources holding an owner reference to the deleted object.
    async fn delete(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError>;

    /// Write only the status subresource of `resource`, leaving any
    /// concurrently updated spec untouched.
    async fn set_status(&self, resource: T) -> Result<T, StoreError>;

    /// Subscribe to change notifications. Slow consumers may observe
    /// `Lagged` and should relist.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}
