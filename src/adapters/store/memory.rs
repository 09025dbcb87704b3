//! In-memory resource store with watch streams.
//!
//! Behaves like a declarative API server for one resource kind: CRUD with
//! identifier validation, a status subresource that cannot clobber specs
//! (and vice versa), and a broadcast watch stream delivering the full
//! object on every change.
//!
//! Owner-reference cascade is a controller concern here: controllers watch
//! `Deleted` events of the owner kind and delete the children they created.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::errors::StoreError;
use crate::domain::models::envelope::validate_identifier;
use crate::domain::models::Resource;
use crate::domain::ports::{ResourceStore, WatchEvent};

const WATCH_CAPACITY: usize = 256;

pub struct MemoryStore<T: Resource> {
    items: RwLock<HashMap<String, T>>,
    tx: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Resource> MemoryStore<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            items: RwLock::new(HashMap::new()),
            tx,
        }
    }

    fn validate(resource: &T) -> Result<(), StoreError> {
        let meta = resource.meta();
        if !validate_identifier(&meta.name) {
            return Err(StoreError::Invalid(format!("invalid name '{}'", meta.name)));
        }
        if !validate_identifier(&meta.namespace) {
            return Err(StoreError::Invalid(format!("invalid namespace '{}'", meta.namespace)));
        }
        Ok(())
    }

    fn notify(&self, event: WatchEvent<T>) {
        // No receivers is fine; controllers may not have started yet.
        let _ = self.tx.send(event);
    }
}

impl<T: Resource> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Resource> ResourceStore<T> for MemoryStore<T> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError> {
        let items = self.items.read().map_err(|_| StoreError::Invalid("store poisoned".to_string()))?;
        Ok(items.get(&format!("{namespace}/{name}")).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        let items = self.items.read().map_err(|_| StoreError::Invalid("store poisoned".to_string()))?;
        let mut result: Vec<T> = items
            .values()
            .filter(|r| namespace.is_none_or(|ns| r.namespace() == ns))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(result)
    }

    async fn list_labeled(
        &self,
        namespace: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<Vec<T>, StoreError> {
        let all = self.list(namespace).await?;
        Ok(all
            .into_iter()
            .filter(|r| r.meta().label(key) == Some(value))
            .collect())
    }

    async fn create(&self, mut resource: T) -> Result<T, StoreError> {
        Self::validate(&resource)?;

        let key = resource.key();
        let mut items = self.items.write().map_err(|_| StoreError::Invalid("store poisoned".to_string()))?;
        if items.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                namespace: resource.namespace().to_string(),
                name: resource.name().to_string(),
            });
        }

        let meta = resource.meta_mut();
        meta.uid = Some(Uuid::new_v4());
        meta.creation_timestamp = Some(Utc::now());

        items.insert(key, resource.clone());
        drop(items);

        self.notify(WatchEvent::Applied(resource.clone()));
        Ok(resource)
    }

    async fn update(&self, mut resource: T) -> Result<T, StoreError> {
        Self::validate(&resource)?;

        let key = resource.key();
        let mut items = self.items.write().map_err(|_| StoreError::Invalid("store poisoned".to_string()))?;
        let Some(existing) = items.get(&key) else {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                namespace: resource.namespace().to_string(),
                name: resource.name().to_string(),
            });
        };

        // Spec-level writes never touch the status subresource.
        resource.copy_status_from(existing);
        resource.meta_mut().uid = existing.meta().uid;
        resource.meta_mut().creation_timestamp = existing.meta().creation_timestamp;

        items.insert(key, resource.clone());
        drop(items);

        self.notify(WatchEvent::Applied(resource.clone()));
        Ok(resource)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError> {
        let mut items = self.items.write().map_err(|_| StoreError::Invalid("store poisoned".to_string()))?;
        let removed = items.remove(&format!("{namespace}/{name}"));
        drop(items);

        if let Some(resource) = &removed {
            self.notify(WatchEvent::Deleted(resource.clone()));
        }
        Ok(removed)
    }

    async fn set_status(&self, resource: T) -> Result<T, StoreError> {
        let key = resource.key();
        let mut items = self.items.write().map_err(|_| StoreError::Invalid("store poisoned".to_string()))?;
        let Some(existing) = items.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                namespace: resource.namespace().to_string(),
                name: resource.name().to_string(),
            });
        };

        // Status-level writes never touch the spec.
        existing.copy_status_from(&resource);
        let updated = existing.clone();
        drop(items);

        self.notify(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.tx.subscribe()
    }
}
