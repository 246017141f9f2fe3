//! Data store contract and the stream-notifying adapter.
//!
//! The physical store is an external collaborator; the relay depends only on
//! the `DataStore` trait (the SDK's init/get/get-all/upsert surface). The
//! in-memory implementation is the default backend. `StoreAdapter` sits
//! between the upstream SDK client and the store, turning every applied
//! mutation into stream notifications.

use crate::streams::EnvStreams;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Features,
    Segments,
}

impl DataKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }

    /// Path prefix used in server-side stream patch/delete events.
    pub const fn patch_path_prefix(&self) -> &'static str {
        match self {
            DataKind::Features => "/flags/",
            DataKind::Segments => "/segments/",
        }
    }
}

/// A versioned item. `item: None` is a deleted-item tombstone that keeps the
/// version for stale-write detection.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<Value>,
}

impl ItemDescriptor {
    pub fn new(version: u64, item: Value) -> Self {
        Self {
            version,
            item: Some(item),
        }
    }

    pub fn deleted(version: u64) -> Self {
        Self {
            version,
            item: None,
        }
    }
}

pub type AllData = HashMap<DataKind, HashMap<String, ItemDescriptor>>;

/// The standard store surface the upstream SDK client writes through.
pub trait DataStore: Send + Sync {
    fn init(&self, data: AllData);
    fn get(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor>;
    fn get_all(&self, kind: DataKind) -> Vec<(String, ItemDescriptor)>;
    /// Applies the item if its version is newer than what is stored.
    /// Returns whether the write was applied.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool;
    fn is_initialized(&self) -> bool;
}

pub type DataStoreFactory = Arc<dyn Fn() -> Arc<dyn DataStore> + Send + Sync>;

pub fn in_memory_store_factory() -> DataStoreFactory {
    Arc::new(|| Arc::new(InMemoryDataStore::new()))
}

#[derive(Default)]
struct StoreState {
    data: AllData,
    initialized: bool,
}

#[derive(Default)]
pub struct InMemoryDataStore {
    state: RwLock<StoreState>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: AllData) {
        let mut state = self.state.write();
        state.data = data;
        state.initialized = true;
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor> {
        self.state.read().data.get(&kind)?.get(key).cloned()
    }

    fn get_all(&self, kind: DataKind) -> Vec<(String, ItemDescriptor)> {
        self.state
            .read()
            .data
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        let mut state = self.state.write();
        let items = state.data.entry(kind).or_default();
        match items.get(key) {
            Some(existing) if existing.version >= item.version => false,
            _ => {
                items.insert(key.to_string(), item);
                true
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }
}

/// Wraps the backing store and notifies the environment's streams on every
/// applied mutation. The `EnvStreams` handle is passed at construction so
/// the adapter can notify publishers without owning them.
pub struct StoreAdapter {
    store: Arc<dyn DataStore>,
    streams: Arc<EnvStreams>,
}

impl StoreAdapter {
    pub fn new(store: Arc<dyn DataStore>, streams: Arc<EnvStreams>) -> Arc<Self> {
        Arc::new(Self { store, streams })
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_initialized()
    }

    pub fn get(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor> {
        self.store.get(kind, key)
    }

    pub fn get_all(&self, kind: DataKind) -> Vec<(String, ItemDescriptor)> {
        self.store.get_all(kind)
    }

    /// Replaces the full dataset and re-broadcasts snapshots on every stream
    /// of the environment.
    pub fn init(&self, data: AllData) {
        self.store.init(data);
        self.streams.publish_full_refresh();
    }

    /// Applies one item and, when the write sticks, fans the change out:
    /// patch/delete on the server streams (flags-only gets flag changes
    /// only), ping on the mobile/browser streams.
    pub fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) {
        if self.store.upsert(kind, key, item.clone()) {
            self.streams.publish_update(kind, key, &item);
        } else {
            tracing::debug!(kind = kind.as_str(), key, "Discarded stale update");
        }
    }

    /// JSON snapshot for the server-side `/all` stream: a `put` payload of
    /// flags and segments. An uninitialized backing store yields an empty
    /// but well-formed dataset.
    pub fn all_data_snapshot(&self) -> Value {
        serde_json::json!({
            "path": "/",
            "data": {
                "flags": items_to_object(self.store.get_all(DataKind::Features)),
                "segments": items_to_object(self.store.get_all(DataKind::Segments)),
            }
        })
    }

    /// JSON snapshot for the flags-only stream: the bare flags map.
    pub fn flags_snapshot(&self) -> Value {
        items_to_object(self.store.get_all(DataKind::Features))
    }
}

/// Live (non-tombstone) items keyed by name.
pub fn items_to_object(items: Vec<(String, ItemDescriptor)>) -> Value {
    let map: serde_json::Map<String, Value> = items
        .into_iter()
        .filter_map(|(key, desc)| desc.item.map(|item| (key, item)))
        .collect();
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn versioned_upsert() {
        let store = InMemoryDataStore::new();
        assert!(!store.is_initialized());

        assert!(store.upsert(
            DataKind::Features,
            "f1",
            ItemDescriptor::new(2, json!({"key": "f1", "version": 2}))
        ));
        // stale write is not applied
        assert!(!store.upsert(
            DataKind::Features,
            "f1",
            ItemDescriptor::new(1, json!({"key": "f1", "version": 1}))
        ));
        // equal version is also stale
        assert!(!store.upsert(
            DataKind::Features,
            "f1",
            ItemDescriptor::new(2, json!({"key": "f1"}))
        ));

        let stored = store.get(DataKind::Features, "f1").unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.item.unwrap()["version"], 2);
    }

    #[test]
    fn tombstones_hide_items_from_snapshots() {
        let store = InMemoryDataStore::new();
        store.upsert(
            DataKind::Features,
            "f1",
            ItemDescriptor::new(1, json!({"key": "f1"})),
        );
        store.upsert(DataKind::Features, "f1", ItemDescriptor::deleted(2));

        let snapshot = items_to_object(store.get_all(DataKind::Features));
        assert_eq!(snapshot, json!({}));

        // but the tombstone still blocks stale resurrection
        assert!(!store.upsert(
            DataKind::Features,
            "f1",
            ItemDescriptor::new(1, json!({"key": "f1"}))
        ));
    }

    #[test]
    fn init_replaces_everything() {
        let store = InMemoryDataStore::new();
        store.upsert(
            DataKind::Features,
            "old",
            ItemDescriptor::new(1, json!({"key": "old"})),
        );

        let mut flags = HashMap::new();
        flags.insert(
            "f1".to_string(),
            ItemDescriptor::new(1, json!({"key": "f1"})),
        );
        store.init(HashMap::from([(DataKind::Features, flags)]));

        assert!(store.is_initialized());
        assert!(store.get(DataKind::Features, "old").is_none());
        assert!(store.get(DataKind::Features, "f1").is_some());
    }
}
