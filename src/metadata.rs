//! Layered experiment metadata.
//!
//! Beamtime, experiment, sample and scan-plan metadata form a chain: each child
//! reads through to its ancestors and may shadow any key with its own value.
//!
//! ## `Layer`
//!
//! A `Layer` is a shared handle to one mapping. Cloning a layer clones the handle,
//! not the map, so an edit made through the beamtime is visible at once from every
//! experiment and scan plan that chains onto it.
//!
//! ## `ChainMap`
//!
//! An ordered list of layers, child first. Lookups walk the list and stop at the
//! first layer that owns the key; writes always land in the first layer, so a child
//! can override an ancestor but never modify it.
//!
//! Values are `serde_json::Value` so arbitrary user metadata (compositions,
//! experimenter lists, calibration snapshots) round-trips through YAML unchanged.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Ordered key/value metadata.
pub type MetadataMap = BTreeMap<String, Value>;

/// Shared handle to one metadata mapping.
#[derive(Debug, Clone, Default)]
pub struct Layer(Arc<RwLock<MetadataMap>>);

impl Layer {
    /// Wrap a mapping in a fresh shared handle.
    pub fn new(map: MetadataMap) -> Self {
        Self(Arc::new(RwLock::new(map)))
    }

    /// Current value of `key` in this layer only.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.read().get(key).cloned()
    }

    /// True if this layer holds `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.read().contains_key(key)
    }

    /// Returns the previous value, if any.
    pub fn insert(&self, key: &str, value: Value) -> Option<Value> {
        self.0.write().insert(key.to_string(), value)
    }

    /// Remove `key` from this layer.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.write().remove(key)
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> MetadataMap {
        self.0.read().clone()
    }

    /// True if both handles point at the same mapping.
    pub fn same_layer(&self, other: &Layer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Layer {
    fn eq(&self, other: &Self) -> bool {
        self.same_layer(other) || self.snapshot() == other.snapshot()
    }
}

/// Child-first list of metadata layers with read-through lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainMap {
    layers: Vec<Layer>,
}

impl Default for ChainMap {
    fn default() -> Self {
        Self::new(MetadataMap::new())
    }
}

impl ChainMap {
    /// A chain with a single, unparented layer.
    pub fn new(own: MetadataMap) -> Self {
        Self {
            layers: vec![Layer::new(own)],
        }
    }

    /// A new child layer chained in front of `parent`'s layers.
    pub fn with_parent(own: MetadataMap, parent: &ChainMap) -> Self {
        let mut layers = Vec::with_capacity(parent.layers.len() + 1);
        layers.push(Layer::new(own));
        layers.extend(parent.layers.iter().cloned());
        Self { layers }
    }

    /// Build from explicit layers, child first. An empty list gets one fresh layer.
    pub fn from_layers(mut layers: Vec<Layer>) -> Self {
        if layers.is_empty() {
            layers.push(Layer::default());
        }
        Self { layers }
    }

    /// First value found for `key`, child layer first.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }

    /// String value of `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// True if any layer holds `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.layers.iter().any(|layer| layer.contains_key(key))
    }

    /// Write into the child layer; ancestors are never modified.
    pub fn insert(&self, key: &str, value: Value) -> Option<Value> {
        self.own_layer().insert(key, value)
    }

    /// Insert `value` unless the key is visible anywhere in the chain.
    pub fn set_default(&self, key: &str, value: Value) -> Value {
        if let Some(existing) = self.get(key) {
            return existing;
        }
        self.insert(key, value.clone());
        value
    }

    /// The layer this entity owns.
    pub fn own_layer(&self) -> &Layer {
        // Every constructor guarantees at least one layer.
        &self.layers[0]
    }

    /// All layers, child first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Every key visible through the chain.
    pub fn keys(&self) -> BTreeSet<String> {
        self.layers
            .iter()
            .flat_map(|layer| layer.snapshot().into_keys())
            .collect()
    }

    /// Merge all layers into one map, children overriding ancestors.
    pub fn flatten(&self) -> MetadataMap {
        let mut merged = MetadataMap::new();
        for layer in self.layers.iter().rev() {
            merged.extend(layer.snapshot());
        }
        merged
    }

    /// Per-layer copies, child first, as persisted on disk.
    pub fn snapshot_layers(&self) -> Vec<MetadataMap> {
        self.layers.iter().map(Layer::snapshot).collect()
    }
}

/// Shorthand for building a [`MetadataMap`] from `(key, value)` pairs.
pub fn metadata_from<K, I>(pairs: I) -> MetadataMap
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
