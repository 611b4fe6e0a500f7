//! # Container: master-side key/value store behind `ContainerGet` / `ContainerSet`.
//!
//! Lets workers share small JSON values through the master. Reading an id
//! that was never set is an error on the caller's side, not an empty value.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::BusError;

/// Shared JSON values keyed by id.
#[derive(Default)]
pub struct Container {
    entries: RwLock<HashMap<String, Value>>,
}

impl Container {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `id`.
    pub fn get(&self, id: &str) -> Result<Value, BusError> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BusError::handler(format!("no container entry {id:?}")))
    }

    /// Stores `value` under `id`; returns the previous value.
    pub fn set(&self, id: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.write().insert(id.into(), value)
    }

    /// True if `id` is set.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
