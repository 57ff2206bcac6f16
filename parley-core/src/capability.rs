// ABOUTME: Named registry of optional resources plugins provide to one another
// ABOUTME: Values are stored type-erased and recovered with a checked downcast

use crate::sync::{read, write};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type Resource = Arc<dyn Any + Send + Sync>;

/// Capability lookup table injected through the dispatcher.
///
/// A plugin that owns a resource (a page pool, an HTTP client) provides
/// it under a name; actions fetch it at call time and cope with absence.
#[derive(Default)]
pub struct Capabilities {
    entries: RwLock<HashMap<String, Resource>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under `name`, returning whatever was there before
    pub fn provide<T: Any + Send + Sync>(&self, name: &str, value: Arc<T>) -> Option<Resource> {
        tracing::debug!(capability = name, "Capability provided");
        write(&self.entries).insert(name.to_string(), value)
    }

    /// Look up `name` as a `T`. A value of a different type reads as absent.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let resource = read(&self.entries).get(name)?.clone();
        resource.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.entries).contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        write(&self.entries).remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.entries).keys().cloned().collect();
        names.sort();
        names
    }
}
