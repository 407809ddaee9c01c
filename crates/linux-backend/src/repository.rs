use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use garden::Container;

/// In-memory registry of live containers, keyed by handle.
#[derive(Debug)]
pub struct ContainerRepository<C> {
    containers: RwLock<HashMap<String, C>>,
}

impl<C> Default for ContainerRepository<C> {
    fn default() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: Container> ContainerRepository<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, C>> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, C>> {
        self.containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `container`, returning any entry it replaced.
    pub fn add(&self, container: C) -> Option<C> {
        self.write()
            .insert(container.handle().to_string(), container)
    }

    pub fn find_by_handle(&self, handle: &str) -> Option<C> {
        self.read().get(handle).cloned()
    }

    pub fn all(&self) -> Vec<C> {
        self.read().values().cloned().collect()
    }

    /// Containers matching `filter`.
    pub fn query<F>(&self, filter: F) -> Vec<C>
    where
        F: Fn(&C) -> bool,
    {
        self.read().values().filter(|c| filter(c)).cloned().collect()
    }

    pub fn delete(&self, handle: &str) -> Option<C> {
        self.write().remove(handle)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
