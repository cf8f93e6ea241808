//! Name-keyed registry with atomic register/unregister, grounded in the
//! `Arc<Mutex<HashMap<..>>>` plus `entry().or_insert_with()` idiom from
//! the original `core::registry::Registry::subscribe`.
//!
//! One instance is kept per kind (service, chain, limiter); `register`
//! folds the "is it already there" check and the insert into a single
//! critical section so `IsRegistered`+`Register` is observably atomic.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;

use crate::error::ForwardError;

/// A name-keyed registry for values of type `T`.
pub struct Registry<T> {
    entries: Mutex<HashMap<String, T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.lock().expect("registry lock poisoned").contains_key(name)
    }

    /// Registers `value` under `name`. Fails with `Duplicate` if the name
    /// is already present; the map is left untouched on failure.
    pub fn register(&self, name: &str, value: T) -> Result<(), ForwardError> {
        let mut guard = self.entries.lock().expect("registry lock poisoned");
        match guard.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ForwardError::Duplicate(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    /// Removes `name`, returning the prior value if it was present.
    pub fn unregister(&self, name: &str) -> Option<T> {
        self.entries.lock().expect("registry lock poisoned").remove(name)
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.entries.lock().expect("registry lock poisoned").get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().expect("registry lock poisoned").keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicate_names() {
        let reg: Registry<u32> = Registry::new();
        reg.register("a", 1).unwrap();
        let err = reg.register("a", 2).unwrap_err();
        assert_eq!(err.kind(), "Duplicate");
        assert_eq!(reg.get("a"), Some(1));
    }

    #[test]
    fn unregister_then_get_observes_removal() {
        let reg: Registry<u32> = Registry::new();
        reg.register("a", 1).unwrap();
        assert!(reg.is_registered("a"));
        assert_eq!(reg.unregister("a"), Some(1));
        assert!(!reg.is_registered("a"));
        assert_eq!(reg.get("a"), None);
    }

    #[test]
    fn reregister_after_unregister_succeeds() {
        let reg: Registry<u32> = Registry::new();
        reg.register("a", 1).unwrap();
        reg.unregister("a");
        reg.register("a", 2).unwrap();
        assert_eq!(reg.get("a"), Some(2));
    }
}
