//! Explicit constructor registry for pluggable service implementations.
//!
//! Deployments choose their location-service and update-policy
//! implementations by string key in the node configuration. The registry is
//! an ordinary object owned by process-level configuration; there is no
//! ambient global factory state.

use std::collections::HashMap;

/// Maps string keys to constructor functions for one pluggable service
/// kind.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use meridian_location_system::{LocationUpdatePolicy, ServiceRegistry};
///
/// let mut registry = ServiceRegistry::new();
/// registry.register("standard", || Arc::new(LocationUpdatePolicy::new()));
///
/// let policy = registry.construct("standard").expect("registered above");
/// ```
pub struct ServiceRegistry<T> {
    constructors: HashMap<String, Box<dyn Fn() -> T + Send + Sync>>,
}

impl<T> ServiceRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers a constructor under `key`, replacing any previous one.
    pub fn register<F>(&mut self, key: impl Into<String>, constructor: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.constructors.insert(key.into(), Box::new(constructor));
    }

    /// Constructs the implementation registered under `key`.
    pub fn construct(&self, key: &str) -> Option<T> {
        self.constructors.get(key).map(|ctor| ctor())
    }

    /// Registered keys, unordered.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl<T> Default for ServiceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ServiceRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("keys", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_construct() {
        let mut registry: ServiceRegistry<u32> = ServiceRegistry::new();
        registry.register("answer", || 42);

        assert_eq!(registry.construct("answer"), Some(42));
        assert_eq!(registry.construct("missing"), None);
    }

    #[test]
    fn test_reregistering_replaces() {
        let mut registry: ServiceRegistry<u32> = ServiceRegistry::new();
        registry.register("v", || 1);
        registry.register("v", || 2);

        assert_eq!(registry.construct("v"), Some(2));
        assert_eq!(registry.keys().count(), 1);
    }
}
