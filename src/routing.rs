// Copyright (c) 2025, The Messenger Authors
// MIT License
// All rights reserved.

//! # Routing Keys
//!
//! This module defines routing keys and the registry used to resolve the key
//! of an inbound delivery. Non-multiple keys bind the single shared queue, so
//! one instance across the fleet receives each message (competing consumers).
//! Multiple keys bind a private exclusive queue per running instance, so
//! every instance receives its own copy (fan-out).
//!
//! The registry is an immutable map built at construction time; duplicate key
//! strings are rejected there rather than surfacing at dispatch time.

use crate::errors::AmqpError;
use std::collections::HashMap;

/// A registered routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub(crate) key: String,
    pub(crate) multiple: bool,
}

impl RoutingKey {
    /// Creates a routing key with competing-consumers semantics: the key is
    /// bound to the shared queue and each message is delivered once across
    /// all running instances.
    pub fn new(key: impl Into<String>) -> RoutingKey {
        RoutingKey {
            key: key.into(),
            multiple: false,
        }
    }

    /// Creates a fan-out routing key: the key is bound to a private exclusive
    /// queue per instance, so every instance receives its own copy.
    pub fn multiple(key: impl Into<String>) -> RoutingKey {
        RoutingKey {
            key: key.into(),
            multiple: true,
        }
    }

    /// The key string used for bindings and publishes.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this key has fan-out semantics.
    pub fn is_multiple(&self) -> bool {
        self.multiple
    }
}

/// Immutable set of registered routing keys, resolvable by key string.
#[derive(Debug, Clone)]
pub struct RoutingKeyRegistry {
    keys: HashMap<String, RoutingKey>,
}

impl RoutingKeyRegistry {
    /// Builds the registry, failing when two keys share the same string.
    pub fn new(keys: Vec<RoutingKey>) -> Result<RoutingKeyRegistry, AmqpError> {
        let mut map = HashMap::with_capacity(keys.len());

        for key in keys {
            if map.insert(key.key.clone(), key.clone()).is_some() {
                return Err(AmqpError::InvalidTopology(format!(
                    "duplicated routing key `{}`",
                    key.key
                )));
            }
        }

        Ok(RoutingKeyRegistry { keys: map })
    }

    /// Resolves a routing key by its string, failing on unregistered keys.
    pub fn resolve(&self, key: &str) -> Result<&RoutingKey, AmqpError> {
        self.keys
            .get(key)
            .ok_or_else(|| AmqpError::UnknownRoutingKey(key.to_owned()))
    }

    /// Keys bound to the shared queue.
    pub fn shared(&self) -> impl Iterator<Item = &RoutingKey> {
        self.keys.values().filter(|key| !key.multiple)
    }

    /// Keys bound to the per-instance exclusive queue.
    pub fn fan_out(&self) -> impl Iterator<Item = &RoutingKey> {
        self.keys.values().filter(|key| key.multiple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_key() {
        let registry =
            RoutingKeyRegistry::new(vec![RoutingKey::new("order.created")]).unwrap();

        let key = registry.resolve("order.created").unwrap();
        assert_eq!(key.key(), "order.created");
        assert!(!key.is_multiple());
    }

    #[test]
    fn unknown_key_fails_resolution() {
        let registry =
            RoutingKeyRegistry::new(vec![RoutingKey::new("order.created")]).unwrap();

        assert_eq!(
            registry.resolve("order.deleted"),
            Err(AmqpError::UnknownRoutingKey("order.deleted".to_owned()))
        );
    }

    #[test]
    fn duplicated_keys_are_rejected_at_construction() {
        let result = RoutingKeyRegistry::new(vec![
            RoutingKey::new("order.created"),
            RoutingKey::multiple("order.created"),
        ]);

        assert!(matches!(result, Err(AmqpError::InvalidTopology(_))));
    }

    #[test]
    fn keys_are_partitioned_by_fan_out_flag() {
        let registry = RoutingKeyRegistry::new(vec![
            RoutingKey::new("order.created"),
            RoutingKey::new("order.updated"),
            RoutingKey::multiple("cache.invalidated"),
        ])
        .unwrap();

        assert_eq!(registry.shared().count(), 2);
        assert_eq!(registry.fan_out().count(), 1);
    }
}
