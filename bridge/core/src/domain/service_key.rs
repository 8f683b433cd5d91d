// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Service Key
//!
//! Immutable identity of a capability remoted across the bridge.
//!
//! Equality and hashing are exact: two keys that differ only in `instance_id`
//! (including absent vs present) are distinct storage entries. The absent
//! `instance_id` acts as a wildcard **only** at lookup sites, through
//! [`ServiceKey::matches`] and [`RoutingTable::resolve`].

use serde::{Deserialize, Serialize};

/// Identity of a remoted capability (interface + capability + optional instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub interface_id: String,
    pub capability_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl ServiceKey {
    pub fn new(interface_id: impl Into<String>, capability_id: impl Into<String>) -> Self {
        Self {
            interface_id: interface_id.into(),
            capability_id: capability_id.into(),
            instance_id: None,
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Lookup-site comparison: `self` is the key being looked up, `stored` is a
    /// key held in some table. A lookup without an instance id matches any
    /// stored instance of the same interface and capability.
    pub fn matches(&self, stored: &ServiceKey) -> bool {
        if self.interface_id != stored.interface_id || self.capability_id != stored.capability_id {
            return false;
        }
        match &self.instance_id {
            None => true,
            Some(instance) => stored.instance_id.as_ref() == Some(instance),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.instance_id {
            Some(instance) => write!(f, "{}/{}@{}", self.interface_id, self.capability_id, instance),
            None => write!(f, "{}/{}", self.interface_id, self.capability_id),
        }
    }
}

/// Name of a local endpoint a remoted capability is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalTarget(pub String);

impl std::fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-capability routing table (`ServiceKey → LocalTarget`) resolved from
/// configuration before a consumer-side domain is constructed.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    // Insertion order is kept so wildcard lookups are deterministic.
    routes: Vec<(ServiceKey, LocalTarget)>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a route. Storage is exact: an existing entry with an identical key
    /// is replaced, entries differing only in instance id are kept apart.
    pub fn insert(&mut self, key: ServiceKey, target: LocalTarget) -> Option<LocalTarget> {
        if let Some(slot) = self.routes.iter_mut().find(|(stored, _)| *stored == key) {
            return Some(std::mem::replace(&mut slot.1, target));
        }
        self.routes.push((key, target));
        None
    }

    /// Resolve the local target for `key`. An exact match wins; otherwise, when
    /// `key` carries no instance id, the first stored instance of the same
    /// interface and capability is used.
    pub fn resolve(&self, key: &ServiceKey) -> Option<&LocalTarget> {
        self.routes
            .iter()
            .find(|(stored, _)| stored == key)
            .or_else(|| self.routes.iter().find(|(stored, _)| key.matches(stored)))
            .map(|(_, target)| target)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.routes.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
