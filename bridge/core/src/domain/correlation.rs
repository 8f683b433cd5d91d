// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Correlation Table
//!
//! Per-connection mapping from exchange id to the local exchange that waits
//! for the peer's next step.
//!
//! ## Invariants
//!
//! - At most **one** entry exists per exchange id.
//! - An entry is stored before the envelope that expects a reply is written,
//!   so a fast reply always finds it.
//! - Any envelope received for an exchange id removes its entry
//!   unconditionally; a continuing exchange stores a fresh one on its next
//!   outward send.
//!
//! `insert` and `remove` are linearizable (`DashMap` shard locks) and are the
//! only synchronisation primitive the relay needs.

use dashmap::DashMap;

use crate::domain::exchange::{ExchangeId, MessageExchange};
use crate::domain::trace::TraceContext;

/// Local exchange awaiting the peer's next step.
#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub exchange: MessageExchange,
    pub trace: TraceContext,
    /// Step of the envelope that was sent; the reply must carry `sent_step + 1`.
    pub sent_step: u32,
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: DashMap<ExchangeId, CorrelationEntry>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entry`, returning whatever was already stored for `id`.
    ///
    /// A returned entry means two outward sends happened for the same id
    /// without an intervening receive; the caller decides how loudly to report it.
    pub fn insert(&self, id: ExchangeId, entry: CorrelationEntry) -> Option<CorrelationEntry> {
        self.entries.insert(id, entry)
    }

    /// Atomically remove and return the entry for `id`.
    pub fn remove(&self, id: &ExchangeId) -> Option<CorrelationEntry> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    pub fn contains(&self, id: &ExchangeId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry; used when the connection goes away.
    pub fn drain(&self) -> Vec<(ExchangeId, CorrelationEntry)> {
        let ids: Vec<ExchangeId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange::{ExchangePattern, ExchangeRole};
    use crate::domain::service_key::ServiceKey;
    use std::sync::Arc;

    fn entry(step: u32) -> CorrelationEntry {
        CorrelationEntry {
            exchange: MessageExchange::new(
                ServiceKey::new("Hello", "Greet"),
                ExchangePattern::InOut,
                ExchangeRole::Consumer,
            ),
            trace: TraceContext::default(),
            sent_step: step,
        }
    }

    #[test]
    fn test_duplicate_insert_overwrites_and_is_detectable() {
        let table = CorrelationTable::new();
        let id = ExchangeId::from("x-1");

        assert!(table.insert(id.clone(), entry(1)).is_none());
        let displaced = table.insert(id.clone(), entry(3));

        assert_eq!(displaced.map(|e| e.sent_step), Some(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(&id).map(|e| e.sent_step), Some(3));
    }

    #[test]
    fn test_remove_is_unconditional_and_single_shot() {
        let table = CorrelationTable::new();
        let id = ExchangeId::from("x-2");
        table.insert(id.clone(), entry(1));

        assert!(table.remove(&id).is_some());
        assert!(table.remove(&id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain_empties_table() {
        let table = CorrelationTable::new();
        table.insert(ExchangeId::from("a"), entry(1));
        table.insert(ExchangeId::from("b"), entry(2));

        let drained = table.drain();

        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_removals_yield_entry_once() {
        let table = Arc::new(CorrelationTable::new());
        let id = ExchangeId::from("contended");
        table.insert(id.clone(), entry(1));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let id = id.clone();
                std::thread::spawn(move || table.remove(&id).is_some())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
