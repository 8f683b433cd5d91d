// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::exchange::ExchangeId;
use crate::domain::handshake::SslType;

/// Identifies one bridge domain, i.e. one admitted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(pub Uuid);

impl DomainId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DomainId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideKind {
    Consumer,
    Provider,
}

/// Lifecycle events of bridge connections and their exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    ConnectionAdmitted {
        domain_id: DomainId,
        peer: String,
        side: SideKind,
        ssl_type: SslType,
        admitted_at: DateTime<Utc>,
    },
    HandshakeFailed {
        peer_address: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    ConnectionClosed {
        domain_id: DomainId,
        peer: String,
        dropped_exchanges: usize,
        closed_at: DateTime<Utc>,
    },
    /// A reconstruction violation ended the exchange locally.
    ExchangeAbandoned {
        domain_id: DomainId,
        exchange_id: ExchangeId,
        reason: String,
        abandoned_at: DateTime<Utc>,
    },
}

