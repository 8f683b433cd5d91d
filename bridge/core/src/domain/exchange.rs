// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Exchange
//!
//! Local model of one exchange as the local router sees it, plus the
//! wire-transportable [`ExchangeSnapshot`].
//!
//! ## Lifecycle
//!
//! ```text
//! InOnly:   in (Active) ──► DONE | ERROR
//! InOut:    in (Active) ──► out | fault (Active) ──► DONE | ERROR
//! ```
//!
//! An exchange whose status is no longer `Active` is terminal: no further
//! step is sent for it in that direction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::service_key::{LocalTarget, ServiceKey};
use crate::domain::trace::TraceStep;

/// Reserved property names.
pub mod properties {
    /// Connection-scoped marker for synchronous sends. Never crosses the wire.
    pub const SEND_SYNC: &str = "aegis.bridge.send-sync";

    /// Consumer endpoint of the local exchange. Meaningless on the peer.
    pub const CONSUMER_ENDPOINT: &str = "aegis.bridge.consumer-endpoint";

    /// Flow tracing activation flag. Travels in the envelope, not in the property set.
    pub const FLOW_TRACING_ACTIVATION: &str = "aegis.bridge.flow-tracing-activation";

    /// Properties that never cross the wire and are never overwritten by it.
    pub const PROTECTED: &[&str] = &[SEND_SYNC, CONSUMER_ENDPOINT, FLOW_TRACING_ACTIVATION];

    pub fn is_protected(name: &str) -> bool {
        PROTECTED.contains(&name)
    }
}

pub type Properties = BTreeMap<String, Value>;

/// Wire-level identifier of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(pub String);

impl ExchangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangePattern {
    InOnly,
    RobustInOnly,
    InOut,
    InOptionalOut,
}

/// Which end of the exchange this side plays locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeRole {
    /// Originated by a local consumer; a remote provider serves it.
    Consumer,
    /// Created from an inbound step-1 envelope; a local provider serves it.
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExchangeStatus {
    Active,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub content: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Value>,
}

impl NormalizedMessage {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Reported by the remote side.
    Remote,
    /// The exchange expired before a reply arrived.
    Timeout,
    /// The envelope could not be written to the channel.
    Transport,
    /// The local router could not deliver the exchange.
    Delivery,
    /// The exchange broke the relay protocol.
    Protocol,
}

/// Error carried by an exchange in `ERROR` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExchangeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Local exchange handle as owned by the local router and the bridge domain.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageExchange {
    pub id: ExchangeId,
    pub service_key: ServiceKey,
    pub pattern: ExchangePattern,
    pub role: ExchangeRole,
    pub operation: String,
    pub status: ExchangeStatus,
    pub properties: Properties,
    pub in_message: Option<NormalizedMessage>,
    pub out_message: Option<NormalizedMessage>,
    pub fault: Option<NormalizedMessage>,
    pub failure: Option<ExchangeFailure>,
    /// Local endpoint resolved for the exchange (provider role only).
    pub endpoint: Option<LocalTarget>,
    /// Flow step the exchange currently belongs to.
    pub trace: Option<TraceStep>,
}

impl MessageExchange {
    pub fn new(service_key: ServiceKey, pattern: ExchangePattern, role: ExchangeRole) -> Self {
        Self {
            id: ExchangeId::new(),
            service_key,
            pattern,
            role,
            operation: String::new(),
            status: ExchangeStatus::Active,
            properties: Properties::new(),
            in_message: None,
            out_message: None,
            fault: None,
            failure: None,
            endpoint: None,
            trace: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExchangeStatus::Active
    }

    pub fn complete(&mut self) {
        self.status = ExchangeStatus::Done;
    }

    pub fn fail(&mut self, failure: ExchangeFailure) {
        self.status = ExchangeStatus::Error;
        self.failure = Some(failure);
    }

    /// Flow tracing activation flag, if one was decided for this exchange.
    pub fn flow_tracing_activation(&self) -> Option<bool> {
        self.properties
            .get(properties::FLOW_TRACING_ACTIVATION)
            .and_then(Value::as_bool)
    }

    pub fn set_flow_tracing_activation(&mut self, flag: Option<bool>) {
        match flag {
            Some(flag) => {
                self.properties
                    .insert(properties::FLOW_TRACING_ACTIVATION.to_string(), Value::Bool(flag));
            }
            None => {
                self.properties.remove(properties::FLOW_TRACING_ACTIVATION);
            }
        }
    }

    /// Wire view of the exchange. Protected properties are left behind.
    pub fn snapshot(&self) -> ExchangeSnapshot {
        ExchangeSnapshot {
            pattern: self.pattern,
            operation: self.operation.clone(),
            status: self.status,
            properties: self
                .properties
                .iter()
                .filter(|(name, _)| !properties::is_protected(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            in_message: self.in_message.clone(),
            out_message: self.out_message.clone(),
            fault: self.fault.clone(),
            failure: self.failure.clone(),
        }
    }
}

/// Snapshot of an exchange's content as transported in one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSnapshot {
    pub pattern: ExchangePattern,
    pub operation: String,
    pub status: ExchangeStatus,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_message: Option<NormalizedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_message: Option<NormalizedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<NormalizedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ExchangeFailure>,
}

impl ExchangeSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status != ExchangeStatus::Active
    }

    /// Same content, turned into an `ERROR` completion.
    pub fn into_error(mut self, failure: ExchangeFailure) -> Self {
        self.status = ExchangeStatus::Error;
        self.failure = Some(failure);
        self
    }
}
