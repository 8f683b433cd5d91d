// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transported Envelope
//!
//! One wire-transmitted step of an exchange.
//!
//! ## Invariants
//!
//! - The first envelope of an exchange has `step == 1`.
//! - `step` grows by exactly one between consecutive envelopes of the same
//!   exchange id in the same direction.
//! - `terminal == true` closes the direction: nothing else is sent for that
//!   exchange id except, at most, one [`TransportedException`] in reply.
//! - An exception never mutates correlation state on the receiving side.

use serde::{Deserialize, Serialize};

use crate::domain::exchange::{ExchangeFailure, ExchangeId, ExchangeSnapshot, MessageExchange};
use crate::domain::service_key::ServiceKey;
use crate::domain::trace::TraceStep;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportedEnvelope {
    Message(TransportedMessage),
    Exception(TransportedException),
}

impl TransportedEnvelope {
    pub fn exchange_id(&self) -> &ExchangeId {
        match self {
            Self::Message(message) => &message.exchange_id,
            Self::Exception(exception) => &exception.exchange_id,
        }
    }

    /// Whether nothing more is expected in this direction after this envelope.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Message(message) => message.terminal,
            Self::Exception(_) => true,
        }
    }
}

impl From<TransportedMessage> for TransportedEnvelope {
    fn from(message: TransportedMessage) -> Self {
        Self::Message(message)
    }
}

impl From<TransportedException> for TransportedEnvelope {
    fn from(exception: TransportedException) -> Self {
        Self::Exception(exception)
    }
}

/// One step of an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportedMessage {
    pub exchange_id: ExchangeId,
    pub step: u32,
    pub terminal: bool,
    pub service_key: ServiceKey,
    pub snapshot: ExchangeSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_trace_step: Option<TraceStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_tracing_flag: Option<bool>,
}

impl TransportedMessage {
    /// First step of an exchange originated by a local consumer.
    pub fn initial(exchange: &MessageExchange) -> Self {
        let snapshot = exchange.snapshot();
        Self {
            exchange_id: exchange.id.clone(),
            step: 1,
            terminal: snapshot.is_terminal(),
            service_key: exchange.service_key.clone(),
            snapshot,
            sender_trace_step: exchange.trace.clone(),
            initial_tracing_flag: exchange.flow_tracing_activation(),
        }
    }

    /// Step following `previous` (an envelope received for the same exchange),
    /// carrying the current state of the local exchange.
    pub fn following(previous: &TransportedMessage, exchange: &MessageExchange) -> Self {
        let snapshot = exchange.snapshot();
        Self {
            exchange_id: previous.exchange_id.clone(),
            step: previous.step + 1,
            terminal: snapshot.is_terminal(),
            service_key: previous.service_key.clone(),
            snapshot,
            sender_trace_step: exchange.trace.clone(),
            initial_tracing_flag: previous.initial_tracing_flag,
        }
    }

    /// Terminal `ERROR` step built on top of `base` without a live local
    /// exchange: used for timeouts, delivery failures and failed writes.
    pub fn error_following(base: &TransportedMessage, failure: ExchangeFailure) -> Self {
        Self {
            exchange_id: base.exchange_id.clone(),
            step: base.step + 1,
            terminal: true,
            service_key: base.service_key.clone(),
            snapshot: base.snapshot.clone().into_error(failure),
            sender_trace_step: base.sender_trace_step.clone(),
            initial_tracing_flag: base.initial_tracing_flag,
        }
    }
}

/// Informational reply to a terminal message that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportedException {
    pub exchange_id: ExchangeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_trace_step: Option<TraceStep>,
    pub cause: String,
}

impl TransportedException {
    pub fn reply_to(message: &TransportedMessage, cause: impl Into<String>) -> Self {
        Self {
            exchange_id: message.exchange_id.clone(),
            sender_trace_step: message.sender_trace_step.clone(),
            cause: cause.into(),
        }
    }
}
