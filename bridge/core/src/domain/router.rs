// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Local Router Collaborator
//!
//! The bridge re-injects reconstructed exchanges into the local router as if
//! they originated locally, and the router calls back when a delivered
//! exchange completes or expires.
//!
//! ```text
//! BridgeDomain ──deliver(RelayedExchange)──► LocalRouter
//!      ▲                                         │
//!      └── exchange_completed / exchange_expired ┘  (CompletionListener)
//! ```
//!
//! Provider-side domains register themselves with the router as a
//! [`RemoteGateway`] for the capabilities their peer propagated, so that
//! local consumers can reach them.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::envelope::TransportedMessage;
use crate::domain::exchange::{ExchangeId, ExchangePattern, MessageExchange};
use crate::domain::service_key::{LocalTarget, ServiceKey};

/// A local exchange paired with the envelope it was last reconstructed from.
///
/// `origin` is the base for the next step sent back to the peer and for any
/// synthetic `ERROR` built on timeout or delivery failure.
#[derive(Debug, Clone)]
pub struct RelayedExchange {
    pub exchange: MessageExchange,
    pub origin: TransportedMessage,
}

impl RelayedExchange {
    pub fn new(exchange: MessageExchange, origin: TransportedMessage) -> Self {
        Self { exchange, origin }
    }
}

#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// The router finished with the exchange synchronously; the returned state
    /// is mirrored to the peer immediately.
    Completed(MessageExchange),
    /// The router will report completion or expiry through the listener later.
    Pending,
    /// Delivered and nothing further is owed to the peer.
    Consumed,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("No local endpoint registered for target '{0}'")]
    UnknownTarget(LocalTarget),

    #[error("No route for service {0}")]
    NoRoute(ServiceKey),

    #[error("Service {0} was not propagated by the remote peer")]
    NotPropagated(ServiceKey),

    #[error("No local consumer is waiting for exchange {0}")]
    NoWaiter(ExchangeId),

    #[error("Exchange {0} expired without a reply")]
    Expired(ExchangeId),

    #[error("Remote link is closed")]
    LinkClosed,

    #[error("Endpoint failed: {0}")]
    Endpoint(String),
}

/// Asynchronous completion and timeout notifications for delivered exchanges.
pub trait CompletionListener: Send + Sync {
    /// The local side moved the exchange to a state that must reach the peer.
    fn exchange_completed(&self, relayed: RelayedExchange);

    /// The router's per-exchange timer fired before completion.
    fn exchange_expired(&self, relayed: RelayedExchange);
}

/// Outward path to a remote provider, as seen by the local router.
pub trait RemoteGateway: Send + Sync {
    /// Send a locally originated exchange to the peer as step 1.
    fn forward(&self, exchange: MessageExchange) -> Result<(), RouterError>;

    /// Forget an exchange the local consumer stopped waiting for.
    fn abandon(&self, id: &ExchangeId);

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait LocalRouter: Send + Sync {
    /// Fresh local exchange for an inbound step-1 envelope.
    fn create_exchange(&self, service_key: &ServiceKey, pattern: ExchangePattern) -> MessageExchange;

    async fn deliver(
        &self,
        relayed: RelayedExchange,
        listener: Arc<dyn CompletionListener>,
    ) -> Result<DeliveryOutcome, RouterError>;

    /// Make `services` reachable through `gateway`.
    fn attach_remote(&self, services: &[ServiceKey], gateway: Arc<dyn RemoteGateway>);
}
