// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-Memory Local Router
//!
//! Hosts named local endpoints and the gateways of connected remote
//! providers. Local consumers call [`InMemoryRouter::send`] and wait for the
//! reply; exchanges reconstructed by a bridge domain arrive through
//! [`LocalRouter::deliver`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::domain::exchange::{
    ExchangeFailure, ExchangeId, ExchangePattern, ExchangeRole, FailureKind, MessageExchange, NormalizedMessage,
};
use crate::domain::router::{
    CompletionListener, DeliveryOutcome, LocalRouter, RelayedExchange, RemoteGateway, RouterError,
};
use crate::domain::service_key::{LocalTarget, ServiceKey};
use crate::domain::trace::TraceStep;

pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// A capability implementation reachable by target name.
#[async_trait]
pub trait LocalEndpoint: Send + Sync {
    /// Serve a provider-role exchange. Set the out message or fault, or
    /// complete the exchange; an error fails it.
    async fn handle(&self, exchange: MessageExchange) -> anyhow::Result<MessageExchange>;
}

/// Replies with the request content.
pub struct EchoEndpoint;

#[async_trait]
impl LocalEndpoint for EchoEndpoint {
    async fn handle(&self, mut exchange: MessageExchange) -> anyhow::Result<MessageExchange> {
        match exchange.pattern {
            ExchangePattern::InOut | ExchangePattern::InOptionalOut => {
                let content = exchange
                    .in_message
                    .as_ref()
                    .map(|m| m.content.clone())
                    .unwrap_or(Value::Null);
                exchange.out_message = Some(NormalizedMessage::new(content));
            }
            ExchangePattern::InOnly | ExchangePattern::RobustInOnly => exchange.complete(),
        }
        Ok(exchange)
    }
}

struct RemoteRoute {
    service_key: ServiceKey,
    gateway: Arc<dyn RemoteGateway>,
}

pub struct InMemoryRouter {
    endpoints: RwLock<HashMap<LocalTarget, Arc<dyn LocalEndpoint>>>,
    remotes: RwLock<Vec<RemoteRoute>>,
    waiters: RwLock<HashMap<ExchangeId, oneshot::Sender<MessageExchange>>>,
    exchange_timeout: Duration,
}

impl InMemoryRouter {
    pub fn new(exchange_timeout: Duration) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            remotes: RwLock::new(Vec::new()),
            waiters: RwLock::new(HashMap::new()),
            exchange_timeout,
        }
    }

    pub fn register_endpoint(&self, target: impl Into<String>, endpoint: Arc<dyn LocalEndpoint>) {
        let target = LocalTarget(target.into());
        info!(target = %target, "Local endpoint registered");
        self.endpoints.write().insert(target, endpoint);
    }

    pub fn remote_services(&self) -> Vec<ServiceKey> {
        self.remotes
            .read()
            .iter()
            .filter(|route| route.gateway.is_open())
            .map(|route| route.service_key.clone())
            .collect()
    }

    /// Consumer-role exchange ready for [`InMemoryRouter::send`], opening a
    /// new traced flow.
    pub fn consumer_exchange(&self, service_key: ServiceKey, pattern: ExchangePattern) -> MessageExchange {
        let mut exchange = MessageExchange::new(service_key, pattern, ExchangeRole::Consumer);
        exchange.trace = Some(TraceStep::new_flow());
        exchange
    }

    /// Send a local exchange to the remote provider hosting its service and
    /// wait for the reply.
    pub async fn send(&self, exchange: MessageExchange) -> Result<MessageExchange, RouterError> {
        let gateway = self
            .remotes
            .read()
            .iter()
            .find(|route| exchange.service_key.matches(&route.service_key) && route.gateway.is_open())
            .map(|route| route.gateway.clone())
            .ok_or_else(|| RouterError::NoRoute(exchange.service_key.clone()))?;

        let id = exchange.id.clone();
        let (tx, rx) = oneshot::channel();
        self.waiters.write().insert(id.clone(), tx);

        if let Err(err) = gateway.forward(exchange) {
            self.waiters.write().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.exchange_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RouterError::LinkClosed),
            Err(_) => {
                warn!(exchange_id = %id, "No reply from remote provider before timeout");
                self.waiters.write().remove(&id);
                gateway.abandon(&id);
                Err(RouterError::Expired(id))
            }
        }
    }

    fn deliver_to_endpoint(
        &self,
        relayed: RelayedExchange,
        listener: Arc<dyn CompletionListener>,
    ) -> Result<DeliveryOutcome, RouterError> {
        if relayed.exchange.is_terminal() {
            debug!(exchange_id = %relayed.origin.exchange_id, status = ?relayed.exchange.status, "Provider exchange finished");
            return Ok(DeliveryOutcome::Consumed);
        }
        if relayed.origin.step > 1 {
            // The consumer answered a fault or reply without ending the exchange.
            let mut exchange = relayed.exchange;
            exchange.complete();
            return Ok(DeliveryOutcome::Completed(exchange));
        }

        let target = relayed
            .exchange
            .endpoint
            .clone()
            .ok_or_else(|| RouterError::NoRoute(relayed.exchange.service_key.clone()))?;
        let endpoint = self
            .endpoints
            .read()
            .get(&target)
            .cloned()
            .ok_or(RouterError::UnknownTarget(target))?;

        let timeout = self.exchange_timeout;
        tokio::spawn(async move {
            let RelayedExchange { exchange, origin } = relayed;
            let fallback = exchange.clone();

            match tokio::time::timeout(timeout, endpoint.handle(exchange)).await {
                Ok(Ok(mut served)) => {
                    let one_way = matches!(served.pattern, ExchangePattern::InOnly | ExchangePattern::RobustInOnly);
                    if one_way && !served.is_terminal() && served.fault.is_none() {
                        served.complete();
                    }
                    listener.exchange_completed(RelayedExchange::new(served, origin));
                }
                Ok(Err(e)) => {
                    let mut failed = fallback;
                    failed.fail(ExchangeFailure::new(FailureKind::Delivery, e.to_string()));
                    listener.exchange_completed(RelayedExchange::new(failed, origin));
                }
                Err(_) => listener.exchange_expired(RelayedExchange::new(fallback, origin)),
            }
        });
        Ok(DeliveryOutcome::Pending)
    }

    fn deliver_reply(&self, relayed: RelayedExchange) -> Result<DeliveryOutcome, RouterError> {
        let exchange = relayed.exchange;
        let waiter = self
            .waiters
            .write()
            .remove(&exchange.id)
            .ok_or_else(|| RouterError::NoWaiter(exchange.id.clone()))?;

        let outcome = if exchange.is_terminal() {
            DeliveryOutcome::Consumed
        } else {
            let mut done = exchange.clone();
            done.complete();
            DeliveryOutcome::Completed(done)
        };

        if waiter.send(exchange).is_err() {
            debug!("Local consumer stopped waiting before the reply arrived");
        }
        Ok(outcome)
    }
}

impl Default for InMemoryRouter {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE_TIMEOUT)
    }
}

#[async_trait]
impl LocalRouter for InMemoryRouter {
    fn create_exchange(&self, service_key: &ServiceKey, pattern: ExchangePattern) -> MessageExchange {
        MessageExchange::new(service_key.clone(), pattern, ExchangeRole::Provider)
    }

    async fn deliver(
        &self,
        relayed: RelayedExchange,
        listener: Arc<dyn CompletionListener>,
    ) -> Result<DeliveryOutcome, RouterError> {
        match relayed.exchange.role {
            ExchangeRole::Provider => self.deliver_to_endpoint(relayed, listener),
            ExchangeRole::Consumer => self.deliver_reply(relayed),
        }
    }

    fn attach_remote(&self, services: &[ServiceKey], gateway: Arc<dyn RemoteGateway>) {
        let mut remotes = self.remotes.write();
        remotes.retain(|route| route.gateway.is_open());
        for service_key in services {
            remotes.push(RemoteRoute {
                service_key: service_key.clone(),
                gateway: gateway.clone(),
            });
        }
        info!(services = services.len(), "Remote provider attached");
    }
}
