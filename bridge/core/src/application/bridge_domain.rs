// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Bridge Domain
//!
//! Per-connection relay state. Translates between "a local exchange happened"
//! and "an envelope arrived or left", owning exactly one correlation table.
//!
//! ```text
//!            reader task                      local router
//!                │ enqueue                        ▲   │ exchange_completed
//!                ▼                                │   ▼ exchange_expired
//!  InboundQueue ──► run() ──► receive_envelope ──►deliver   send_local_completion
//!      ▲                                                      │ on_exchange_timeout
//!      │ synthesised ERROR                                    ▼
//!      └──────────────── WriteFailureSink ◄── ChannelWriteSupervisor ──► channel
//! ```
//!
//! Inbound processing is sequential: every envelope for the connection goes
//! through the single [`InboundQueue`]. Outward sends may come from any task.
//! The queue is also the close barrier. Before [`BridgeDomain::run`] closes
//! the domain it waits for outstanding write completions and drains the
//! queue, so a failed non-terminal write always reaches the local router.
//! Once closed, the queue refuses new envelopes.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::application::reconstruction::{expect_next_step, reconstruct};
use crate::application::write_supervisor::{ChannelWriteSupervisor, WriteFailureSink};
use crate::domain::channel::{EnvelopeChannel, TransportError};
use crate::domain::correlation::{CorrelationEntry, CorrelationTable};
use crate::domain::envelope::{TransportedEnvelope, TransportedException, TransportedMessage};
use crate::domain::error::ReconstructionError;
use crate::domain::events::{BridgeEvent, DomainId, SideKind};
use crate::domain::exchange::{ExchangeFailure, ExchangeId, FailureKind, MessageExchange};
use crate::domain::router::{
    CompletionListener, DeliveryOutcome, LocalRouter, RelayedExchange, RemoteGateway, RouterError,
};
use crate::domain::service_key::{RoutingTable, ServiceKey};
use crate::domain::trace::TraceContext;
use crate::infrastructure::event_bus::EventBus;

/// Which end of the link the remote peer plays.
pub enum DomainSide {
    /// The peer consumes capabilities hosted locally: inbound step-1
    /// envelopes are accepted and resolved through `routes`.
    Consumer {
        routes: RoutingTable,
        propagate_tracing_activation: bool,
    },
    /// The peer hosts capabilities consumed locally: local exchanges are
    /// forwarded as step-1 envelopes. `remote` is the catalogue the peer
    /// propagated, once known.
    Provider { remote: RwLock<Option<Vec<ServiceKey>>> },
}

impl DomainSide {
    pub fn consumer(routes: RoutingTable, propagate_tracing_activation: bool) -> Self {
        Self::Consumer {
            routes,
            propagate_tracing_activation,
        }
    }

    pub fn provider() -> Self {
        Self::Provider {
            remote: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> SideKind {
        match self {
            Self::Consumer { .. } => SideKind::Consumer,
            Self::Provider { .. } => SideKind::Provider,
        }
    }
}

/// Receiving half of the domain's inbound queue, consumed by [`BridgeDomain::run`].
pub struct InboundQueue {
    rx: mpsc::UnboundedReceiver<TransportedEnvelope>,
}

pub struct BridgeDomain {
    id: DomainId,
    peer: String,
    side: DomainSide,
    correlations: CorrelationTable,
    router: Arc<dyn LocalRouter>,
    supervisor: ChannelWriteSupervisor,
    event_bus: EventBus,
    inbound: Mutex<Option<mpsc::UnboundedSender<TransportedEnvelope>>>,
    handle: Arc<DomainHandle>,
}

impl BridgeDomain {
    pub fn new(
        peer: impl Into<String>,
        side: DomainSide,
        router: Arc<dyn LocalRouter>,
        channel: Arc<dyn EnvelopeChannel>,
        event_bus: EventBus,
    ) -> (Arc<Self>, InboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let domain = Arc::new_cyclic(|weak: &Weak<BridgeDomain>| Self {
            id: DomainId::new(),
            peer: peer.into(),
            side,
            correlations: CorrelationTable::new(),
            router,
            supervisor: ChannelWriteSupervisor::new(channel),
            event_bus,
            inbound: Mutex::new(Some(tx)),
            handle: Arc::new(DomainHandle { domain: weak.clone() }),
        });
        (domain, InboundQueue { rx })
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn side(&self) -> &DomainSide {
        &self.side
    }

    pub fn pending_exchanges(&self) -> usize {
        self.correlations.len()
    }

    pub fn is_awaiting(&self, id: &ExchangeId) -> bool {
        self.correlations.contains(id)
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.lock().is_none()
    }

    /// Gateway handle registered with the local router on the provider side.
    pub fn gateway(&self) -> Arc<dyn RemoteGateway> {
        self.handle.clone()
    }

    /// Capabilities a consumer-side domain exposes to its peer.
    pub fn advertised_services(&self) -> Vec<ServiceKey> {
        match &self.side {
            DomainSide::Consumer { routes, .. } => routes.keys().cloned().collect(),
            DomainSide::Provider { .. } => Vec::new(),
        }
    }

    /// Queue an envelope for sequential processing. Returns `false` once closed.
    pub fn enqueue(&self, envelope: TransportedEnvelope) -> bool {
        match self.inbound.lock().as_ref() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Inbound loop. Ends on shutdown or once the domain is closed, and
    /// always leaves the domain closed.
    pub async fn run(self: Arc<Self>, mut queue: InboundQueue, shutdown: CancellationToken) {
        debug!(domain_id = %self.id, peer = %self.peer, "Inbound loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = queue.rx.recv() => match next {
                    Some(envelope) if self.is_closed() => {
                        debug!(
                            domain_id = %self.id,
                            exchange_id = %envelope.exchange_id(),
                            "Envelope discarded after close"
                        );
                    }
                    Some(envelope) => self.receive_envelope(envelope).await,
                    None => break,
                },
            }
        }
        self.settle(&mut queue).await;
        self.close();
    }

    /// Waits for every observed write to report, then processes whatever is
    /// still queued, until both are empty. A non-terminal write that failed
    /// while the connection went down is completed here rather than dropped
    /// by [`close`](Self::close).
    async fn settle(&self, queue: &mut InboundQueue) {
        loop {
            self.supervisor.idle().await;
            let mut drained = 0usize;
            while let Ok(envelope) = queue.rx.try_recv() {
                if self.is_closed() {
                    continue;
                }
                drained += 1;
                self.receive_envelope(envelope).await;
            }
            if drained == 0 {
                break;
            }
            debug!(domain_id = %self.id, drained, "Processed envelopes queued during shutdown");
        }
    }

    /// Receive entry point. The correlation entry for the envelope's exchange
    /// id is removed unconditionally before anything else happens.
    pub async fn receive_envelope(&self, envelope: TransportedEnvelope) {
        metrics::counter!("aegis_bridge_envelopes_received_total").increment(1);
        let entry = self.correlations.remove(envelope.exchange_id());

        match envelope {
            TransportedEnvelope::Exception(exception) => {
                warn!(
                    domain_id = %self.id,
                    exchange_id = %exception.exchange_id,
                    cause = %exception.cause,
                    "Peer could not process a terminal message"
                );
                if entry.is_some() {
                    self.abandon(&ReconstructionError::UnexpectedException(exception.exchange_id));
                }
            }
            TransportedEnvelope::Message(message) => {
                debug!(
                    domain_id = %self.id,
                    exchange_id = %message.exchange_id,
                    step = message.step,
                    terminal = message.terminal,
                    "Envelope received"
                );
                let accepted = if message.step == 1 {
                    self.accept_initial(&message, entry)
                } else {
                    self.accept_continuation(&message, entry)
                };
                match accepted {
                    Ok(Some(relayed)) => self.dispatch(relayed).await,
                    Ok(None) => {}
                    Err(violation) => self.abandon(&violation),
                }
            }
        }
    }

    fn accept_initial(
        &self,
        message: &TransportedMessage,
        entry: Option<CorrelationEntry>,
    ) -> Result<Option<RelayedExchange>, ReconstructionError> {
        if entry.is_some() {
            return Err(ReconstructionError::DuplicateEntry(message.exchange_id.clone()));
        }
        let (routes, propagate) = match &self.side {
            DomainSide::Consumer {
                routes,
                propagate_tracing_activation,
            } => (routes, *propagate_tracing_activation),
            DomainSide::Provider { .. } => {
                return Err(ReconstructionError::SideViolation(message.exchange_id.clone()))
            }
        };

        let Some(target) = routes.resolve(&message.service_key) else {
            self.reply_delivery_failure(message, &RouterError::NoRoute(message.service_key.clone()));
            return Ok(None);
        };

        let mut fresh = self.router.create_exchange(&message.service_key, message.snapshot.pattern);
        fresh.endpoint = Some(target.clone());
        let mut exchange = reconstruct(None, message, Some(fresh))?;

        // Only step 1 decides; later steps inherit the stored flag.
        exchange.set_flow_tracing_activation(if propagate {
            message.initial_tracing_flag
        } else {
            Some(false)
        });

        Ok(Some(RelayedExchange::new(exchange, message.clone())))
    }

    fn accept_continuation(
        &self,
        message: &TransportedMessage,
        entry: Option<CorrelationEntry>,
    ) -> Result<Option<RelayedExchange>, ReconstructionError> {
        let entry = entry.ok_or_else(|| ReconstructionError::MissingEntry(message.exchange_id.clone()))?;
        expect_next_step(&message.exchange_id, entry.sent_step, message.step)?;

        let mut exchange = reconstruct(Some(entry.exchange), message, None)?;
        exchange.trace = entry.trace.step;
        Ok(Some(RelayedExchange::new(exchange, message.clone())))
    }

    async fn dispatch(&self, relayed: RelayedExchange) {
        let span = TraceContext::new(relayed.exchange.trace.clone()).span(&relayed.origin.exchange_id.0);
        let origin = relayed.origin.clone();
        let listener: Arc<dyn CompletionListener> = self.handle.clone();

        match self.router.deliver(relayed, listener).instrument(span).await {
            Ok(DeliveryOutcome::Completed(exchange)) => {
                self.send_local_completion(RelayedExchange::new(exchange, origin));
            }
            Ok(DeliveryOutcome::Pending) => {
                debug!(exchange_id = %origin.exchange_id, "Delivered, completion pending");
            }
            Ok(DeliveryOutcome::Consumed) => {
                debug!(exchange_id = %origin.exchange_id, "Delivered");
            }
            Err(err) => self.reply_delivery_failure(&origin, &err),
        }
    }

    /// Mirror the local state of a delivered exchange to the peer as the step
    /// following `relayed.origin`.
    pub fn send_local_completion(&self, relayed: RelayedExchange) {
        if relayed.origin.terminal {
            warn!(
                domain_id = %self.id,
                exchange_id = %relayed.origin.exchange_id,
                "Completion for an exchange the peer already terminated; dropped"
            );
            return;
        }
        let message = TransportedMessage::following(&relayed.origin, &relayed.exchange);
        if !message.terminal {
            self.store_correlation(&message, relayed.exchange);
        }
        self.send(message.into());
    }

    /// Send a locally originated exchange to a provider-side peer as step 1.
    pub fn forward_exchange(&self, exchange: MessageExchange) -> Result<ExchangeId, RouterError> {
        if self.is_closed() {
            return Err(RouterError::LinkClosed);
        }
        match &self.side {
            DomainSide::Consumer { .. } => return Err(RouterError::NoRoute(exchange.service_key)),
            DomainSide::Provider { remote } => {
                if let Some(catalogue) = remote.read().as_ref() {
                    if !catalogue.iter().any(|stored| exchange.service_key.matches(stored)) {
                        return Err(RouterError::NotPropagated(exchange.service_key));
                    }
                }
            }
        }

        let message = TransportedMessage::initial(&exchange);
        let id = message.exchange_id.clone();
        info!(
            domain_id = %self.id,
            exchange_id = %id,
            service = %message.service_key,
            "Forwarding exchange to remote provider"
        );
        if !message.terminal {
            self.store_correlation(&message, exchange);
        }
        self.send(message.into());
        Ok(id)
    }

    /// The router's timer fired for an exchange delivered from `relayed.origin`.
    /// The error is built from that inbound envelope, since what was sent
    /// onward locally is no longer addressable.
    pub fn on_exchange_timeout(&self, relayed: RelayedExchange) {
        metrics::counter!("aegis_bridge_exchanges_timed_out_total").increment(1);
        let origin = relayed.origin;
        if origin.terminal {
            debug!(exchange_id = %origin.exchange_id, "Expiry of a terminated exchange ignored");
            return;
        }
        warn!(
            domain_id = %self.id,
            exchange_id = %origin.exchange_id,
            step = origin.step,
            "Exchange expired without reply"
        );
        let error = TransportedMessage::error_following(
            &origin,
            ExchangeFailure::new(
                FailureKind::Timeout,
                format!("exchange {} expired before the local provider replied", origin.exchange_id),
            ),
        );
        self.send(error.into());
    }

    /// Forget an outstanding exchange (the local consumer gave up on it).
    pub fn abandon_exchange(&self, id: &ExchangeId) {
        if self.correlations.remove(id).is_some() {
            debug!(domain_id = %self.id, exchange_id = %id, "Outstanding exchange abandoned locally");
        }
    }

    /// Record the catalogue a provider-side peer propagated and make it
    /// reachable through the local router.
    pub fn record_remote_catalogue(&self, services: Vec<ServiceKey>) {
        match &self.side {
            DomainSide::Provider { remote } => {
                info!(domain_id = %self.id, peer = %self.peer, services = services.len(), "Remote catalogue received");
                self.router.attach_remote(&services, self.gateway());
                *remote.write() = Some(services);
            }
            DomainSide::Consumer { .. } => {
                warn!(domain_id = %self.id, peer = %self.peer, "Ignoring service propagation from a consumer peer");
            }
        }
    }

    /// Close barrier. Refuses further inbound envelopes, drops every
    /// unresolved exchange and reports how many were lost.
    pub fn close(&self) -> usize {
        if self.inbound.lock().take().is_none() {
            return 0;
        }

        let dropped = self.correlations.drain();
        for (id, entry) in &dropped {
            warn!(
                domain_id = %self.id,
                exchange_id = %id,
                sent_step = entry.sent_step,
                "Dropping unresolved exchange on connection close"
            );
        }
        info!(domain_id = %self.id, peer = %self.peer, dropped = dropped.len(), "Bridge domain closed");

        self.event_bus.publish(BridgeEvent::ConnectionClosed {
            domain_id: self.id,
            peer: self.peer.clone(),
            dropped_exchanges: dropped.len(),
            closed_at: Utc::now(),
        });
        dropped.len()
    }

    fn store_correlation(&self, message: &TransportedMessage, exchange: MessageExchange) {
        let entry = CorrelationEntry {
            trace: TraceContext::new(exchange.trace.clone()),
            exchange,
            sent_step: message.step,
        };
        if let Some(displaced) = self.correlations.insert(message.exchange_id.clone(), entry) {
            error!(
                domain_id = %self.id,
                exchange_id = %message.exchange_id,
                previous_step = displaced.sent_step,
                step = message.step,
                "Second outstanding send for the same exchange; previous correlation entry overwritten"
            );
        }
    }

    fn reply_delivery_failure(&self, origin: &TransportedMessage, err: &RouterError) {
        warn!(
            domain_id = %self.id,
            exchange_id = %origin.exchange_id,
            error = %err,
            "Local delivery failed"
        );
        if origin.terminal {
            self.send(TransportedException::reply_to(origin, err.to_string()).into());
        } else {
            let error =
                TransportedMessage::error_following(origin, ExchangeFailure::new(FailureKind::Delivery, err.to_string()));
            self.send(error.into());
        }
    }

    fn abandon(&self, violation: &ReconstructionError) {
        error!(domain_id = %self.id, error = %violation, "Reconstruction violation; exchange abandoned");
        self.event_bus.publish(BridgeEvent::ExchangeAbandoned {
            domain_id: self.id,
            exchange_id: violation.exchange_id().clone(),
            reason: violation.to_string(),
            abandoned_at: Utc::now(),
        });
    }

    fn send(&self, envelope: TransportedEnvelope) {
        metrics::counter!("aegis_bridge_envelopes_sent_total").increment(1);
        self.supervisor.send(envelope, self.handle.clone());
    }

    fn on_non_terminal_write_failure(&self, message: TransportedMessage, error: TransportError) {
        if !self.correlations.contains(&message.exchange_id) {
            debug!(exchange_id = %message.exchange_id, "Failed write concerns an exchange no longer outstanding");
            return;
        }
        let failure =
            TransportedMessage::error_following(&message, ExchangeFailure::new(FailureKind::Transport, error.to_string()));
        if !self.enqueue(failure.into()) {
            warn!(
                domain_id = %self.id,
                exchange_id = %message.exchange_id,
                "Domain closed; write-failure completion dropped"
            );
        }
    }
}

/// Weak handle through which the router and the write supervisor call back
/// into a domain without keeping it alive.
struct DomainHandle {
    domain: Weak<BridgeDomain>,
}

impl CompletionListener for DomainHandle {
    fn exchange_completed(&self, relayed: RelayedExchange) {
        match self.domain.upgrade() {
            Some(domain) => domain.send_local_completion(relayed),
            None => debug!(exchange_id = %relayed.origin.exchange_id, "Completion after domain teardown dropped"),
        }
    }

    fn exchange_expired(&self, relayed: RelayedExchange) {
        match self.domain.upgrade() {
            Some(domain) => domain.on_exchange_timeout(relayed),
            None => debug!(exchange_id = %relayed.origin.exchange_id, "Expiry after domain teardown dropped"),
        }
    }
}

impl RemoteGateway for DomainHandle {
    fn forward(&self, exchange: MessageExchange) -> Result<(), RouterError> {
        let domain = self.domain.upgrade().ok_or(RouterError::LinkClosed)?;
        domain.forward_exchange(exchange).map(|_| ())
    }

    fn abandon(&self, id: &ExchangeId) {
        if let Some(domain) = self.domain.upgrade() {
            domain.abandon_exchange(id);
        }
    }

    fn is_open(&self) -> bool {
        self.domain.upgrade().is_some_and(|domain| !domain.is_closed())
    }
}

impl WriteFailureSink for DomainHandle {
    fn non_terminal_write_failed(&self, message: TransportedMessage, error: TransportError) {
        if let Some(domain) = self.domain.upgrade() {
            domain.on_non_terminal_write_failure(message, error);
        }
    }
}
