// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Acceptor side: admits initiators on a TCP listener and binds each
//! admitted connection to a consumer-side bridge domain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::bridge_domain::DomainSide;
use crate::domain::bridge_config::{ConsumerDomainConfig, TransportConfig};
use crate::domain::error::BridgeError;
use crate::domain::events::{BridgeEvent, SideKind};
use crate::domain::router::LocalRouter;
use crate::domain::service_key::RoutingTable;
use crate::infrastructure::connection::{bind, BoundConnection};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::handshake::{spawn_handshake, Handshake, HandshakeRole, PeerResolver, ResolvedPeer};
use crate::infrastructure::tls::load_server_config;
use crate::infrastructure::wire::WireMessage;

/// Everything the acceptor knows about one consumer domain.
#[derive(Clone)]
pub struct ConsumerProfile {
    pub auth_name: String,
    pub server_tls: Option<Arc<ServerConfig>>,
    pub client_trust: bool,
    pub routes: RoutingTable,
    pub propagate_tracing_activation: bool,
}

impl ConsumerProfile {
    pub fn from_config(config: &ConsumerDomainConfig) -> Result<Self, BridgeError> {
        let server_tls = match &config.tls {
            Some(tls) => load_server_config(tls)?,
            None => None,
        };
        Ok(Self {
            auth_name: config.auth_name.clone(),
            client_trust: server_tls.is_some() && config.certificate_policy().client_trust,
            server_tls,
            routes: config.routing_table(),
            propagate_tracing_activation: config.propagate_tracing_activation,
        })
    }

    /// Plain-text profile.
    pub fn plain(auth_name: impl Into<String>, routes: RoutingTable) -> Self {
        Self {
            auth_name: auth_name.into(),
            server_tls: None,
            client_trust: false,
            routes,
            propagate_tracing_activation: true,
        }
    }
}

pub struct BridgeListener {
    name: String,
    profiles: Arc<HashMap<String, ConsumerProfile>>,
    router: Arc<dyn LocalRouter>,
    event_bus: EventBus,
    handshake_timeout: Duration,
    max_frame_length: usize,
}

impl BridgeListener {
    pub fn new(
        name: impl Into<String>,
        profiles: Vec<ConsumerProfile>,
        transport: &TransportConfig,
        router: Arc<dyn LocalRouter>,
        event_bus: EventBus,
    ) -> Self {
        let profiles = profiles.into_iter().map(|p| (p.auth_name.clone(), p)).collect();
        Self {
            name: name.into(),
            profiles: Arc::new(profiles),
            router,
            event_bus,
            handshake_timeout: Duration::from_secs(transport.handshake_timeout_seconds),
            max_frame_length: transport.max_frame_length,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolver(&self) -> PeerResolver {
        let profiles = self.profiles.clone();
        Arc::new(move |auth_name: &str| {
            profiles.get(auth_name).map(|profile| ResolvedPeer {
                auth_name: profile.auth_name.clone(),
                server_tls: profile.server_tls.clone(),
                client_trust: profile.client_trust,
            })
        })
    }

    /// Accept loop; one handshake task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!(listener = %self.name, address = %addr, "Bridge listener accepting connections"),
            Err(e) => warn!(listener = %self.name, error = %e, "Bridge listener address unknown"),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let this = self.clone();
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            this.serve_connection(stream, addr.to_string(), &token).await;
                        });
                    }
                    Err(e) => error!(listener = %self.name, error = %e, "Accept failed"),
                },
            }
        }
        info!(listener = %self.name, "Bridge listener stopped");
    }

    /// Run the acceptor handshake on `stream` and, once admitted, bind the
    /// connection and propagate the services exposed to the peer.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        peer_address: String,
        shutdown: &CancellationToken,
    ) -> Option<BoundConnection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = Handshake::new(
            stream,
            HandshakeRole::Acceptor {
                resolver: self.resolver(),
            },
        )
        .with_timeout(self.handshake_timeout)
        .with_max_frame_length(self.max_frame_length);

        let admitted = match spawn_handshake(handshake).await {
            Ok(admitted) => admitted,
            Err(err) => {
                self.event_bus.publish(BridgeEvent::HandshakeFailed {
                    peer_address,
                    reason: err.to_string(),
                    failed_at: Utc::now(),
                });
                return None;
            }
        };

        let profile = self.profiles.get(&admitted.auth_name)?;
        let ssl_type = admitted.ssl_type;
        let bound = bind(
            admitted,
            DomainSide::consumer(profile.routes.clone(), profile.propagate_tracing_activation),
            self.router.clone(),
            self.event_bus.clone(),
            shutdown,
        );

        self.event_bus.publish(BridgeEvent::ConnectionAdmitted {
            domain_id: bound.domain.id(),
            peer: bound.domain.peer().to_string(),
            side: SideKind::Consumer,
            ssl_type,
            admitted_at: Utc::now(),
        });

        let services = bound.domain.advertised_services();
        if let Err(e) = bound.writer.write_wire(WireMessage::Propagation { services }).await {
            warn!(peer = %bound.domain.peer(), error = %e, "Service propagation failed");
        }
        Some(bound)
    }
}
