// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Initiator side: connects to a remote acceptor hosting capabilities and
//! binds the link to a provider-side bridge domain. There is no
//! reconnection; a closed link stays closed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::bridge_domain::DomainSide;
use crate::domain::bridge_config::{ProviderDomainConfig, TransportConfig};
use crate::domain::error::BridgeError;
use crate::domain::events::{BridgeEvent, SideKind};
use crate::domain::router::LocalRouter;
use crate::infrastructure::connection::{bind, BoundConnection};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::handshake::{spawn_handshake, Handshake, HandshakeRole, InitiatorIdentity};
use crate::infrastructure::tls::load_client_config;

pub struct ProviderConnector {
    name: String,
    endpoint: String,
    identity: InitiatorIdentity,
    router: Arc<dyn LocalRouter>,
    event_bus: EventBus,
    handshake_timeout: Duration,
    max_frame_length: usize,
}

impl ProviderConnector {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        identity: InitiatorIdentity,
        transport: &TransportConfig,
        router: Arc<dyn LocalRouter>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            identity,
            router,
            event_bus,
            handshake_timeout: Duration::from_secs(transport.handshake_timeout_seconds),
            max_frame_length: transport.max_frame_length,
        }
    }

    pub fn from_config(
        config: &ProviderDomainConfig,
        transport: &TransportConfig,
        router: Arc<dyn LocalRouter>,
        event_bus: EventBus,
    ) -> Result<Self, BridgeError> {
        let client_tls = match &config.tls {
            Some(tls) => load_client_config(tls)?.map(|client| {
                let server_name = tls.server_name.clone().unwrap_or_else(|| config.remote_address.clone());
                (client, server_name)
            }),
            None => None,
        };

        let identity = match client_tls {
            Some((client, server_name)) => InitiatorIdentity {
                auth_name: config.auth_name.clone(),
                ssl_type: config.ssl_type(),
                tls: Some(client),
                server_name,
            },
            None => InitiatorIdentity::plain(&config.auth_name),
        };

        Ok(Self::new(
            &config.name,
            config.remote_endpoint(),
            identity,
            transport,
            router,
            event_bus,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn connect(&self, shutdown: &CancellationToken) -> Result<BoundConnection, BridgeError> {
        info!(provider = %self.name, endpoint = %self.endpoint, "Connecting to remote provider");
        let stream = match TcpStream::connect(&self.endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                self.publish_failure(e.to_string());
                return Err(e.into());
            }
        };
        self.establish(stream, shutdown).await
    }

    /// Run the initiator handshake on an already open stream.
    pub async fn establish<S>(&self, stream: S, shutdown: &CancellationToken) -> Result<BoundConnection, BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = Handshake::new(
            stream,
            HandshakeRole::Initiator {
                identity: self.identity.clone(),
            },
        )
        .with_timeout(self.handshake_timeout)
        .with_max_frame_length(self.max_frame_length);

        let admitted = match spawn_handshake(handshake).await {
            Ok(admitted) => admitted,
            Err(err) => {
                self.publish_failure(err.to_string());
                return Err(err.into());
            }
        };

        let ssl_type = admitted.ssl_type;
        let bound = bind(
            admitted,
            DomainSide::provider(),
            self.router.clone(),
            self.event_bus.clone(),
            shutdown,
        );
        self.event_bus.publish(BridgeEvent::ConnectionAdmitted {
            domain_id: bound.domain.id(),
            peer: self.name.clone(),
            side: SideKind::Provider,
            ssl_type,
            admitted_at: Utc::now(),
        });
        Ok(bound)
    }

    fn publish_failure(&self, reason: String) {
        self.event_bus.publish(BridgeEvent::HandshakeFailed {
            peer_address: self.endpoint.clone(),
            reason,
            failed_at: Utc::now(),
        });
    }
}
