// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Bridge Runtime
//!
//! Starts a bridge node from its configuration: one accept loop per
//! listener, one outbound link per provider domain. Everything hangs off a
//! single shutdown token.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::bridge_config::BridgeConfigManifest;
use crate::domain::error::BridgeError;
use crate::domain::router::LocalRouter;
use crate::infrastructure::connection::BoundConnection;
use crate::infrastructure::connector::ProviderConnector;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::listener::{BridgeListener, ConsumerProfile};

pub struct BridgeRuntime {
    shutdown: CancellationToken,
    listeners: HashMap<String, SocketAddr>,
    providers: HashMap<String, BoundConnection>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeRuntime {
    pub async fn start(
        config: &BridgeConfigManifest,
        router: Arc<dyn LocalRouter>,
        event_bus: EventBus,
        shutdown: CancellationToken,
    ) -> Result<Self, BridgeError> {
        config.validate().map_err(|e| BridgeError::Config(e.to_string()))?;
        let spec = &config.spec;

        let mut listeners = HashMap::new();
        let mut tasks = Vec::new();
        for listener_config in &spec.listeners {
            let profiles = spec
                .consumer_domains
                .iter()
                .filter(|domain| domain.listener == listener_config.name)
                .map(ConsumerProfile::from_config)
                .collect::<Result<Vec<_>, _>>()?;

            let socket = TcpListener::bind(listener_config.socket_address()).await?;
            let address = socket.local_addr()?;
            info!(
                listener = %listener_config.name,
                address = %address,
                consumer_domains = profiles.len(),
                "Listener bound"
            );

            let listener = Arc::new(BridgeListener::new(
                &listener_config.name,
                profiles,
                &spec.transport,
                router.clone(),
                event_bus.clone(),
            ));
            tasks.push(tokio::spawn(listener.serve(socket, shutdown.clone())));
            listeners.insert(listener_config.name.clone(), address);
        }

        let mut providers = HashMap::new();
        for provider in &spec.provider_domains {
            let connector = ProviderConnector::from_config(provider, &spec.transport, router.clone(), event_bus.clone())?;
            match connector.connect(&shutdown).await {
                Ok(bound) => {
                    providers.insert(provider.name.clone(), bound);
                }
                Err(e) => warn!(provider = %provider.name, error = %e, "Provider domain unreachable"),
            }
        }

        info!(
            listeners = listeners.len(),
            providers = providers.len(),
            "Bridge runtime started"
        );
        Ok(Self {
            shutdown,
            listeners,
            providers,
            tasks,
        })
    }

    /// Address a listener actually bound to (useful with port 0).
    pub fn listener_address(&self, name: &str) -> Option<SocketAddr> {
        self.listeners.get(name).copied()
    }

    pub fn provider(&self, name: &str) -> Option<&BoundConnection> {
        self.providers.get(name)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once shutdown was requested and every task has stopped.
    pub async fn wait(self) {
        self.shutdown.cancelled().await;
        for task in self.tasks {
            let _ = task.await;
        }
        for (_, connection) in self.providers {
            connection.closed().await;
        }
        info!("Bridge runtime stopped");
    }
}
