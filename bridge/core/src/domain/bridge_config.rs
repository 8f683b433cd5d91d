// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Bridge Configuration Types
//
// Defines the configuration schema for an AEGIS bridge node, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Listeners accepting remote consumers
// - Consumer domains (peers consuming local capabilities) and their routing tables
// - Provider domains (peers hosting capabilities consumed locally)
// - Transport limits and observability settings

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::domain::handshake::{CertificatePolicy, SslType};
use crate::domain::service_key::{LocalTarget, RoutingTable, ServiceKey};

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "BridgeConfig";

/// Top-level Kubernetes-style bridge configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "BridgeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: BridgeConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable bridge name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfigSpec {
    /// TCP listeners accepting initiators
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Remote peers consuming capabilities hosted locally (acceptor side)
    #[serde(default)]
    pub consumer_domains: Vec<ConsumerDomainConfig>,

    /// Remote peers hosting capabilities consumed locally (initiator side)
    #[serde(default)]
    pub provider_domains: Vec<ProviderDomainConfig>,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl ListenerConfig {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerDomainConfig {
    /// Authentication name the initiator presents
    pub auth_name: String,

    /// Listener this peer connects to
    pub listener: String,

    /// Copy the peer's flow tracing activation onto new local exchanges
    #[serde(default = "default_true")]
    pub propagate_tracing_activation: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ServerTlsConfig>,

    /// Capabilities exposed to this peer and their local targets
    #[serde(default)]
    pub services: Vec<ServiceRouteConfig>,
}

impl ConsumerDomainConfig {
    pub fn certificate_policy(&self) -> CertificatePolicy {
        match &self.tls {
            Some(tls) => CertificatePolicy {
                server_certificate: tls.cert_path.is_some(),
                client_trust: tls.client_ca_path.is_some(),
            },
            None => CertificatePolicy::default(),
        }
    }

    pub fn routing_table(&self) -> RoutingTable {
        let mut table = RoutingTable::new();
        for route in &self.services {
            table.insert(route.service_key(), LocalTarget(route.target.clone()));
        }
        table
    }
}

/// Acceptor TLS material for one consumer domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    /// Server certificate chain (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,

    /// Server private key (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,

    /// Trust anchors for client certificates (PEM); demands mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRouteConfig {
    pub interface_id: String,
    pub capability_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Local endpoint name
    pub target: String,
}

impl ServiceRouteConfig {
    pub fn service_key(&self) -> ServiceKey {
        let key = ServiceKey::new(&self.interface_id, &self.capability_id);
        match &self.instance_id {
            Some(instance) => key.with_instance(instance),
            None => key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDomainConfig {
    pub name: String,

    /// Authentication name presented to the remote acceptor
    pub auth_name: String,

    pub remote_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClientTlsConfig>,
}

impl ProviderDomainConfig {
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_address, self.port)
    }

    pub fn ssl_type(&self) -> SslType {
        match &self.tls {
            Some(tls) => SslType::for_initiator(tls.client_cert_path.is_some(), tls.server_ca_path.is_some()),
            None => SslType::None,
        }
    }
}

/// Initiator TLS material for one provider domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientTlsConfig {
    /// Trust anchors for the acceptor's certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ca_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_path: Option<String>,

    /// Name checked against the acceptor's certificate (defaults to remote_address)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,

    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Per-exchange timer owned by the local router
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_seconds: default_handshake_timeout(),
            max_frame_length: default_max_frame_length(),
            exchange_timeout_seconds: default_exchange_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7600
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_max_frame_length() -> usize {
    16 * 1024 * 1024
}

fn default_exchange_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for BridgeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "aegis-bridge".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: BridgeConfigSpec::default(),
        }
    }
}

impl BridgeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_BRIDGE_CONFIG_PATH environment variable
    /// 2. ./aegis-bridge.yaml (working directory)
    /// 3. ~/.aegis/bridge.yaml (user home)
    /// 4. /etc/aegis/bridge.yaml (system, Unix) or C:\ProgramData\Aegis\bridge.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AEGIS_BRIDGE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aegis-bridge.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("bridge.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/aegis/bridge.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Aegis\\bridge.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using empty defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AEGIS_BRIDGE_HANDSHAKE_TIMEOUT_SECONDS") {
            match val.parse::<u64>() {
                Ok(seconds) if seconds > 0 => {
                    tracing::info!("Environment override: AEGIS_BRIDGE_HANDSHAKE_TIMEOUT_SECONDS={}", seconds);
                    self.spec.transport.handshake_timeout_seconds = seconds;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for AEGIS_BRIDGE_HANDSHAKE_TIMEOUT_SECONDS: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("AEGIS_BRIDGE_MAX_FRAME_LENGTH") {
            match val.parse::<usize>() {
                Ok(length) if length > 0 => {
                    tracing::info!("Environment override: AEGIS_BRIDGE_MAX_FRAME_LENGTH={}", length);
                    self.spec.transport.max_frame_length = length;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for AEGIS_BRIDGE_MAX_FRAME_LENGTH: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let mut listener_names = HashSet::new();
        for listener in &self.spec.listeners {
            if listener.name.is_empty() {
                anyhow::bail!("Listener name cannot be empty");
            }
            if !listener_names.insert(listener.name.as_str()) {
                anyhow::bail!("Duplicate listener name: {}", listener.name);
            }
        }

        let mut auth_names = HashSet::new();
        for domain in &self.spec.consumer_domains {
            if domain.auth_name.is_empty() {
                anyhow::bail!("Consumer domain auth_name cannot be empty");
            }
            if !listener_names.contains(domain.listener.as_str()) {
                anyhow::bail!(
                    "Consumer domain '{}' references unknown listener '{}'",
                    domain.auth_name,
                    domain.listener
                );
            }
            if !auth_names.insert((domain.listener.as_str(), domain.auth_name.as_str())) {
                anyhow::bail!(
                    "Duplicate auth_name '{}' on listener '{}'",
                    domain.auth_name,
                    domain.listener
                );
            }
            if let Some(tls) = &domain.tls {
                match (&tls.cert_path, &tls.key_path) {
                    (Some(_), None) => {
                        anyhow::bail!("Consumer domain '{}' has a certificate without a key", domain.auth_name)
                    }
                    (None, Some(_)) => {
                        anyhow::bail!("Consumer domain '{}' has a key without a certificate", domain.auth_name)
                    }
                    _ => {}
                }
                if tls.client_ca_path.is_some() && tls.cert_path.is_none() {
                    anyhow::bail!(
                        "Consumer domain '{}' trusts client certificates without a server certificate",
                        domain.auth_name
                    );
                }
            }
            for route in &domain.services {
                if route.interface_id.is_empty() || route.capability_id.is_empty() {
                    anyhow::bail!("Service route in '{}' needs interface_id and capability_id", domain.auth_name);
                }
                if route.target.is_empty() {
                    anyhow::bail!("Service route {} in '{}' has an empty target", route.service_key(), domain.auth_name);
                }
            }
        }

        let mut provider_names = HashSet::new();
        for provider in &self.spec.provider_domains {
            if provider.name.is_empty() {
                anyhow::bail!("Provider domain name cannot be empty");
            }
            if !provider_names.insert(provider.name.as_str()) {
                anyhow::bail!("Duplicate provider domain name: {}", provider.name);
            }
            if provider.auth_name.is_empty() {
                anyhow::bail!("Provider domain '{}' auth_name cannot be empty", provider.name);
            }
            if provider.remote_address.is_empty() {
                anyhow::bail!("Provider domain '{}' remote_address cannot be empty", provider.name);
            }
            if let Some(tls) = &provider.tls {
                match (&tls.client_cert_path, &tls.client_key_path) {
                    (Some(_), None) => {
                        anyhow::bail!("Provider domain '{}' has a client certificate without a key", provider.name)
                    }
                    (None, Some(_)) => {
                        anyhow::bail!("Provider domain '{}' has a client key without a certificate", provider.name)
                    }
                    _ => {}
                }
                if tls.client_cert_path.is_some() && tls.server_ca_path.is_none() {
                    anyhow::bail!(
                        "Provider domain '{}' presents a client certificate without a trusted server CA",
                        provider.name
                    );
                }
            }
        }

        if self.spec.transport.handshake_timeout_seconds == 0 {
            anyhow::bail!("spec.transport.handshake_timeout_seconds must be greater than zero");
        }
        if self.spec.transport.max_frame_length == 0 {
            anyhow::bail!("spec.transport.max_frame_length must be greater than zero");
        }

        Ok(())
    }
}
