// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Authenticated Channel Handshake (policy)
//!
//! Pure decision rules of the admission handshake. The async driver lives in
//! `infrastructure::handshake`.
//!
//! ```text
//! Initiator                         Acceptor
//!    │── AuthRequest{name, ssl} ──────►│ resolve(name), check_ssl_consistency
//!    │◄──────── AuthAccept ────────────│ (flushed before anything else)
//!    │══════ TLS (if ssl != None) ═════│
//!    │◄═══════ business frames ═══════►│
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which side presents a TLS identity once the plain-text phase is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SslType {
    /// No TLS at all.
    None,
    /// Server certificate only.
    Server,
    /// Mutual TLS.
    #[serde(rename = "CLIENTSERVER")]
    ClientServer,
}

impl SslType {
    /// Requested type for an initiator holding the given material.
    ///
    /// A client certificate is only presentable inside a server-authenticated
    /// session, so it implies `ClientServer`.
    pub fn for_initiator(has_client_certificate: bool, trusts_server_ca: bool) -> Self {
        match (has_client_certificate, trusts_server_ca) {
            (true, _) => Self::ClientServer,
            (false, true) => Self::Server,
            (false, false) => Self::None,
        }
    }

    pub fn requires_tls(self) -> bool {
        self != Self::None
    }
}

impl std::fmt::Display for SslType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Server => write!(f, "SERVER"),
            Self::ClientServer => write!(f, "CLIENTSERVER"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub auth_name: String,
    pub ssl_type: SslType,
}

/// Acceptor-side certificate configuration for one resolved peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CertificatePolicy {
    pub server_certificate: bool,
    pub client_trust: bool,
}

impl CertificatePolicy {
    /// The only `SslType` this configuration can serve.
    pub fn expected_ssl_type(&self) -> SslType {
        match (self.server_certificate, self.client_trust) {
            // Client trust is meaningless without a server certificate.
            (false, _) => SslType::None,
            (true, false) => SslType::Server,
            (true, true) => SslType::ClientServer,
        }
    }
}

/// Check the requested `ssl_type` against the acceptor's configuration.
pub fn check_ssl_consistency(policy: CertificatePolicy, requested: SslType) -> Result<(), HandshakeError> {
    let expected = policy.expected_ssl_type();
    if expected == requested {
        return Ok(());
    }
    let reason = match expected {
        SslType::None => "no server certificate is configured",
        SslType::Server => "server certificate configured without client trust; only SERVER is accepted",
        SslType::ClientServer => "client certificates are required; only CLIENTSERVER is accepted",
    };
    Err(HandshakeError::CertificatePolicy {
        requested,
        reason: reason.to_string(),
    })
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Unknown peer identity '{0}'")]
    UnknownIdentity(String),

    #[error("Requested ssl type {requested} is inconsistent with local configuration: {reason}")]
    CertificatePolicy { requested: SslType, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Refused by peer: {0}")]
    Refused(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("Handshake timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake task aborted: {0}")]
    Aborted(String),
}

impl HandshakeError {
    /// Label used for the handshake outcome metric.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::UnknownIdentity(_) => "unknown_identity",
            Self::CertificatePolicy { .. } => "certificate_policy",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Refused(_) => "refused",
            Self::Tls(_) => "tls",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed | Self::Io(_) | Self::Aborted(_) => "io",
        }
    }
}
