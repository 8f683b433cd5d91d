// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Handshake Driver
//!
//! Runs the admission handshake over a freshly opened stream and yields an
//! [`AdmittedChannel`]: the framed, optionally TLS-wrapped connection that
//! the business handler takes over.
//!
//! The plain-text phase is framed with [`WireCodec`]. When TLS follows,
//! any byte already buffered past `AuthAccept` is a protocol violation, since
//! the peer must wait for the TLS handshake. Without TLS, buffered bytes are
//! carried into the business framing unchanged.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::either::Either;
use tracing::{debug, info, warn};

use crate::domain::handshake::{check_ssl_consistency, AuthRequest, CertificatePolicy, HandshakeError, SslType};
use crate::infrastructure::wire::{WireCodec, WireError, WireMessage, DEFAULT_MAX_FRAME_LENGTH};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Plain or TLS-wrapped transport after admission.
pub type BridgeStream<S> = Either<S, TlsStream<S>>;

pub type BridgeFramed<S> = Framed<BridgeStream<S>, WireCodec>;

/// What an initiator presents.
#[derive(Clone)]
pub struct InitiatorIdentity {
    pub auth_name: String,
    pub ssl_type: SslType,
    pub tls: Option<Arc<ClientConfig>>,
    /// Name checked against the acceptor's certificate.
    pub server_name: String,
}

impl InitiatorIdentity {
    pub fn plain(auth_name: impl Into<String>) -> Self {
        Self {
            auth_name: auth_name.into(),
            ssl_type: SslType::None,
            tls: None,
            server_name: String::new(),
        }
    }

    pub fn with_tls(
        auth_name: impl Into<String>,
        server_name: impl Into<String>,
        config: Arc<ClientConfig>,
        presents_client_certificate: bool,
    ) -> Self {
        Self {
            auth_name: auth_name.into(),
            ssl_type: SslType::for_initiator(presents_client_certificate, true),
            tls: Some(config),
            server_name: server_name.into(),
        }
    }
}

/// Acceptor-side view of a configured peer.
#[derive(Clone)]
pub struct ResolvedPeer {
    pub auth_name: String,
    pub server_tls: Option<Arc<ServerConfig>>,
    pub client_trust: bool,
}

impl ResolvedPeer {
    pub fn policy(&self) -> CertificatePolicy {
        CertificatePolicy {
            server_certificate: self.server_tls.is_some(),
            client_trust: self.client_trust,
        }
    }
}

/// Resolves an authentication name to a configured peer.
pub type PeerResolver = Arc<dyn Fn(&str) -> Option<ResolvedPeer> + Send + Sync>;

pub enum HandshakeRole {
    Initiator { identity: InitiatorIdentity },
    Acceptor { resolver: PeerResolver },
}

impl HandshakeRole {
    fn name(&self) -> &'static str {
        match self {
            Self::Initiator { .. } => "initiator",
            Self::Acceptor { .. } => "acceptor",
        }
    }
}

/// Connection admitted to the relay.
pub struct AdmittedChannel<S> {
    pub framed: BridgeFramed<S>,
    /// Authentication name of the connection (ours as initiator, the peer's as acceptor).
    pub auth_name: String,
    pub ssl_type: SslType,
}

pub struct Handshake<S> {
    stream: S,
    role: HandshakeRole,
    timeout: Duration,
    max_frame_length: usize,
}

impl<S> Handshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, role: HandshakeRole) -> Self {
        Self {
            stream,
            role,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Drive the handshake to its single outcome.
    pub async fn run(self) -> Result<AdmittedChannel<S>, HandshakeError> {
        let role = self.role.name();
        let deadline = self.timeout;
        let result = match tokio::time::timeout(deadline, self.negotiate()).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Timeout(deadline)),
        };

        match &result {
            Ok(admitted) => {
                metrics::counter!("aegis_bridge_handshakes_total", "outcome" => "admitted").increment(1);
                info!(role, auth_name = %admitted.auth_name, ssl_type = %admitted.ssl_type, "Connection admitted");
            }
            Err(err) => {
                metrics::counter!("aegis_bridge_handshakes_total", "outcome" => err.outcome_label()).increment(1);
                warn!(role, error = %err, "Handshake failed");
            }
        }
        result
    }

    async fn negotiate(self) -> Result<AdmittedChannel<S>, HandshakeError> {
        let framed = Framed::new(self.stream, WireCodec::new(self.max_frame_length));
        match self.role {
            HandshakeRole::Initiator { identity } => initiate(framed, identity).await,
            HandshakeRole::Acceptor { resolver } => accept(framed, resolver).await,
        }
    }
}

async fn initiate<S>(
    mut framed: Framed<S, WireCodec>,
    identity: InitiatorIdentity,
) -> Result<AdmittedChannel<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ssl_type = identity.ssl_type;
    debug!(auth_name = %identity.auth_name, %ssl_type, "Sending AuthRequest");
    framed
        .send(WireMessage::AuthRequest(AuthRequest {
            auth_name: identity.auth_name.clone(),
            ssl_type,
        }))
        .await
        .map_err(wire_error)?;

    match next_message(&mut framed).await? {
        WireMessage::AuthAccept => {}
        WireMessage::AuthRefuse { reason } => return Err(HandshakeError::Refused(reason)),
        other => {
            return Err(HandshakeError::ProtocolViolation(format!(
                "initiator received {} while awaiting admission",
                other.type_name()
            )))
        }
    }

    let framed = if ssl_type.requires_tls() {
        let config = identity
            .tls
            .ok_or_else(|| HandshakeError::Tls("no client TLS configuration".into()))?;
        let server_name = ServerName::try_from(identity.server_name.clone())
            .map_err(|e| HandshakeError::Tls(format!("invalid server name '{}': {e}", identity.server_name)))?;
        let (io, codec) = take_for_tls(framed)?;
        let tls = TlsConnector::from(config)
            .connect(server_name, io)
            .await
            .map_err(|e| HandshakeError::Tls(e.to_string()))?;
        Framed::new(Either::Right(TlsStream::Client(tls)), codec)
    } else {
        carry_over(framed)
    };

    Ok(AdmittedChannel {
        framed,
        auth_name: identity.auth_name,
        ssl_type,
    })
}

async fn accept<S>(mut framed: Framed<S, WireCodec>, resolver: PeerResolver) -> Result<AdmittedChannel<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = match next_message(&mut framed).await? {
        WireMessage::AuthRequest(request) => request,
        other => {
            return Err(HandshakeError::ProtocolViolation(format!(
                "acceptor received {} before AuthRequest",
                other.type_name()
            )))
        }
    };

    let Some(peer) = resolver(&request.auth_name) else {
        refuse(&mut framed, format!("unknown identity '{}'", request.auth_name)).await;
        return Err(HandshakeError::UnknownIdentity(request.auth_name));
    };

    if let Err(err) = check_ssl_consistency(peer.policy(), request.ssl_type) {
        refuse(&mut framed, err.to_string()).await;
        return Err(err);
    }

    // AuthAccept must be on the wire before the business handler can write.
    framed.send(WireMessage::AuthAccept).await.map_err(wire_error)?;

    let framed = if request.ssl_type.requires_tls() {
        let config = peer
            .server_tls
            .clone()
            .ok_or_else(|| HandshakeError::Tls("no server TLS configuration".into()))?;
        let (io, codec) = take_for_tls(framed)?;
        let tls = TlsAcceptor::from(config)
            .accept(io)
            .await
            .map_err(|e| HandshakeError::Tls(e.to_string()))?;
        Framed::new(Either::Right(TlsStream::Server(tls)), codec)
    } else {
        carry_over(framed)
    };

    Ok(AdmittedChannel {
        framed,
        auth_name: peer.auth_name,
        ssl_type: request.ssl_type,
    })
}

async fn next_message<S>(framed: &mut Framed<S, WireCodec>) -> Result<WireMessage, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(message)) if message.is_handshake() => Ok(message),
        Some(Ok(message)) => Err(HandshakeError::ProtocolViolation(format!(
            "{} before admission",
            message.type_name()
        ))),
        Some(Err(err)) => Err(wire_error(err)),
        None => Err(HandshakeError::ConnectionClosed),
    }
}

async fn refuse<S>(framed: &mut Framed<S, WireCodec>, reason: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(%reason, "Refusing connection");
    if framed.send(WireMessage::AuthRefuse { reason }).await.is_ok() {
        let _ = framed.close().await;
    }
}

fn take_for_tls<S>(framed: Framed<S, WireCodec>) -> Result<(S, WireCodec), HandshakeError> {
    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        return Err(HandshakeError::ProtocolViolation(format!(
            "{} bytes received before the TLS handshake",
            parts.read_buf.len()
        )));
    }
    Ok((parts.io, parts.codec))
}

fn carry_over<S>(framed: Framed<S, WireCodec>) -> BridgeFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let parts = framed.into_parts();
    let mut carried = FramedParts::new::<WireMessage>(Either::Left(parts.io), parts.codec);
    carried.read_buf = parts.read_buf;
    carried.write_buf = parts.write_buf;
    Framed::from_parts(carried)
}

fn wire_error(err: WireError) -> HandshakeError {
    match err {
        WireError::Io(io) => HandshakeError::Io(io),
        WireError::Json(json) => HandshakeError::ProtocolViolation(format!("malformed handshake frame: {json}")),
    }
}

/// Handshake running on its own task; resolves exactly once, from any thread.
pub struct HandshakeOutcome<S> {
    task: JoinHandle<Result<AdmittedChannel<S>, HandshakeError>>,
}

impl<S> Future for HandshakeOutcome<S> {
    type Output = Result<AdmittedChannel<S>, HandshakeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task)
            .poll(cx)
            .map(|joined| joined.unwrap_or_else(|e| Err(HandshakeError::Aborted(e.to_string()))))
    }
}

pub fn spawn_handshake<S>(handshake: Handshake<S>) -> HandshakeOutcome<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    HandshakeOutcome {
        task: tokio::spawn(handshake.run()),
    }
}
