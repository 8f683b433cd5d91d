// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use aegis_bridge_core::domain::handshake::{AuthRequest, HandshakeError, SslType};
use aegis_bridge_core::domain::service_key::ServiceKey;
use aegis_bridge_core::infrastructure::handshake::{
    spawn_handshake, Handshake, HandshakeRole, InitiatorIdentity, PeerResolver, ResolvedPeer,
};
use aegis_bridge_core::infrastructure::tls::{client_config_from_pem, server_config_from_pem};
use aegis_bridge_core::infrastructure::wire::{WireCodec, WireMessage};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Encoder;

struct TestPki {
    ca_pem: String,
    server_cert: String,
    server_key: String,
    client_cert: String,
    client_key: String,
}

fn issue(
    name: &str,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> (String, String) {
    let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages = vec![usage];
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, ca, ca_key).unwrap();
    (cert.pem(), key.serialize_pem())
}

fn test_pki() -> TestPki {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(DnType::CommonName, "Bridge Test CA");
    let ca_key = KeyPair::generate().unwrap();
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let (server_cert, server_key) = issue("localhost", ExtendedKeyUsagePurpose::ServerAuth, &ca, &ca_key);
    let (client_cert, client_key) = issue("acme.client", ExtendedKeyUsagePurpose::ClientAuth, &ca, &ca_key);

    TestPki {
        ca_pem: ca.pem(),
        server_cert,
        server_key,
        client_cert,
        client_key,
    }
}

fn resolver(peers: Vec<ResolvedPeer>) -> PeerResolver {
    Arc::new(move |name: &str| peers.iter().find(|p| p.auth_name == name).cloned())
}

fn plain_peer(name: &str) -> ResolvedPeer {
    ResolvedPeer {
        auth_name: name.to_string(),
        server_tls: None,
        client_trust: false,
    }
}

fn acceptor(stream: tokio::io::DuplexStream, peers: Vec<ResolvedPeer>) -> Handshake<tokio::io::DuplexStream> {
    Handshake::new(
        stream,
        HandshakeRole::Acceptor {
            resolver: resolver(peers),
        },
    )
    .with_timeout(Duration::from_secs(5))
}

fn initiator(stream: tokio::io::DuplexStream, identity: InitiatorIdentity) -> Handshake<tokio::io::DuplexStream> {
    Handshake::new(stream, HandshakeRole::Initiator { identity }).with_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_plain_identity_is_admitted_without_tls() {
    let (a, b) = tokio::io::duplex(64 * 1024);

    let (accepted, initiated) = tokio::join!(
        spawn_handshake(acceptor(a, vec![plain_peer("acme")])),
        spawn_handshake(initiator(b, InitiatorIdentity::plain("acme"))),
    );

    let mut accepted = accepted.unwrap();
    let mut initiated = initiated.unwrap();
    assert_eq!(accepted.auth_name, "acme");
    assert_eq!(accepted.ssl_type, SslType::None);
    assert_eq!(initiated.ssl_type, SslType::None);

    // Business traffic flows over the admitted framing.
    accepted
        .framed
        .send(WireMessage::Propagation {
            services: vec![ServiceKey::new("Hello", "Greet")],
        })
        .await
        .unwrap();
    match initiated.framed.next().await {
        Some(Ok(WireMessage::Propagation { services })) => assert_eq!(services.len(), 1),
        other => panic!("Unexpected frame: {:?}", other.map(|r| r.map(|m| m.type_name()))),
    }
}

#[tokio::test]
async fn test_unknown_identity_is_refused() {
    let (a, b) = tokio::io::duplex(64 * 1024);

    let (accepted, initiated) = tokio::join!(
        spawn_handshake(acceptor(a, vec![plain_peer("acme")])),
        spawn_handshake(initiator(b, InitiatorIdentity::plain("globex"))),
    );

    assert!(matches!(accepted, Err(HandshakeError::UnknownIdentity(name)) if name == "globex"));
    assert!(matches!(initiated, Err(HandshakeError::Refused(_))));
}

#[tokio::test]
async fn test_plain_request_refused_when_server_certificate_configured() {
    let pki = test_pki();
    let server = server_config_from_pem(pki.server_cert.as_bytes(), pki.server_key.as_bytes(), None).unwrap();
    let (a, b) = tokio::io::duplex(64 * 1024);

    let peer = ResolvedPeer {
        auth_name: "acme".into(),
        server_tls: Some(server),
        client_trust: false,
    };
    let (accepted, initiated) = tokio::join!(
        spawn_handshake(acceptor(a, vec![peer])),
        spawn_handshake(initiator(b, InitiatorIdentity::plain("acme"))),
    );

    assert!(matches!(
        accepted,
        Err(HandshakeError::CertificatePolicy {
            requested: SslType::None,
            ..
        })
    ));
    assert!(matches!(initiated, Err(HandshakeError::Refused(_))));
}

#[tokio::test]
async fn test_mutual_tls_is_established() {
    let pki = test_pki();
    let server = server_config_from_pem(
        pki.server_cert.as_bytes(),
        pki.server_key.as_bytes(),
        Some(pki.ca_pem.as_bytes()),
    )
    .unwrap();
    let client = client_config_from_pem(
        pki.ca_pem.as_bytes(),
        Some((pki.client_cert.as_bytes(), pki.client_key.as_bytes())),
    )
    .unwrap();
    let (a, b) = tokio::io::duplex(64 * 1024);

    let peer = ResolvedPeer {
        auth_name: "acme".into(),
        server_tls: Some(server),
        client_trust: true,
    };
    let identity = InitiatorIdentity::with_tls("acme", "localhost", client, true);
    assert_eq!(identity.ssl_type, SslType::ClientServer);

    let (accepted, initiated) = tokio::join!(
        spawn_handshake(acceptor(a, vec![peer])),
        spawn_handshake(initiator(b, identity)),
    );

    let mut accepted = accepted.unwrap();
    let mut initiated = initiated.unwrap();
    assert_eq!(accepted.ssl_type, SslType::ClientServer);

    initiated
        .framed
        .send(WireMessage::Propagation { services: vec![] })
        .await
        .unwrap();
    assert!(matches!(
        accepted.framed.next().await,
        Some(Ok(WireMessage::Propagation { .. }))
    ));
}

#[tokio::test]
async fn test_server_only_tls_is_established() {
    let pki = test_pki();
    let server = server_config_from_pem(pki.server_cert.as_bytes(), pki.server_key.as_bytes(), None).unwrap();
    let client = client_config_from_pem(pki.ca_pem.as_bytes(), None).unwrap();
    let (a, b) = tokio::io::duplex(64 * 1024);

    let peer = ResolvedPeer {
        auth_name: "acme".into(),
        server_tls: Some(server),
        client_trust: false,
    };
    let (accepted, initiated) = tokio::join!(
        spawn_handshake(acceptor(a, vec![peer])),
        spawn_handshake(initiator(b, InitiatorIdentity::with_tls("acme", "localhost", client, false))),
    );

    assert_eq!(accepted.unwrap().ssl_type, SslType::Server);
    assert_eq!(initiated.unwrap().ssl_type, SslType::Server);
}

#[tokio::test]
async fn test_bytes_before_tls_are_a_protocol_violation() {
    let pki = test_pki();
    let server = server_config_from_pem(pki.server_cert.as_bytes(), pki.server_key.as_bytes(), None).unwrap();
    let (a, mut b) = tokio::io::duplex(64 * 1024);

    let mut codec = WireCodec::default();
    let mut buf = BytesMut::new();
    codec
        .encode(
            WireMessage::AuthRequest(AuthRequest {
                auth_name: "acme".into(),
                ssl_type: SslType::Server,
            }),
            &mut buf,
        )
        .unwrap();
    codec
        .encode(WireMessage::Propagation { services: vec![] }, &mut buf)
        .unwrap();
    b.write_all(&buf).await.unwrap();

    let peer = ResolvedPeer {
        auth_name: "acme".into(),
        server_tls: Some(server),
        client_trust: false,
    };
    let result = spawn_handshake(acceptor(a, vec![peer])).await;
    assert!(matches!(result, Err(HandshakeError::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_bytes_after_plain_admission_are_carried_over() {
    let (a, mut b) = tokio::io::duplex(64 * 1024);

    let mut codec = WireCodec::default();
    let mut buf = BytesMut::new();
    codec
        .encode(
            WireMessage::AuthRequest(AuthRequest {
                auth_name: "acme".into(),
                ssl_type: SslType::None,
            }),
            &mut buf,
        )
        .unwrap();
    codec
        .encode(
            WireMessage::Propagation {
                services: vec![ServiceKey::new("Hello", "Greet")],
            },
            &mut buf,
        )
        .unwrap();
    b.write_all(&buf).await.unwrap();

    let mut admitted = spawn_handshake(acceptor(a, vec![plain_peer("acme")])).await.unwrap();
    assert!(matches!(
        admitted.framed.next().await,
        Some(Ok(WireMessage::Propagation { services })) if services.len() == 1
    ));
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (a, _b) = tokio::io::duplex(1024);

    let handshake = Handshake::new(
        a,
        HandshakeRole::Acceptor {
            resolver: resolver(vec![plain_peer("acme")]),
        },
    )
    .with_timeout(Duration::from_millis(50));

    match spawn_handshake(handshake).await {
        Err(err @ HandshakeError::Timeout(_)) => {
            assert!(matches!(err, HandshakeError::Timeout(d) if d == Duration::from_millis(50)));
            assert_eq!(err.to_string(), "Handshake timed out after 50ms");
        }
        other => panic!("Expected timeout, got {:?}", other.map(|a| a.auth_name)),
    }
}

#[tokio::test]
async fn test_business_frame_before_admission_is_a_protocol_violation() {
    let (a, b) = tokio::io::duplex(1024);
    let mut peer = tokio_util::codec::Framed::new(b, WireCodec::default());
    peer.send(WireMessage::Propagation { services: vec![] }).await.unwrap();

    let result = spawn_handshake(acceptor(a, vec![plain_peer("acme")])).await;
    assert!(matches!(result, Err(HandshakeError::ProtocolViolation(reason)) if reason.contains("Propagation")));
}

#[tokio::test]
async fn test_unexpected_first_message_is_a_protocol_violation() {
    let (a, b) = tokio::io::duplex(1024);
    let mut peer = tokio_util::codec::Framed::new(b, WireCodec::default());
    peer.send(WireMessage::AuthAccept).await.unwrap();

    let result = spawn_handshake(acceptor(a, vec![plain_peer("acme")])).await;
    assert!(matches!(result, Err(HandshakeError::ProtocolViolation(_))));
}
