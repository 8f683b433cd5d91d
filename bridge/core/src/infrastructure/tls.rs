// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! TLS material for the post-handshake upgrade, loaded from PEM.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::domain::bridge_config::{ClientTlsConfig, ServerTlsConfig};
use crate::domain::error::BridgeError;

fn read_pem(path: impl AsRef<Path>) -> Result<Vec<u8>, BridgeError> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|e| BridgeError::TlsConfig(format!("failed to read {}: {e}", path.display())))
}

pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, BridgeError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BridgeError::TlsConfig(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(BridgeError::TlsConfig("no certificates found".into()));
    }
    Ok(certs)
}

pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, BridgeError> {
    PrivateKeyDer::from_pem_slice(pem).map_err(|e| BridgeError::TlsConfig(format!("failed to parse private key: {e}")))
}

fn root_store(pem: &[u8]) -> Result<RootCertStore, BridgeError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(pem)? {
        roots
            .add(cert)
            .map_err(|e| BridgeError::TlsConfig(format!("failed to add trust anchor: {e}")))?;
    }
    Ok(roots)
}

/// Acceptor-side TLS; demands a client certificate when `client_ca_pem` is set.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
    client_ca_pem: Option<&[u8]>,
) -> Result<Arc<ServerConfig>, BridgeError> {
    let certs = parse_certificates(cert_pem)?;
    let key = parse_private_key(key_pem)?;

    let builder = match client_ca_pem {
        Some(ca) => {
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store(ca)?))
                .build()
                .map_err(|e| BridgeError::TlsConfig(format!("client verifier error: {e}")))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| BridgeError::TlsConfig(format!("server config error: {e}")))?;
    Ok(Arc::new(config))
}

/// Initiator-side TLS; presents a client certificate when one is given.
pub fn client_config_from_pem(
    server_ca_pem: &[u8],
    client_identity: Option<(&[u8], &[u8])>,
) -> Result<Arc<ClientConfig>, BridgeError> {
    let builder = ClientConfig::builder().with_root_certificates(root_store(server_ca_pem)?);

    let config = match client_identity {
        Some((cert_pem, key_pem)) => builder
            .with_client_auth_cert(parse_certificates(cert_pem)?, parse_private_key(key_pem)?)
            .map_err(|e| BridgeError::TlsConfig(format!("client config error: {e}")))?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// `None` when the consumer domain has no server certificate.
pub fn load_server_config(tls: &ServerTlsConfig) -> Result<Option<Arc<ServerConfig>>, BridgeError> {
    let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) else {
        return Ok(None);
    };
    let client_ca = tls.client_ca_path.as_ref().map(read_pem).transpose()?;
    server_config_from_pem(&read_pem(cert_path)?, &read_pem(key_path)?, client_ca.as_deref()).map(Some)
}

/// `None` when the provider domain trusts no server CA, i.e. no TLS.
pub fn load_client_config(tls: &ClientTlsConfig) -> Result<Option<Arc<ClientConfig>>, BridgeError> {
    let Some(ca_path) = &tls.server_ca_path else {
        return Ok(None);
    };
    let identity = match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        _ => None,
    };
    client_config_from_pem(
        &read_pem(ca_path)?,
        identity.as_ref().map(|(cert, key)| (cert.as_slice(), key.as_slice())),
    )
    .map(Some)
}
