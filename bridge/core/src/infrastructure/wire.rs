// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Wire Format
//!
//! Every frame is a 4-byte big-endian length prefix followed by one JSON
//! encoded [`WireMessage`].
//!
//! `AuthRequest`, `AuthAccept` and `AuthRefuse` are the only valid messages
//! before a connection is admitted; after admission they are protocol
//! violations, and only `Propagation` and `Envelope` flow.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::domain::envelope::TransportedEnvelope;
use crate::domain::handshake::AuthRequest;
use crate::domain::service_key::ServiceKey;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMessage {
    AuthRequest(AuthRequest),
    AuthAccept,
    AuthRefuse { reason: String },
    /// Capabilities the acceptor exposes to this peer.
    Propagation { services: Vec<ServiceKey> },
    Envelope(TransportedEnvelope),
}

impl WireMessage {
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::AuthRequest(_) | Self::AuthAccept | Self::AuthRefuse { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AuthRequest(_) => "AuthRequest",
            Self::AuthAccept => "AuthAccept",
            Self::AuthRefuse { .. } => "AuthRefuse",
            Self::Propagation { .. } => "Propagation",
            Self::Envelope(_) => "Envelope",
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-delimited JSON codec for [`WireMessage`].
#[derive(Debug)]
pub struct WireCodec {
    frames: LengthDelimitedCodec,
}

impl WireCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for WireCodec {
    type Item = WireMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WireMessage>, WireError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<WireMessage> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        let payload = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::TransportedMessage;
    use crate::domain::exchange::{ExchangePattern, ExchangeRole, MessageExchange};
    use crate::domain::handshake::SslType;

    #[test]
    fn test_frame_has_big_endian_length_prefix() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(WireMessage::AuthAccept, &mut buf).unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let json: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(json["type"], "auth_accept");
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
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

        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert!(decoded.is_handshake());
        assert_eq!(decoded.type_name(), "AuthRequest");
    }

    #[test]
    fn test_envelope_frame_decodes() {
        let exchange = MessageExchange::new(
            ServiceKey::new("Hello", "Greet"),
            ExchangePattern::InOnly,
            ExchangeRole::Consumer,
        );
        let message = WireMessage::Envelope(TransportedMessage::initial(&exchange).into());

        let mut codec = WireCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(message));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut small = WireCodec::new(8);
        let mut buf = BytesMut::new();
        WireCodec::default()
            .encode(WireMessage::AuthRefuse { reason: "x".repeat(64) }, &mut buf)
            .unwrap();

        assert!(matches!(small.decode(&mut buf), Err(WireError::Io(_))));
    }

    #[test]
    fn test_garbage_frame_is_malformed() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();

        assert!(matches!(codec.decode(&mut buf), Err(WireError::Json(_))));
    }
}
