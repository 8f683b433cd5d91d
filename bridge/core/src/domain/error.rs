// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use thiserror::Error;

use crate::domain::channel::TransportError;
use crate::domain::exchange::ExchangeId;
use crate::domain::handshake::HandshakeError;
use crate::domain::router::RouterError;

/// Protocol-invariant violations found while turning envelopes into local
/// exchanges. Never retried: the exchange is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconstructionError {
    #[error("Exchange {exchange_id}: expected step {expected}, received step {received}")]
    UnexpectedStep {
        exchange_id: ExchangeId,
        expected: u32,
        received: u32,
    },

    #[error("Exchange {0}: no correlation entry for a continuation step")]
    MissingEntry(ExchangeId),

    #[error("Exchange {0}: correlation entry already present")]
    DuplicateEntry(ExchangeId),

    #[error("Exchange {0}: exception received while a correlation entry was pending")]
    UnexpectedException(ExchangeId),

    #[error("Exchange {0}: step 1 received on the provider side")]
    SideViolation(ExchangeId),

    #[error("Exchange {0}: no local exchange to build step 1 from")]
    MissingFreshExchange(ExchangeId),
}

impl ReconstructionError {
    pub fn exchange_id(&self) -> &ExchangeId {
        match self {
            Self::UnexpectedStep { exchange_id, .. } => exchange_id,
            Self::MissingEntry(id)
            | Self::DuplicateEntry(id)
            | Self::UnexpectedException(id)
            | Self::SideViolation(id)
            | Self::MissingFreshExchange(id) => id,
        }
    }
}

/// Top-level error of the bridge core.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Reconstruction violation: {0}")]
    Reconstruction(#[from] ReconstructionError),

    #[error("Local delivery failed: {0}")]
    Router(#[from] RouterError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Wire codec error: {0}")]
    Codec(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
