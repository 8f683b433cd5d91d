// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Outward half of the transport collaborator.

use futures::future::BoxFuture;
use thiserror::Error;

use crate::domain::envelope::TransportedEnvelope;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Frame encoding failed: {0}")]
    Encode(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Resolves once the frame reached the socket, or failed to.
pub type WriteCompletion = BoxFuture<'static, Result<(), TransportError>>;

/// Non-blocking envelope sink bound to one connection.
///
/// `write` only queues the envelope; the returned completion is observed by
/// the write supervisor, never awaited on the caller's path.
pub trait EnvelopeChannel: Send + Sync {
    fn write(&self, envelope: TransportedEnvelope) -> WriteCompletion;
}
