// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Channel Write Supervisor
//!
//! Wraps every outward write with a completion listener. The caller never
//! waits: the write completion is awaited on a spawned task.
//!
//! On failure:
//! - non-terminal `Message` → handed to the [`WriteFailureSink`], which
//!   synthesises a local `ERROR` completion if the exchange is still live;
//! - terminal `Message` or `Exception` → logged only, the peer cannot be told.
//!
//! There is no reconnection and no retry of the write itself.
//!
//! The supervisor counts the completions it is still observing, so a closing
//! domain can wait until every failed write has been reported before it
//! drops its correlation table.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::domain::channel::{EnvelopeChannel, TransportError};
use crate::domain::envelope::{TransportedEnvelope, TransportedMessage};

/// Receives failed non-terminal writes.
pub trait WriteFailureSink: Send + Sync + 'static {
    fn non_terminal_write_failed(&self, message: TransportedMessage, error: TransportError);
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count once the observer task is done with its
/// completion, including the failure report.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct ChannelWriteSupervisor {
    channel: Arc<dyn EnvelopeChannel>,
    in_flight: Arc<InFlight>,
}

impl ChannelWriteSupervisor {
    pub fn new(channel: Arc<dyn EnvelopeChannel>) -> Self {
        Self {
            channel,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Resolves once no write completion is being observed.
    pub async fn idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Queue `envelope` and observe its completion in the background.
    pub fn send(&self, envelope: TransportedEnvelope, sink: Arc<dyn WriteFailureSink>) {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(self.in_flight.clone());
        let completion = self.channel.write(envelope.clone());

        tokio::spawn(async move {
            let _guard = guard;
            let error = match completion.await {
                Ok(()) => {
                    debug!(exchange_id = %envelope.exchange_id(), "Envelope written");
                    return;
                }
                Err(error) => error,
            };

            metrics::counter!("aegis_bridge_write_failures_total").increment(1);

            match envelope {
                TransportedEnvelope::Message(message) if !message.terminal => {
                    warn!(
                        exchange_id = %message.exchange_id,
                        step = message.step,
                        error = %error,
                        "Write of non-terminal envelope failed"
                    );
                    sink.non_terminal_write_failed(message, error);
                }
                TransportedEnvelope::Message(message) => {
                    warn!(
                        exchange_id = %message.exchange_id,
                        step = message.step,
                        error = %error,
                        "Write of terminal envelope failed; the peer cannot be informed"
                    );
                }
                TransportedEnvelope::Exception(exception) => {
                    warn!(
                        exchange_id = %exception.exchange_id,
                        error = %error,
                        "Write of exception failed; the peer cannot be informed"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel::WriteCompletion;
    use crate::domain::envelope::TransportedException;
    use crate::domain::exchange::{ExchangePattern, ExchangeRole, MessageExchange};
    use crate::domain::service_key::ServiceKey;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct FailingChannel;

    impl EnvelopeChannel for FailingChannel {
        fn write(&self, _envelope: TransportedEnvelope) -> WriteCompletion {
            futures::future::ready(Err(TransportError::Closed)).boxed()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        failed: Mutex<Vec<TransportedMessage>>,
    }

    impl WriteFailureSink for RecordingSink {
        fn non_terminal_write_failed(&self, message: TransportedMessage, _error: TransportError) {
            self.failed.lock().push(message);
        }
    }

    fn initial() -> TransportedMessage {
        TransportedMessage::initial(&MessageExchange::new(
            ServiceKey::new("Hello", "Greet"),
            ExchangePattern::InOut,
            ExchangeRole::Consumer,
        ))
    }

    #[tokio::test]
    async fn test_only_non_terminal_failures_reach_the_sink() {
        let supervisor = ChannelWriteSupervisor::new(Arc::new(FailingChannel));
        let sink = Arc::new(RecordingSink::default());

        let first = initial();
        let mut terminal = first.clone();
        terminal.terminal = true;

        supervisor.send(first.clone().into(), sink.clone());
        supervisor.send(terminal.into(), sink.clone());
        supervisor.send(TransportedException::reply_to(&first, "boom").into(), sink.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;

        let failed = sink.failed.lock();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].exchange_id, first.exchange_id);
    }

    struct GatedChannel {
        gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    }

    impl EnvelopeChannel for GatedChannel {
        fn write(&self, _envelope: TransportedEnvelope) -> WriteCompletion {
            let gate = self.gate.lock().take();
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Err(TransportError::Closed)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_idle_waits_for_failure_report() {
        let (open, gate) = tokio::sync::oneshot::channel();
        let supervisor = ChannelWriteSupervisor::new(Arc::new(GatedChannel {
            gate: Mutex::new(Some(gate)),
        }));
        let sink = Arc::new(RecordingSink::default());

        supervisor.send(initial().into(), sink.clone());
        assert_eq!(supervisor.in_flight(), 1);
        assert!(tokio::time::timeout(Duration::from_millis(20), supervisor.idle()).await.is_err());

        open.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), supervisor.idle()).await.unwrap();
        assert_eq!(supervisor.in_flight(), 0);
        assert_eq!(sink.failed.lock().len(), 1);
    }
}
