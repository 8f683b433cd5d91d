// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Connection Binding
//!
//! Couples an [`AdmittedChannel`] with a fresh [`BridgeDomain`]:
//!
//! - a reader task decodes frames and queues envelopes on the domain,
//! - a writer task owns the sink and reports each frame's outcome,
//! - the domain's inbound loop processes envelopes one at a time.
//!
//! All three share a connection token. Whichever stops first (peer EOF,
//! write error, protocol violation, runtime shutdown) cancels it, and the
//! domain closes.

use std::sync::Arc;

use futures::future::FutureExt;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::application::bridge_domain::{BridgeDomain, DomainSide};
use crate::domain::channel::{EnvelopeChannel, TransportError, WriteCompletion};
use crate::domain::envelope::TransportedEnvelope;
use crate::domain::router::LocalRouter;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::handshake::AdmittedChannel;
use crate::infrastructure::wire::{WireError, WireMessage};

struct WriteRequest {
    message: WireMessage,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// Queueing front of a connection's writer task.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl ChannelWriter {
    pub fn write_wire(&self, message: WireMessage) -> WriteCompletion {
        let (done, completion) = oneshot::channel();
        if self.tx.send(WriteRequest { message, done }).is_err() {
            return futures::future::ready(Err(TransportError::Closed)).boxed();
        }
        async move { completion.await.unwrap_or(Err(TransportError::Closed)) }.boxed()
    }
}

impl EnvelopeChannel for ChannelWriter {
    fn write(&self, envelope: TransportedEnvelope) -> WriteCompletion {
        self.write_wire(WireMessage::Envelope(envelope))
    }
}

/// A live connection and its domain.
pub struct BoundConnection {
    pub domain: Arc<BridgeDomain>,
    pub writer: ChannelWriter,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BoundConnection {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the reader, writer and inbound loop have all stopped.
    pub async fn closed(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection task ended abnormally");
            }
        }
    }
}

/// Hand an admitted channel to a new domain and start its tasks.
pub fn bind<S>(
    admitted: AdmittedChannel<S>,
    side: DomainSide,
    router: Arc<dyn LocalRouter>,
    event_bus: EventBus,
    parent: &CancellationToken,
) -> BoundConnection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let shutdown = parent.child_token();
    let (sink, stream) = admitted.framed.split::<WireMessage>();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = ChannelWriter { tx };

    let (domain, queue) = BridgeDomain::new(admitted.auth_name, side, router, Arc::new(writer.clone()), event_bus);
    let span = tracing::info_span!("bridge_connection", domain_id = %domain.id(), peer = %domain.peer());

    let tasks = vec![
        tokio::spawn(write_loop(sink, rx, shutdown.clone()).instrument(span.clone())),
        tokio::spawn(read_loop(stream, domain.clone(), shutdown.clone()).instrument(span.clone())),
        tokio::spawn(domain.clone().run(queue, shutdown.clone()).instrument(span)),
    ];

    BoundConnection {
        domain,
        writer,
        shutdown,
        tasks,
    }
}

async fn write_loop<W>(mut sink: W, mut rx: mpsc::UnboundedReceiver<WriteRequest>, shutdown: CancellationToken)
where
    W: Sink<WireMessage, Error = WireError> + Unpin,
{
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let WriteRequest { message, done } = request;
        let sent = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = done.send(Err(TransportError::Closed));
                break;
            }
            sent = sink.send(message) => sent,
        };

        match sent {
            Ok(()) => {
                let _ = done.send(Ok(()));
            }
            Err(WireError::Json(e)) => {
                // Nothing reached the socket; the connection is still usable.
                let _ = done.send(Err(TransportError::Encode(e.to_string())));
            }
            Err(WireError::Io(e)) => {
                warn!(error = %e, "Write failed; closing connection");
                let _ = done.send(Err(TransportError::from(e)));
                break;
            }
        }
    }

    shutdown.cancel();
    rx.close();
    while let Ok(pending) = rx.try_recv() {
        let _ = pending.done.send(Err(TransportError::Closed));
    }
    let _ = sink.close().await;
    debug!("Writer stopped");
}

async fn read_loop<R>(mut stream: R, domain: Arc<BridgeDomain>, shutdown: CancellationToken)
where
    R: Stream<Item = Result<WireMessage, WireError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WireMessage::Envelope(envelope))) => {
                if !domain.enqueue(envelope) {
                    break;
                }
            }
            Some(Ok(WireMessage::Propagation { services })) => domain.record_remote_catalogue(services),
            Some(Ok(other)) => {
                warn!(message_type = other.type_name(), "Handshake message after admission; closing connection");
                break;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Unreadable frame; closing connection");
                break;
            }
            None => {
                info!("Peer closed the connection");
                break;
            }
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::TransportedMessage;
    use crate::domain::exchange::{ExchangePattern, ExchangeRole, ExchangeStatus, FailureKind, MessageExchange};
    use crate::domain::handshake::SslType;
    use crate::domain::router::{CompletionListener, DeliveryOutcome, RelayedExchange, RemoteGateway, RouterError};
    use crate::domain::service_key::{LocalTarget, RoutingTable, ServiceKey};
    use crate::infrastructure::wire::WireCodec;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio_util::codec::Framed;
    use tokio_util::either::Either;

    #[derive(Default)]
    struct NullRouter {
        delivered: Mutex<Vec<RelayedExchange>>,
    }

    #[async_trait]
    impl LocalRouter for NullRouter {
        fn create_exchange(&self, service_key: &ServiceKey, pattern: ExchangePattern) -> MessageExchange {
            MessageExchange::new(service_key.clone(), pattern, ExchangeRole::Provider)
        }

        async fn deliver(
            &self,
            relayed: RelayedExchange,
            _listener: Arc<dyn CompletionListener>,
        ) -> Result<DeliveryOutcome, RouterError> {
            self.delivered.lock().push(relayed);
            Ok(DeliveryOutcome::Pending)
        }

        fn attach_remote(&self, _services: &[ServiceKey], _gateway: Arc<dyn RemoteGateway>) {}
    }

    fn admitted(io: tokio::io::DuplexStream) -> AdmittedChannel<tokio::io::DuplexStream> {
        AdmittedChannel {
            framed: Framed::new(Either::Left(io), WireCodec::default()),
            auth_name: "acme".into(),
            ssl_type: SslType::None,
        }
    }

    fn consumer_side() -> DomainSide {
        let mut routes = RoutingTable::new();
        routes.insert(ServiceKey::new("Hello", "Greet"), LocalTarget("hello".into()));
        DomainSide::consumer(routes, true)
    }

    #[tokio::test]
    async fn test_inbound_envelope_reaches_router() {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let router = Arc::new(NullRouter::default());
        let bound = bind(admitted(local), consumer_side(), router.clone(), EventBus::new(8), &CancellationToken::new());

        let mut peer = Framed::new(remote, WireCodec::default());
        let exchange = MessageExchange::new(ServiceKey::new("Hello", "Greet"), ExchangePattern::InOut, ExchangeRole::Consumer);
        peer.send(WireMessage::Envelope(TransportedMessage::initial(&exchange).into()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.delivered.lock().len(), 1);

        bound.shutdown();
        bound.closed().await;
    }

    #[tokio::test]
    async fn test_peer_eof_closes_domain() {
        let (local, remote) = tokio::io::duplex(1024);
        let bound = bind(
            admitted(local),
            consumer_side(),
            Arc::new(NullRouter::default()),
            EventBus::new(8),
            &CancellationToken::new(),
        );
        let domain = bound.domain.clone();

        drop(remote);
        tokio::time::timeout(Duration::from_secs(2), bound.closed()).await.unwrap();
        assert!(domain.is_closed());
    }

    #[tokio::test]
    async fn test_handshake_message_after_admission_closes_connection() {
        let (local, remote) = tokio::io::duplex(1024);
        let bound = bind(
            admitted(local),
            consumer_side(),
            Arc::new(NullRouter::default()),
            EventBus::new(8),
            &CancellationToken::new(),
        );
        let domain = bound.domain.clone();

        let mut peer = Framed::new(remote, WireCodec::default());
        peer.send(WireMessage::AuthAccept).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), bound.closed()).await.unwrap();
        assert!(domain.is_closed());
    }

    /// Never yields a byte and refuses every write.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe")))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_io_write_failure_always_completes_exchange_with_error() {
        for _ in 0..40 {
            let router = Arc::new(NullRouter::default());
            let admitted = AdmittedChannel {
                framed: Framed::new(Either::Left(BrokenPipe), WireCodec::default()),
                auth_name: "partner".into(),
                ssl_type: SslType::None,
            };
            let bound = bind(
                admitted,
                DomainSide::provider(),
                router.clone(),
                EventBus::new(8),
                &CancellationToken::new(),
            );
            let domain = bound.domain.clone();

            let exchange = MessageExchange::new(ServiceKey::new("Hello", "Greet"), ExchangePattern::InOut, ExchangeRole::Consumer);
            let id = domain.forward_exchange(exchange).unwrap();

            tokio::time::timeout(Duration::from_secs(2), bound.closed()).await.unwrap();
            assert!(domain.is_closed());

            let delivered = router.delivered.lock();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].origin.exchange_id, id);
            assert_eq!(delivered[0].exchange.status, ExchangeStatus::Error);
            assert_eq!(
                delivered[0].exchange.failure.as_ref().map(|f| f.kind),
                Some(FailureKind::Transport)
            );
        }
    }

    #[tokio::test]
    async fn test_writes_after_close_fail() {
        let (local, _remote) = tokio::io::duplex(1024);
        let bound = bind(
            admitted(local),
            consumer_side(),
            Arc::new(NullRouter::default()),
            EventBus::new(8),
            &CancellationToken::new(),
        );
        let writer = bound.writer.clone();
        bound.shutdown();
        bound.closed().await;

        let result = writer.write_wire(WireMessage::Propagation { services: vec![] }).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
