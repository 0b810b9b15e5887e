//! Server-side session for one client connection
//!
//! A session owns one byte stream and moves through
//! CONNECTING → HANDSHAKING → ACTIVE → CLOSED. Two tasks serve it:
//!
//! - the reader (this task): decodes frames, answers heartbeats, binds the
//!   identity and hands everything else to the dispatcher
//! - the writer: owns the write half. It writes control envelopes from the
//!   connection's queue and, once the identity is bound, pulls the recipient's
//!   sink one message at a time, only after the previous write finished
//!
//! Teardown releases the registry entry and the sink subscription. A message
//! the writer had taken but not finished writing goes back to the head of the
//! sink. The sink itself stays, so messages published while the client is
//! away are replayed when it comes back.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::dispatcher::{DispatchOutcome, Dispatcher, HandlerContext};
use super::node::NodeServices;
use super::sink_registry::SinkSubscription;
use crate::error::{ChatError, Result};
use crate::protocol::codec::EnvelopeCodec;
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::protocol::messages::{Envelope, Heartbeat, Payload, RecipientKey};
use crate::transport::connection::{ConnectionHandle, ConnectionStatus};
use crate::transport::heartbeat::{ActivityClock, HeartbeatConfig, IdleEvent, IdleMonitor};

/// How long a closing writer may spend flushing
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Per-connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub heartbeat: HeartbeatConfig,
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Serves client connections against shared node services
#[derive(Clone)]
pub struct Session {
    services: NodeServices,
    dispatcher: Dispatcher,
    config: Arc<SessionConfig>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(services: NodeServices, dispatcher: Dispatcher, config: SessionConfig) -> Self {
        Self {
            services,
            dispatcher,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop every session sharing this token when it is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Serve one connection until it closes
    pub async fn run<IO>(&self, io: IO, remote: impl Into<String>) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (handle, control) = ConnectionHandle::channel(remote);
        let handle = Arc::new(handle);
        let clock = Arc::new(ActivityClock::new());
        let (attach, attached) = mpsc::channel(1);

        debug!(conn_id = handle.id(), remote = handle.remote(), "New connection");

        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, EnvelopeCodec::new(self.config.max_frame_size)),
            control,
            attached,
            handle.clone(),
            clock.clone(),
        ));

        let mut frames = FramedRead::new(read_half, EnvelopeCodec::new(self.config.max_frame_size));
        let mut monitor = IdleMonitor::new(&self.config.heartbeat, clock.clone());
        let mut missed_pings = 0u32;
        let close = handle.close_token();

        handle.set_status(ConnectionStatus::Handshaking);

        let result = loop {
            tokio::select! {
                _ = close.cancelled() => break Ok(()),
                _ = self.shutdown.cancelled() => break Ok(()),
                event = monitor.next_event() => match event {
                    IdleEvent::ReaderIdle => {
                        if let Some(max) = self.config.heartbeat.max_missed_pings {
                            if missed_pings >= max {
                                break Err(ChatError::timeout(format!(
                                    "No answer to {} pings",
                                    missed_pings
                                )));
                            }
                        }
                        missed_pings += 1;
                        trace!(conn_id = handle.id(), missed_pings, "Reader idle, sending ping");
                        if handle.send(Envelope::ping()).is_err() {
                            if handle.is_closed() {
                                break Ok(());
                            }
                            trace!(conn_id = handle.id(), "Control queue full, ping skipped");
                        }
                    }
                    IdleEvent::WriterIdle | IdleEvent::AllIdle => {
                        debug!(conn_id = handle.id(), ?event, "Connection idle");
                    }
                },
                frame = frames.next() => match frame {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(e),
                    Some(Ok(envelope)) => {
                        clock.record_read();
                        missed_pings = 0;
                        if let Err(e) = self.on_envelope(&handle, envelope, &attach).await {
                            break Err(e);
                        }
                    }
                },
            }
        };

        self.teardown(&handle, writer).await;

        match &result {
            Ok(()) => info!(conn_id = handle.id(), identity = ?handle.identity(), "Connection closed"),
            Err(e) => warn!(
                conn_id = handle.id(),
                identity = ?handle.identity(),
                "Connection closed with error: {}",
                e
            ),
        }
        result
    }

    async fn on_envelope(
        &self,
        handle: &Arc<ConnectionHandle>,
        envelope: Envelope,
        attach: &mpsc::Sender<SinkSubscription>,
    ) -> Result<()> {
        match envelope.payload {
            Some(Payload::Heartbeat(Heartbeat { ping: true, timestamp })) => {
                let pong = Envelope {
                    payload: Some(Payload::Heartbeat(Heartbeat {
                        ping: false,
                        timestamp,
                    })),
                };
                if handle.send(pong).is_err() {
                    trace!(conn_id = handle.id(), "Pong dropped, connection closing or control queue full");
                }
            }
            Some(Payload::Heartbeat(_)) => {
                trace!(conn_id = handle.id(), "Pong received");
            }
            Some(Payload::Identity(identity)) => {
                self.bind(handle, identity.recipient_key()?, attach)?;
            }
            _ if handle.identity().is_none() => {
                warn!(
                    conn_id = handle.id(),
                    "Dropping {} envelope received before identity",
                    envelope.case().map_or("unknown".to_string(), |case| case.to_string())
                );
            }
            _ => {
                let ctx = HandlerContext::new(self.services.clone(), handle.clone());
                if let DispatchOutcome::Unhandled = self.dispatcher.dispatch(ctx, envelope).await {
                    trace!(conn_id = handle.id(), "Envelope not handled");
                }
            }
        }
        Ok(())
    }

    fn bind(
        &self,
        handle: &Arc<ConnectionHandle>,
        key: RecipientKey,
        attach: &mpsc::Sender<SinkSubscription>,
    ) -> Result<()> {
        match handle.identity() {
            Some(bound) if *bound == key => {
                debug!(conn_id = handle.id(), identity = %key, "Identity re-asserted");
                return Ok(());
            }
            Some(bound) => {
                return Err(ChatError::protocol(format!(
                    "Connection bound to {} asserted identity {}",
                    bound, key
                )));
            }
            None => {}
        }

        if handle.bind_identity(key.clone()).is_err() {
            return Err(ChatError::internal("Identity bound concurrently"));
        }

        if let Some(previous) = self.services.connections.register(key.clone(), handle.clone()) {
            info!(
                identity = %key,
                old_conn = previous.id(),
                new_conn = handle.id(),
                "Replacing existing connection"
            );
            previous.close();
        }
        handle.set_status(ConnectionStatus::Active);

        let sink = self.services.sinks.register_sink_flow(&key);
        if attach.try_send(sink.subscribe()).is_err() {
            return Err(ChatError::internal("Writer stopped before the sink was attached"));
        }

        self.services.locator.announce(&key, &self.services.node_id);

        info!(
            conn_id = handle.id(),
            identity = %key,
            buffered = sink.len(),
            "Identity bound"
        );
        Ok(())
    }

    async fn teardown(&self, handle: &Arc<ConnectionHandle>, writer: JoinHandle<()>) {
        handle.set_status(ConnectionStatus::Closing);

        // The writer hands an unfinished message back to the sink before it exits
        handle.close();
        let _ = writer.await;

        if let Some(key) = handle.identity() {
            let services = &self.services;
            if services.connections.remove_if_current(key, handle.id()) {
                services.locator.withdraw(key, &services.node_id);
            }
        }

        handle.set_status(ConnectionStatus::Closed);
    }
}

/// Next message of the attached sink; never resolves while nothing is attached
async fn next_queued(subscription: &mut Option<SinkSubscription>) -> Option<Envelope> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_loop<W>(
    mut frames: FramedWrite<WriteHalf<W>, EnvelopeCodec>,
    mut control: mpsc::Receiver<Envelope>,
    mut attached: mpsc::Receiver<SinkSubscription>,
    handle: Arc<ConnectionHandle>,
    clock: Arc<ActivityClock>,
) where
    W: AsyncWrite + Send + 'static,
{
    let close = handle.close_token();
    let mut subscription: Option<SinkSubscription> = None;

    loop {
        let (envelope, from_sink) = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            Some(next) = attached.recv(), if subscription.is_none() => {
                subscription = Some(next);
                continue;
            }
            envelope = control.recv() => match envelope {
                Some(envelope) => (envelope, false),
                None => break,
            },
            envelope = next_queued(&mut subscription) => match envelope {
                Some(envelope) => (envelope, true),
                None => {
                    // Superseded by a newer connection, or the sink was disposed
                    trace!(conn_id = handle.id(), "Sink subscription ended");
                    subscription = None;
                    continue;
                }
            },
        };

        let unwritten = from_sink.then(|| envelope.clone());
        let written = tokio::select! {
            result = frames.send(envelope) => result,
            _ = close.cancelled() => Err(ChatError::transport("Connection closed during write")),
        };

        match written {
            Ok(()) => clock.record_write(),
            Err(e) => {
                if let (Some(envelope), Some(subscription)) = (unwritten, &subscription) {
                    subscription.requeue(envelope);
                }
                if !close.is_cancelled() {
                    warn!(conn_id = handle.id(), "Write failed: {}", e);
                    handle.close();
                }
                // No flush: a half-written frame was handed back to the sink
                return;
            }
        }
    }

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, frames.close()).await;
}
