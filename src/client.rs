//! Chat client with a reconnect supervisor
//!
//! The client speaks the same framed envelope protocol as the server over any
//! transport a [`Connector`] can open. It asserts its identity as the first
//! frame, answers server pings on its own and hands every other inbound
//! envelope to the application as a [`ClientEvent`].
//!
//! Supervisor states: DISCONNECTED → CONNECTING → ACTIVE, or FAILED once
//! [`ChatClient::reconnect`] has used up its attempts. FAILED is terminal for
//! implicit reconnects; only an explicit `connect` or `reconnect` leaves it.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use quinn::Endpoint;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ChatError, Result};
use crate::protocol::codec::EnvelopeCodec;
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::protocol::messages::{Envelope, Heartbeat, Payload, RecipientKey};
use crate::transport::quic::{self, QuicBiStream};

/// Opens the byte stream a client session runs over
pub trait Connector: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Send + 'static;

    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Self::Io>>;
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| ChatError::invalid_address(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| ChatError::invalid_address(format!("{} did not resolve", address)))
}

/// Plain TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for TcpConnector {
    type Io = TcpStream;

    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<TcpStream>> {
        async move {
            let addr = resolve(address).await?;
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| ChatError::timeout(format!("Connecting to {} timed out", addr)))??;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        .boxed()
    }
}

/// QUIC with one bidirectional stream per connection
pub struct QuicConnector {
    endpoint: Endpoint,
    connect_timeout: Duration,
}

impl fmt::Debug for QuicConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl QuicConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: quic::client_endpoint()?,
            connect_timeout,
        })
    }
}

impl Connector for QuicConnector {
    type Io = QuicBiStream;

    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<QuicBiStream>> {
        async move {
            let addr = resolve(address).await?;
            let connecting = self.endpoint.connect(addr, quic::SERVER_NAME)?;
            let connection = tokio::time::timeout(self.connect_timeout, connecting)
                .await
                .map_err(|_| ChatError::timeout(format!("Connecting to {} timed out", addr)))??;
            QuicBiStream::open(connection).await
        }
        .boxed()
    }
}

/// Retry schedule for [`ChatClient::reconnect`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Each delay is scaled by a random factor in `1 ± jitter`
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`
    pub address: String,
    /// Identity asserted on every connection
    pub identity: RecipientKey,
    pub reconnect: ReconnectPolicy,
    pub max_frame_size: usize,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, identity: RecipientKey) -> Self {
        Self {
            address: address.into(),
            identity,
            reconnect: ReconnectPolicy::default(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Active,
    /// Retries exhausted; no implicit reconnect happens from here
    Failed,
}

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connected and identity sent
    Connected,
    /// Transport closed or failed
    Disconnected(String),
    /// Inbound envelope other than a heartbeat
    Received(Envelope),
}

/// One live transport
struct Link {
    outbound: mpsc::UnboundedSender<Envelope>,
    closed: CancellationToken,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }
}

/// Chat client over the transport opened by `C`
pub struct ChatClient<C: Connector> {
    connector: C,
    config: ClientConfig,
    state: SupervisorState,
    link: Option<Link>,
    terminal: Option<ChatError>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl<C: Connector> ChatClient<C> {
    pub fn new(connector: C, config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            config,
            state: SupervisorState::Disconnected,
            link: None,
            terminal: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Inbound event stream; available once
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events_rx.take()
    }

    /// True while the transport is open and its reader has not hit EOF or an error
    pub fn is_alive(&self) -> bool {
        self.link.as_ref().is_some_and(Link::is_alive)
    }

    /// Connect to `address` once, without retrying
    pub async fn connect(&mut self, address: impl Into<String>) -> Result<()> {
        self.config.address = address.into();
        self.disconnect();
        self.terminal = None;
        self.state = SupervisorState::Connecting;

        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = SupervisorState::Disconnected;
                Err(e)
            }
        }
    }

    /// Reconnect with backoff unless already alive
    pub async fn reconnect(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        self.disconnect();
        self.terminal = None;
        self.state = SupervisorState::Connecting;

        let policy = self.config.reconnect.clone();
        let mut last_error = ChatError::internal("No connection attempt made");

        for attempt in 1..=policy.max_attempts {
            match self.open().await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "Reconnected to {}", self.config.address);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    warn!(attempt, "Connect failed permanently: {}", e);
                    return Err(self.fail(e));
                }
                Err(e) => {
                    warn!(attempt, max_attempts = policy.max_attempts, "Connect attempt failed: {}", e);
                    last_error = e;
                }
            }

            if attempt < policy.max_attempts {
                let delay = policy.delay_after(attempt);
                debug!(attempt, ?delay, "Backing off before next attempt");
                tokio::time::sleep(delay).await;
            }
        }

        Err(self.fail(ChatError::RetriesExhausted {
            attempts: policy.max_attempts,
            last: last_error.to_string(),
        }))
    }

    /// Make sure a transport is up before sending
    ///
    /// Reconnects implicitly, except from the FAILED state where the terminal
    /// error is returned again.
    pub async fn ensure_connection(&mut self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        if let Some(terminal) = &self.terminal {
            return Err(terminal.clone());
        }
        self.reconnect().await
    }

    /// Queue an envelope for sending, connecting first if needed
    pub async fn send(&mut self, envelope: Envelope) -> Result<()> {
        self.ensure_connection().await?;
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| ChatError::transport("Not connected"))?;
        link.outbound
            .send(envelope)
            .map_err(|_| ChatError::transport("Connection closed"))
    }

    /// Close the transport, if any
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.closed.cancel();
            info!("Disconnected from {}", self.config.address);
        }
        if self.state != SupervisorState::Failed {
            self.state = SupervisorState::Disconnected;
        }
    }

    fn fail(&mut self, error: ChatError) -> ChatError {
        self.state = SupervisorState::Failed;
        self.terminal = Some(error.clone());
        error
    }

    async fn open(&mut self) -> Result<()> {
        info!("Connecting to chat server at {}", self.config.address);
        let io = self.connector.connect(&self.config.address).await?;

        let (read_half, write_half) = tokio::io::split(io);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, EnvelopeCodec::new(self.config.max_frame_size)),
            outbound_rx,
            closed.clone(),
        ));
        tokio::spawn(read_loop(
            FramedRead::new(read_half, EnvelopeCodec::new(self.config.max_frame_size)),
            outbound.clone(),
            self.events_tx.clone(),
            closed.clone(),
        ));

        outbound
            .send(Envelope::identity(&self.config.identity))
            .map_err(|_| ChatError::transport("Connection closed during handshake"))?;

        self.link = Some(Link { outbound, closed });
        self.state = SupervisorState::Active;
        let _ = self.events_tx.send(ClientEvent::Connected);
        info!(identity = %self.config.identity, "Connected to {}", self.config.address);
        Ok(())
    }
}

impl<C: Connector> Drop for ChatClient<C> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.closed.cancel();
        }
    }
}

async fn write_loop<W>(
    mut frames: FramedWrite<W, EnvelopeCodec>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let envelope = tokio::select! {
            _ = closed.cancelled() => break,
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if let Err(e) = frames.send(envelope).await {
            warn!("Write failed: {}", e);
            closed.cancel();
            break;
        }
    }
    let _ = frames.close().await;
}

async fn read_loop<R>(
    mut frames: FramedRead<R, EnvelopeCodec>,
    outbound: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedSender<ClientEvent>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reason = loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => return,
            frame = frames.next() => frame,
        };
        match frame {
            None => break "Server closed the connection".to_string(),
            Some(Err(e)) => break e.to_string(),
            Some(Ok(envelope)) => match envelope.payload {
                Some(Payload::Heartbeat(Heartbeat { ping: true, timestamp })) => {
                    let pong = Envelope {
                        payload: Some(Payload::Heartbeat(Heartbeat {
                            ping: false,
                            timestamp,
                        })),
                    };
                    if outbound.send(pong).is_err() {
                        trace!("Pong dropped, writer already stopped");
                    }
                }
                Some(Payload::Heartbeat(_)) => trace!("Pong received"),
                _ => {
                    let _ = events.send(ClientEvent::Received(envelope));
                }
            },
        }
    };

    closed.cancel();
    warn!("Connection lost: {}", reason);
    let _ = events.send(ClientEvent::Disconnected(reason));
}
