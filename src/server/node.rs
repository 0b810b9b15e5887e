//! Chat node: shared services plus the accept loops feeding sessions
//!
//! A node owns exactly one connection registry, one sink registry and one
//! handler table. Sessions, handlers and the relay consumer all receive them
//! through [`NodeServices`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use quinn::Endpoint;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection_registry::ConnectionRegistry;
use super::dispatcher::{Dispatcher, HandlerTable};
use super::handlers::default_handler_table;
use super::session::Session;
use super::sink_registry::{SinkConfig, SinkRegistry};
use crate::config::{NodeConfig, TransportKind};
use crate::error::{ChatError, Result};
use crate::protocol::messages::NodeId;
use crate::relay::{NodeLocator, RelayBackend, RelayConsumer, RelayPublisher, SharedDirectory, StreamStore};
use crate::transport::quic::{self, QuicBiStream};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a session or handler may touch on this node
#[derive(Clone)]
pub struct NodeServices {
    pub node_id: NodeId,
    pub connections: Arc<ConnectionRegistry>,
    pub sinks: Arc<SinkRegistry>,
    pub locator: Arc<dyn NodeLocator>,
    /// Present when the node can hand messages to other nodes
    pub relay: Option<RelayPublisher>,
}

impl fmt::Debug for NodeServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeServices")
            .field("node_id", &self.node_id)
            .field("connections", &self.connections.len())
            .field("sinks", &self.sinks.len())
            .field("relay", &self.relay.is_some())
            .finish()
    }
}

impl NodeServices {
    pub fn new(node_id: impl Into<NodeId>, sinks: SinkConfig, locator: Arc<dyn NodeLocator>) -> Self {
        Self {
            node_id: node_id.into(),
            connections: Arc::new(ConnectionRegistry::new()),
            sinks: Arc::new(SinkRegistry::new(sinks)),
            locator,
            relay: None,
        }
    }

    /// A node with default sinks, a private directory and no relay
    pub fn standalone(node_id: impl Into<NodeId>) -> Self {
        Self::new(node_id, SinkConfig::default(), Arc::new(SharedDirectory::new()))
    }
}

/// Releases a connection slot when dropped
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One routing node
pub struct ChatNode {
    config: NodeConfig,
    services: NodeServices,
    dispatcher: Dispatcher,
    relay_store: Option<Arc<dyn StreamStore>>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl ChatNode {
    /// Create a node with the built-in routing handlers
    pub fn new(config: NodeConfig) -> Self {
        let services = NodeServices::new(
            config.node_id.clone(),
            config.sinks.clone(),
            Arc::new(SharedDirectory::new()),
        );
        let dispatcher = Dispatcher::new(default_handler_table(), &config.dispatcher);

        Self {
            config,
            services,
            dispatcher,
            relay_store: None,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Share a locator with other nodes
    pub fn with_locator(mut self, locator: Arc<dyn NodeLocator>) -> Self {
        self.services.locator = locator;
        self
    }

    /// Enable relaying through `store`, both outbound and for this node's stream
    pub fn with_relay_store(mut self, store: Arc<dyn StreamStore>) -> Self {
        self.services.relay = Some(RelayPublisher::new(store.clone()));
        self.relay_store = Some(store);
        self
    }

    /// Relay through a backend shared with the other nodes of the cluster
    pub fn with_relay(self, backend: &RelayBackend) -> Self {
        self.with_locator(backend.locator.clone())
            .with_relay_store(backend.store.clone())
    }

    /// Whether this node can hand messages to other nodes
    pub fn relay_enabled(&self) -> bool {
        self.relay_store.is_some()
    }

    /// Replace the handler table
    pub fn with_handlers(mut self, table: HandlerTable) -> Self {
        self.dispatcher = Dispatcher::new(table, &self.config.dispatcher);
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.services.node_id
    }

    pub fn services(&self) -> &NodeServices {
        &self.services
    }

    /// Connections currently holding a slot
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Cancels every accept loop, session and background task of this node
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        info!(node_id = %self.services.node_id, "Shutting down node");
        self.shutdown.cancel();
    }

    fn session(&self) -> Session {
        Session::new(self.services.clone(), self.dispatcher.clone(), self.config.session())
            .with_shutdown(self.shutdown.clone())
    }

    fn try_admit(&self) -> Option<ConnectionSlot> {
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        if previous >= self.config.max_connections {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(ConnectionSlot {
            active: self.active.clone(),
        })
    }

    /// Start the sink eviction sweep and, with a relay store, the relay consumer
    pub async fn start_background(&self) -> Result<()> {
        if self.services.sinks.spawn_eviction(self.shutdown.clone()).is_some() {
            debug!(node_id = %self.services.node_id, "Sink eviction sweep started");
        }

        if let Some(store) = &self.relay_store {
            let consumer = RelayConsumer::new(
                self.services.node_id.clone(),
                store.clone(),
                self.services.sinks.clone(),
                self.config.relay.clone(),
            );
            consumer.init().await?;
            info!(node_id = %self.services.node_id, stream = consumer.stream(), "Relay consumer started");
            consumer.spawn(self.shutdown.clone());
        }
        Ok(())
    }

    /// Serve a single already-connected byte stream
    pub async fn serve_stream<IO>(&self, io: IO, remote: impl Into<String>) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.session().run(io, remote).await
    }

    /// Accept TCP connections until shutdown
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<()> {
        info!(
            node_id = %self.services.node_id,
            "Node listening on {} (tcp)",
            listener.local_addr()?
        );

        loop {
            let (stream, remote) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let Some(slot) = self.try_admit() else {
                warn!(remote = %remote, "Connection limit reached, rejecting connection");
                drop(stream);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(remote = %remote, "Failed to set TCP_NODELAY: {}", e);
            }

            let session = self.session();
            tokio::spawn(async move {
                let _slot = slot;
                let _ = session.run(stream, remote.to_string()).await;
            });
        }

        info!(node_id = %self.services.node_id, "TCP accept loop stopped");
        Ok(())
    }

    /// Accept QUIC connections until shutdown, one bidirectional stream each
    pub async fn serve_quic(&self, endpoint: Endpoint) -> Result<()> {
        info!(
            node_id = %self.services.node_id,
            "Node listening on {} (quic)",
            endpoint.local_addr()?
        );

        loop {
            let incoming = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => {
                        warn!("Endpoint stopped accepting connections");
                        break;
                    }
                },
            };

            let Some(slot) = self.try_admit() else {
                warn!(
                    remote = %incoming.remote_address(),
                    "Connection limit reached, rejecting connection"
                );
                incoming.refuse();
                continue;
            };

            let session = self.session();
            tokio::spawn(async move {
                let _slot = slot;
                let connection = match incoming.await {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!("QUIC handshake failed: {}", e);
                        return;
                    }
                };
                let remote = connection.remote_address();
                match QuicBiStream::accept(connection.clone()).await {
                    Ok(stream) => {
                        let _ = session.run(stream, remote.to_string()).await;
                    }
                    Err(e) => warn!(remote = %remote, "No stream opened: {}", e),
                }
                connection.close(quinn::VarInt::from_u32(0), b"closed");
            });
        }

        endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        info!(node_id = %self.services.node_id, "QUIC accept loop stopped");
        Ok(())
    }

    /// Bind the configured transport and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        self.start_background().await?;

        match self.config.transport {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(self.config.bind_addr).await?;
                self.serve_tcp(listener).await
            }
            TransportKind::Quic => {
                let endpoint = quic::server_endpoint(self.config.bind_addr)?;
                self.serve_quic(endpoint).await
            }
        }
    }
}

/// Build `count` nodes from `base` that relay to each other in-process.
///
/// Node ids get a `-{index}` suffix and ports count up from the base port; a
/// base port of 0 lets every node pick its own.
pub fn local_cluster(base: &NodeConfig, count: usize) -> Result<Vec<ChatNode>> {
    let backend = RelayBackend::in_process();
    (0..count.max(1))
        .map(|index| {
            let mut config = base.clone();
            config.node_id = format!("{}-{}", base.node_id, index);
            if base.bind_addr.port() != 0 {
                let port = u16::try_from(index)
                    .ok()
                    .and_then(|offset| base.bind_addr.port().checked_add(offset))
                    .ok_or_else(|| ChatError::config(format!("No port left for node {}", index)))?;
                config.bind_addr.set_port(port);
            }
            Ok(ChatNode::new(config).with_relay(&backend))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::EnvelopeCodec;
    use crate::protocol::messages::{ChatMessage, Envelope, Payload, RecipientKey};
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    fn test_config(max_connections: usize) -> NodeConfig {
        NodeConfig {
            node_id: "node-test".to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections,
            ..NodeConfig::default()
        }
    }

    async fn spawn_tcp(node: Arc<ChatNode>) -> (std::net::SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move { node.serve_tcp(listener).await });
        (addr, task)
    }

    #[test]
    fn test_local_cluster_assigns_ids_and_ports() {
        let base = NodeConfig {
            node_id: "mesh".to_string(),
            bind_addr: "127.0.0.1:7000".parse().unwrap(),
            ..NodeConfig::default()
        };
        let nodes = local_cluster(&base, 3).unwrap();

        let ids: Vec<_> = nodes.iter().map(|node| node.node_id().to_string()).collect();
        assert_eq!(ids, vec!["mesh-0", "mesh-1", "mesh-2"]);
        let ports: Vec<_> = nodes.iter().map(|node| node.config().bind_addr.port()).collect();
        assert_eq!(ports, vec![7000, 7001, 7002]);
        assert!(nodes.iter().all(|node| node.relay_enabled()));
        assert!(!ChatNode::new(base.clone()).relay_enabled());

        let top = NodeConfig {
            bind_addr: "127.0.0.1:65535".parse().unwrap(),
            ..base
        };
        assert!(matches!(local_cluster(&top, 2), Err(ChatError::Config(_))));
    }

    #[tokio::test]
    async fn test_local_cluster_relays_between_nodes() {
        let base = NodeConfig {
            node_id: "mesh".to_string(),
            heartbeat: crate::transport::HeartbeatConfig::disabled(),
            relay: crate::relay::RelayConfig {
                read_block: Duration::from_millis(20),
                ..crate::relay::RelayConfig::default()
            },
            ..test_config(10)
        };
        let nodes: Vec<Arc<ChatNode>> = local_cluster(&base, 2).unwrap().into_iter().map(Arc::new).collect();
        for node in &nodes {
            node.start_background().await.unwrap();
        }

        let attach = |node: &Arc<ChatNode>| {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let node = node.clone();
            tokio::spawn(async move { node.serve_stream(server, "duplex").await });
            Framed::new(client, EnvelopeCodec::default())
        };

        let bob_key = RecipientKey::mobile("bob");
        let mut bob = attach(&nodes[1]);
        bob.send(Envelope::identity(&bob_key)).await.unwrap();
        bob.send(Envelope::ping()).await.unwrap();
        bob.next().await.unwrap().unwrap();

        let mut alice = attach(&nodes[0]);
        alice.send(Envelope::identity(&RecipientKey::desktop("alice"))).await.unwrap();
        alice
            .send(Envelope::chat(ChatMessage::new("alice", "bob", "next door")))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), bob.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match received.payload {
            Some(Payload::Chat(chat)) => assert_eq!(chat.body, "next door"),
            other => panic!("Expected chat payload, got {:?}", other),
        }

        for node in &nodes {
            node.shutdown();
        }
    }

    #[test]
    fn test_standalone_services() {
        let services = NodeServices::standalone("node-a");
        assert_eq!(services.node_id, "node-a");
        assert!(services.connections.is_empty());
        assert!(services.sinks.is_empty());
        assert!(services.relay.is_none());
    }

    #[tokio::test]
    async fn test_connection_limit_closes_excess_tcp() {
        let node = Arc::new(ChatNode::new(test_config(1)));
        let (addr, _task) = spawn_tcp(node.clone()).await;

        let mut first = Framed::new(TcpStream::connect(addr).await.unwrap(), EnvelopeCodec::default());
        first.send(Envelope::identity(&RecipientKey::desktop("alice"))).await.unwrap();
        first.send(Envelope::ping()).await.unwrap();
        first.next().await.unwrap().unwrap();
        assert_eq!(node.active_connections(), 1);

        let mut second = Framed::new(TcpStream::connect(addr).await.unwrap(), EnvelopeCodec::default());
        let _ = second.send(Envelope::ping()).await;
        assert!(matches!(second.next().await, None | Some(Err(_))));
        assert_eq!(node.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop_and_sessions() {
        let node = Arc::new(ChatNode::new(test_config(10)));
        let (addr, task) = spawn_tcp(node.clone()).await;

        let mut client = Framed::new(TcpStream::connect(addr).await.unwrap(), EnvelopeCodec::default());
        client.send(Envelope::ping()).await.unwrap();
        client.next().await.unwrap().unwrap();

        node.shutdown();
        assert!(task.await.unwrap().is_ok());
        assert!(client.next().await.is_none());

        for _ in 0..100 {
            if node.active_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_quic_session_binds_identity() {
        let node = Arc::new(ChatNode::new(NodeConfig {
            transport: TransportKind::Quic,
            ..test_config(10)
        }));
        let endpoint = quic::server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = endpoint.local_addr().unwrap();
        let server = node.clone();
        tokio::spawn(async move { server.serve_quic(endpoint).await });

        let client = quic::client_endpoint().unwrap();
        let connection = client.connect(addr, quic::SERVER_NAME).unwrap().await.unwrap();
        let stream = QuicBiStream::open(connection).await.unwrap();
        let mut framed = Framed::new(stream, EnvelopeCodec::default());

        let key = RecipientKey::mobile("carol");
        framed.send(Envelope::identity(&key)).await.unwrap();
        framed.send(Envelope::ping()).await.unwrap();
        framed.next().await.unwrap().unwrap();

        assert!(node.services().connections.lookup(&key).is_some());
        node.shutdown();
    }
}
