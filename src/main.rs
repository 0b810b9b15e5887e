//! Chatmesh node and test client
//!
//! Usage:
//!   cargo run -- server                              # TCP node on 127.0.0.1:4433
//!   cargo run -- server --transport quic --port 5000
//!   cargo run -- server --nodes 3                    # three relaying nodes on 4433..4435
//!   cargo run -- client --addr 127.0.0.1:4433 --account alice --to bob --text hi

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chatmesh::client::{ChatClient, ClientConfig, ClientEvent, Connector, QuicConnector, TcpConnector};
use chatmesh::protocol::messages::{ChatMessage, Envelope, Payload, Platform, RecipientKey};
use chatmesh::{ChatNode, NodeConfig, TransportKind, local_cluster};
use futures::future::try_join_all;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => run_server(&args).await?,
        "client" => run_client(&args).await?,
        "help" | "--help" | "-h" => print_usage(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Chatmesh - chat message routing node");
    println!();
    println!("USAGE:");
    println!("    cargo run -- server [OPTIONS]");
    println!("    cargo run -- client --addr <HOST:PORT> --account <ID> [OPTIONS]");
    println!();
    println!("SERVER OPTIONS:");
    println!("    --port <PORT>           Port to listen on (default: 4433)");
    println!("    --transport <tcp|quic>  Transport to serve (default: tcp)");
    println!("    --node-id <ID>          Node identifier used for relaying");
    println!("    --config <FILE>         JSON config file applied before flags");
    println!("    --max-conn <NUM>        Maximum connections (default: 10000)");
    println!("    --nodes <NUM>           Run NUM nodes on consecutive ports that relay");
    println!("                            to each other in-process (default: 1, no relay)");
    println!();
    println!("CLIENT OPTIONS:");
    println!("    --addr <HOST:PORT>      Server address");
    println!("    --account <ID>          Account to assert");
    println!("    --platform <P>          desktop or mobile (default: desktop)");
    println!("    --transport <tcp|quic>  Transport to use (default: tcp)");
    println!("    --to <ID> --text <MSG>  Send one chat message after connecting");
    println!();
    println!("EXAMPLES:");
    println!("    cargo run -- server --port 5000");
    println!("    RUST_LOG=debug cargo run -- server --transport quic");
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_transport(args: &[String]) -> anyhow::Result<Option<TransportKind>> {
    match flag(args, "--transport") {
        Some(value) => TransportKind::parse(value)
            .map(Some)
            .with_context(|| format!("Unknown transport: {}", value)),
        None => Ok(None),
    }
}

async fn run_server(args: &[String]) -> anyhow::Result<()> {
    let mut config = match flag(args, "--config") {
        Some(path) => NodeConfig::from_json_file(path)?,
        None => NodeConfig::default(),
    };

    if let Some(port) = flag(args, "--port") {
        config.bind_addr.set_port(port.parse().context("Invalid --port")?);
    }
    if let Some(transport) = parse_transport(args)? {
        config.transport = transport;
    }
    if let Some(node_id) = flag(args, "--node-id") {
        config.node_id = node_id.to_string();
    }
    if let Some(max) = flag(args, "--max-conn") {
        config.max_connections = max.parse().context("Invalid --max-conn")?;
    }
    if let Some(nodes) = flag(args, "--nodes") {
        config.nodes = nodes.parse().context("Invalid --nodes")?;
    }

    info!("Configuration:");
    info!("  - Node id: {}", config.node_id);
    info!("  - Bind address: {} ({})", config.bind_addr, config.transport);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Handler workers: {}", config.dispatcher.workers);
    info!(
        "  - Sink capacity: {} ({:?} on overflow)",
        config.sinks.capacity, config.sinks.overflow
    );

    let nodes: Vec<Arc<ChatNode>> = if config.nodes > 1 {
        info!("  - Relay: {} in-process nodes", config.nodes);
        local_cluster(&config, config.nodes)?
            .into_iter()
            .map(Arc::new)
            .collect()
    } else {
        info!("  - Relay: disabled (single node without a shared relay backend)");
        vec![Arc::new(ChatNode::new(config))]
    };

    let signal_nodes = nodes.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for node in &signal_nodes {
                node.shutdown();
            }
        }
    });

    if let Err(e) = try_join_all(nodes.iter().map(|node| node.run())).await {
        error!("Server error: {}", e);
        for node in &nodes {
            node.shutdown();
        }
        return Err(e.into());
    }
    Ok(())
}

async fn run_client(args: &[String]) -> anyhow::Result<()> {
    let Some(addr) = flag(args, "--addr") else {
        bail!("--addr is required");
    };
    let Some(account) = flag(args, "--account") else {
        bail!("--account is required");
    };
    let platform = match flag(args, "--platform") {
        Some(value) => Platform::parse(value).with_context(|| format!("Unknown platform: {}", value))?,
        None => Platform::Desktop,
    };
    let identity = RecipientKey::new(account, platform);
    let config = ClientConfig::new(addr, identity);

    match parse_transport(args)?.unwrap_or_default() {
        TransportKind::Tcp => client_session(TcpConnector::default(), config, args).await,
        TransportKind::Quic => {
            let connector = QuicConnector::new(Duration::from_secs(10))?;
            client_session(connector, config, args).await
        }
    }
}

async fn client_session<C: Connector>(connector: C, config: ClientConfig, args: &[String]) -> anyhow::Result<()> {
    let account = config.identity.account.clone();
    let mut client = ChatClient::new(connector, config);
    let mut events = client.events().context("Event stream already taken")?;

    client.reconnect().await?;

    if let (Some(to), Some(text)) = (flag(args, "--to"), flag(args, "--text")) {
        client
            .send(Envelope::chat(ChatMessage::new(account.as_str(), to, text)))
            .await?;
        info!("Sent message to {}", to);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ClientEvent::Received(envelope)) => match envelope.payload {
                    Some(Payload::Chat(chat)) => println!("[{}] {}", chat.from_account, chat.body),
                    Some(Payload::Notification(n)) => println!("(notification {})", n.kind),
                    _ => {}
                },
                Some(ClientEvent::Disconnected(reason)) => {
                    error!("Disconnected: {}", reason);
                    break;
                }
                Some(ClientEvent::Connected) => {}
                None => break,
            },
        }
    }

    client.disconnect();
    Ok(())
}
