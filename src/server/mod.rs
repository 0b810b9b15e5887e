//! Server side of the routing core
//!
//! - Connection and sink registries keyed by recipient
//! - The handler table and the bounded dispatcher running it
//! - Per-connection sessions and the node that accepts them

pub mod connection_registry;
pub mod dispatcher;
pub mod handlers;
pub mod node;
pub mod session;
pub mod sink_registry;

pub use connection_registry::ConnectionRegistry;
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig, Handler, HandlerContext, HandlerTable};
pub use handlers::{Delivery, default_handler_table};
pub use node::{ChatNode, NodeServices, local_cluster};
pub use session::{Session, SessionConfig};
pub use sink_registry::{OutboundSink, OverflowPolicy, SinkConfig, SinkRegistry, SinkSubscription};
