//! Message dispatcher
//!
//! Routes each decoded envelope to the handler registered for its payload
//! case. Handlers never run on the connection's reader task: async handlers
//! are spawned, sync handlers go to the blocking pool, and both hold a permit
//! from a shared semaphore while running. When every permit is taken,
//! `dispatch` waits, which pushes back onto the reading connection.
//!
//! Handler failures stop here. Errors and panics are logged and never close
//! the connection the envelope came from.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::node::NodeServices;
use crate::error::{ChatError, Result};
use crate::protocol::messages::{Envelope, PayloadCase, RecipientKey};
use crate::transport::connection::ConnectionHandle;

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Handlers allowed to run at once
    pub workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { workers: 64 }
    }
}

/// What a handler gets to work with
#[derive(Clone)]
pub struct HandlerContext {
    pub services: NodeServices,
    /// Connection the envelope arrived on
    pub connection: Arc<ConnectionHandle>,
}

impl HandlerContext {
    pub fn new(services: NodeServices, connection: Arc<ConnectionHandle>) -> Self {
        Self {
            services,
            connection,
        }
    }

    /// Identity bound to the originating connection
    pub fn sender(&self) -> Result<&RecipientKey> {
        self.connection
            .identity()
            .ok_or_else(|| ChatError::protocol("Envelope received before identity assertion"))
    }
}

type SyncHandlerFn = dyn Fn(HandlerContext, Envelope) -> Result<()> + Send + Sync;
type AsyncHandlerFn = dyn Fn(HandlerContext, Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// A registered handler
#[derive(Clone)]
pub enum Handler {
    /// Runs on the blocking pool
    Sync(Arc<SyncHandlerFn>),
    /// Runs as a spawned task
    Async(Arc<AsyncHandlerFn>),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Immutable map from payload case to handler
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<PayloadCase, Handler>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn get(&self, case: PayloadCase) -> Option<&Handler> {
        self.handlers.get(&case)
    }

    pub fn contains(&self, case: PayloadCase) -> bool {
        self.handlers.contains_key(&case)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Startup-time registration of handlers
#[derive(Debug, Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<PayloadCase, Handler>,
}

impl HandlerTableBuilder {
    /// Register a blocking handler; replaces any earlier one for `case`
    pub fn on_sync<F>(mut self, case: PayloadCase, handler: F) -> Self
    where
        F: Fn(HandlerContext, Envelope) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(case, Handler::Sync(Arc::new(handler)));
        self
    }

    /// Register an async handler; replaces any earlier one for `case`
    pub fn on_async<F, Fut>(mut self, case: PayloadCase, handler: F) -> Self
    where
        F: Fn(HandlerContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed = move |ctx: HandlerContext, envelope: Envelope| -> BoxFuture<'static, Result<()>> {
            handler(ctx, envelope).boxed()
        };
        self.handlers.insert(case, Handler::Async(Arc::new(boxed)));
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}

/// Result of handing an envelope to the dispatcher
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A handler was scheduled; the handle resolves when it finishes
    Dispatched(JoinHandle<()>),
    /// No handler for the payload case; the envelope was dropped
    Unhandled,
}

impl DispatchOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, DispatchOutcome::Dispatched(_))
    }
}

/// Runs handlers on a bounded worker pool
#[derive(Debug, Clone)]
pub struct Dispatcher {
    table: Arc<HandlerTable>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(table: HandlerTable, config: &DispatcherConfig) -> Self {
        Self {
            table: Arc::new(table),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
        }
    }

    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    /// Permits currently free
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Schedule the handler for `envelope`, waiting for a free worker
    pub async fn dispatch(&self, ctx: HandlerContext, envelope: Envelope) -> DispatchOutcome {
        let Some(case) = envelope.case() else {
            debug!(conn_id = ctx.connection.id(), "Dropping envelope with unknown payload case");
            return DispatchOutcome::Unhandled;
        };

        let Some(handler) = self.table.get(case).cloned() else {
            warn!(conn_id = ctx.connection.id(), "No handler for {} envelope, dropping", case);
            return DispatchOutcome::Unhandled;
        };

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Dispatcher closed, dropping {} envelope", case);
                return DispatchOutcome::Unhandled;
            }
        };

        let conn_id = ctx.connection.id().to_string();
        let handle = match handler {
            Handler::Async(handler) => tokio::spawn(async move {
                let _permit = permit;
                let result = AssertUnwindSafe(async move { handler(ctx, envelope).await })
                    .catch_unwind()
                    .await;
                report(case, &conn_id, result);
            }),
            Handler::Sync(handler) => tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, envelope)));
                report(case, &conn_id, result);
            }),
        };

        DispatchOutcome::Dispatched(handle)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Classify and log a finished handler
fn report(case: PayloadCase, conn_id: &str, result: std::thread::Result<Result<()>>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(ChatError::Routing(msg))) => {
            warn!(conn_id, "Could not route {} envelope: {}", case, msg);
        }
        Ok(Err(e)) => {
            error!(conn_id, code = e.code(), "{} handler failed: {}", case, e);
        }
        Err(panic) => {
            error!(conn_id, "{} handler panicked: {}", case, panic_message(panic.as_ref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ChatMessage, Notification};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn context() -> HandlerContext {
        let (conn, _rx) = ConnectionHandle::channel("test");
        HandlerContext::new(NodeServices::standalone("node-test"), Arc::new(conn))
    }

    fn counting_table(counter: Arc<AtomicUsize>) -> HandlerTable {
        HandlerTable::builder()
            .on_async(PayloadCase::Chat, move |_ctx, _env| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
    }

    #[tokio::test]
    async fn test_dispatches_to_registered_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(counting_table(counter.clone()), &DispatcherConfig::default());

        let envelope = Envelope::chat(ChatMessage::new("alice", "bob", "hi"));
        match dispatcher.dispatch(context(), envelope).await {
            DispatchOutcome::Dispatched(handle) => handle.await.unwrap(),
            DispatchOutcome::Unhandled => panic!("Expected dispatch"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhandled_case_invokes_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(counting_table(counter.clone()), &DispatcherConfig::default());

        let notification = Envelope::notification(Notification::new("bob", "mention", vec![]));
        assert!(!dispatcher.dispatch(context(), notification).await.is_dispatched());
        assert!(!dispatcher.dispatch(context(), Envelope::default()).await.is_dispatched());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_contained() {
        let table = HandlerTable::builder()
            .on_async(PayloadCase::Chat, |_ctx, _env| async {
                Err::<(), _>(ChatError::handler("boom"))
            })
            .on_async(PayloadCase::Notification, |_ctx, _env| async {
                if true {
                    panic!("async handler exploded");
                }
                Ok(())
            })
            .on_sync(PayloadCase::Identity, |_ctx, _env| panic!("sync handler exploded"))
            .build();
        let dispatcher = Dispatcher::new(table, &DispatcherConfig { workers: 2 });

        let envelopes = vec![
            Envelope::chat(ChatMessage::new("a", "b", "c")),
            Envelope::notification(Notification::new("b", "k", vec![])),
            Envelope::identity(&RecipientKey::desktop("a")),
        ];
        for envelope in envelopes {
            match dispatcher.dispatch(context(), envelope).await {
                DispatchOutcome::Dispatched(handle) => assert!(handle.await.is_ok()),
                DispatchOutcome::Unhandled => panic!("Expected dispatch"),
            }
        }
        assert_eq!(dispatcher.available_workers(), 2);
    }

    #[tokio::test]
    async fn test_sync_handler_runs_off_reader_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let table = HandlerTable::builder()
            .on_sync(PayloadCase::Chat, move |ctx, _env| {
                assert_eq!(ctx.services.node_id, "node-test");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();
        let dispatcher = Dispatcher::new(table, &DispatcherConfig::default());

        if let DispatchOutcome::Dispatched(handle) = dispatcher
            .dispatch(context(), Envelope::chat(ChatMessage::new("a", "b", "c")))
            .await
        {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_free_worker() {
        let gate = Arc::new(Notify::new());
        let table = {
            let gate = gate.clone();
            HandlerTable::builder()
                .on_async(PayloadCase::Chat, move |_ctx, _env| {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok(())
                    }
                })
                .build()
        };
        let dispatcher = Dispatcher::new(table, &DispatcherConfig { workers: 1 });
        let chat = || Envelope::chat(ChatMessage::new("a", "b", "c"));

        let first = dispatcher.dispatch(context(), chat()).await;
        assert_eq!(dispatcher.available_workers(), 0);

        let second = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.dispatch(context(), chat()),
        )
        .await;
        assert!(second.is_err());

        gate.notify_one();
        if let DispatchOutcome::Dispatched(handle) = first {
            handle.await.unwrap();
        }
        assert_eq!(dispatcher.available_workers(), 1);
    }
}
