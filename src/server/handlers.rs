//! Built-in routing handlers
//!
//! Each endpoint of the recipient is resolved on its own. A live connection on
//! this node wins; otherwise the node locator is asked whether another node
//! holds the endpoint and the envelope is relayed there. Only when no node
//! holds it does a surviving local sink buffer the message for a later
//! reconnect.

use tracing::{debug, warn};

use super::dispatcher::{HandlerContext, HandlerTable};
use super::node::NodeServices;
use crate::error::{ChatError, Result};
use crate::protocol::messages::{Envelope, NodeId, Payload, PayloadCase, Platform, RecipientKey};
use crate::relay::RelayRecord;

/// Where a routed envelope ended up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Local sinks the envelope was published into
    pub local: usize,
    /// Nodes the envelope was relayed to, one entry per endpoint
    pub relayed: Vec<NodeId>,
    /// Endpoints that resolved but refused the envelope
    pub failed: usize,
}

impl Delivery {
    /// Nothing was published or relayed
    pub fn is_empty(&self) -> bool {
        self.local == 0 && self.relayed.is_empty()
    }
}

/// Resolved destination of one endpoint
enum Target {
    Local(RecipientKey),
    Remote(RecipientKey, NodeId),
}

impl Target {
    fn key(&self) -> &RecipientKey {
        match self {
            Target::Local(key) | Target::Remote(key, _) => key,
        }
    }
}

/// Handler table with the built-in chat and notification routes
pub fn default_handler_table() -> HandlerTable {
    HandlerTable::builder()
        .on_async(PayloadCase::Chat, route_chat)
        .on_async(PayloadCase::Notification, route_notification)
        .build()
}

/// Route a chat message from the connection's bound identity
pub async fn route_chat(ctx: HandlerContext, envelope: Envelope) -> Result<()> {
    let sender = ctx.sender()?.clone();
    let Some(Payload::Chat(mut chat)) = envelope.payload else {
        return Err(ChatError::handler("route_chat received a non-chat envelope"));
    };
    if chat.to_account.is_empty() {
        return Err(ChatError::routing("Chat message without recipient"));
    }

    // The identity layer already vouched for the connection, not the payload
    chat.from_account = sender.account.clone();
    let to_account = chat.to_account.clone();
    let platform = chat.target_platform();
    let delivery = route(&ctx.services, &to_account, platform, &sender.account, Envelope::chat(chat)).await?;

    debug!(from = %sender, to = %to_account, ?delivery, "Routed chat message");
    Ok(())
}

/// Route a notification to every endpoint of its account
pub async fn route_notification(ctx: HandlerContext, envelope: Envelope) -> Result<()> {
    let sender = ctx.sender()?.clone();
    let Some(Payload::Notification(notification)) = envelope.payload else {
        return Err(ChatError::handler("route_notification received a non-notification envelope"));
    };
    if notification.to_account.is_empty() {
        return Err(ChatError::routing("Notification without recipient"));
    }

    let to_account = notification.to_account.clone();
    let delivery = route(
        &ctx.services,
        &to_account,
        None,
        &sender.account,
        Envelope::notification(notification),
    )
    .await?;

    debug!(to = %to_account, ?delivery, "Routed notification");
    Ok(())
}

fn resolve(services: &NodeServices, key: &RecipientKey) -> Option<Target> {
    if services.connections.lookup(key).is_some() {
        return Some(Target::Local(key.clone()));
    }
    if let Some(node) = services.locator.locate(key).filter(|node| *node != services.node_id) {
        return Some(Target::Remote(key.clone(), node));
    }
    services
        .sinks
        .get_sink_flow(key)
        .map(|_| Target::Local(key.clone()))
}

async fn relay_to(
    services: &NodeServices,
    key: &RecipientKey,
    node: &str,
    from_account: &str,
    envelope: &Envelope,
) -> Result<()> {
    let Some(relay) = &services.relay else {
        return Err(ChatError::routing(format!(
            "{} is on node {} but relaying is disabled",
            key, node
        )));
    };
    let record = RelayRecord::for_envelope(key.account.clone(), from_account, envelope).with_platform(Some(key.platform));
    relay.relay(node, record).await?;
    Ok(())
}

/// Deliver to every endpoint of `to_account`, or to one when `platform` is set.
///
/// Every resolved endpoint is attempted even when an earlier one fails. The
/// call only errors when nothing could be delivered at all.
pub async fn route(
    services: &NodeServices,
    to_account: &str,
    platform: Option<Platform>,
    from_account: &str,
    envelope: Envelope,
) -> Result<Delivery> {
    let platforms: &[Platform] = match &platform {
        Some(platform) => std::slice::from_ref(platform),
        None => &Platform::ALL,
    };
    let targets: Vec<Target> = platforms
        .iter()
        .filter_map(|platform| resolve(services, &RecipientKey::new(to_account, *platform)))
        .collect();

    if targets.is_empty() {
        return Err(ChatError::routing(format!("No route to account {}", to_account)));
    }

    let mut delivery = Delivery::default();
    let mut last_error = None;
    for target in targets {
        let result = match &target {
            // A concurrent eviction may have removed the sink since the lookup
            Target::Local(key) => services.sinks.register_sink_flow(key).publish(envelope.clone()).await,
            Target::Remote(key, node) => relay_to(services, key, node, from_account, &envelope).await,
        };
        match (result, target) {
            (Ok(()), Target::Local(_)) => delivery.local += 1,
            (Ok(()), Target::Remote(_, node)) => delivery.relayed.push(node),
            (Err(e), target) => {
                warn!(recipient = %target.key(), "Delivery to endpoint failed: {}", e);
                delivery.failed += 1;
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if delivery.is_empty() => Err(e),
        _ => Ok(delivery),
    }
}
