//! Protocol message types for the routing core
//!
//! The envelope is a protobuf tagged union. Field tags are wire-stable: new payload
//! cases get new tags, and peers that do not know a tag decode the envelope with an
//! empty payload, which the dispatcher drops.

use std::fmt;

use crate::error::ChatError;

/// Account identifier as asserted by the identity layer
pub type AccountId = String;

/// Identifier of a server process taking part in cross-node relay
pub type NodeId = String;

// =============================================================================
// Addressing
// =============================================================================

/// Client platform of a logical endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Platform {
    Desktop = 0,
    Mobile = 1,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Desktop, Platform::Mobile];

    /// Parse a platform name as used on the command line
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "desktop" | "pc" => Some(Platform::Desktop),
            "mobile" | "phone" => Some(Platform::Mobile),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Desktop => f.write_str("desktop"),
            Platform::Mobile => f.write_str("mobile"),
        }
    }
}

/// Address of one logical endpoint a message can target
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientKey {
    pub account: AccountId,
    pub platform: Platform,
}

impl RecipientKey {
    pub fn new(account: impl Into<AccountId>, platform: Platform) -> Self {
        Self {
            account: account.into(),
            platform,
        }
    }

    pub fn desktop(account: impl Into<AccountId>) -> Self {
        Self::new(account, Platform::Desktop)
    }

    pub fn mobile(account: impl Into<AccountId>) -> Self {
        Self::new(account, Platform::Mobile)
    }
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.platform)
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Top-level wire message
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(oneof = "Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<Payload>,
}

/// Payload variants carried by an [`Envelope`]
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "1")]
    Identity(IdentityAssertion),
    #[prost(message, tag = "2")]
    Heartbeat(Heartbeat),
    #[prost(message, tag = "3")]
    Chat(ChatMessage),
    #[prost(message, tag = "4")]
    Notification(Notification),
}

/// Discriminant of an envelope payload, used as the dispatch key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadCase {
    Identity,
    Heartbeat,
    Chat,
    Notification,
}

impl fmt::Display for PayloadCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadCase::Identity => "identity",
            PayloadCase::Heartbeat => "heartbeat",
            PayloadCase::Chat => "chat",
            PayloadCase::Notification => "notification",
        };
        f.write_str(name)
    }
}

impl Payload {
    pub fn case(&self) -> PayloadCase {
        match self {
            Payload::Identity(_) => PayloadCase::Identity,
            Payload::Heartbeat(_) => PayloadCase::Heartbeat,
            Payload::Chat(_) => PayloadCase::Chat,
            Payload::Notification(_) => PayloadCase::Notification,
        }
    }
}

impl Envelope {
    /// Payload case, or `None` when the sender used a tag this build does not know
    pub fn case(&self) -> Option<PayloadCase> {
        self.payload.as_ref().map(Payload::case)
    }

    pub fn identity(key: &RecipientKey) -> Self {
        Self {
            payload: Some(Payload::Identity(IdentityAssertion {
                account_id: key.account.clone(),
                platform: key.platform as i32,
            })),
        }
    }

    pub fn ping() -> Self {
        Self::heartbeat(true)
    }

    pub fn pong() -> Self {
        Self::heartbeat(false)
    }

    fn heartbeat(ping: bool) -> Self {
        Self {
            payload: Some(Payload::Heartbeat(Heartbeat {
                ping,
                timestamp: crate::current_timestamp(),
            })),
        }
    }

    pub fn chat(message: ChatMessage) -> Self {
        Self {
            payload: Some(Payload::Chat(message)),
        }
    }

    pub fn notification(notification: Notification) -> Self {
        Self {
            payload: Some(Payload::Notification(notification)),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Identity assertion sent by a client right after connecting.
///
/// The identity has already been verified upstream; the core binds it as-is.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IdentityAssertion {
    #[prost(string, tag = "1")]
    pub account_id: String,
    #[prost(enumeration = "Platform", tag = "2")]
    pub platform: i32,
}

impl IdentityAssertion {
    /// The endpoint being asserted; an empty account or unknown platform is a protocol error
    pub fn recipient_key(&self) -> crate::error::Result<RecipientKey> {
        if self.account_id.is_empty() {
            return Err(ChatError::protocol("Identity assertion without account"));
        }
        let platform = Platform::try_from(self.platform)
            .map_err(|_| ChatError::protocol(format!("Unknown platform {} in identity assertion", self.platform)))?;
        Ok(RecipientKey::new(self.account_id.clone(), platform))
    }
}

/// Keepalive request (`ping = true`) or answer (`ping = false`)
#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {
    #[prost(bool, tag = "1")]
    pub ping: bool,
    /// Sender clock in milliseconds, echoed for RTT estimates
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
}

/// Chat message between two accounts
#[derive(Clone, PartialEq, prost::Message)]
pub struct ChatMessage {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(string, tag = "2")]
    pub from_account: String,
    #[prost(string, tag = "3")]
    pub to_account: String,
    /// Restricts delivery to one platform; all platforms when unset
    #[prost(enumeration = "Platform", optional, tag = "4")]
    pub to_platform: Option<i32>,
    #[prost(string, tag = "5")]
    pub conversation_id: String,
    #[prost(string, tag = "6")]
    pub body: String,
    #[prost(uint64, tag = "7")]
    pub sent_at: u64,
}

impl ChatMessage {
    pub fn new(
        from_account: impl Into<String>,
        to_account: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: crate::generate_message_id(),
            from_account: from_account.into(),
            to_account: to_account.into(),
            to_platform: None,
            conversation_id: String::new(),
            body: body.into(),
            sent_at: crate::current_timestamp(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.to_platform = Some(platform as i32);
        self
    }

    /// Target platform, ignoring values this build does not know
    pub fn target_platform(&self) -> Option<Platform> {
        self.to_platform.and_then(|p| Platform::try_from(p).ok())
    }
}

/// Server-originated notice for one account (mentions, membership changes, ...)
#[derive(Clone, PartialEq, prost::Message)]
pub struct Notification {
    #[prost(string, tag = "1")]
    pub notification_id: String,
    #[prost(string, tag = "2")]
    pub to_account: String,
    #[prost(string, tag = "3")]
    pub kind: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub created_at: u64,
}

impl Notification {
    pub fn new(to_account: impl Into<String>, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            notification_id: crate::generate_message_id(),
            to_account: to_account.into(),
            kind: kind.into(),
            payload,
            created_at: crate::current_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_case() {
        assert_eq!(Envelope::ping().case(), Some(PayloadCase::Heartbeat));
        assert_eq!(
            Envelope::identity(&RecipientKey::desktop("alice")).case(),
            Some(PayloadCase::Identity)
        );
        assert_eq!(Envelope::default().case(), None);
    }

    #[test]
    fn test_identity_recipient_key() {
        let key = RecipientKey::mobile("bob");
        match Envelope::identity(&key).payload {
            Some(Payload::Identity(identity)) => assert_eq!(identity.recipient_key().unwrap(), key),
            other => panic!("Expected identity payload, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_identity_is_protocol_error() {
        let anonymous = IdentityAssertion {
            account_id: String::new(),
            platform: Platform::Desktop as i32,
        };
        assert!(matches!(anonymous.recipient_key(), Err(ChatError::Protocol(_))));

        let unknown_platform = IdentityAssertion {
            account_id: "bob".to_string(),
            platform: 7,
        };
        assert!(matches!(unknown_platform.recipient_key(), Err(ChatError::Protocol(_))));
    }

    #[test]
    fn test_unknown_platform_is_ignored() {
        let mut msg = ChatMessage::new("alice", "bob", "hi");
        msg.to_platform = Some(42);
        assert_eq!(msg.target_platform(), None);

        let msg = msg.with_platform(Platform::Mobile);
        assert_eq!(msg.target_platform(), Some(Platform::Mobile));
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!(Platform::parse("Desktop"), Some(Platform::Desktop));
        assert_eq!(Platform::parse("mobile"), Some(Platform::Mobile));
        assert_eq!(Platform::parse("watch"), None);
        assert_eq!(RecipientKey::mobile("carol").to_string(), "carol/mobile");
    }
}
