//! Error handling for the routing core

use thiserror::Error;

/// Result type alias for routing operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Routing core error types
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// Connect, read or write failure on a transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Address could not be parsed or resolved
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed frame or unparseable envelope
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure raised inside a message handler
    #[error("Handler error: {0}")]
    Handler(String),

    /// No handler for a discriminant, or recipient unresolvable
    #[error("Routing error: {0}")]
    Routing(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Resource limit exceeded (full sink, connection limit)
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Durable stream store failure
    #[error("Stream store error: {0}")]
    Store(String),

    /// The reconnect supervisor gave up
    #[error("Connection failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            ChatError::Transport(_) => 1000,
            ChatError::InvalidAddress(_) => 1001,
            ChatError::Protocol(_) => 1003,
            ChatError::Handler(_) => 1004,
            ChatError::Routing(_) => 1005,
            ChatError::Config(_) => 1010,
            ChatError::Timeout(_) => 1011,
            ChatError::ResourceLimit(_) => 1012,
            ChatError::Store(_) => 1013,
            ChatError::RetriesExhausted { .. } => 1014,
            ChatError::Internal(_) => 1009,
        }
    }

    /// Whether the reconnect supervisor should try again after this error.
    ///
    /// Only transient transport failures qualify; an address that does not parse
    /// or resolve will not get better by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Transport(_) | ChatError::Timeout(_))
    }

    /// Errors after which the owning connection must be torn down
    pub fn closes_connection(&self) -> bool {
        matches!(self, ChatError::Transport(_) | ChatError::Protocol(_))
    }

    /// Create a transport error
    pub fn transport<T: Into<String>>(msg: T) -> Self {
        ChatError::Transport(msg.into())
    }

    /// Create an invalid address error
    pub fn invalid_address<T: Into<String>>(msg: T) -> Self {
        ChatError::InvalidAddress(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ChatError::Protocol(msg.into())
    }

    /// Create a handler error
    pub fn handler<T: Into<String>>(msg: T) -> Self {
        ChatError::Handler(msg.into())
    }

    /// Create a routing error
    pub fn routing<T: Into<String>>(msg: T) -> Self {
        ChatError::Routing(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChatError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ChatError::Timeout(msg.into())
    }

    /// Create a resource limit error
    pub fn resource_limit<T: Into<String>>(msg: T) -> Self {
        ChatError::ResourceLimit(msg.into())
    }

    /// Create a stream store error
    pub fn store<T: Into<String>>(msg: T) -> Self {
        ChatError::Store(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Transport(format!("IO error: {}", err))
    }
}

impl From<prost::DecodeError> for ChatError {
    fn from(err: prost::DecodeError) -> Self {
        ChatError::Protocol(format!("Envelope decode error: {}", err))
    }
}

impl From<prost::EncodeError> for ChatError {
    fn from(err: prost::EncodeError) -> Self {
        ChatError::Internal(format!("Envelope encode error: {}", err))
    }
}

impl From<std::net::AddrParseError> for ChatError {
    fn from(err: std::net::AddrParseError) -> Self {
        ChatError::InvalidAddress(err.to_string())
    }
}

impl From<quinn::ConnectError> for ChatError {
    fn from(err: quinn::ConnectError) -> Self {
        match err {
            quinn::ConnectError::InvalidServerName(name) => {
                ChatError::InvalidAddress(format!("Invalid server name: {}", name))
            }
            quinn::ConnectError::InvalidRemoteAddress(addr) => {
                ChatError::InvalidAddress(format!("Invalid remote address: {}", addr))
            }
            other => ChatError::Transport(format!("QUIC connect error: {}", other)),
        }
    }
}

impl From<quinn::ConnectionError> for ChatError {
    fn from(err: quinn::ConnectionError) -> Self {
        ChatError::Transport(format!("QUIC connection error: {}", err))
    }
}

impl From<rustls::Error> for ChatError {
    fn from(err: rustls::Error) -> Self {
        ChatError::Config(format!("TLS error: {}", err))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Config(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ChatError::transport("refused").is_retryable());
        assert!(ChatError::timeout("connect").is_retryable());
        assert!(!ChatError::invalid_address("nope").is_retryable());
        assert!(!ChatError::protocol("garbled").is_retryable());
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let err: ChatError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, ChatError::Transport(_)));
        assert!(err.closes_connection());
    }

    #[test]
    fn test_display_includes_attempts() {
        let err = ChatError::RetriesExhausted {
            attempts: 3,
            last: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "Connection failed after 3 attempts: refused");
        assert_eq!(err.code(), 1014);
    }
}
