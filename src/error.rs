// Error taxonomy for the real-time core
// Only NotConnected and Invocation are meant to reach callers; the rest are
// logged and recovered where they occur.

use thiserror::Error;

/// Errors produced by the hub connections, the delivery pipeline and the stores
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The connection could not be established or was dropped
    #[error("Transport error: {0}")]
    Transport(String),

    /// An invoke was attempted while the named hub had no live connection
    #[error("Not connected to the {0} hub")]
    NotConnected(String),

    /// An inbound event failed shape validation
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The conversation history request failed
    #[error("History fetch failed: {0}")]
    HistoryFetch(String),

    /// Local persisted state could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// The hub answered an invocation with an error completion
    #[error("Hub invocation failed: {0}")]
    Invocation(String),

    /// A hub record could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration (bad URL and the like)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RealtimeError {
    /// True for errors that callers are expected to surface with a retry affordance
    pub fn is_retryable(&self) -> bool {
        matches!(self, RealtimeError::NotConnected(_) | RealtimeError::Transport(_))
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
