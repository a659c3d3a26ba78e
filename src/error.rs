use std::io;
use thiserror::Error;

/// Every failure the chat protocol can produce.
///
/// None of these are fatal to a running server: protocol and transport errors
/// end at most one connection, crypto errors are reported to the affected peer.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A frame could not be parsed or is missing a field for its kind.
    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("identity '{0}' is already registered")]
    DuplicateIdentity(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Room secret mismatch.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("identity '{0}' is not registered")]
    NotRegistered(String),

    #[error("not connected")]
    NotConnected,
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Protocol(e.to_string())
    }
}

impl ChatError {
    /// Errors after which the connection is finished. Protocol, identity and
    /// crypto errors leave it usable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatError::Transport(_) | ChatError::Auth(_) | ChatError::NotRegistered(_) | ChatError::NotConnected
        )
    }
}
