use serde::{Deserialize, Serialize};
use crate::error::ChatError;

/// One protocol envelope. Serialized as a single JSON object on one line,
/// discriminated by its `"type"` field.
///
/// Envelopes are never mutated after construction; the server builds a fresh
/// `Chat` with `sender` filled in when it relays a client's message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// client -> server: identity, PEM public key and the optional room secret
    Handshake {
        #[serde(rename = "username", alias = "identity")]
        identity: String,
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_secret: Option<String>,
    },
    /// server -> client: room key wrapped under the client's public key (base64)
    KeyExchange {
        encrypted_key: String,
    },
    /// both directions; `sender` is only set by the server when relaying
    #[serde(rename = "message")]
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        message: String,
        #[serde(default)]
        encrypted: bool,
    },
    UserList {
        users: Vec<String>,
    },
    System {
        message: String,
    },
    AuthError {
        message: String,
    },
}

impl Message {
    pub fn handshake(identity: &str, public_key: String, room_secret: Option<String>) -> Self {
        Message::Handshake {
            identity: identity.to_string(),
            public_key,
            room_secret,
        }
    }

    pub fn key_exchange(encrypted_key: String) -> Self {
        Message::KeyExchange { encrypted_key }
    }

    /// Outbound chat payload as a client sends it (no sender).
    pub fn outgoing(message: String, encrypted: bool) -> Self {
        Message::Chat { sender: None, message, encrypted }
    }

    /// Chat payload as the server relays it.
    pub fn relayed(sender: &str, message: String, encrypted: bool) -> Self {
        Message::Chat {
            sender: Some(sender.to_string()),
            message,
            encrypted,
        }
    }

    pub fn user_list(users: Vec<String>) -> Self {
        Message::UserList { users }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Message::System { message: message.into() }
    }

    pub fn auth_error(message: impl Into<String>) -> Self {
        Message::AuthError { message: message.into() }
    }

    /// Wire name of this envelope's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::KeyExchange { .. } => "key_exchange",
            Message::Chat { .. } => "message",
            Message::UserList { .. } => "user_list",
            Message::System { .. } => "system",
            Message::AuthError { .. } => "auth_error",
        }
    }

    /// Serialize to one newline-terminated line.
    pub fn to_line(&self) -> Result<String, ChatError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (with or without its terminator).
    pub fn from_line(line: &str) -> Result<Self, ChatError> {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            return Err(ChatError::Protocol("empty frame".into()));
        }
        Ok(serde_json::from_str(trimmed)?)
    }
}
