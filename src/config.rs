use std::time::Duration;
use crate::cryptography::KeyMode;
use crate::{DEFAULT_HOST, DEFAULT_PORT, RSA_KEY_BITS};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the client does when encrypting an outgoing message fails while it
/// holds a room key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaintextFallback {
    /// Refuse to send; the caller gets a crypto error.
    #[default]
    FailClosed,
    /// Send the message unencrypted and report the downgrade.
    Allow,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub room_secret: Option<String>,
    pub key_mode: KeyMode,
    /// A peer whose write takes longer than this is evicted.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            room_secret: None,
            key_mode: KeyMode::Shared,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_room_secret(mut self, secret: impl Into<String>) -> Self {
        self.room_secret = Some(secret.into());
        self
    }

    pub fn with_key_mode(mut self, mode: KeyMode) -> Self {
        self.key_mode = mode;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub identity: String,
    pub room_secret: Option<String>,
    pub rsa_bits: usize,
    pub plaintext_fallback: PlaintextFallback,
}

impl ClientConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            identity: identity.into(),
            room_secret: None,
            rsa_bits: RSA_KEY_BITS,
            plaintext_fallback: PlaintextFallback::FailClosed,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_room_secret(mut self, secret: impl Into<String>) -> Self {
        self.room_secret = Some(secret.into());
        self
    }

    pub fn with_rsa_bits(mut self, bits: usize) -> Self {
        self.rsa_bits = bits;
        self
    }

    pub fn with_plaintext_fallback(mut self, fallback: PlaintextFallback) -> Self {
        self.plaintext_fallback = fallback;
        self
    }
}
