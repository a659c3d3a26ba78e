use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use crate::config::ServerConfig;
use crate::cryptography::{decrypt_payload, encrypt_payload, wrap_symmetric_key, KeyMode, KeyPolicy};
use crate::error::ChatError;
use crate::messages::Message;
use crate::networking::{write_frame, FrameReader};
use crate::registry::{Connection, ConnectionWriter, DuplicateIdentity, RegisterError, Registry, SessionId};
use crate::MAX_IDENTITY_LEN;

pub const IDENTITY_TAKEN: &str = "Username already taken";
pub const INVALID_SECRET: &str = "Invalid room secret";
pub const KEY_EXCHANGE_FAILED: &str = "Error establishing secure connection";
pub const WELCOME: &str = "Welcome to the secure chat!";
pub const RELAY_DECRYPT_FAILED: &str = "Message could not be decrypted by the server and was not relayed";

pub fn joined_notice(identity: &str) -> String {
    format!("{} has joined the chat", identity)
}

pub fn left_notice(identity: &str) -> String {
    format!("{} has left the chat", identity)
}

/// The relay. Cheap to clone; every clone shares one registry and one key policy.
#[derive(Clone)]
pub struct ChatServer {
    registry: Registry,
    keys: KeyPolicy,
    room_secret: Option<String>,
}

impl ChatServer {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_key_policy(config, KeyPolicy::new(config.key_mode))
    }

    pub fn with_key_policy(config: &ServerConfig, keys: KeyPolicy) -> Self {
        ChatServer {
            registry: Registry::new(config.write_timeout),
            keys,
            room_secret: config.room_secret.clone(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn key_mode(&self) -> KeyMode {
        self.keys.mode()
    }

    /// Bind the listening socket. This is the only failure that should stop the process.
    pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ChatError> {
        let listener = TcpListener::bind(config.addr()).await?;
        Ok(listener)
    }

    /// Run the accept loop for the chat relay.
    ///
    /// # Overview
    /// Every accepted socket gets `TCP_NODELAY`, is split into halves and is
    /// handed to [`ChatServer::handle_connection`] on its own task. All tasks
    /// share this server's registry and key policy through `clone`.
    ///
    /// # Arguments
    /// * `listener` - A socket from [`ChatServer::bind`]
    ///
    /// # Returns
    /// Never returns under normal operation. Accept errors are logged and the
    /// loop backs off briefly instead of stopping.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ChatError> {
        if let Ok(addr) = listener.local_addr() {
            info!("Chat server listening on {}", addr);
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            info!("New connection from {}", addr);
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
            }

            let server = self.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                server.handle_connection(reader, writer, addr.to_string()).await;
            });
        }
    }

    /// Drive one connection from accept to close.
    ///
    /// # Process Flow
    /// 1. Frames are read one at a time, so a peer's messages are relayed in the order sent
    /// 2. A handshake registers the peer; its first frame back is `key_exchange` (or a
    ///    `system` error if its public key is unusable)
    /// 3. Chat frames are relayed only while this connection still owns its identity
    /// 4. On EOF, a read error or a terminal error, the session is released and, if the
    ///    identity is now free, everyone is told the peer left
    ///
    /// # Arguments
    /// * `reader`, `writer` - The two halves of the peer's stream
    /// * `peer` - Label used in logs, usually the remote address
    ///
    /// Errors never escape: they end this connection and nothing else.
    pub async fn handle_connection<R, W>(&self, reader: R, writer: W, peer: String)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut frames = FrameReader::new(reader);
        let mut session = Session::new(self, peer, Box::new(writer));

        loop {
            let message = match frames.next_message().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("{} closed the connection", session.peer);
                    break;
                }
                Err(e) => {
                    debug!("Read from {} failed: {}", session.peer, e);
                    break;
                }
            };

            if let Err(e) = session.handle(message).await {
                if e.is_terminal() {
                    debug!("Closing {}: {}", session.peer, e);
                    break;
                }
                warn!("Error handling frame from {}: {}", session.peer, e);
            }
        }

        session.close().await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Connected,
    Registered(String),
    Closed,
}

/// Per-connection state machine. Only registry calls cross connections.
struct Session<'a> {
    server: &'a ChatServer,
    id: SessionId,
    peer: String,
    state: SessionState,
    /// Owned until registration moves it into the registry.
    writer: Option<ConnectionWriter>,
}

impl<'a> Session<'a> {
    fn new(server: &'a ChatServer, peer: String, writer: ConnectionWriter) -> Self {
        Session {
            server,
            id: SessionId::next(),
            peer,
            state: SessionState::Connected,
            writer: Some(writer),
        }
    }

    async fn handle(&mut self, message: Message) -> Result<(), ChatError> {
        let registered = match &self.state {
            SessionState::Registered(identity) => Some(identity.clone()),
            _ => None,
        };

        match (registered, message) {
            (None, Message::Handshake { identity, public_key, room_secret }) => {
                self.handshake(identity, public_key, room_secret).await
            }
            (Some(identity), Message::Chat { message, encrypted, .. }) => {
                self.relay(&identity, message, encrypted).await
            }
            (Some(identity), Message::Handshake { .. }) => {
                warn!("{} sent a second handshake; ignored", identity);
                Ok(())
            }
            (None, Message::Chat { .. }) => {
                debug!("Ignoring message from unregistered {}", self.peer);
                Ok(())
            }
            (_, other) => {
                debug!("Ignoring unexpected {} frame from {}", other.kind(), self.peer);
                Ok(())
            }
        }
    }

    async fn handshake(
        &mut self,
        identity: String,
        public_key: String,
        room_secret: Option<String>,
    ) -> Result<(), ChatError> {
        if let Some(expected) = &self.server.room_secret {
            if !secret_matches(expected, room_secret.as_deref()) {
                warn!("Rejected handshake from {}: wrong room secret", self.peer);
                self.reply(&Message::auth_error(INVALID_SECRET)).await?;
                return Err(ChatError::Auth(INVALID_SECRET.to_string()));
            }
        }

        let identity = identity.trim().to_string();
        if let Err(reason) = validate_identity(&identity) {
            self.reply(&Message::system(format!("Invalid username: {}", reason))).await?;
            return Err(ChatError::InvalidIdentity(reason));
        }

        let room_key = self.server.keys.key_for_new_peer();
        let (greeting, keyed) = match wrap_symmetric_key(&public_key, &room_key) {
            Ok(wrapped) => (Message::key_exchange(wrapped), true),
            Err(e) => {
                warn!("Key exchange with {} failed: {}", identity, e);
                (Message::system(KEY_EXCHANGE_FAILED), false)
            }
        };
        let greeting = greeting.to_line()?;

        let writer = self.writer.take().ok_or(ChatError::NotConnected)?;
        let mut connection = Connection::new(identity.clone(), self.id, public_key, room_key, writer);
        connection.handshake_complete = keyed;

        match self.server.registry.register_with_greeting(connection, &greeting).await {
            Ok(()) => {}
            Err(RegisterError::Duplicate(DuplicateIdentity(rejected))) => {
                self.writer = Some(rejected.into_writer());
                self.reply(&Message::system(IDENTITY_TAKEN)).await?;
                return Err(ChatError::DuplicateIdentity(identity));
            }
            Err(RegisterError::Unreachable(e)) => return Err(e),
        }

        self.state = SessionState::Registered(identity.clone());
        info!("{} registered as {}", self.peer, identity);

        self.server.announce_roster().await?;
        self.server.broadcast(&Message::system(joined_notice(&identity)), Some(&identity)).await?;
        self.server.send_own(&identity, self.id, &Message::system(WELCOME)).await
    }

    async fn relay(&mut self, identity: &str, message: String, encrypted: bool) -> Result<(), ChatError> {
        let envelope = Message::relayed(identity, message, encrypted);

        if encrypted && self.server.keys.mode() == KeyMode::PerPeer {
            if !self.relay_reencrypted(identity, &envelope).await? {
                return Ok(());
            }
        } else {
            let line = envelope.to_line()?;
            let evicted = self
                .server
                .registry
                .broadcast_from(identity, self.id, |_| Some(line.clone()))
                .await?;
            self.server.refresh_after_eviction(evicted).await?;
        }

        // delivery confirmation
        self.server.send_own(identity, self.id, &envelope).await
    }

    /// Per-peer keys: open the sender's ciphertext and seal it again for each
    /// recipient. Returns false if the payload could not be opened.
    async fn relay_reencrypted(&mut self, identity: &str, envelope: &Message) -> Result<bool, ChatError> {
        let server = self.server;
        let registry = &server.registry;
        let Message::Chat { message: ciphertext, .. } = envelope else {
            return Ok(false);
        };

        if !registry.holds(identity, self.id).await {
            return Err(ChatError::NotRegistered(identity.to_string()));
        }
        let sender_key = registry
            .room_key(identity)
            .await
            .ok_or_else(|| ChatError::NotRegistered(identity.to_string()))?;

        let plaintext = match decrypt_payload(&sender_key, ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Could not open payload from {}: {}", identity, e);
                self.server.send_own(identity, self.id, &Message::system(RELAY_DECRYPT_FAILED)).await?;
                return Ok(false);
            }
        };

        let evicted = registry
            .broadcast_from(identity, self.id, |recipient| {
                let sealed = encrypt_payload(&recipient.room_key, &plaintext)
                    .and_then(|payload| Message::relayed(identity, payload, true).to_line());
                match sealed {
                    Ok(line) => Some(line),
                    Err(e) => {
                        warn!("Could not seal payload for {}: {}", recipient.identity, e);
                        None
                    }
                }
            })
            .await?;
        self.server.refresh_after_eviction(evicted).await?;
        Ok(true)
    }

    async fn close(mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);

        if let SessionState::Registered(identity) = state {
            info!("{} ({}) disconnected", identity, self.peer);

            // an evicted session whose name was taken again must not announce the new owner's departure
            if self.server.registry.release(&identity, self.id).await {
                if let Err(e) = self.server.broadcast(&Message::system(left_notice(&identity)), None).await {
                    warn!("Could not announce departure of {}: {}", identity, e);
                }
                if let Err(e) = self.server.announce_roster().await {
                    warn!("Could not refresh roster: {}", e);
                }
            } else {
                debug!("{} now belongs to another connection; no departure notice", identity);
            }
        }

        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        debug!("Connection {} ({}) closed", self.id, self.peer);
    }

    /// Write to our own stream while we still own it (before registration).
    async fn reply(&mut self, message: &Message) -> Result<(), ChatError> {
        let writer = self.writer.as_mut().ok_or(ChatError::NotConnected)?;
        write_frame(writer, message).await
    }
}

impl ChatServer {
    /// Unicast to a session's own registered stream. Fails with `NotRegistered`
    /// once that session no longer owns `identity`.
    async fn send_own(&self, identity: &str, session: SessionId, message: &Message) -> Result<(), ChatError> {
        let line = message.to_line()?;
        self.registry.send_to_session(identity, session, &line).await
    }

    async fn announce_roster(&self) -> Result<(), ChatError> {
        let users = self.registry.snapshot_identities().await;
        self.broadcast(&Message::user_list(users), None).await
    }

    async fn broadcast(&self, message: &Message, exclude: Option<&str>) -> Result<(), ChatError> {
        let line = message.to_line()?;
        let evicted = self.registry.broadcast(&line, exclude).await;
        self.refresh_after_eviction(evicted).await
    }

    /// Keep re-sending the roster until a broadcast goes through without evicting anyone.
    async fn refresh_after_eviction(&self, mut evicted: Vec<String>) -> Result<(), ChatError> {
        while !evicted.is_empty() {
            info!("Evicted unreachable peers: {}", evicted.join(", "));
            let users = self.registry.snapshot_identities().await;
            let line = Message::user_list(users).to_line()?;
            evicted = self.registry.broadcast(&line, None).await;
        }
        Ok(())
    }
}

/// Constant-time room secret check. Both sides are hashed first so the
/// comparison does not leak the secret's length either.
fn secret_matches(expected: &str, presented: Option<&str>) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    let expected = Sha256::digest(expected.as_bytes());
    let presented = Sha256::digest(presented.as_bytes());
    expected.ct_eq(&presented).into()
}

/// Display names must be non-empty, short and free of control characters.
pub fn validate_identity(identity: &str) -> Result<(), String> {
    if identity.is_empty() {
        return Err("must not be empty".to_string());
    }
    if identity.chars().count() > MAX_IDENTITY_LEN {
        return Err(format!("must be at most {} characters", MAX_IDENTITY_LEN));
    }
    if identity.chars().any(char::is_control) {
        return Err("must not contain control characters".to_string());
    }
    Ok(())
}
