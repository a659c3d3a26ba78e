use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use log::{debug, info, warn};
use crate::config::{ClientConfig, PlaintextFallback};
use crate::cryptography::{decrypt_payload, encrypt_payload, KeyPair, RoomKey};
use crate::error::ChatError;
use crate::messages::Message;
use crate::networking::{check_frame_len, write_frame, write_line, FrameReader};
use crate::registry::ConnectionWriter;
use crate::server::KEY_EXCHANGE_FAILED;
use crate::MAX_FRAME_LEN;

/// Room left in a frame for the `sender` field the server fills in on relay.
const RELAY_HEADROOM: usize = 256;

/// Client session state. Only `SecureReady` encrypts outgoing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Handshaking,
    /// Room key received and unwrapped.
    SecureReady,
    /// Registered without a usable room key; plaintext only.
    OpenReady,
}

/// Displayable content of a received chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Plain(String),
    Decrypted(String),
    /// Marked as encrypted but we could not open it. Carries the raw payload.
    Undecryptable(String),
}

impl MessageBody {
    pub fn text(&self) -> &str {
        match self {
            MessageBody::Plain(text) | MessageBody::Decrypted(text) | MessageBody::Undecryptable(text) => text,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, MessageBody::Undecryptable(_))
    }
}

/// Everything the UI is told about, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Message {
        sender: String,
        body: MessageBody,
        encrypted: bool,
    },
    UserList(Vec<String>),
    System(String),
    AuthError(String),
    /// The room key was received; messages are encrypted from now on.
    SecureChannel,
    /// Local problems worth showing the user (key exchange failure, downgrades).
    Diagnostic(String),
    Disconnected,
}

struct SessionKeys {
    state: ClientState,
    room_key: Option<RoomKey>,
}

struct Inner {
    identity: String,
    fallback: PlaintextFallback,
    session: Mutex<SessionKeys>,
    writer: Mutex<Option<ConnectionWriter>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    disconnected: AtomicBool,
}

/// A connected chat client.
///
/// Incoming frames are handled by a background task and surfaced as
/// [`ClientEvent`]s on the receiver returned from [`ChatClient::connect`].
pub struct ChatClient {
    inner: Arc<Inner>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Connect, handshake and start receiving.
    pub async fn connect(
        config: &ClientConfig,
    ) -> Result<(ChatClient, mpsc::UnboundedReceiver<ClientEvent>), ChatError> {
        let bits = config.rsa_bits;
        let keypair = tokio::task::spawn_blocking(move || KeyPair::generate_with_bits(bits))
            .await
            .map_err(|e| ChatError::Crypto(format!("key generation task failed: {}", e)))??;

        debug!("Connecting to {}", config.addr());
        let stream = TcpStream::connect(config.addr()).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        Self::start(reader, writer, config, keypair).await
    }

    /// Run the client protocol over an already-open stream.
    pub async fn start<R, W>(
        reader: R,
        writer: W,
        config: &ClientConfig,
        keypair: KeyPair,
    ) -> Result<(ChatClient, mpsc::UnboundedReceiver<ClientEvent>), ChatError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut writer: ConnectionWriter = Box::new(writer);
        let handshake = Message::handshake(
            &config.identity,
            keypair.export_public_key()?,
            config.room_secret.clone(),
        );
        write_frame(&mut writer, &handshake).await?;

        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            identity: config.identity.clone(),
            fallback: config.plaintext_fallback,
            session: Mutex::new(SessionKeys {
                state: ClientState::Handshaking,
                room_key: None,
            }),
            writer: Mutex::new(Some(writer)),
            events,
            disconnected: AtomicBool::new(false),
        });

        let task = tokio::spawn(receive_loop(inner.clone(), keypair, reader));
        info!("Handshake sent as {}", config.identity);

        let client = ChatClient {
            inner,
            receive_task: Mutex::new(Some(task)),
        };
        Ok((client, receiver))
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub async fn state(&self) -> ClientState {
        self.inner.session.lock().await.state
    }

    /// Send a chat message, encrypted when a room key is held.
    ///
    /// Messages too large to be relayed once the server adds the sender are
    /// refused with `ChatError::Protocol` and nothing is written.
    pub async fn send(&self, text: &str) -> Result<(), ChatError> {
        let (state, room_key) = {
            let session = self.inner.session.lock().await;
            (session.state, session.room_key.clone())
        };

        let message = match (state, room_key) {
            (ClientState::Disconnected, _) => return Err(ChatError::NotConnected),
            (ClientState::SecureReady, Some(key)) => match encrypt_payload(&key, text) {
                Ok(sealed) => Message::outgoing(sealed, true),
                Err(e) => match self.inner.fallback {
                    PlaintextFallback::FailClosed => {
                        self.inner.emit(ClientEvent::Diagnostic(format!("Message not sent: {}", e)));
                        return Err(e);
                    }
                    PlaintextFallback::Allow => {
                        warn!("Encryption failed, sending in plaintext: {}", e);
                        self.inner.emit(ClientEvent::Diagnostic(
                            "Encryption failed; message was sent unencrypted".to_string(),
                        ));
                        Message::outgoing(text.to_string(), false)
                    }
                },
            },
            _ => Message::outgoing(text.to_string(), false),
        };

        let line = message.to_line()?;
        if let Err(e) = check_frame_len(&line, MAX_FRAME_LEN - RELAY_HEADROOM) {
            self.inner.emit(ClientEvent::Diagnostic(format!("Message not sent: {}", e)));
            return Err(e);
        }
        self.inner.write(&line).await
    }

    /// Close the connection and stop the receive loop. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.inner.shutdown().await;
        if let Some(task) = self.receive_task.lock().await.take() {
            task.abort();
        }
    }
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.events.send(event);
    }

    async fn set_state(&self, state: ClientState) {
        self.session.lock().await.state = state;
    }

    async fn write(&self, line: &str) -> Result<(), ChatError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChatError::NotConnected)?;
        if let Err(e) = write_line(writer, line).await {
            warn!("Write to server failed: {}", e);
            guard.take();
            drop(guard);
            self.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        {
            let mut session = self.session.lock().await;
            session.state = ClientState::Disconnected;
            session.room_key = None;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            info!("Disconnected from server");
            self.emit(ClientEvent::Disconnected);
        }
    }

    /// Handle one frame from the server. Returns false when the session must end.
    async fn process(&self, keypair: &KeyPair, message: Message) -> bool {
        match message {
            Message::KeyExchange { encrypted_key } => {
                match keypair.unwrap_symmetric_key(&encrypted_key) {
                    Ok(key) => {
                        let mut session = self.session.lock().await;
                        session.room_key = Some(key);
                        session.state = ClientState::SecureReady;
                        drop(session);
                        info!("Room key received; messages are now encrypted");
                        self.emit(ClientEvent::SecureChannel);
                    }
                    Err(e) => {
                        warn!("Key exchange failed: {}", e);
                        self.set_state(ClientState::OpenReady).await;
                        self.emit(ClientEvent::Diagnostic(format!(
                            "Secure channel unavailable, messages will be sent unencrypted ({})",
                            e
                        )));
                    }
                }
                true
            }
            Message::Chat { sender, message, encrypted } => {
                let sender = sender.unwrap_or_else(|| "Unknown".to_string());
                let body = if encrypted {
                    self.open(message).await
                } else {
                    MessageBody::Plain(message)
                };
                self.emit(ClientEvent::Message { sender, body, encrypted });
                true
            }
            Message::UserList { users } => {
                self.emit(ClientEvent::UserList(users));
                true
            }
            Message::System { message } => {
                if message == KEY_EXCHANGE_FAILED {
                    let mut session = self.session.lock().await;
                    if session.state == ClientState::Handshaking {
                        // the server could not wrap a key for us; no key_exchange will follow
                        session.state = ClientState::OpenReady;
                    }
                }
                self.emit(ClientEvent::System(message));
                true
            }
            Message::AuthError { message } => {
                warn!("Server rejected the handshake: {}", message);
                self.emit(ClientEvent::AuthError(message));
                false
            }
            Message::Handshake { .. } => {
                debug!("Ignoring handshake frame from server");
                true
            }
        }
    }

    async fn open(&self, payload: String) -> MessageBody {
        let room_key = self.session.lock().await.room_key.clone();
        let Some(key) = room_key else {
            return MessageBody::Undecryptable(payload);
        };
        match decrypt_payload(&key, &payload) {
            Ok(text) => MessageBody::Decrypted(text),
            Err(e) => {
                debug!("Could not decrypt message: {}", e);
                MessageBody::Undecryptable(payload)
            }
        }
    }
}

async fn receive_loop<R: AsyncRead + Unpin>(inner: Arc<Inner>, keypair: KeyPair, reader: R) {
    let mut frames = FrameReader::new(reader);
    loop {
        match frames.next_message().await {
            Ok(Some(message)) => {
                if !inner.process(&keypair, message).await {
                    break;
                }
            }
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Connection lost: {}", e);
                break;
            }
        }
    }
    inner.shutdown().await;
}
