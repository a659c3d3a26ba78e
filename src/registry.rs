use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio::time::timeout;
use log::{debug, warn};
use crate::config::DEFAULT_WRITE_TIMEOUT;
use crate::cryptography::RoomKey;
use crate::error::ChatError;
use crate::networking::write_line;

/// Write half of a peer's stream, owned by the registry once the peer is registered.
pub type ConnectionWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identifies one accepted connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered peer.
pub struct Connection {
    pub identity: String,
    pub session: SessionId,
    /// PEM public key from the peer's handshake
    pub public_key: String,
    pub room_key: RoomKey,
    /// Whether the peer was greeted with its wrapped room key.
    pub handshake_complete: bool,
    writer: ConnectionWriter,
}

impl Connection {
    pub fn new(
        identity: String,
        session: SessionId,
        public_key: String,
        room_key: RoomKey,
        writer: ConnectionWriter,
    ) -> Self {
        Connection {
            identity,
            session,
            public_key,
            room_key,
            handshake_complete: false,
            writer,
        }
    }

    /// Give the stream back, e.g. after a rejected registration.
    pub fn into_writer(self) -> ConnectionWriter {
        self.writer
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("session", &self.session)
            .field("handshake_complete", &self.handshake_complete)
            .finish_non_exhaustive()
    }
}

/// Registration refused because the identity is taken. Carries the rejected
/// connection so the caller can still answer on its stream.
#[derive(Debug)]
pub struct DuplicateIdentity(pub Connection);

impl fmt::Display for DuplicateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity '{}' is already registered", self.0.identity)
    }
}

impl std::error::Error for DuplicateIdentity {}

/// Why [`Registry::register_with_greeting`] did not store a connection.
#[derive(Debug)]
pub enum RegisterError {
    /// The identity is taken. The connection is handed back untouched.
    Duplicate(DuplicateIdentity),
    /// The greeting could not be written. The connection has been dropped.
    Unreachable(ChatError),
}

/// Every live, registered connection, in registration order.
///
/// All reads and writes of the map go through one mutex. Deliveries are made
/// while it is held, so a broadcast reaches every recipient before the next
/// one starts and per-sender ordering is preserved.
///
/// The price is that a stalled peer holds up every other handler, roster
/// snapshots included, for up to `write_timeout` per delivery before it is
/// evicted. Keep the timeout short relative to how long the room may pause.
#[derive(Clone)]
pub struct Registry {
    connections: Arc<Mutex<Vec<Connection>>>,
    write_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new(DEFAULT_WRITE_TIMEOUT)
    }
}

impl Registry {
    pub fn new(write_timeout: Duration) -> Self {
        Registry {
            connections: Arc::new(Mutex::new(Vec::new())),
            write_timeout,
        }
    }

    /// Store `connection` iff its identity is not already present.
    pub async fn register(&self, connection: Connection) -> Result<(), DuplicateIdentity> {
        let mut connections = self.connections.lock().await;
        if connections.iter().any(|c| c.identity == connection.identity) {
            return Err(DuplicateIdentity(connection));
        }
        debug!("Registered {} (session {})", connection.identity, connection.session);
        connections.push(connection);
        Ok(())
    }

    /// Register `connection` and write `greeting` to it as one step.
    ///
    /// The greeting is delivered while the registry is locked, so it is the
    /// first frame the new peer receives: no broadcast from another handler
    /// can get in ahead of it.
    ///
    /// # Arguments
    /// * `connection` - The peer to store. Its identity must be free.
    /// * `greeting` - One serialized line, usually the peer's `key_exchange`.
    ///
    /// # Returns
    /// `Ok(())` once the peer is stored and greeted. On a failed or timed out
    /// greeting write the peer is not stored and its stream is dropped.
    pub async fn register_with_greeting(&self, mut connection: Connection, greeting: &str) -> Result<(), RegisterError> {
        let mut connections = self.connections.lock().await;
        if connections.iter().any(|c| c.identity == connection.identity) {
            return Err(RegisterError::Duplicate(DuplicateIdentity(connection)));
        }
        if let Err(e) = deliver(&mut connection, greeting, self.write_timeout).await {
            warn!("Could not greet {}: {}", connection.identity, e);
            return Err(RegisterError::Unreachable(e));
        }
        debug!("Registered {} (session {})", connection.identity, connection.session);
        connections.push(connection);
        Ok(())
    }

    /// Remove `identity` if present. Returns whether anything was removed.
    pub async fn unregister(&self, identity: &str) -> bool {
        let mut connections = self.connections.lock().await;
        let before = connections.len();
        connections.retain(|c| c.identity != identity);
        before != connections.len()
    }

    /// Remove `identity` only if it still belongs to `session`.
    pub async fn unregister_session(&self, identity: &str, session: SessionId) -> bool {
        let mut connections = self.connections.lock().await;
        remove_session(&mut connections, identity, session)
    }

    /// Drop whatever `session` still holds and report whether `identity` is now
    /// free, i.e. this session was its last owner. A session that was evicted
    /// and whose name has since been taken by someone else gets `false`.
    pub async fn release(&self, identity: &str, session: SessionId) -> bool {
        let mut connections = self.connections.lock().await;
        remove_session(&mut connections, identity, session);
        !connections.iter().any(|c| c.identity == identity)
    }

    pub async fn snapshot_identities(&self) -> Vec<String> {
        let connections = self.connections.lock().await;
        connections.iter().map(|c| c.identity.clone()).collect()
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.connections.lock().await.iter().any(|c| c.identity == identity)
    }

    /// Whether `identity` is registered and still owned by `session`.
    pub async fn holds(&self, identity: &str, session: SessionId) -> bool {
        let connections = self.connections.lock().await;
        find_session(&connections, identity, session).is_some()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn room_key(&self, identity: &str) -> Option<RoomKey> {
        let connections = self.connections.lock().await;
        connections
            .iter()
            .find(|c| c.identity == identity)
            .map(|c| c.room_key.clone())
    }

    /// Send `line` to everyone but `exclude`. Returns the identities evicted
    /// because their write failed.
    pub async fn broadcast(&self, line: &str, exclude: Option<&str>) -> Vec<String> {
        self.broadcast_with(exclude, |_| Some(line.to_string())).await
    }

    /// Like [`Registry::broadcast`], with the payload built per recipient.
    ///
    /// `payload` is called once for every registered connection except
    /// `exclude`, in registration order, with the lock held. Recipients for
    /// which it returns `None` are skipped; this is how per-peer keys reseal
    /// a message for each reader.
    ///
    /// # Arguments
    /// * `exclude` - Identity that receives nothing, usually the sender
    /// * `payload` - Builds the line for one recipient identity
    ///
    /// # Returns
    /// The identities evicted because their write failed or timed out. They
    /// are already gone from the registry when this returns.
    pub async fn broadcast_with<F>(&self, exclude: Option<&str>, payload: F) -> Vec<String>
    where
        F: FnMut(&Connection) -> Option<String>,
    {
        let mut connections = self.connections.lock().await;
        fan_out(&mut connections, exclude, payload, self.write_timeout).await
    }

    /// Relay on behalf of `sender`: like [`Registry::broadcast_with`] excluding
    /// the sender, but only while `session` still owns that identity. The
    /// ownership check and the deliveries happen under one lock.
    ///
    /// # Returns
    /// The evicted identities, or `NotRegistered` if the sender's session is no
    /// longer in the registry (evicted, or its name re-registered by another
    /// connection). Nothing is delivered in that case.
    pub async fn broadcast_from<F>(&self, sender: &str, session: SessionId, payload: F) -> Result<Vec<String>, ChatError>
    where
        F: FnMut(&Connection) -> Option<String>,
    {
        let mut connections = self.connections.lock().await;
        if find_session(&connections, sender, session).is_none() {
            return Err(ChatError::NotRegistered(sender.to_string()));
        }
        Ok(fan_out(&mut connections, Some(sender), payload, self.write_timeout).await)
    }

    /// Unicast. A failed write evicts the recipient.
    pub async fn send_to(&self, identity: &str, line: &str) -> Result<(), ChatError> {
        let mut connections = self.connections.lock().await;
        let index = connections
            .iter()
            .position(|c| c.identity == identity)
            .ok_or_else(|| ChatError::NotRegistered(identity.to_string()))?;
        unicast(&mut connections, index, line, self.write_timeout).await
    }

    /// Unicast to `identity` only while `session` still owns it.
    pub async fn send_to_session(&self, identity: &str, session: SessionId, line: &str) -> Result<(), ChatError> {
        let mut connections = self.connections.lock().await;
        let index = find_session(&connections, identity, session)
            .ok_or_else(|| ChatError::NotRegistered(identity.to_string()))?;
        unicast(&mut connections, index, line, self.write_timeout).await
    }
}

fn find_session(connections: &[Connection], identity: &str, session: SessionId) -> Option<usize> {
    connections
        .iter()
        .position(|c| c.identity == identity && c.session == session)
}

fn remove_session(connections: &mut Vec<Connection>, identity: &str, session: SessionId) -> bool {
    match find_session(connections, identity, session) {
        Some(index) => {
            connections.remove(index);
            true
        }
        None => false,
    }
}

async fn unicast(connections: &mut Vec<Connection>, index: usize, line: &str, limit: Duration) -> Result<(), ChatError> {
    if let Err(e) = deliver(&mut connections[index], line, limit).await {
        warn!("Evicting {}: {}", connections[index].identity, e);
        connections.remove(index);
        return Err(e);
    }
    Ok(())
}

async fn fan_out<F>(connections: &mut Vec<Connection>, exclude: Option<&str>, mut payload: F, limit: Duration) -> Vec<String>
where
    F: FnMut(&Connection) -> Option<String>,
{
    let mut evicted = Vec::new();

    for connection in connections.iter_mut() {
        if exclude == Some(connection.identity.as_str()) {
            continue;
        }
        let Some(line) = payload(&*connection) else {
            continue;
        };
        if let Err(e) = deliver(connection, &line, limit).await {
            warn!("Evicting {}: {}", connection.identity, e);
            evicted.push(connection.session);
        }
    }

    let mut evicted_identities = Vec::with_capacity(evicted.len());
    connections.retain(|c| {
        if evicted.contains(&c.session) {
            evicted_identities.push(c.identity.clone());
            false
        } else {
            true
        }
    });
    evicted_identities
}

async fn deliver(connection: &mut Connection, line: &str, limit: Duration) -> Result<(), ChatError> {
    match timeout(limit, write_line(&mut connection.writer, line)).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}
