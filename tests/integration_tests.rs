// Integration tests for the murmur chat relay
// These tests run a real server on a loopback port and drive it with real clients

use murmur::{
    client::{ChatClient, ClientEvent, ClientState, MessageBody},
    config::{ClientConfig, ServerConfig},
    cryptography::{decrypt_payload, KeyMode, KeyPair, RoomKey},
    messages::Message,
    networking::{write_frame, FrameReader},
    server::{ChatServer, IDENTITY_TAKEN, INVALID_SECRET, KEY_EXCHANGE_FAILED, WELCOME},
    MAX_FRAME_LEN,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};

const TEST_RSA_BITS: usize = 1024;
const WAIT: Duration = Duration::from_secs(10);

async fn start_server(config: ServerConfig) -> u16 {
    let listener = ChatServer::bind(&config.clone().with_port(0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(ChatServer::new(&config).serve(listener));
    port
}

fn client_config(name: &str, port: u16) -> ClientConfig {
    ClientConfig::new(name)
        .with_server("127.0.0.1", port)
        .with_rsa_bits(TEST_RSA_BITS)
}

async fn next_matching<F>(events: &mut UnboundedReceiver<ClientEvent>, mut wanted: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Connect and wait until the server has welcomed us.
async fn join(name: &str, port: u16) -> (ChatClient, UnboundedReceiver<ClientEvent>) {
    let (client, mut events) = ChatClient::connect(&client_config(name, port)).await.unwrap();
    next_matching(&mut events, |e| *e == ClientEvent::System(WELCOME.to_string())).await;
    (client, events)
}

fn is_roster_of(event: &ClientEvent, len: usize) -> bool {
    matches!(event, ClientEvent::UserList(users) if users.len() == len)
}

/// A client speaking raw frames, for cases the real client never produces.
struct RawPeer {
    frames: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (reader, writer) = stream.into_split();
        RawPeer { frames: FrameReader::new(reader), writer }
    }

    async fn send(&mut self, message: &Message) {
        write_frame(&mut self.writer, message).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Message> {
        timeout(WAIT, self.frames.next_message())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
    }

    async fn recv_until<F: FnMut(&Message) -> bool>(&mut self, mut wanted: F) -> Message {
        loop {
            let message = self.recv().await.expect("server closed the connection");
            if wanted(&message) {
                return message;
            }
        }
    }
}

// ============================================================================
// Registration and Roster Tests
// ============================================================================

#[tokio::test]
async fn test_roster_follows_registration_order() {
    let port = start_server(ServerConfig::default()).await;

    let (alice, mut alice_events) = join("alice", port).await;
    let (_bob, _) = join("bob", port).await;
    let (_carol, _) = join("carol", port).await;

    let roster = next_matching(&mut alice_events, |e| is_roster_of(e, 3)).await;
    assert_eq!(
        roster,
        ClientEvent::UserList(vec!["alice".into(), "bob".into(), "carol".into()])
    );
    assert_eq!(alice.state().await, ClientState::SecureReady);
}

#[tokio::test]
async fn test_join_is_announced_to_others_only() {
    let port = start_server(ServerConfig::default()).await;

    let (_alice, mut alice_events) = join("alice", port).await;
    let (_bob, mut bob_events) = join("bob", port).await;

    let notice = next_matching(&mut alice_events, |e| matches!(e, ClientEvent::System(_))).await;
    assert_eq!(notice, ClientEvent::System("bob has joined the chat".into()));

    // bob already consumed his welcome; nothing about his own join may follow
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = bob_events.try_recv() {
        assert_ne!(event, ClientEvent::System("bob has joined the chat".into()));
    }
}

#[tokio::test]
async fn test_duplicate_identity_rejected_and_never_listed() {
    let port = start_server(ServerConfig::default()).await;
    let (_alice, mut alice_events) = join("alice", port).await;

    let (_impostor, mut impostor_events) = ChatClient::connect(&client_config("alice", port)).await.unwrap();
    let reply = next_matching(&mut impostor_events, |e| matches!(e, ClientEvent::System(_))).await;
    assert_eq!(reply, ClientEvent::System(IDENTITY_TAKEN.into()));

    let (_bob, _) = join("bob", port).await;
    let roster = next_matching(&mut alice_events, |e| is_roster_of(e, 2)).await;
    assert_eq!(roster, ClientEvent::UserList(vec!["alice".into(), "bob".into()]));
}

#[tokio::test]
async fn test_concurrent_duplicate_identity_admits_one() {
    let port = start_server(ServerConfig::default()).await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        tasks.push(tokio::spawn(async move {
            let (client, mut events) = ChatClient::connect(&client_config("dup", port)).await.unwrap();
            let outcome = next_matching(&mut events, |e| {
                *e == ClientEvent::SecureChannel || *e == ClientEvent::System(IDENTITY_TAKEN.into())
            })
            .await;
            (client, outcome == ClientEvent::SecureChannel)
        }));
    }

    let mut admitted = 0;
    let mut clients = Vec::new();
    for task in tasks {
        let (client, accepted) = task.await.unwrap();
        if accepted {
            admitted += 1;
        }
        clients.push(client);
    }
    assert_eq!(admitted, 1);
}

// ============================================================================
// Encrypted Relay Tests
// ============================================================================

#[tokio::test]
async fn test_encrypted_message_reaches_every_peer() {
    let port = start_server(ServerConfig::default()).await;

    let (alice, mut alice_events) = join("alice", port).await;
    let (_bob, mut bob_events) = join("bob", port).await;
    let (_carol, mut carol_events) = join("carol", port).await;

    alice.send("hello").await.unwrap();

    let expected = ClientEvent::Message {
        sender: "alice".into(),
        body: MessageBody::Decrypted("hello".into()),
        encrypted: true,
    };
    for events in [&mut bob_events, &mut carol_events] {
        let received = next_matching(events, |e| matches!(e, ClientEvent::Message { .. })).await;
        assert_eq!(received, expected);
    }

    // delivery confirmation goes back to the sender
    let echo = next_matching(&mut alice_events, |e| matches!(e, ClientEvent::Message { .. })).await;
    assert_eq!(echo, expected);
}

#[tokio::test]
async fn test_relay_preserves_per_sender_order() {
    let port = start_server(ServerConfig::default()).await;

    let (alice, _alice_events) = join("alice", port).await;
    let (_bob, mut bob_events) = join("bob", port).await;

    for i in 0..10 {
        alice.send(&format!("message {}", i)).await.unwrap();
    }
    for i in 0..10 {
        let received = next_matching(&mut bob_events, |e| matches!(e, ClientEvent::Message { .. })).await;
        let ClientEvent::Message { body, .. } = received else { unreachable!() };
        assert_eq!(body, MessageBody::Decrypted(format!("message {}", i)));
    }
}

#[tokio::test]
async fn test_peer_without_key_cannot_read_encrypted_traffic() {
    let port = start_server(ServerConfig::default()).await;
    let (alice, mut alice_events) = join("alice", port).await;

    // A malformed public key still registers, but no room key is handed out.
    let mut eve = RawPeer::connect(port).await;
    eve.send(&Message::handshake("eve", "not a public key".into(), None)).await;
    assert_eq!(eve.recv().await, Some(Message::system(KEY_EXCHANGE_FAILED)));
    next_matching(&mut alice_events, |e| is_roster_of(e, 2)).await;

    alice.send("hello").await.unwrap();
    let Message::Chat { sender, message, encrypted } =
        eve.recv_until(|m| matches!(m, Message::Chat { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(sender.as_deref(), Some("alice"));
    assert!(encrypted);
    assert!(!message.contains("hello"));
    assert!(decrypt_payload(&RoomKey::generate(), &message).is_err());

    // plaintext from eve still reaches alice, marked as such
    eve.send(&Message::outgoing("hi in the clear".into(), false)).await;
    let received = next_matching(&mut alice_events, |e| {
        matches!(e, ClientEvent::Message { sender, .. } if sender == "eve")
    })
    .await;
    assert_eq!(
        received,
        ClientEvent::Message {
            sender: "eve".into(),
            body: MessageBody::Plain("hi in the clear".into()),
            encrypted: false,
        }
    );
}

#[tokio::test]
async fn test_per_peer_keys_reencrypt_for_each_recipient() {
    let config = ServerConfig::default().with_key_mode(KeyMode::PerPeer);
    let port = start_server(config).await;

    let (alice, mut alice_events) = join("alice", port).await;
    let (_bob, mut bob_events) = join("bob", port).await;

    alice.send("hello").await.unwrap();

    let expected = ClientEvent::Message {
        sender: "alice".into(),
        body: MessageBody::Decrypted("hello".into()),
        encrypted: true,
    };
    let received = next_matching(&mut bob_events, |e| matches!(e, ClientEvent::Message { .. })).await;
    assert_eq!(received, expected);
    let echo = next_matching(&mut alice_events, |e| matches!(e, ClientEvent::Message { .. })).await;
    assert_eq!(echo, expected);
}

// ============================================================================
// Disconnect and Authentication Tests
// ============================================================================

#[tokio::test]
async fn test_departure_announced_once() {
    let port = start_server(ServerConfig::default()).await;

    let (_alice, mut alice_events) = join("alice", port).await;
    let (bob, _bob_events) = join("bob", port).await;
    next_matching(&mut alice_events, |e| is_roster_of(e, 2)).await;

    bob.disconnect().await;

    let notice = next_matching(&mut alice_events, |e| matches!(e, ClientEvent::System(_))).await;
    assert_eq!(notice, ClientEvent::System("bob has left the chat".into()));
    let roster = next_matching(&mut alice_events, |e| matches!(e, ClientEvent::UserList(_))).await;
    assert_eq!(roster, ClientEvent::UserList(vec!["alice".into()]));

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = alice_events.try_recv() {
        assert_ne!(event, ClientEvent::System("bob has left the chat".into()));
    }
}

#[tokio::test]
async fn test_wrong_room_secret_closes_connection() {
    let port = start_server(ServerConfig::default().with_room_secret("s3cr3t")).await;

    let config = client_config("mallory", port).with_room_secret("guess");
    let (client, mut events) = ChatClient::connect(&config).await.unwrap();
    assert_eq!(
        next_matching(&mut events, |_| true).await,
        ClientEvent::AuthError(INVALID_SECRET.into())
    );
    assert_eq!(next_matching(&mut events, |_| true).await, ClientEvent::Disconnected);
    assert!(client.send("let me in").await.is_err());

    // at the wire level the server hangs up right after the auth error
    let mut raw = RawPeer::connect(port).await;
    raw.send(&Message::handshake("mallory", "pem".into(), None)).await;
    assert_eq!(raw.recv().await, Some(Message::auth_error(INVALID_SECRET)));
    assert_eq!(raw.recv().await, None);
}

#[tokio::test]
async fn test_correct_room_secret_admits() {
    let port = start_server(ServerConfig::default().with_room_secret("s3cr3t")).await;

    let config = client_config("alice", port).with_room_secret("s3cr3t");
    let (client, mut events) = ChatClient::connect(&config).await.unwrap();
    next_matching(&mut events, |e| *e == ClientEvent::System(WELCOME.into())).await;
    assert_eq!(client.state().await, ClientState::SecureReady);
}

#[tokio::test]
async fn test_garbage_does_not_disturb_server() {
    let port = start_server(ServerConfig::default()).await;

    let mut raw = RawPeer::connect(port).await;
    raw.writer.write_all(b"this is not json\n{\"type\":\"nonsense\"}\n").await.unwrap();
    raw.send(&Message::outgoing("before handshake".into(), false)).await;
    raw.send(&Message::handshake("raw", "bad pem".into(), None)).await;
    assert_eq!(raw.recv().await, Some(Message::system(KEY_EXCHANGE_FAILED)));

    let (_alice, mut alice_events) = join("alice", port).await;
    let roster = next_matching(&mut alice_events, |e| matches!(e, ClientEvent::UserList(_))).await;
    assert_eq!(roster, ClientEvent::UserList(vec!["raw".into(), "alice".into()]));
}

#[tokio::test]
async fn test_oversized_frame_skipped_over_tcp() {
    let port = start_server(ServerConfig::default()).await;

    let mut raw = RawPeer::connect(port).await;
    raw.writer.write_all(&vec![b'{'; MAX_FRAME_LEN + 1024]).await.unwrap();
    raw.writer.write_all(b"\n").await.unwrap();
    raw.send(&Message::handshake("raw", "bad pem".into(), None)).await;
    assert_eq!(raw.recv().await, Some(Message::system(KEY_EXCHANGE_FAILED)));
}

// ============================================================================
// Ordering Under Load
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_key_exchange_first_while_room_is_busy() {
    let port = start_server(ServerConfig::default()).await;
    let (alice, _alice_events) = join("alice", port).await;
    let pem = KeyPair::generate_with_bits(TEST_RSA_BITS).unwrap().export_public_key().unwrap();

    let chatter = tokio::spawn(async move {
        for i in 0..200 {
            alice.send(&format!("noise {}", i)).await.unwrap();
        }
        alice
    });

    let mut newcomers = Vec::new();
    for i in 0..10 {
        let mut peer = RawPeer::connect(port).await;
        peer.send(&Message::handshake(&format!("peer{}", i), pem.clone(), None)).await;
        let first = peer.recv().await.expect("server closed the connection");
        assert!(matches!(first, Message::KeyExchange { .. }), "peer{} first saw {:?}", i, first);
        newcomers.push(peer);
    }

    chatter.await.unwrap().disconnect().await;
}

