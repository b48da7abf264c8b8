//! End-to-end client tests against a scripted in-process server.
//!
//! The server answers `GET /api/discover` with a canned document and
//! upgrades every other request to a WebSocket that plays the server side
//! of the handshake. Both share one port, split by peeking the request
//! line.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether_client::discovery::{DiscoverResponse, Feature, Version};
use tether_client::{
    Bootstrap, Client, ClientConfig, ClientError, ClientListener, ConnectionState, DirectoryLock,
    FeatureHandler, IdentityStore, IdentityStoreError, IdentityStoreFactory, Lifecycle,
};
use tether_protocol::testing::{PairCipher, identity};
use tether_protocol::{
    Cipher, FeatureMessage, Identity, JsonCodec, PacketCodec, PlayerSession, PreKeyBundle,
    PrivateIdentityToken, Profile, Request, Response, SendPreKeysRequest, ServerIdentity,
    SessionMode,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// Identity store
// =========================================================================

struct MemoryStore {
    identity: Identity,
}

impl IdentityStore for MemoryStore {
    fn create_cipher(&self) -> Arc<dyn Cipher> {
        Arc::new(PairCipher::new(self.identity.clone()))
    }

    fn current_identity(&self) -> Identity {
        self.identity.clone()
    }

    fn private_identity_token(&self) -> PrivateIdentityToken {
        PrivateIdentityToken(vec![1, 2, 3])
    }

    fn trust_identity(
        &mut self,
        _identity: &ServerIdentity,
        _bundle: PreKeyBundle,
    ) -> Result<(), IdentityStoreError> {
        Ok(())
    }

    fn process_device_registered(
        &mut self,
        _profile: Profile,
        device_id: u32,
    ) -> Result<(), IdentityStoreError> {
        self.identity.device_id = Some(device_id);
        Ok(())
    }

    fn create_prekey_request(
        &mut self,
        _target: Option<&ServerIdentity>,
    ) -> Result<SendPreKeysRequest, IdentityStoreError> {
        Ok(SendPreKeysRequest {
            identity: Some(self.identity.clone()),
            bundle: PreKeyBundle(vec![0]),
        })
    }

    fn save(&self) -> Result<(), IdentityStoreError> {
        Ok(())
    }

    fn clear_all_group_sessions(&mut self) {}
}

struct MemoryFactory {
    exists: bool,
    identity: Identity,
}

impl IdentityStoreFactory for MemoryFactory {
    type Store = MemoryStore;

    fn exists(&self) -> bool {
        self.exists
    }

    fn open(&self, _owner: Option<Uuid>) -> Result<Bootstrap<MemoryStore>, IdentityStoreError> {
        let store = MemoryStore {
            identity: self.identity.clone(),
        };
        Ok(if self.exists {
            Bootstrap::ExistingInstallation(store)
        } else {
            Bootstrap::NewInstallation(store)
        })
    }
}

// =========================================================================
// Listener and handler
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Note {
    State(ConnectionState),
    Error(String),
    ConfirmDevice(String),
    Feature(FeatureMessage),
}

struct Recorder(UnboundedSender<Note>);

impl ClientListener for Recorder {
    fn on_state_changed(&self, state: ConnectionState) {
        let _ = self.0.send(Note::State(state));
    }

    fn on_error(&self, message: &str) {
        let _ = self.0.send(Note::Error(message.to_string()));
    }

    fn on_confirm_device_registration(&self, _token: &str, url: &str) {
        let _ = self.0.send(Note::ConfirmDevice(url.to_string()));
    }
}

impl FeatureHandler for Recorder {
    fn handle_response(&self, message: &FeatureMessage) -> bool {
        let _ = self.0.send(Note::Feature(message.clone()));
        true
    }
}

/// Waits for the first note matching `pred`, skipping others.
async fn wait_for(rx: &mut UnboundedReceiver<Note>, pred: impl Fn(&Note) -> bool) -> Note {
    timeout(WAIT, async {
        loop {
            let note = rx.recv().await.expect("listener channel closed");
            if pred(&note) {
                return note;
            }
        }
    })
    .await
    .expect("timed out waiting for listener note")
}

// =========================================================================
// Scripted server
// =========================================================================

fn discovery(versions: Vec<Version>) -> DiscoverResponse {
    let mut features = vec![Feature {
        name: "auth:verification_scheme".into(),
        value: serde_json::json!("nojang"),
    }];
    for name in ["groups:locations", "groups:waypoints", "profile:friends"] {
        features.push(Feature {
            name: name.into(),
            value: serde_json::Value::Null,
        });
    }
    DiscoverResponse { versions, features }
}

/// Starts the server and returns its base URL.
async fn spawn_server(document: DiscoverResponse, client: Identity) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let document = Arc::new(serde_json::to_vec(&document).unwrap());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let document = Arc::clone(&document);
            let client = client.clone();
            tokio::spawn(async move {
                if is_discovery(&stream).await {
                    serve_discovery(stream, &document).await;
                } else {
                    serve_socket(stream, client).await;
                }
            });
        }
    });

    format!("http://{addr}")
}

async fn is_discovery(stream: &TcpStream) -> bool {
    let target = b"GET /api/discover";
    let mut buf = [0u8; 32];
    loop {
        let n = stream.peek(&mut buf).await.unwrap_or(0);
        if n == 0 {
            return false;
        }
        if n >= target.len() {
            return &buf[..target.len()] == target;
        }
        tokio::task::yield_now().await;
    }
}

async fn serve_discovery(mut stream: TcpStream, body: &[u8]) {
    // The request has no body; consume the headers before answering.
    let mut seen = Vec::new();
    let mut chunk = [0u8; 512];
    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
        stream.readable().await.unwrap();
        match stream.try_read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => seen.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => return,
        }
    }
    let head = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body).await;
    let _ = stream.shutdown().await;
}

/// Plays the server side of the handshake for `client`.
///
/// A returning client is identified straight away; an unknown one is
/// asked to register its device and never approved.
async fn serve_socket(stream: TcpStream, client: Identity) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let server = ServerIdentity(identity());
    let codec = PacketCodec::with_cipher(
        JsonCodec,
        Arc::new(PairCipher::new(server.as_identity().clone())),
    );
    let mut trusted = false;

    while let Some(Ok(message)) = ws.next().await {
        let Message::Binary(bytes) = message else {
            continue;
        };
        let Ok(Some(request)) = codec.decode::<Request>(Some(&client), &bytes) else {
            continue;
        };
        let reply = match request {
            Request::Identify { identity: None, .. } => Some(Response::RegisterDevice {
                approval_url: "https://tether.test/approve".into(),
                approval_token: "pending".into(),
            }),
            Request::Identify { .. } => Some(Response::Identify {
                profile: Profile { id: client.owner },
                server_public_key: vec![],
                shared_secret: vec![],
            }),
            Request::StartSession { .. } => Some(Response::StartSession),
            Request::CheckTrustRelationship { .. } => Some(Response::IsTrustedRelationship {
                identity: server.clone(),
            }),
            Request::KeepAlive { .. } => Some(Response::KeepAlive),
            Request::Feature(message) => Some(Response::Feature(message)),
            Request::SendPreKeys(_) => None,
        };
        let Some(reply) = reply else {
            continue;
        };
        let becomes_trusted = matches!(reply, Response::IsTrustedRelationship { .. });
        let bytes = if trusted {
            codec.encode_encrypted(Some(&client), &reply).unwrap()
        } else {
            codec.encode_plain(&reply).unwrap()
        };
        trusted |= becomes_trusted;
        if ws.send(Message::Binary(bytes.into())).await.is_err() {
            return;
        }
    }
}

// =========================================================================
// Helpers
// =========================================================================

fn session() -> PlayerSession {
    PlayerSession {
        player_id: Uuid::new_v4(),
        username: "alex".into(),
        server: "alpha".into(),
        mode: SessionMode::Unverified,
        access_token: None,
    }
}

struct Setup {
    client: Client<MemoryFactory>,
    notes: UnboundedReceiver<Note>,
}

fn client(url: &str, home: &Path, exists: bool, me: Identity, approval: Option<Duration>) -> Setup {
    let (tx, notes) = mpsc::unbounded_channel();
    let mut config = ClientConfig::builder(url, session()).home_dir(home);
    if let Some(approval) = approval {
        config = config.device_approval_timeout(approval);
    }
    let client = Client::builder(config.build(), MemoryFactory { exists, identity: me })
        .listener(Recorder(tx.clone()))
        .handler(Arc::new(Recorder(tx)))
        .build()
        .unwrap();
    Setup { client, notes }
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_connect_returning_client_reaches_connected_and_exchanges_features() {
    let me = identity();
    let url = spawn_server(discovery(vec![Version { major: 0, minor: 1 }]), me.clone()).await;
    let home = tempfile::tempdir().unwrap();
    let mut s = client(&url, home.path(), true, me.clone(), None);

    s.client.connect().await.unwrap();
    wait_for(&mut s.notes, |n| n == &Note::State(ConnectionState::Connecting)).await;
    wait_for(&mut s.notes, |n| n == &Note::State(ConnectionState::Connected)).await;
    assert_eq!(s.client.identity(), Some(me));
    assert!(s.client.server_identity().is_some());

    let message = FeatureMessage::new("echo", vec![7, 7]);
    s.client.send(&Request::Feature(message.clone())).unwrap();
    let echoed = wait_for(&mut s.notes, |n| matches!(n, Note::Feature(_))).await;
    assert_eq!(echoed, Note::Feature(message));

    s.client.disconnect();
    wait_for(&mut s.notes, |n| n == &Note::State(ConnectionState::Disconnected)).await;
    assert!(DirectoryLock::acquire(home.path()).is_ok());
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let me = identity();
    let url = spawn_server(discovery(vec![Version { major: 0, minor: 1 }]), me.clone()).await;
    let home = tempfile::tempdir().unwrap();
    let s = client(&url, home.path(), true, me, None);

    s.client.connect().await.unwrap();
    let second = s.client.connect().await;

    assert!(matches!(second, Err(ClientError::AlreadyConnected(_))));
}

#[tokio::test]
async fn test_connect_incompatible_version_fails_and_releases_lock() {
    let me = identity();
    let url = spawn_server(discovery(vec![Version { major: 0, minor: 2 }]), me.clone()).await;
    let home = tempfile::tempdir().unwrap();
    let s = client(&url, home.path(), true, me, None);

    let result = s.client.connect().await;

    match result {
        Err(ClientError::UnsupportedServerVersion { client, server }) => {
            assert_eq!(client, "0.1");
            assert_eq!(server, "0.2");
        }
        other => panic!("expected version mismatch, got {other:?}"),
    }
    assert_eq!(s.client.state(), ConnectionState::Disconnected);
    assert!(DirectoryLock::acquire(home.path()).is_ok());
}

#[tokio::test]
async fn test_connect_unreachable_server_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let home = tempfile::tempdir().unwrap();
    let s = client(&format!("http://{addr}"), home.path(), true, identity(), None);

    let result = s.client.connect().await;

    assert!(matches!(result, Err(ClientError::Connection { .. })));
}

#[tokio::test]
async fn test_second_client_on_same_home_is_locked_out() {
    let me = identity();
    let url = spawn_server(discovery(vec![Version { major: 0, minor: 1 }]), me.clone()).await;
    let home = tempfile::tempdir().unwrap();
    let first = client(&url, home.path(), true, me.clone(), None);
    let mut second = client(&url, home.path(), true, me, None);

    first.client.connect().await.unwrap();
    let result = second.client.connect().await;

    assert!(matches!(result, Err(ClientError::DirectoryLocked(_))));
    let note = wait_for(&mut second.notes, |n| matches!(n, Note::Error(_))).await;
    assert!(matches!(note, Note::Error(m) if m.contains("another client")));
}

#[tokio::test]
async fn test_unapproved_device_times_out_and_disconnects() {
    let me = identity();
    let url = spawn_server(discovery(vec![Version { major: 0, minor: 1 }]), me.clone()).await;
    let home = tempfile::tempdir().unwrap();
    let mut s = client(
        &url,
        home.path(),
        false,
        me,
        Some(Duration::from_millis(200)),
    );

    s.client.connect().await.unwrap();

    let confirm = wait_for(&mut s.notes, |n| matches!(n, Note::ConfirmDevice(_))).await;
    assert_eq!(confirm, Note::ConfirmDevice("https://tether.test/approve".into()));
    let error = wait_for(&mut s.notes, |n| matches!(n, Note::Error(_))).await;
    assert!(matches!(error, Note::Error(m) if m.contains("not approved")));
    wait_for(&mut s.notes, |n| n == &Note::State(ConnectionState::Disconnected)).await;
    assert_eq!(s.client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_hook_releases_lock_and_drop_deregisters_it() {
    let me = identity();
    let url = spawn_server(discovery(vec![Version { major: 0, minor: 1 }]), me.clone()).await;
    let home = tempfile::tempdir().unwrap();
    let lifecycle = Lifecycle::new();
    let config = ClientConfig::builder(&url, session())
        .home_dir(home.path())
        .build();
    let client = Client::builder(config, MemoryFactory { exists: true, identity: me })
        .lifecycle(&lifecycle)
        .build()
        .unwrap();
    assert_eq!(lifecycle.hook_count(), 1);

    client.connect().await.unwrap();
    assert!(DirectoryLock::acquire(home.path()).is_err());

    lifecycle.shutdown();
    assert!(DirectoryLock::acquire(home.path()).is_ok());

    let other = Lifecycle::new();
    let config = ClientConfig::builder(&url, session())
        .home_dir(home.path())
        .build();
    let second = Client::builder(config, MemoryFactory { exists: true, identity: identity() })
        .lifecycle(&other)
        .build()
        .unwrap();
    assert_eq!(other.hook_count(), 1);
    drop(second);
    assert_eq!(other.hook_count(), 0);
}
