//! Client side of a Tether connection.
//!
//! A [`Client`] discovers the server over HTTP, opens a WebSocket, and
//! drives the handshake to an encrypted, trusted session:
//!
//! 1. `Identify`, known or unknown
//! 2. device registration and prekey exchange, for new devices
//! 3. account verification, for verified sessions
//! 4. `StartSession`, then the trust check
//!
//! The state machine lives in [`Orchestrator`]; the [`Client`] wraps it
//! with the socket tasks, the keepalive monitor, and listener dispatch.
//! Identity and key storage are supplied by the embedding application
//! through [`IdentityStoreFactory`].

mod client;
mod config;
pub mod discovery;
mod error;
mod handlers;
mod lifecycle;
mod listener;
mod lock;
mod orchestrator;
mod sender;
mod state;
mod store;
mod verification;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{ClientError, IdentityStoreError};
pub use handlers::{FeatureHandler, HandlerChain};
pub use lifecycle::{HookHandle, Lifecycle};
pub use listener::{ClientListener, LoggingListener};
pub use lock::DirectoryLock;
pub use orchestrator::{Event, Orchestrator};
pub use sender::SenderBinding;
pub use state::{ConnectionState, HandshakePhase};
pub use store::{Bootstrap, IdentityStore, IdentityStoreFactory};
pub use verification::{AccountVerifier, Unverified};
