//! # Tether
//!
//! Encrypted, identity-bound sessions between clients and a server over
//! persistent WebSocket connections.
//!
//! A client proves who it is with a device identity and a game session,
//! exchanges prekeys, and ends up in an encrypted, trusted session. The
//! server keeps a directory of which connection belongs to which identity
//! and which in-game player.
//!
//! This crate ties the layers together:
//!
//! - [`TetherServer`]: accept loop and per-connection handling on top of
//!   the session directory
//! - [`client`]: the client handshake orchestrator
//! - [`protocol`]: identities, messages and the packet envelope
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! // Implement ServerIdentityStore and RequestHandler, then:
//! // tether::init_tracing();
//! // let server = TetherServer::builder()
//! //     .bind("0.0.0.0:8080")
//! //     .build(my_store, my_handler)
//! //     .await?;
//! // server.run().await
//! ```

mod error;
mod handler;
mod server;

pub use error::TetherError;
pub use handler::RequestContext;
pub use server::{RequestHandler, ServerIdentityStore, TetherServer, TetherServerBuilder};

pub use tether_client as client;
pub use tether_keepalive as keepalive;
pub use tether_protocol as protocol;
pub use tether_session as session;
pub use tether_transport as transport;

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling it
/// again, or after another subscriber was installed, does nothing.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}

pub mod prelude {
    pub use crate::{
        RequestContext, RequestHandler, ServerIdentityStore, TetherError, TetherServer,
        TetherServerBuilder,
    };
    pub use tether_client::{
        Client, ClientConfig, ClientError, ClientListener, ConnectionState, FeatureHandler,
        IdentityStore, IdentityStoreFactory, Lifecycle,
    };
    pub use tether_keepalive::KeepAliveConfig;
    pub use tether_protocol::{
        BoundPlayer, Cipher, CipherError, FeatureMessage, Identity, Player, PlayerSession,
        Profile, Request, Response, ServerIdentity, SessionFailure, SessionMode,
        SessionStopReason,
    };
    pub use tether_session::{SessionDirectory, SessionError};
    pub use tether_transport::{Connection, ConnectionId};
}
