//! `TetherServer` builder and server loop.
//!
//! This is the entry point for running a Tether server. It ties together
//! the layers: transport → protocol → session directory → request handler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tether_protocol::{Cipher, Identity, JsonCodec, Player, Request, ServerIdentity};
use tether_session::SessionDirectory;
use tether_transport::{Transport, WebSocketConnection, WebSocketTransport};

use crate::TetherError;
use crate::handler::{RequestContext, handle_connection};

/// Supplies the server's identity and the cipher bound to it.
pub trait ServerIdentityStore: Send + Sync + 'static {
    fn identity(&self) -> ServerIdentity;

    /// A cipher holding a session with every trusted client.
    fn cipher(&self) -> Arc<dyn Cipher>;
}

/// Application logic for everything except keepalives.
///
/// The handler drives the server side of the handshake (identify,
/// device registration, prekeys, session start, trust) and any feature
/// traffic, using the [`RequestContext`] to reply and to record identities
/// in the session directory.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one decoded request.
    ///
    /// Returning an error stops the session with a server error.
    fn handle(
        &self,
        ctx: &RequestContext,
        request: Request,
    ) -> impl Future<Output = Result<(), TetherError>> + Send;

    /// Called once when an identified session ends.
    fn on_session_stopped(&self, _identity: &Identity, _player: &Player) {}
}

/// Shared server state passed to each connection handler task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. The
/// directory has its own concurrency, so nothing here needs a lock.
pub(crate) struct ServerState<H: RequestHandler> {
    pub(crate) directory: Arc<SessionDirectory<WebSocketConnection>>,
    pub(crate) identity: ServerIdentity,
    pub(crate) handler: H,
    pub(crate) idle_timeout: Duration,
}

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,ignore
/// use tether::prelude::*;
///
/// let server = TetherServer::builder()
///     .bind("0.0.0.0:8080")
///     .build(my_identity_store, MyHandler)
///     .await?;
/// server.run().await
/// ```
pub struct TetherServerBuilder {
    bind_addr: String,
    idle_timeout: Duration,
}

impl TetherServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets how long a connection may stay silent before its session is
    /// stopped. Clients keep it alive with keepalive probes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Binds the listener and builds the server.
    pub async fn build<S, H>(self, store: S, handler: H) -> Result<TetherServer<H>, TetherError>
    where
        S: ServerIdentityStore,
        H: RequestHandler,
    {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let state = Arc::new(ServerState {
            directory: Arc::new(SessionDirectory::new(JsonCodec, store.cipher())),
            identity: store.identity(),
            handler,
            idle_timeout: self.idle_timeout,
        });

        Ok(TetherServer { transport, state })
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Tether server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct TetherServer<H: RequestHandler> {
    transport: WebSocketTransport,
    state: Arc<ServerState<H>>,
}

impl<H: RequestHandler> TetherServer<H> {
    /// Creates a new builder.
    pub fn builder() -> TetherServerBuilder {
        TetherServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The directory of live sessions, shared with every connection task.
    pub fn directory(&self) -> Arc<SessionDirectory<WebSocketConnection>> {
        Arc::clone(&self.state.directory)
    }

    /// Runs the server accept loop.
    ///
    /// Spawns a handler task for each accepted connection. Runs until the
    /// process is terminated.
    pub async fn run(mut self) -> Result<(), TetherError> {
        tracing::info!(server = %self.state.identity, "Tether server running");

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}
