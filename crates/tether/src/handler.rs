//! Per-connection handler: decode, keepalive, and request routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive an envelope, decoded with the sender identity the
//!      directory holds for this connection (none until identified)
//!   2. Answer `KeepAlive` directly
//!   3. Hand every other request to the [`RequestHandler`]
//!   4. On close, idle timeout or failure, stop the session

use std::sync::Arc;

use tether_protocol::{
    BoundPlayer, Identity, ProtocolError, Request, Response, ServerIdentity, SessionStopReason,
};
use tether_session::SessionDirectory;
use tether_transport::{Connection, ConnectionId, WebSocketConnection};

use crate::TetherError;
use crate::server::{RequestHandler, ServerState};

/// What a [`RequestHandler`] can see and do for one connection.
pub struct RequestContext {
    connection: Arc<WebSocketConnection>,
    directory: Arc<SessionDirectory<WebSocketConnection>>,
    server_identity: ServerIdentity,
}

impl RequestContext {
    pub fn conn_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn connection(&self) -> &Arc<WebSocketConnection> {
        &self.connection
    }

    pub fn directory(&self) -> &SessionDirectory<WebSocketConnection> {
        &self.directory
    }

    pub fn server_identity(&self) -> &ServerIdentity {
        &self.server_identity
    }

    /// The identity this connection established, if any.
    pub fn identity(&self) -> Option<Identity> {
        self.directory.identity(self.connection.id())
    }

    /// Sends `response`, encrypted once the connection is identified.
    pub async fn reply(&self, response: &Response) -> Result<(), TetherError> {
        let recipient = self.identity();
        self.directory
            .send(&self.connection, recipient.as_ref(), response)
            .await?;
        Ok(())
    }

    /// Records the connection's identity and, optionally, its player.
    ///
    /// Everything sent to and received from the connection afterwards is
    /// encrypted, so the trust decision must be replied before the
    /// connection is identified.
    pub fn identify(
        &self,
        identity: Identity,
        player: Option<BoundPlayer>,
    ) -> Result<(), TetherError> {
        self.directory
            .identify(&self.connection, identity, player, |identity, player| {
                if let Some(bound) = &player.bound {
                    tracing::info!(%identity, player = %bound.id, "player bound");
                }
            })?;
        Ok(())
    }

    /// Stops this connection's session, telling the peer why.
    pub async fn stop(&self, reason: SessionStopReason, message: &str) -> Result<(), TetherError> {
        self.directory
            .stop_session(&self.connection, reason, message, None, |_, _| {})
            .await?;
        Ok(())
    }
}

/// Why the receive loop ended.
enum Exit {
    Closed,
    Idle,
    Failed {
        reason: SessionStopReason,
        message: String,
        cause: TetherError,
    },
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<H: RequestHandler>(
    conn: WebSocketConnection,
    state: Arc<ServerState<H>>,
) -> Result<(), TetherError> {
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let ctx = RequestContext {
        connection: Arc::clone(&conn),
        directory: Arc::clone(&state.directory),
        server_identity: state.identity.clone(),
    };

    let exit = receive_loop(&ctx, &state).await;

    let (reason, message, cause) = match exit {
        Exit::Closed => (SessionStopReason::NormalClose, "connection closed".to_string(), None),
        Exit::Idle => (SessionStopReason::NormalClose, "idle timeout".to_string(), None),
        Exit::Failed {
            reason,
            message,
            cause,
        } => (reason, message, Some(cause)),
    };
    let cause_ref = cause
        .as_ref()
        .map(|e| e as &(dyn std::error::Error + Send + Sync));

    state
        .directory
        .stop_session(&conn, reason, &message, cause_ref, |identity, player| {
            state.handler.on_session_stopped(identity, player);
        })
        .await?;
    Ok(())
}

async fn receive_loop<H: RequestHandler>(ctx: &RequestContext, state: &ServerState<H>) -> Exit {
    let conn = &ctx.connection;
    let conn_id = conn.id();

    loop {
        let data = match tokio::time::timeout(state.idle_timeout, conn.recv()).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::info!(%conn_id, "connection closed cleanly");
                return Exit::Closed;
            }
            Ok(Err(e)) => {
                tracing::debug!(%conn_id, error = %e, "recv error");
                return Exit::Closed;
            }
            Err(_) => {
                tracing::info!(%conn_id, "connection timed out");
                return Exit::Idle;
            }
        };

        let sender = state.directory.identity(conn_id);
        let request = match state
            .directory
            .packets()
            .decode::<Request>(sender.as_ref(), &data)
        {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(ProtocolError::Cipher(e)) => {
                // Ask the client to re-key instead of dropping the session.
                tracing::warn!(%conn_id, error = %e, "could not decrypt request");
                let resend = Response::ResendPreKeys {
                    identity: Some(state.identity.clone()),
                };
                if let Err(e) = ctx.reply(&resend).await {
                    return failed(SessionStopReason::ServerError, e);
                }
                continue;
            }
            Err(e) => return failed(SessionStopReason::ProtocolError, e.into()),
        };

        tracing::debug!(%conn_id, msg = request.name(), "received");
        let result = match request {
            Request::KeepAlive { .. } => ctx.reply(&Response::KeepAlive).await,
            request => state.handler.handle(ctx, request).await,
        };
        if let Err(e) = result {
            return failed(SessionStopReason::ServerError, e);
        }
    }
}

fn failed(reason: SessionStopReason, cause: TetherError) -> Exit {
    Exit::Failed {
        reason,
        message: cause.to_string(),
        cause,
    }
}
