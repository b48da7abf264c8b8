//! Error types for the session layer.

use tether_protocol::{Identity, ProtocolError};
use tether_transport::ConnectionId;

/// Errors that can occur while managing sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The connection already has a player bound; identity cannot be
    /// rebound for the lifetime of the connection.
    #[error("connection {0} cannot be identified with a player more than once")]
    AlreadyBound(ConnectionId),

    /// The identity has no bound player, so player-relative lookups
    /// have nothing to compare against.
    #[error("cannot find player for {0}")]
    NoBoundPlayer(Identity),

    /// Encoding the outgoing envelope failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Writing to the connection failed.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}
