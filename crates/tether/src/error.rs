//! Unified error type for Tether.

use tether_client::ClientError;
use tether_protocol::ProtocolError;
use tether_session::SessionError;
use tether_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `tether` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant auto-generates `From` impls, so the `?`
/// operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A transport-level error (connection, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (framing, encode, decode, cipher).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (rebinding, lookups, notifying a peer).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A client-side error (discovery, handshake, identity store).
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A request handler refused a request.
    #[error("request rejected: {0}")]
    Rejected(String),
}
