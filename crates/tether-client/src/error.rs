//! Error types for the client.

use std::path::PathBuf;

use tether_protocol::{CipherError, ProtocolError};
use tether_transport::TransportError;

/// Errors raised by an identity store.
#[derive(Debug, thiserror::Error)]
pub enum IdentityStoreError {
    /// Reading or writing the store's files failed.
    #[error("identity store io: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted state could not be understood.
    #[error("identity store is corrupt: {0}")]
    Corrupt(String),

    /// Key material could not be processed.
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Errors that can occur in the client.
///
/// Connect-time failures (`Connection`, `UnsupportedServerVersion`,
/// `MissingFeature`, `VerificationScheme`, `DirectoryLocked`) abort the
/// attempt and leave the client disconnected. Failures after the socket
/// opens are reported through the listener instead of being returned.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server could not be reached or the socket could not be opened.
    #[error("failed to connect: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The server does not offer this client's protocol version.
    #[error("{client} is not supported by server. Server supports versions {server}")]
    UnsupportedServerVersion { client: String, server: String },

    /// A capability the client relies on is not offered by the server.
    #[error("server does not support {0}")]
    MissingFeature(String),

    /// The player session does not fit the server's verification scheme.
    #[error("{0} verification scheme requested but was provided an invalid player session")]
    VerificationScheme(String),

    /// Another client holds the working directory.
    #[error("another client is using {}", .0.display())]
    DirectoryLocked(PathBuf),

    /// `connect` was called while connecting or connected.
    #[error("client is already {0}")]
    AlreadyConnected(crate::ConnectionState),

    /// The operation requires a CONNECTED client.
    #[error("client is not connected")]
    NotConnected,

    /// Nothing can be sent before the socket opens.
    #[error("no socket is bound for sending")]
    SenderUnbound,

    /// The sender is bound once per connection.
    #[error("sender is already bound")]
    SenderAlreadyBound,

    /// A message needed an identity before one was established.
    #[error("identity has not been established")]
    IdentityNotEstablished,

    /// The game account could not be verified.
    #[error("account verification failed: {0}")]
    AccountVerification(String),

    #[error(transparent)]
    Store(#[from] IdentityStoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub(crate) fn connection(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}
