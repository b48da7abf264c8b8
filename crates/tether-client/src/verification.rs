//! Third-party account verification.
//!
//! A verified player session must prove to the server that it owns the
//! game account. The server's `Identify` response carries its public key
//! and a shared secret; the verifier hands them to the account service
//! and returns the server id the service recorded, which is then sent
//! with `StartSession`.

use std::future::Future;

use tether_protocol::PlayerSession;

use crate::ClientError;

/// Joins the game account service on behalf of a verified session.
///
/// Implement this with your account service's client. The future must be
/// `Send` because it is awaited on the client's reader task.
pub trait AccountVerifier: Send + Sync + 'static {
    /// Returns the server id to present to the Tether server.
    ///
    /// # Errors
    /// [`ClientError::AccountVerification`] if the service refuses the
    /// session.
    fn join_server(
        &self,
        session: &PlayerSession,
        server_public_key: &[u8],
        shared_secret: &[u8],
    ) -> impl Future<Output = Result<String, ClientError>> + Send;
}

/// A verifier for clients that only run unverified sessions.
///
/// Any verified session fails to connect.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unverified;

impl AccountVerifier for Unverified {
    async fn join_server(
        &self,
        session: &PlayerSession,
        _server_public_key: &[u8],
        _shared_secret: &[u8],
    ) -> Result<String, ClientError> {
        Err(ClientError::AccountVerification(format!(
            "no account verifier configured for {}",
            session.username
        )))
    }
}
