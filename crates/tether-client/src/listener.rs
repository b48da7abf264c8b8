//! Consumer-visible notifications.

use tether_protocol::PlayerSession;

use crate::ConnectionState;

/// Receives the client's asynchronous outcomes.
///
/// Failures after the socket opens are never returned from a call; they
/// arrive here. Every method has a no-op default. Callbacks run on the
/// client's reader task after its internal lock is released, so they may
/// call back into the client.
pub trait ClientListener: Send + Sync + 'static {
    fn on_state_changed(&self, _state: ConnectionState) {}

    /// A connection-level error, e.g. a non-normal close.
    fn on_error(&self, _message: &str) {}

    /// The device must be approved out of band at `url`.
    fn on_confirm_device_registration(&self, _token: &str, _url: &str) {}

    fn on_account_verification_failed(&self, _session: &PlayerSession) {}

    /// The private identity token did not match; `url` explains recovery.
    fn on_private_identity_mismatch(&self, _url: &str) {}

    /// The server no longer trusts this client. The identity store must
    /// be reset before reconnecting.
    fn on_client_untrusted(&self) {}
}

/// Logs every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl ClientListener for LoggingListener {
    fn on_state_changed(&self, state: ConnectionState) {
        tracing::info!(%state, "client state changed");
    }

    fn on_error(&self, message: &str) {
        tracing::error!(message, "client error");
    }

    fn on_confirm_device_registration(&self, _token: &str, url: &str) {
        tracing::info!(url, "approve this device to continue");
    }

    fn on_account_verification_failed(&self, session: &PlayerSession) {
        tracing::warn!(username = %session.username, "account verification failed");
    }

    fn on_private_identity_mismatch(&self, url: &str) {
        tracing::warn!(url, "private identity mismatch");
    }

    fn on_client_untrusted(&self) {
        tracing::warn!("client is untrusted, reset the identity store");
    }
}
