//! Connection state as seen by consumers, and the handshake sub-phase.

use std::fmt;

/// The client's connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}

/// Where the handshake is while [`ConnectionState::Connecting`].
///
/// ```text
/// AwaitingIdentity ──RegisterDevice──▶ AwaitingDeviceApproval
///        │                                    │ DeviceRegistered
///        │                                    ▼
///        │                             AwaitingPreKeyAck ◀── ResendPreKeys
///        │ Identify                           │ SendPreKeys
///        ▼                                    ▼
/// AwaitingSessionStart ◀──────────────────────┘
///        │ StartSession
///        ▼
/// AwaitingTrustDecision ──IsTrustedRelationship──▶ CONNECTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakePhase {
    AwaitingIdentity,
    AwaitingDeviceApproval,
    AwaitingPreKeyAck,
    AwaitingSessionStart,
    AwaitingTrustDecision,
}
