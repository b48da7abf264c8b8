//! Identity and player types shared by client and server.
//!
//! These are the values that travel inside handshake messages and that
//! the server's session directory indexes connections by.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// A serialized public identity key.
///
/// Opaque to this crate: the cipher capability produces and interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(pub Vec<u8>);

/// Secret correlating a returning device with its profile.
///
/// Persisted by the client's identity store and presented on re-identify
/// so the server can skip device registration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateIdentityToken(pub Vec<u8>);

impl fmt::Debug for PrivateIdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateIdentityToken(<{} bytes>)", self.0.len())
    }
}

/// A consumable batch of prekey material.
///
/// Ownership moves from the issuing identity store to the consumer on
/// exchange; consumers take it by value. An exhausted bundle is replaced
/// by a fresh one, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreKeyBundle(pub Vec<u8>);

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// The cryptographic and ownership identifier of one party.
///
/// Immutable once attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// The profile that owns this identity.
    pub owner: Uuid,
    /// The identity's public key.
    pub public_key: PublicKey,
    /// The registered device, once device registration has completed.
    pub device_id: Option<u32>,
}

impl Identity {
    pub fn new(owner: Uuid, public_key: PublicKey) -> Self {
        Self {
            owner,
            public_key,
            device_id: None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_id {
            Some(device) => write!(f, "{}#{}", self.owner, device),
            None => write!(f, "{}", self.owner),
        }
    }
}

/// The server's public identity.
///
/// The client only records this after the server has confirmed a trusted
/// relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerIdentity(pub Identity);

impl ServerIdentity {
    /// The identity the cipher is keyed to.
    pub fn as_identity(&self) -> &Identity {
        &self.0
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server:{}", self.0)
    }
}

/// A user profile known to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
}

// ---------------------------------------------------------------------------
// Players
// ---------------------------------------------------------------------------

/// The in-game player bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundPlayer {
    /// The game account's id.
    pub id: Uuid,
    /// The game server instance the player is currently on.
    pub server: String,
}

impl BoundPlayer {
    /// Returns `true` if both players are on the same game server.
    pub fn in_server_with(&self, other: &BoundPlayer) -> bool {
        self.server == other.server
    }
}

/// An identity together with the in-game player it is bound to, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub identity: Identity,
    pub bound: Option<BoundPlayer>,
}

/// How the game session proves account ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Verified against the game's account service.
    Verified,
    /// Not verified; the player name is taken on trust.
    Unverified,
}

/// The game session a client presents when starting a session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSession {
    pub player_id: Uuid,
    pub username: String,
    pub server: String,
    pub mode: SessionMode,
    /// Account service token. Never serialized.
    #[serde(skip)]
    pub access_token: Option<String>,
}

impl PlayerSession {
    /// The player this session binds to on the server.
    pub fn to_bound_player(&self) -> BoundPlayer {
        BoundPlayer {
            id: self.player_id,
            server: self.server.clone(),
        }
    }
}

impl fmt::Debug for PlayerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerSession")
            .field("player_id", &self.player_id)
            .field("username", &self.username)
            .field("server", &self.server)
            .field("mode", &self.mode)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Session stop reasons
// ---------------------------------------------------------------------------

/// Machine-readable reason a session ended.
///
/// The code doubles as the WebSocket close code when the server
/// force-closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStopReason {
    NormalClose,
    ProtocolError,
    Unauthorised,
    ServerError,
}

impl SessionStopReason {
    /// The close code for this reason.
    pub fn code(self) -> u16 {
        match self {
            Self::NormalClose => 1000,
            Self::ProtocolError => 1002,
            Self::Unauthorised => 1008,
            Self::ServerError => 1011,
        }
    }

    /// Formats a human-readable message for this reason.
    pub fn message(self, detail: &str) -> String {
        let prefix = match self {
            Self::NormalClose => "Session closed normally",
            Self::ProtocolError => "Protocol error",
            Self::Unauthorised => "Unauthorised",
            Self::ServerError => "Server error",
        };
        if detail.is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix}: {detail}")
        }
    }
}
