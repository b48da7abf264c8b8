//! Handshake and session messages.
//!
//! The core protocol is a closed set: [`Request`] is everything a client
//! sends, [`Response`] everything a server sends. Both are matched
//! exhaustively by the client orchestrator and the server loop. Feature
//! traffic (friends, groups, location, ...) rides in the
//! [`FeatureMessage`] variant and is dispatched at runtime to registered
//! handlers instead.
//!
//! Both enums are internally tagged, so a message serializes as
//! `{ "type": "Identify", ... }`.

use serde::{Deserialize, Serialize};

use crate::{
    Identity, PlayerSession, PreKeyBundle, PrivateIdentityToken, Profile,
    ServerIdentity, SessionStopReason,
};

/// An opaque feature-level message.
///
/// `kind` names the feature message (e.g. `"friends.list"`); `body` is
/// serialized by the feature that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMessage {
    pub kind: String,
    pub body: Vec<u8>,
}

impl FeatureMessage {
    pub fn new(kind: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            body,
        }
    }
}

/// Prekeys offered by a client to establish an encrypted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPreKeysRequest {
    /// The sender's identity, when it already has one.
    pub identity: Option<Identity>,
    pub bundle: PreKeyBundle,
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// "Here is who I am", or with both fields `None`, "I'm new here".
    Identify {
        identity: Option<Identity>,
        token: Option<PrivateIdentityToken>,
    },

    /// Prekey material for the server to establish a cipher session.
    SendPreKeys(SendPreKeysRequest),

    /// Start a session for the given game player.
    /// `server_id` is the account-verification proof, when required.
    StartSession {
        identity: Identity,
        session: PlayerSession,
        server_id: Option<String>,
    },

    /// Ask the server whether it trusts this identity.
    CheckTrustRelationship { identity: Identity },

    /// Liveness probe. Carries the identity once one is established.
    KeepAlive { identity: Option<Identity> },

    /// Feature-level traffic.
    Feature(FeatureMessage),
}

impl Request {
    /// An `Identify` for a client with no local identity.
    pub fn identify_unknown() -> Self {
        Self::Identify {
            identity: None,
            token: None,
        }
    }

    /// An `Identify` for a client with an established identity.
    pub fn identify(identity: Identity, token: PrivateIdentityToken) -> Self {
        Self::Identify {
            identity: Some(identity),
            token: Some(token),
        }
    }

    /// Short variant name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "Identify",
            Self::SendPreKeys(_) => "SendPreKeys",
            Self::StartSession { .. } => "StartSession",
            Self::CheckTrustRelationship { .. } => "CheckTrustRelationship",
            Self::KeepAlive { .. } => "KeepAlive",
            Self::Feature(_) => "Feature",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Why the server refused or ended a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SessionFailure {
    /// The game account could not be verified.
    AccountVerificationFailed { session: PlayerSession },
    /// The presented private identity token does not match the profile.
    /// `url` points the user at the recovery page.
    PrivateIdentityMismatch { url: String },
    /// Any other server-declared failure.
    SessionError {
        reason: SessionStopReason,
        message: String,
    },
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// The identity was recognised. Carries the material a verified
    /// session needs to produce its session proof.
    Identify {
        profile: Profile,
        server_public_key: Vec<u8>,
        shared_secret: Vec<u8>,
    },

    /// This device is unknown and must be approved out of band.
    RegisterDevice {
        approval_url: String,
        approval_token: String,
    },

    /// The device was approved and assigned an id.
    DeviceRegistered { profile: Profile, device_id: u32 },

    /// The server's identity and prekeys, in reply to `SendPreKeys`.
    SendPreKeys {
        identity: ServerIdentity,
        bundle: PreKeyBundle,
    },

    /// The server needs fresh prekeys.
    ResendPreKeys { identity: Option<ServerIdentity> },

    /// The session has started.
    StartSession,

    /// The session could not start, or was ended by the server.
    SessionFailed { failure: SessionFailure },

    /// The server trusts the client. Carries the server's identity.
    IsTrustedRelationship { identity: ServerIdentity },

    /// The server does not trust the client; its identity store must be
    /// reset before reconnecting.
    IsUntrustedRelationship,

    /// Liveness acknowledgement.
    KeepAlive,

    /// Feature-level traffic.
    Feature(FeatureMessage),
}

impl Response {
    /// Short variant name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "Identify",
            Self::RegisterDevice { .. } => "RegisterDevice",
            Self::DeviceRegistered { .. } => "DeviceRegistered",
            Self::SendPreKeys { .. } => "SendPreKeys",
            Self::ResendPreKeys { .. } => "ResendPreKeys",
            Self::StartSession => "StartSession",
            Self::SessionFailed { .. } => "SessionFailed",
            Self::IsTrustedRelationship { .. } => "IsTrustedRelationship",
            Self::IsUntrustedRelationship => "IsUntrustedRelationship",
            Self::KeepAlive => "KeepAlive",
            Self::Feature(_) => "Feature",
        }
    }

    /// A `SessionFailed` carrying a generic session error.
    pub fn session_error(reason: SessionStopReason, message: impl Into<String>) -> Self {
        Self::SessionFailed {
            failure: SessionFailure::SessionError {
                reason,
                message: message.into(),
            },
        }
    }
}
