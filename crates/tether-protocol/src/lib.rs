//! Wire protocol for Tether.
//!
//! This crate defines what clients and servers say to each other and how
//! it is framed:
//!
//! - **Types** ([`Identity`], [`ServerIdentity`], [`PlayerSession`], ...)
//!   shared by both ends of the handshake.
//! - **Messages** ([`Request`], [`Response`]) forming the closed core
//!   protocol, with feature traffic carried as [`FeatureMessage`].
//! - **Envelope** ([`PacketCodec`]) wrapping a serialized message in a
//!   versioned header, optionally encrypted through a [`Cipher`].
//! - **Errors** ([`ProtocolError`], [`CipherError`]).
//!
//! ```text
//! Transport (bytes) → Protocol (envelope → message) → Session / Client
//! ```

mod cipher;
mod codec;
mod error;
mod messages;
mod packet;
mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cipher::Cipher;
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{CipherError, ProtocolError};
pub use messages::{FeatureMessage, Request, Response, SendPreKeysRequest, SessionFailure};
pub use packet::{
    HEADER_LEN, MAX_PACKET_SIZE, Mode, PACKET_MARKER, PACKET_VERSION, PacketCodec, peek_mode,
    read_header,
};
pub use types::{
    BoundPlayer, Identity, Player, PlayerSession, PreKeyBundle, PrivateIdentityToken, Profile,
    PublicKey, ServerIdentity, SessionMode, SessionStopReason,
};
