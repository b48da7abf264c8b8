//! The binary envelope every message travels in.
//!
//! ```text
//! ┌──────────────┬───────────────┬────────────┬──────────────────────┐
//! │ marker: i32  │ version: i32  │ mode: i32  │ payload              │
//! │ 0x22         │ 2             │ 0xC001 or  │ serialized message,  │
//! │              │               │ 0xBA5ED    │ or its ciphertext    │
//! └──────────────┴───────────────┴────────────┴──────────────────────┘
//!   big-endian, 12-byte header, at most 32767 bytes in total
//! ```
//!
//! The size ceiling is checked after encoding on the way out and both on
//! the raw buffer and on the decrypted payload on the way in. Nothing is
//! ever truncated to fit.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Cipher, Codec, Identity, ProtocolError};

/// First word of every envelope.
pub const PACKET_MARKER: i32 = 0x22;

/// Envelope format version.
pub const PACKET_VERSION: i32 = 2;

/// Length of the fixed header in bytes.
pub const HEADER_LEN: usize = 12;

/// Largest envelope accepted on either path.
pub const MAX_PACKET_SIZE: usize = i16::MAX as usize;

/// How the payload of an envelope is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The payload is the serialized message.
    Plain,
    /// The payload is the serialized message encrypted for the recipient.
    Encrypted,
}

impl Mode {
    const PLAIN: i32 = 0xC001;
    const ENCRYPTED: i32 = 0xBA5ED;

    /// The on-wire value of this mode.
    pub fn to_wire(self) -> i32 {
        match self {
            Self::Plain => Self::PLAIN,
            Self::Encrypted => Self::ENCRYPTED,
        }
    }

    /// Parses an on-wire mode value. Unknown values yield `None`.
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            Self::PLAIN => Some(Self::Plain),
            Self::ENCRYPTED => Some(Self::Encrypted),
            _ => None,
        }
    }
}

/// Reads the header of `buffer` and returns the raw mode with the payload.
///
/// # Errors
/// [`ProtocolError::Truncated`] if the buffer is shorter than the header,
/// [`ProtocolError::BadMarker`] or [`ProtocolError::UnsupportedVersion`]
/// if either header word is wrong.
pub fn read_header(buffer: &[u8]) -> Result<(i32, &[u8]), ProtocolError> {
    if buffer.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated(buffer.len()));
    }
    let mut buf = buffer;
    let marker = buf.get_i32();
    if marker != PACKET_MARKER {
        return Err(ProtocolError::BadMarker(marker));
    }
    let version = buf.get_i32();
    if version != PACKET_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let mode = buf.get_i32();
    Ok((mode, buf))
}

/// Returns the mode of an envelope without decoding its payload.
pub fn peek_mode(buffer: &[u8]) -> Result<Option<Mode>, ProtocolError> {
    read_header(buffer).map(|(mode, _)| Mode::from_wire(mode))
}

fn write_envelope(mode: Mode, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_i32(PACKET_MARKER);
    buf.put_i32(PACKET_VERSION);
    buf.put_i32(mode.to_wire());
    buf.put_slice(payload);
    check_size(buf.len())?;
    Ok(buf.to_vec())
}

fn check_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_PACKET_SIZE {
        return Err(ProtocolError::TooLarge {
            size,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(())
}

/// Encodes messages into envelopes and decodes them back.
///
/// A pure function of the message and the bound cipher: it holds no
/// per-connection state, so callers build one per send or receive with
/// whatever cipher the identity store currently offers.
pub struct PacketCodec<C: Codec> {
    codec: C,
    cipher: Option<Arc<dyn Cipher>>,
}

impl<C: Codec> PacketCodec<C> {
    /// A codec that can only handle plain envelopes.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            cipher: None,
        }
    }

    /// A codec that can also encrypt and decrypt.
    pub fn with_cipher(codec: C, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            codec,
            cipher: Some(cipher),
        }
    }

    /// Serializes `msg` into a plain envelope.
    ///
    /// # Errors
    /// Serialization failures and [`ProtocolError::TooLarge`].
    pub fn encode_plain<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.codec.encode(msg)?;
        write_envelope(Mode::Plain, &payload)
    }

    /// Serializes `msg` and encrypts it for `recipient`.
    ///
    /// # Errors
    /// [`ProtocolError::NoCipher`] without a cipher,
    /// [`ProtocolError::MissingRecipient`] without a recipient, cipher
    /// failures, and [`ProtocolError::TooLarge`].
    pub fn encode_encrypted<T: Serialize>(
        &self,
        recipient: Option<&Identity>,
        msg: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::NoCipher)?;
        let recipient = recipient.ok_or(ProtocolError::MissingRecipient)?;
        let payload = self.codec.encode(msg)?;
        let ciphertext = cipher.encrypt(&payload, recipient)?;
        write_envelope(Mode::Encrypted, &ciphertext)
    }

    /// Decodes an envelope received from `sender`.
    ///
    /// Returns `Ok(None)` when the message cannot be attributed (encrypted
    /// but the sender is not known yet) or carries an unknown mode; both
    /// are logged and dropped rather than failing the connection.
    ///
    /// # Errors
    /// Header violations, [`ProtocolError::TooLarge`],
    /// [`ProtocolError::NoCipher`] for an encrypted envelope without a
    /// cipher, cipher failures, and deserialization failures.
    pub fn decode<T: DeserializeOwned>(
        &self,
        sender: Option<&Identity>,
        buffer: &[u8],
    ) -> Result<Option<T>, ProtocolError> {
        check_size(buffer.len())?;
        let (mode, payload) = read_header(buffer)?;
        match Mode::from_wire(mode) {
            Some(Mode::Plain) => {
                check_size(payload.len())?;
                self.codec.decode(payload).map(Some)
            }
            Some(Mode::Encrypted) => {
                let cipher = self.cipher.as_ref().ok_or(ProtocolError::NoCipher)?;
                let Some(sender) = sender else {
                    tracing::warn!("dropping encrypted packet with no known sender");
                    return Ok(None);
                };
                let plaintext = cipher.decrypt(payload, sender)?;
                check_size(plaintext.len())?;
                self.codec.decode(&plaintext).map(Some)
            }
            None => {
                tracing::warn!(mode, "unknown packet mode");
                Ok(None)
            }
        }
    }
}
