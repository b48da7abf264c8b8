//! Error types for the protocol layer.
//!
//! Each crate in Tether defines its own error enum. A `ProtocolError`
//! means the problem is in framing, serialization, or the cipher, not in
//! networking or session bookkeeping.

/// Errors raised by the cipher capability.
///
/// The orchestrator treats these differently depending on where they
/// surface: a decrypt failure on receive triggers a prekey refresh, an
/// invalid session on send is reported as an untrusted client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    /// There is no usable cipher session with the peer.
    #[error("invalid cipher session: {0}")]
    InvalidSession(String),

    /// Encryption failed for another reason.
    #[error("encrypt failed: {0}")]
    Encrypt(String),

    /// The ciphertext could not be decrypted with the sender's session.
    #[error("decrypt failed: {0}")]
    Decrypt(String),
}

impl CipherError {
    /// Returns `true` for [`CipherError::InvalidSession`].
    pub fn is_invalid_session(&self) -> bool {
        matches!(self, Self::InvalidSession(_))
    }
}

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The buffer does not start with the envelope marker.
    #[error("not a tether packet (marker {0:#x})")]
    BadMarker(i32),

    /// The envelope was written by an incompatible protocol version.
    #[error("unknown packet version {0}")]
    UnsupportedVersion(i32),

    /// The buffer is shorter than the fixed envelope header.
    #[error("packet truncated: {0} bytes is shorter than the header")]
    Truncated(usize),

    /// The envelope or its decrypted payload exceeds the size ceiling.
    #[error("packet is too large: {size} bytes when maximum is {max}")]
    TooLarge { size: usize, max: usize },

    /// Encrypted mode was requested but no cipher is bound.
    #[error("cipher was not set when mode is expecting encrypted")]
    NoCipher,

    /// Encrypted mode was requested without a recipient identity.
    #[error("recipient is required when sending encrypted packets")]
    MissingRecipient,

    /// The cipher capability failed.
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl ProtocolError {
    /// Returns the cipher error if this failure came from the cipher.
    pub fn as_cipher(&self) -> Option<&CipherError> {
        match self {
            Self::Cipher(e) => Some(e),
            _ => None,
        }
    }
}
