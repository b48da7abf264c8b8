//! The per-identity cipher capability.
//!
//! Tether does not implement key agreement or ratchets. An identity store
//! hands out a [`Cipher`] that already knows how to reach every peer it
//! has a session with; the envelope codec only asks it to encrypt for a
//! recipient or decrypt from a sender.

use crate::{CipherError, Identity};

/// Encrypts and decrypts payloads for a peer identity.
pub trait Cipher: Send + Sync {
    /// Encrypts `plaintext` so only `recipient` can read it.
    fn encrypt(
        &self,
        plaintext: &[u8],
        recipient: &Identity,
    ) -> Result<Vec<u8>, CipherError>;

    /// Decrypts `ciphertext` that `sender` encrypted for us.
    fn decrypt(
        &self,
        ciphertext: &[u8],
        sender: &Identity,
    ) -> Result<Vec<u8>, CipherError>;
}
