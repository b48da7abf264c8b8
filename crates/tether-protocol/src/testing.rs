//! Deterministic ciphers and identities for tests.
//!
//! Enabled with the `test-util` feature. Nothing here is secure.

use uuid::Uuid;

use crate::{Cipher, CipherError, Identity, PublicKey, ServerIdentity};

const KEY: u8 = 0x5A;
const OWNER_LEN: usize = 16;

/// A fresh identity with a random owner.
pub fn identity() -> Identity {
    let owner = Uuid::new_v4();
    Identity::new(owner, PublicKey(owner.as_bytes().to_vec()))
}

/// A fresh server identity with a random owner.
pub fn server_identity() -> ServerIdentity {
    ServerIdentity(identity())
}

/// A cipher that only decrypts what was encrypted between the same pair.
///
/// Ciphertext is `sender owner ‖ recipient owner ‖ payload ^ 0x5A`.
/// Decryption checks both owners so a packet attributed to the wrong
/// sender fails the way a real session cipher would.
#[derive(Debug, Clone)]
pub struct PairCipher {
    local: Identity,
}

impl PairCipher {
    pub fn new(local: Identity) -> Self {
        Self { local }
    }
}

impl Cipher for PairCipher {
    fn encrypt(&self, plaintext: &[u8], recipient: &Identity) -> Result<Vec<u8>, CipherError> {
        let mut out = Vec::with_capacity(OWNER_LEN * 2 + plaintext.len());
        out.extend_from_slice(self.local.owner.as_bytes());
        out.extend_from_slice(recipient.owner.as_bytes());
        out.extend(plaintext.iter().map(|b| b ^ KEY));
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], sender: &Identity) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < OWNER_LEN * 2 {
            return Err(CipherError::Decrypt("ciphertext too short".into()));
        }
        let (from, rest) = ciphertext.split_at(OWNER_LEN);
        let (to, payload) = rest.split_at(OWNER_LEN);
        if from != sender.owner.as_bytes() || to != self.local.owner.as_bytes() {
            return Err(CipherError::Decrypt(format!("no session with {sender}")));
        }
        Ok(payload.iter().map(|b| b ^ KEY).collect())
    }
}

/// A cipher that fails every operation with the same error.
#[derive(Debug, Clone)]
pub struct RejectingCipher(pub CipherError);

impl Cipher for RejectingCipher {
    fn encrypt(&self, _: &[u8], _: &Identity) -> Result<Vec<u8>, CipherError> {
        Err(self.0.clone())
    }

    fn decrypt(&self, _: &[u8], _: &Identity) -> Result<Vec<u8>, CipherError> {
        Err(self.0.clone())
    }
}
