//! The identity store capability.
//!
//! The client never touches key material itself. A store owns the local
//! identity, the per-peer cipher sessions, and the prekeys it issues; the
//! orchestrator only sequences calls into it. How a store persists itself
//! is up to the implementation.

use std::sync::Arc;

use tether_protocol::{
    Cipher, Identity, PreKeyBundle, PrivateIdentityToken, Profile, SendPreKeysRequest,
    ServerIdentity,
};
use uuid::Uuid;

use crate::IdentityStoreError;

/// The local identity and its cipher sessions.
pub trait IdentityStore: Send + 'static {
    /// A cipher for the sessions this store currently holds.
    fn create_cipher(&self) -> Arc<dyn Cipher>;

    /// This client's identity.
    fn current_identity(&self) -> Identity;

    /// The secret presented when re-identifying.
    fn private_identity_token(&self) -> PrivateIdentityToken;

    /// Records the server's identity and consumes its prekey bundle to
    /// establish a session with it.
    fn trust_identity(
        &mut self,
        identity: &ServerIdentity,
        bundle: PreKeyBundle,
    ) -> Result<(), IdentityStoreError>;

    /// Applies the device id assigned by the server.
    fn process_device_registered(
        &mut self,
        profile: Profile,
        device_id: u32,
    ) -> Result<(), IdentityStoreError>;

    /// Issues a fresh prekey bundle addressed to `target`.
    fn create_prekey_request(
        &mut self,
        target: Option<&ServerIdentity>,
    ) -> Result<SendPreKeysRequest, IdentityStoreError>;

    /// Persists mutable state.
    fn save(&self) -> Result<(), IdentityStoreError>;

    /// Drops every group cipher session.
    fn clear_all_group_sessions(&mut self);
}

/// An opened store and whether it was just created.
#[derive(Debug)]
pub enum Bootstrap<S> {
    /// No store existed; the device still has to be registered.
    NewInstallation(S),
    /// A store was loaded from disk; the client can identify right away.
    ExistingInstallation(S),
}

impl<S> Bootstrap<S> {
    pub fn into_store(self) -> S {
        match self {
            Self::NewInstallation(s) | Self::ExistingInstallation(s) => s,
        }
    }
}

/// Opens or creates the identity store in the client's home directory.
pub trait IdentityStoreFactory: Send + 'static {
    type Store: IdentityStore;

    /// Returns `true` if a store already exists locally.
    fn exists(&self) -> bool;

    /// Opens the store, creating it for `owner` when none exists.
    ///
    /// `owner` is `None` when opening an existing store on socket open;
    /// the store then uses the profile it recorded when it was created.
    fn open(&self, owner: Option<Uuid>) -> Result<Bootstrap<Self::Store>, IdentityStoreError>;
}
