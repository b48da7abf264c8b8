//! The handshake state machine.
//!
//! [`Orchestrator`] turns an opened socket into a CONNECTED, encrypted,
//! trusted session, or fails explicitly. It is synchronous and owns no
//! tasks: the [`Client`](crate::Client) feeds it inbound envelopes in
//! transport order and drains the [`Event`]s it produces, dispatching them
//! after releasing its lock.
//!
//! Outbound envelopes are encoded at send time, from the state at that
//! moment: plain while connecting, encrypted for the server identity once
//! connected. They all leave through the single [`SenderBinding`].

use tether_protocol::{
    CipherError, FeatureMessage, Identity, JsonCodec, PacketCodec, PlayerSession, ProtocolError,
    Request, Response, ServerIdentity, SessionFailure, SessionMode, SessionStopReason,
};
use tether_transport::CloseInfo;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::{
    Bootstrap, ClientConfig, ClientError, ConnectionState, DirectoryLock, HandshakePhase,
    IdentityStore, IdentityStoreFactory, SenderBinding,
};

/// Something the orchestrator wants the outside world to know or do.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged(ConnectionState),
    /// A connection-level error for the consumer.
    Error(String),
    ConfirmDeviceRegistration { token: String, url: String },
    AccountVerificationFailed(PlayerSession),
    PrivateIdentityMismatch(String),
    ClientUntrusted,
    /// A feature message for the handler chain.
    Feature(FeatureMessage),
    /// An identity is established; restart the keepalive with it.
    Identified(Identity),
    /// A verified session needs its account proof before the session can
    /// start. Answer with [`Orchestrator::start_session`].
    VerifyAccount {
        session: PlayerSession,
        server_public_key: Vec<u8>,
        shared_secret: Vec<u8>,
    },
    /// Waiting for out-of-band device approval.
    AwaitingApproval,
}

/// Drives one client through the handshake and owns its session state.
pub struct Orchestrator<F: IdentityStoreFactory> {
    factory: F,
    session: PlayerSession,
    prekey_refresh_limit: Option<u32>,
    state: ConnectionState,
    phase: Option<HandshakePhase>,
    sender: SenderBinding,
    store: Option<F::Store>,
    server_identity: Option<ServerIdentity>,
    lock: Option<DirectoryLock>,
    cipher_failures: u32,
    events: Vec<Event>,
}

impl<F: IdentityStoreFactory> Orchestrator<F> {
    pub fn new(factory: F, config: &ClientConfig) -> Self {
        Self {
            factory,
            session: config.session.clone(),
            prekey_refresh_limit: config.prekey_refresh_limit,
            state: ConnectionState::Disconnected,
            phase: None,
            sender: SenderBinding::Unbound,
            store: None,
            server_identity: None,
            lock: None,
            cipher_failures: 0,
            events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The handshake phase, only while connecting.
    pub fn phase(&self) -> Option<HandshakePhase> {
        self.phase
    }

    /// This client's identity, once a store exists.
    pub fn identity(&self) -> Option<Identity> {
        self.store.as_ref().map(IdentityStore::current_identity)
    }

    /// The server's identity, once it has confirmed trust.
    pub fn server_identity(&self) -> Option<&ServerIdentity> {
        self.server_identity.as_ref()
    }

    /// Takes the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------
    // Socket lifecycle
    // -----------------------------------------------------------------

    /// Binds the freshly opened socket and sends the first `Identify`.
    ///
    /// `lock` is held until the client is next disconnected.
    ///
    /// # Errors
    /// Binding or store failures. The caller should disconnect.
    pub fn on_open(
        &mut self,
        sender: UnboundedSender<Vec<u8>>,
        lock: Option<DirectoryLock>,
    ) -> Result<(), ClientError> {
        self.lock = lock;
        self.sender.bind(sender)?;
        self.change_state(ConnectionState::Connecting);
        info!("connection established");

        if !self.factory.exists() {
            return self.send_request(&Request::identify_unknown());
        }
        match self.factory.open(None)? {
            Bootstrap::ExistingInstallation(store) => {
                let request =
                    Request::identify(store.current_identity(), store.private_identity_token());
                info!(identity = %store.current_identity(), "existing installation, identifying");
                self.store = Some(store);
                self.send_request(&request)
            }
            Bootstrap::NewInstallation(store) => {
                info!("new installation, registering device with server");
                self.store = Some(store);
                self.send_request(&Request::identify_unknown())
            }
        }
    }

    /// The socket closed. A close code other than normal is reported as
    /// an error.
    pub fn on_close(&mut self, close: Option<CloseInfo>) {
        match close {
            Some(info) if info.is_normal() => {
                info!(code = info.code, "socket closed");
            }
            Some(info) => {
                error!(code = info.code, reason = %info.reason, "socket closed");
                let message = if info.reason.is_empty() {
                    format!("connection closed with code {}", info.code)
                } else {
                    info.reason
                };
                self.events.push(Event::Error(message));
            }
            None if self.state != ConnectionState::Disconnected => {
                error!("socket closed without a close frame");
                self.events
                    .push(Event::Error("connection closed unexpectedly".into()));
            }
            None => {}
        }
        if self.state != ConnectionState::Disconnected {
            self.change_state(ConnectionState::Disconnected);
        }
    }

    /// The socket failed. Reverts to disconnected without notifying an
    /// error.
    pub fn on_failure(&mut self, err: &dyn std::error::Error) {
        error!(error = %err, "socket failure");
        if self.state != ConnectionState::Disconnected {
            self.change_state(ConnectionState::Disconnected);
        }
    }

    /// Disconnects. Does nothing beyond releasing the lock when already
    /// disconnected.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.lock = None;
            return;
        }
        info!("disconnecting");
        self.change_state(ConnectionState::Disconnected);
    }

    /// Reports `message` and disconnects.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(%message, "connection failed");
        self.events.push(Event::Error(message));
        self.change_state(ConnectionState::Disconnected);
    }

    /// Saves the identity store and releases the directory lock, for the
    /// process shutdown hook. Safe to call in any state.
    pub fn save_on_shutdown(&mut self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save() {
                error!(error = %e, "could not save identity store on shutdown");
            }
        }
        self.lock = None;
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    /// Processes one inbound envelope.
    ///
    /// # Errors
    /// Malformed envelopes and protocol violations. Decrypt failures are
    /// recovered from by refreshing prekeys and are not returned.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        if self.state == ConnectionState::Disconnected {
            warn!(len = bytes.len(), "dropping message received while disconnected");
            return Ok(());
        }

        let codec = self.packet_codec();
        let sender = self.server_identity.as_ref().map(ServerIdentity::as_identity);
        let response = match codec.decode::<Response>(sender, bytes) {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(()),
            Err(ProtocolError::Cipher(e)) => return self.recover_cipher(e),
            Err(e) => return Err(e.into()),
        };
        self.cipher_failures = 0;

        debug!(msg = response.name(), phase = ?self.phase, "received");
        if !self.expects(&response) {
            warn!(
                msg = response.name(),
                state = %self.state,
                phase = ?self.phase,
                "ignoring out-of-phase message"
            );
            return Ok(());
        }
        self.handle(response)
    }

    /// Whether `response` fits the current state and handshake phase.
    fn expects(&self, response: &Response) -> bool {
        use HandshakePhase::*;

        let phase = self.phase;
        match response {
            Response::KeepAlive | Response::SessionFailed { .. } | Response::ResendPreKeys { .. } => {
                true
            }
            Response::Identify { .. } => {
                matches!(phase, Some(AwaitingIdentity | AwaitingSessionStart))
            }
            Response::RegisterDevice { .. } => phase == Some(AwaitingIdentity),
            Response::DeviceRegistered { .. } => phase == Some(AwaitingDeviceApproval),
            // Also the answer to a prekey refresh on a live session.
            Response::SendPreKeys { .. } => {
                phase == Some(AwaitingPreKeyAck) || self.state == ConnectionState::Connected
            }
            Response::StartSession => phase == Some(AwaitingSessionStart),
            Response::IsTrustedRelationship { .. } | Response::IsUntrustedRelationship => {
                phase == Some(AwaitingTrustDecision)
            }
            Response::Feature(_) => self.state == ConnectionState::Connected,
        }
    }

    fn handle(&mut self, response: Response) -> Result<(), ClientError> {
        match response {
            Response::Identify {
                profile,
                server_public_key,
                shared_secret,
            } => {
                if self.store.is_none() {
                    self.store = Some(self.factory.open(Some(profile.id))?.into_store());
                }
                self.set_phase(HandshakePhase::AwaitingSessionStart);
                if self.session.mode == SessionMode::Verified {
                    self.events.push(Event::VerifyAccount {
                        session: self.session.clone(),
                        server_public_key,
                        shared_secret,
                    });
                    Ok(())
                } else {
                    self.start_session(None)
                }
            }
            Response::KeepAlive => {
                debug!("keepalive acknowledged");
                Ok(())
            }
            Response::RegisterDevice {
                approval_url,
                approval_token,
            } => {
                info!(url = %approval_url, "device registration required");
                self.set_phase(HandshakePhase::AwaitingDeviceApproval);
                self.events.push(Event::ConfirmDeviceRegistration {
                    token: approval_token,
                    url: approval_url,
                });
                self.events.push(Event::AwaitingApproval);
                Ok(())
            }
            Response::DeviceRegistered { profile, device_id } => {
                let mut store = self.factory.open(Some(profile.id))?.into_store();
                store.process_device_registered(profile, device_id)?;
                info!(device_id, "ready to exchange keys");
                let request = store.create_prekey_request(None)?;
                self.store = Some(store);
                self.set_phase(HandshakePhase::AwaitingPreKeyAck);
                self.send_request(&Request::SendPreKeys(request))
            }
            Response::SendPreKeys { identity, bundle } => {
                let store = self
                    .store
                    .as_mut()
                    .ok_or(ClientError::IdentityNotEstablished)?;
                store.trust_identity(&identity, bundle)?;
                info!(server = %identity, "prekeys exchanged");
                if self.state == ConnectionState::Connected {
                    return Ok(());
                }
                let request =
                    Request::identify(store.current_identity(), store.private_identity_token());
                self.set_phase(HandshakePhase::AwaitingSessionStart);
                self.send_request(&request)
            }
            Response::ResendPreKeys { identity } => {
                let store = self
                    .store
                    .as_mut()
                    .ok_or(ClientError::IdentityNotEstablished)?;
                let request = store.create_prekey_request(identity.as_ref())?;
                self.set_phase(HandshakePhase::AwaitingPreKeyAck);
                self.send_request(&Request::SendPreKeys(request))
            }
            Response::StartSession => {
                let identity = self.identity().ok_or(ClientError::IdentityNotEstablished)?;
                info!("session started, checking trust relationship");
                self.set_phase(HandshakePhase::AwaitingTrustDecision);
                self.send_request(&Request::CheckTrustRelationship { identity })
            }
            Response::SessionFailed { failure } => {
                match failure {
                    SessionFailure::AccountVerificationFailed { session } => {
                        info!("session failed: account verification");
                        self.events.push(Event::AccountVerificationFailed(session));
                    }
                    SessionFailure::PrivateIdentityMismatch { url } => {
                        info!("session failed: private identity mismatch");
                        self.events.push(Event::PrivateIdentityMismatch(url));
                    }
                    SessionFailure::SessionError { reason, message } => {
                        let text = reason.message(&message);
                        info!(reason = ?reason, "session failed: {text}");
                        if reason != SessionStopReason::NormalClose {
                            self.events.push(Event::Error(text));
                        }
                    }
                }
                self.change_state(ConnectionState::Disconnected);
                Ok(())
            }
            Response::IsTrustedRelationship { identity } => {
                info!(server = %identity, "server confirmed a trusted relationship");
                self.server_identity = Some(identity);
                self.change_state(ConnectionState::Connected);
                Ok(())
            }
            Response::IsUntrustedRelationship => {
                info!("server declared the client untrusted");
                self.change_state(ConnectionState::Disconnected);
                self.events.push(Event::ClientUntrusted);
                Ok(())
            }
            Response::Feature(message) => {
                self.events.push(Event::Feature(message));
                Ok(())
            }
        }
    }

    fn recover_cipher(&mut self, err: CipherError) -> Result<(), ClientError> {
        if self.store.is_none() {
            return Err(ClientError::IdentityNotEstablished);
        }
        self.cipher_failures += 1;
        if let Some(limit) = self.prekey_refresh_limit.filter(|&l| self.cipher_failures > l) {
            self.fail(format!(
                "cipher session could not be recovered after {limit} prekey refreshes"
            ));
            return Ok(());
        }

        warn!(error = %err, attempt = self.cipher_failures, "decrypt failed, refreshing prekeys");
        let target = self.server_identity.clone();
        let request = match self.store.as_mut() {
            Some(store) => store.create_prekey_request(target.as_ref())?,
            None => return Err(ClientError::IdentityNotEstablished),
        };
        self.send_request(&Request::SendPreKeys(request))
    }

    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    /// Sends `StartSession`, with the account proof for verified sessions.
    ///
    /// # Errors
    /// [`ClientError::NotConnected`] if the handshake was abandoned in the
    /// meantime.
    pub fn start_session(&mut self, server_id: Option<String>) -> Result<(), ClientError> {
        if self.state != ConnectionState::Connecting {
            return Err(ClientError::NotConnected);
        }
        let identity = self.identity().ok_or(ClientError::IdentityNotEstablished)?;
        self.send_request(&Request::StartSession {
            identity: identity.clone(),
            session: self.session.clone(),
            server_id,
        })?;
        self.events.push(Event::Identified(identity));
        Ok(())
    }

    /// Sends an application request. Only allowed once connected.
    ///
    /// # Errors
    /// [`ClientError::NotConnected`] before the handshake completes.
    pub fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.send_request(request)
    }

    /// Sends a keepalive through the same sender as everything else.
    pub fn send_keepalive(&mut self, identity: Option<&Identity>) -> Result<(), ClientError> {
        self.send_request(&Request::KeepAlive {
            identity: identity.cloned(),
        })
    }

    /// Encodes `request` for the current state and queues it.
    ///
    /// An invalid cipher session while connected is reported as
    /// [`Event::ClientUntrusted`] and the request is dropped.
    fn send_request(&mut self, request: &Request) -> Result<(), ClientError> {
        let bytes = if self.state == ConnectionState::Connected {
            let recipient = self.server_identity.as_ref().map(ServerIdentity::as_identity);
            match self.packet_codec().encode_encrypted(recipient, request) {
                Ok(bytes) => bytes,
                Err(e) if e.as_cipher().is_some_and(CipherError::is_invalid_session) => {
                    warn!(msg = request.name(), error = %e, "cipher session invalid, dropping send");
                    self.events.push(Event::ClientUntrusted);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            self.packet_codec().encode_plain(request)?
        };
        debug!(msg = request.name(), "sending");
        self.sender.send(bytes)
    }

    fn packet_codec(&self) -> PacketCodec<JsonCodec> {
        match &self.store {
            Some(store) => PacketCodec::with_cipher(JsonCodec, store.create_cipher()),
            None => PacketCodec::new(JsonCodec),
        }
    }

    // -----------------------------------------------------------------
    // State
    // -----------------------------------------------------------------

    fn set_phase(&mut self, phase: HandshakePhase) {
        if self.state == ConnectionState::Connecting {
            self.phase = Some(phase);
        }
    }

    fn change_state(&mut self, next: ConnectionState) {
        let previous = self.state;
        if previous != next {
            self.state = next;
            self.phase =
                (next == ConnectionState::Connecting).then_some(HandshakePhase::AwaitingIdentity);
            match self.identity() {
                Some(identity) => info!(%identity, from = %previous, to = %next, "state changed"),
                None => info!(from = %previous, to = %next, "state changed"),
            }
            if next == ConnectionState::Disconnected {
                self.teardown();
            }
            self.events.push(Event::StateChanged(next));
        }
        if next == ConnectionState::Disconnected {
            self.lock = None;
        }
    }

    fn teardown(&mut self) {
        self.sender.unbind();
        self.server_identity = None;
        self.cipher_failures = 0;
        if let Some(store) = self.store.as_mut() {
            store.clear_all_group_sessions();
            if let Err(e) = store.save() {
                error!(error = %e, "could not save identity store");
            }
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
