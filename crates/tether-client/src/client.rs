//! The async client shell around the orchestrator.
//!
//! [`Client`] owns the socket tasks and the keepalive monitor. All session
//! state lives in the [`Orchestrator`] behind one lock. Every path that
//! touches it (the reader task, the keepalive probe, timers, and the public
//! API) drains the orchestrator's events after releasing the lock, so
//! listener and handler callbacks never run while it is held.

use std::sync::Arc;

use parking_lot::Mutex;
use tether_keepalive::KeepAlive;
use tether_protocol::{Identity, PlayerSession, Request, ServerIdentity};
use tether_transport::{Connection, ConnectionId, WebSocketConnection};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

use crate::discovery::{check_compatibility, discover, listen_url};
use crate::orchestrator::{Event, Orchestrator};
use crate::{
    AccountVerifier, ClientConfig, ClientError, ClientListener, ConnectionState, DirectoryLock,
    FeatureHandler, HandlerChain, HandshakePhase, HookHandle, IdentityStoreFactory, Lifecycle,
    LoggingListener, Unverified,
};

/// A Tether client.
///
/// ```rust,ignore
/// let client = Client::builder(config, MyStoreFactory::new(&home))
///     .listener(MyListener)
///     .handler(Arc::new(FriendsApi::default()))
///     .lifecycle(&lifecycle)
///     .build()?;
/// client.connect().await?;
/// ```
///
/// Dropping the client disconnects it.
pub struct Client<F: IdentityStoreFactory, V: AccountVerifier = Unverified> {
    inner: Arc<Inner<F, V>>,
    _shutdown_hook: Option<HookHandle>,
}

struct Inner<F: IdentityStoreFactory, V: AccountVerifier> {
    config: ClientConfig,
    orchestrator: Mutex<Orchestrator<F>>,
    listener: Arc<dyn ClientListener>,
    handlers: HandlerChain,
    verifier: V,
    http: reqwest::Client,
    keepalive: Mutex<KeepAlive>,
    /// The socket whose reader may drive the orchestrator.
    current: Mutex<Option<ConnectionId>>,
}

impl<F: IdentityStoreFactory> Client<F> {
    pub fn builder(config: ClientConfig, factory: F) -> ClientBuilder<F> {
        ClientBuilder {
            config,
            factory,
            listener: Arc::new(LoggingListener),
            handlers: HandlerChain::new(),
            verifier: Unverified,
            lifecycle: None,
        }
    }
}

impl<F: IdentityStoreFactory, V: AccountVerifier> Client<F, V> {
    /// Discovers the server, opens the socket and starts the handshake.
    ///
    /// Returns once the socket is open. The handshake continues in the
    /// background; watch [`ClientListener::on_state_changed`] for
    /// [`ConnectionState::Connected`].
    ///
    /// # Errors
    /// Failures before the socket opens: the directory is locked, the
    /// server is unreachable or incompatible, or the socket could not be
    /// opened. The client stays disconnected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        let state = inner.orchestrator.lock().state();
        if state != ConnectionState::Disconnected {
            return Err(ClientError::AlreadyConnected(state));
        }

        let lock = DirectoryLock::acquire(&inner.config.home_dir).inspect_err(|e| {
            inner.listener.on_error(&e.to_string());
        })?;

        let discovered = discover(&inner.http, &inner.config.server_url).await?;
        check_compatibility(&discovered, &inner.config.session)?;
        let url = listen_url(&inner.config.server_url)?;

        info!(%url, "opening socket");
        let conn = Arc::new(WebSocketConnection::connect(url.as_str()).await?);
        *inner.current.lock() = Some(conn.id());

        let (tx, rx) = mpsc::unbounded_channel();
        let opened = inner.orchestrator.lock().on_open(tx, Some(lock));
        if let Err(e) = opened {
            error!(error = %e, "could not start handshake");
            inner.orchestrator.lock().disconnect();
            inner.drain();
            return Err(e);
        }

        inner.restart_keepalive(None);
        tokio::spawn(write_loop(Arc::clone(&conn), rx));
        tokio::spawn(read_loop(Arc::clone(inner), conn));
        inner.drain();
        Ok(())
    }

    /// Disconnects. Does nothing when already disconnected.
    pub fn disconnect(&self) {
        self.inner.orchestrator.lock().disconnect();
        self.inner.drain();
    }

    /// Sends an application request over the encrypted session.
    ///
    /// # Errors
    /// [`ClientError::NotConnected`] until the handshake completes.
    pub fn send(&self, request: &Request) -> Result<(), ClientError> {
        let result = self.inner.orchestrator.lock().send(request);
        self.inner.drain();
        result
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.orchestrator.lock().state()
    }

    /// The handshake phase while connecting.
    pub fn phase(&self) -> Option<HandshakePhase> {
        self.inner.orchestrator.lock().phase()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.orchestrator.lock().identity()
    }

    pub fn server_identity(&self) -> Option<ServerIdentity> {
        self.inner.orchestrator.lock().server_identity().cloned()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl<F: IdentityStoreFactory, V: AccountVerifier> Drop for Client<F, V> {
    fn drop(&mut self) {
        self.disconnect();
        self.inner.keepalive.lock().stop();
    }
}

impl<F: IdentityStoreFactory, V: AccountVerifier> Inner<F, V> {
    /// Dispatches queued events until the orchestrator has none left.
    fn drain(self: &Arc<Self>) {
        loop {
            let events = self.orchestrator.lock().take_events();
            if events.is_empty() {
                return;
            }
            for event in events {
                self.dispatch(event);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, event: Event) {
        match event {
            Event::StateChanged(state) => {
                if state == ConnectionState::Disconnected {
                    self.keepalive.lock().stop();
                }
                self.listener.on_state_changed(state);
                self.handlers.on_state_changed(state);
            }
            Event::Error(message) => self.listener.on_error(&message),
            Event::ConfirmDeviceRegistration { token, url } => {
                self.listener.on_confirm_device_registration(&token, &url);
            }
            Event::AccountVerificationFailed(session) => {
                self.listener.on_account_verification_failed(&session);
            }
            Event::PrivateIdentityMismatch(url) => {
                self.listener.on_private_identity_mismatch(&url);
            }
            Event::ClientUntrusted => self.listener.on_client_untrusted(),
            Event::Feature(message) => {
                self.handlers.dispatch(&message);
            }
            Event::Identified(identity) => self.restart_keepalive(Some(identity)),
            Event::VerifyAccount {
                session,
                server_public_key,
                shared_secret,
            } => {
                tokio::spawn(Arc::clone(self).verify_account(
                    session,
                    server_public_key,
                    shared_secret,
                ));
            }
            Event::AwaitingApproval => self.arm_approval_timeout(),
        }
    }

    async fn verify_account(
        self: Arc<Self>,
        session: PlayerSession,
        server_public_key: Vec<u8>,
        shared_secret: Vec<u8>,
    ) {
        debug!(username = %session.username, "verifying account");
        let result = self
            .verifier
            .join_server(&session, &server_public_key, &shared_secret)
            .await;
        {
            let mut orchestrator = self.orchestrator.lock();
            if orchestrator.state() == ConnectionState::Connecting {
                match result {
                    Ok(server_id) => {
                        if let Err(e) = orchestrator.start_session(Some(server_id)) {
                            warn!(error = %e, "could not start session");
                        }
                    }
                    Err(e) => orchestrator.fail(e.to_string()),
                }
            }
        }
        self.drain();
    }

    fn arm_approval_timeout(self: &Arc<Self>) {
        let Some(timeout) = self.config.device_approval_timeout else {
            return;
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut orchestrator = inner.orchestrator.lock();
                if orchestrator.phase() == Some(HandshakePhase::AwaitingDeviceApproval) {
                    orchestrator.fail(format!(
                        "device was not approved within {}s",
                        timeout.as_secs()
                    ));
                }
            }
            inner.drain();
        });
    }

    /// The probe holds the client until the keepalive is stopped, which
    /// happens on every disconnect and when the client is dropped.
    fn restart_keepalive(self: &Arc<Self>, identity: Option<Identity>) {
        let inner = Arc::clone(self);
        let probe = move |identity: Option<&Identity>| {
            let result = inner.orchestrator.lock().send_keepalive(identity);
            if let Err(e) = result {
                debug!(error = %e, "keepalive not sent");
            }
            inner.drain();
        };
        self.keepalive.lock().start(identity, Arc::new(probe));
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        *self.current.lock() == Some(id)
    }
}

/// Moves queued envelopes onto the socket, then closes it once the
/// orchestrator unbinds the sender.
async fn write_loop(conn: Arc<WebSocketConnection>, mut rx: UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = conn.send(&bytes).await {
            warn!(id = %conn.id(), error = %e, "send failed");
            break;
        }
    }
    if let Err(e) = conn.close().await {
        debug!(id = %conn.id(), error = %e, "close failed");
    }
}

/// Feeds inbound envelopes to the orchestrator in arrival order.
async fn read_loop<F: IdentityStoreFactory, V: AccountVerifier>(
    inner: Arc<Inner<F, V>>,
    conn: Arc<WebSocketConnection>,
) {
    let id = conn.id();
    loop {
        let received = conn.recv().await;
        if !inner.is_current(id) {
            debug!(%id, "socket replaced, reader exiting");
            return;
        }
        match received {
            Ok(Some(bytes)) => {
                let result = inner.orchestrator.lock().receive(&bytes);
                if let Err(e) = result {
                    error!(%id, error = %e, "could not process message");
                    inner.orchestrator.lock().on_failure(&e);
                }
                inner.drain();
            }
            Ok(None) => {
                inner.orchestrator.lock().on_close(conn.close_info());
                inner.drain();
                return;
            }
            Err(e) => {
                inner.orchestrator.lock().on_failure(&e);
                inner.drain();
                return;
            }
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder<F: IdentityStoreFactory, V: AccountVerifier = Unverified> {
    config: ClientConfig,
    factory: F,
    listener: Arc<dyn ClientListener>,
    handlers: HandlerChain,
    verifier: V,
    lifecycle: Option<Lifecycle>,
}

impl<F: IdentityStoreFactory, V: AccountVerifier> ClientBuilder<F, V> {
    /// Sets the listener. Defaults to [`LoggingListener`].
    pub fn listener(mut self, listener: impl ClientListener) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Appends a feature handler. Handlers see feature messages in
    /// registration order.
    pub fn handler(mut self, handler: Arc<dyn FeatureHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Sets the account verifier used for verified sessions.
    pub fn verifier<V2: AccountVerifier>(self, verifier: V2) -> ClientBuilder<F, V2> {
        ClientBuilder {
            config: self.config,
            factory: self.factory,
            listener: self.listener,
            handlers: self.handlers,
            verifier,
            lifecycle: self.lifecycle,
        }
    }

    /// Saves the identity store and releases the directory lock when
    /// `lifecycle` shuts down.
    pub fn lifecycle(mut self, lifecycle: &Lifecycle) -> Self {
        self.lifecycle = Some(lifecycle.clone());
        self
    }

    /// # Errors
    /// [`ClientError::Http`] if the HTTP client cannot be created.
    pub fn build(self) -> Result<Client<F, V>, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(self.config.http_timeout)
            .build()?;
        let keepalive = KeepAlive::new(self.config.keepalive.clone());
        let orchestrator = Orchestrator::new(self.factory, &self.config);

        let inner = Arc::new(Inner {
            config: self.config,
            orchestrator: Mutex::new(orchestrator),
            listener: self.listener,
            handlers: self.handlers,
            verifier: self.verifier,
            http,
            keepalive: Mutex::new(keepalive),
            current: Mutex::new(None),
        });

        // Deregistered when the client drops its handle.
        let shutdown_hook = self.lifecycle.map(|lifecycle| {
            let inner = Arc::clone(&inner);
            lifecycle.register(move || inner.orchestrator.lock().save_on_shutdown())
        });

        Ok(Client {
            inner,
            _shutdown_hook: shutdown_hook,
        })
    }
}
