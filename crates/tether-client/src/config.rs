//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use tether_keepalive::KeepAliveConfig;
use tether_protocol::PlayerSession;

/// Everything a client needs to connect.
///
/// Build one with [`ClientConfig::builder`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the server, e.g. `https://tether.example`.
    pub server_url: String,
    /// Working directory holding the identity store and the lock file.
    pub home_dir: PathBuf,
    /// The game session to start.
    pub session: PlayerSession,
    pub keepalive: KeepAliveConfig,
    /// Consecutive decrypt failures tolerated before giving up on the
    /// connection. `None` keeps refreshing prekeys indefinitely.
    pub prekey_refresh_limit: Option<u32>,
    /// How long to wait for out-of-band device approval. `None` waits
    /// indefinitely.
    pub device_approval_timeout: Option<Duration>,
    /// Timeout for the discovery request.
    pub http_timeout: Duration,
}

impl ClientConfig {
    pub fn builder(server_url: impl Into<String>, session: PlayerSession) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: ClientConfig {
                server_url: server_url.into(),
                home_dir: PathBuf::from(".tether"),
                session,
                keepalive: KeepAliveConfig::default(),
                prekey_refresh_limit: None,
                device_approval_timeout: None,
                http_timeout: Duration::from_secs(10),
            },
        }
    }
}

/// Builder for [`ClientConfig`].
///
/// ```rust,ignore
/// let config = ClientConfig::builder("https://tether.example", session)
///     .home_dir(dirs.join("tether"))
///     .device_approval_timeout(Duration::from_secs(300))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn home_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.home_dir = dir.into();
        self
    }

    pub fn keepalive(mut self, config: KeepAliveConfig) -> Self {
        self.config.keepalive = config;
        self
    }

    pub fn prekey_refresh_limit(mut self, limit: u32) -> Self {
        self.config.prekey_refresh_limit = Some(limit);
        self
    }

    pub fn device_approval_timeout(mut self, timeout: Duration) -> Self {
        self.config.device_approval_timeout = Some(timeout);
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_timeout = timeout;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
