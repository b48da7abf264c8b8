//! Pre-connect compatibility check.
//!
//! Before opening the socket the client asks the server what it speaks
//! (`GET /api/discover`) and refuses to connect unless the server offers
//! this client's exact protocol version and every capability it relies
//! on. Only then is `/api/1/listen` opened.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tether_protocol::{PlayerSession, SessionMode};

use crate::ClientError;

/// Path of the discovery endpoint.
pub const DISCOVER_PATH: &str = "/api/discover";

/// Path of the socket endpoint.
pub const LISTEN_PATH: &str = "/api/1/listen";

/// The protocol version compiled into this client.
pub const CLIENT_VERSION: Version = Version { major: 0, minor: 1 };

/// Feature naming the server's account-verification scheme.
pub const VERIFICATION_SCHEME: &str = "auth:verification_scheme";

/// Capabilities the client refuses to run without.
pub const REQUIRED_FEATURES: [&str; 3] = ["groups:locations", "groups:waypoints", "profile:friends"];

/// A protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A capability offered by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Body of the discovery endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub versions: Vec<Version>,
    pub features: Vec<Feature>,
}

impl DiscoverResponse {
    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }
}

/// Fetches the server's discovery document.
///
/// # Errors
/// [`ClientError::Connection`] for a malformed URL or an unreachable
/// server, [`ClientError::Http`] for a bad response.
pub async fn discover(
    http: &reqwest::Client,
    server_url: &str,
) -> Result<DiscoverResponse, ClientError> {
    let url = endpoint(server_url, DISCOVER_PATH)?;
    tracing::debug!(%url, "discovering server");
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| ClientError::connection("problem connecting to server", e))?
        .error_for_status()?;
    Ok(response.json().await?)
}

/// Checks that the server can serve `session`.
///
/// # Errors
/// [`ClientError::UnsupportedServerVersion`],
/// [`ClientError::MissingFeature`], or
/// [`ClientError::VerificationScheme`].
pub fn check_compatibility(
    response: &DiscoverResponse,
    session: &PlayerSession,
) -> Result<(), ClientError> {
    if !response.versions.contains(&CLIENT_VERSION) {
        let server = response
            .versions
            .iter()
            .map(Version::to_string)
            .collect::<Vec<_>>()
            .join(",");
        return Err(ClientError::UnsupportedServerVersion {
            client: CLIENT_VERSION.to_string(),
            server,
        });
    }

    let scheme = response
        .feature(VERIFICATION_SCHEME)
        .ok_or_else(|| ClientError::MissingFeature(VERIFICATION_SCHEME.into()))?;
    match scheme.value.as_str() {
        Some("mojang")
            if session.mode != SessionMode::Verified && session.access_token.is_none() =>
        {
            return Err(ClientError::VerificationScheme("mojang".into()));
        }
        Some("nojang")
            if session.mode != SessionMode::Unverified && session.access_token.is_some() =>
        {
            return Err(ClientError::VerificationScheme("nojang".into()));
        }
        _ => {}
    }

    for name in REQUIRED_FEATURES {
        if response.feature(name).is_none() {
            return Err(ClientError::MissingFeature(name.into()));
        }
    }
    Ok(())
}

/// Resolves `path` against the server's base URL.
pub fn endpoint(server_url: &str, path: &str) -> Result<Url, ClientError> {
    Url::parse(server_url)
        .and_then(|base| base.join(path))
        .map_err(|e| ClientError::connection(format!("invalid server url {server_url}"), e))
}

/// The socket URL: the listen endpoint with `http` mapped to `ws` and
/// `https` to `wss`.
pub fn listen_url(server_url: &str) -> Result<Url, ClientError> {
    let mut url = endpoint(server_url, LISTEN_PATH)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|()| ClientError::Connection {
            message: format!("cannot open a socket to {server_url}"),
            source: None,
        })?;
    Ok(url)
}
