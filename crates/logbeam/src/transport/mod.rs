// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The authenticated channel to a remote collector.
//!
//! A transport moves through
//! `Disconnected -> Authenticating -> Connected -> LiveActive`, falls to `Failed`
//! on network or serialization errors from any state, and returns to
//! `Disconnected` on [`Transport::close`]. It never retries on its own: every
//! send completes with success or a typed [`TransportError`] and the dispatcher
//! decides what happens to the batch.

pub mod http;

use std::fmt;
use std::hash::Hasher;

use async_trait::async_trait;
use fnv::FnvHasher;
use reqwest::{StatusCode, Url};
use tracing::error;

use crate::errors::TransportError;
use crate::record::Batch;

pub use self::http::HttpTransport;

pub const REGISTER_PATH: &str = "/api/v1/source";
pub const SEND_PATH: &str = "/api/v1/send";
pub const LIVE_PATH: &str = "/api/v1/live";
pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const LIVE_SESSION_HEADER: &str = "X-Live-Session";
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

const CONNECTION_CODE_LEN: usize = 6;
/// No 0/O, 1/I/L: the code is read aloud or typed by hand.
const CONNECTION_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Authenticating,
    Connected,
    LiveActive,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::LiveActive)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::LiveActive => "live",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Where to connect and the shared secret presented during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub endpoint: String,
    pub secret: String,
}

impl EndpointConfig {
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("endpoint", &self.endpoint)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn is_live(&self) -> bool {
        self.state() == ConnectionState::LiveActive
    }

    /// Short shareable code identifying the live session, for pairing a viewer.
    fn live_connection_code(&self) -> Option<String>;

    /// Replaces the endpoint. Any session with a different endpoint is dropped;
    /// `None` returns the transport to the not-configured state.
    async fn configure(&self, endpoint: Option<EndpointConfig>);

    async fn authorize(&self) -> Result<(), TransportError>;

    async fn start_live(&self) -> Result<(), TransportError>;

    async fn stop_live(&self);

    async fn send_live(&self, batch: &Batch) -> Result<(), TransportError>;

    async fn send_archive(&self, batch: &Batch) -> Result<(), TransportError>;

    /// Invalidates session tokens and closes every sub-channel. Safe when idle.
    async fn close(&self);
}

/// Derives the pairing code for a live session token.
pub fn connection_code(live_session_token: &str) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(live_session_token.as_bytes());
    let mut hash = hasher.finish();
    let base = CONNECTION_CODE_ALPHABET.len() as u64;
    (0..CONNECTION_CODE_LEN)
        .map(|_| {
            let index = (hash % base) as usize;
            hash /= base;
            char::from(CONNECTION_CODE_ALPHABET[index])
        })
        .collect()
}

/// Maps a collector status onto the error taxonomy.
pub(crate) fn classify_status(status: StatusCode) -> Result<(), TransportError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(TransportError::NotAuthorized);
    }
    if !status.is_success() {
        return Err(TransportError::Network(format!(
            "collector responded with {status}"
        )));
    }
    Ok(())
}

/// Resolves `path` against the endpoint as an HTTP(S) URL; `ws`/`wss`
/// endpoints (as announced by discovery) map to `http`/`https`.
pub(crate) fn http_url(endpoint: &str, path: &str) -> Result<Url, TransportError> {
    endpoint_url(endpoint, path, false)
}

/// Resolves `path` against the endpoint as a WebSocket URL.
pub(crate) fn ws_url(endpoint: &str, path: &str) -> Result<Url, TransportError> {
    endpoint_url(endpoint, path, true)
}

fn endpoint_url(endpoint: &str, path: &str, websocket: bool) -> Result<Url, TransportError> {
    let mut url = Url::parse(endpoint.trim()).map_err(|e| {
        error!("Invalid collector endpoint {endpoint:?}: {e}");
        TransportError::NotConfigured
    })?;
    let scheme = match (url.scheme(), websocket) {
        ("http" | "ws", false) => "http",
        ("https" | "wss", false) => "https",
        ("http" | "ws", true) => "ws",
        ("https" | "wss", true) => "wss",
        (other, _) => {
            error!("Unsupported collector endpoint scheme {other:?}");
            return Err(TransportError::NotConfigured);
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TransportError::NotConfigured);
    }
    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}{path}"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_code_is_stable_and_unambiguous() {
        let code = connection_code("session-token-1");
        assert_eq!(code.len(), 6);
        assert_eq!(code, connection_code("session-token-1"));
        assert_ne!(code, connection_code("session-token-2"));
        assert!(code
            .bytes()
            .all(|b| CONNECTION_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::ACCEPTED).is_ok());
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            Err(TransportError::NotAuthorized)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            Err(TransportError::NotAuthorized)
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Err(TransportError::Network(_))
        ));
    }

    #[test]
    fn test_endpoint_urls() {
        assert_eq!(
            http_url("ws://10.0.0.5:9999", SEND_PATH)
                .expect("url")
                .as_str(),
            "http://10.0.0.5:9999/api/v1/send"
        );
        assert_eq!(
            http_url("https://collector.example.com/base/", REGISTER_PATH)
                .expect("url")
                .as_str(),
            "https://collector.example.com/base/api/v1/source"
        );
        assert_eq!(
            ws_url("https://collector.example.com", LIVE_PATH)
                .expect("url")
                .as_str(),
            "wss://collector.example.com/api/v1/live"
        );
        assert_eq!(
            http_url("ftp://collector", SEND_PATH),
            Err(TransportError::NotConfigured)
        );
        assert_eq!(
            http_url("not a url", SEND_PATH),
            Err(TransportError::NotConfigured)
        );
    }

    #[test]
    fn test_state_connectivity() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::LiveActive.is_connected());
        assert!(!ConnectionState::Authenticating.is_connected());
        assert!(!ConnectionState::Failed.is_connected());
    }
}
