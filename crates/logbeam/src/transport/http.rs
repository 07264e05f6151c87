// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector transport over HTTP(S) with a WebSocket live sub-channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::TransportError;
use crate::http::get_client;
use crate::record::{ApplicationInfo, Batch};
use crate::transport::{
    classify_status, connection_code, http_url, ws_url, ConnectionState, EndpointConfig,
    Transport, AUTHORIZATION_HEADER, LIVE_PATH, LIVE_SESSION_HEADER, PROTOBUF_CONTENT_TYPE,
    REGISTER_PATH, SEND_PATH,
};
use crate::wire::{encode_batch, encode_live_envelope, SenderRegistration};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Answer to the registration handshake.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionGrant {
    auth_token: String,
    #[serde(default)]
    live_session_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    auth_token: String,
    live_session_token: Option<String>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Option<EndpointConfig>,
    session: Option<Session>,
    state: ConnectionState,
    /// Bumped whenever a live channel is opened or invalidated so a stale
    /// reader task cannot demote the state of a newer channel.
    live_generation: u64,
}

struct LiveChannel {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
    generation: u64,
}

struct Shared {
    client: reqwest::Client,
    app: ApplicationInfo,
    compression_level: i32,
    /// Bounds the live channel handshake like the client bounds requests.
    request_timeout: Duration,
    inner: Mutex<Inner>,
    live: tokio::sync::Mutex<Option<LiveChannel>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn demote_live(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.live_generation == generation && inner.state == ConnectionState::LiveActive {
            inner.state = ConnectionState::Connected;
        }
    }
}

pub struct HttpTransport {
    shared: Arc<Shared>,
}

impl HttpTransport {
    pub fn new(config: &Config, app: ApplicationInfo) -> Self {
        let endpoint = match (&config.endpoint, &config.secret) {
            (Some(endpoint), Some(secret)) => Some(EndpointConfig::new(endpoint, secret)),
            _ => None,
        };
        Self {
            shared: Arc::new(Shared {
                client: get_client(config),
                app,
                compression_level: config.compression_level,
                request_timeout: config.request_timeout,
                inner: Mutex::new(Inner {
                    endpoint,
                    session: None,
                    state: ConnectionState::Disconnected,
                    live_generation: 0,
                }),
                live: tokio::sync::Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.lock()
    }

    fn session(&self) -> Result<(EndpointConfig, Session), TransportError> {
        let inner = self.lock();
        let endpoint = inner
            .endpoint
            .clone()
            .ok_or(TransportError::NotConfigured)?;
        let session = inner
            .session
            .clone()
            .ok_or(TransportError::NotAuthorized)?;
        Ok((endpoint, session))
    }

    async fn register(
        &self,
        endpoint: &EndpointConfig,
    ) -> Result<SessionGrant, TransportError> {
        let url = http_url(&endpoint.endpoint, REGISTER_PATH)?;
        let body = SenderRegistration::new(&endpoint.secret, &self.shared.app).encode_to_vec();
        let response = self
            .shared
            .client
            .post(url)
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        classify_status(response.status())?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(TransportError::serialization)
    }

    /// Applies the state change for a failed send, unless the session it was
    /// sent under has already been replaced.
    async fn record_failure(&self, auth_token: &str, err: &TransportError) {
        let drop_live = {
            let mut inner = self.lock();
            let current = inner
                .session
                .as_ref()
                .is_some_and(|session| session.auth_token == auth_token);
            match err {
                TransportError::NotAuthorized if current => {
                    inner.session = None;
                    inner.state = ConnectionState::Disconnected;
                    true
                }
                TransportError::Network(_) if current => {
                    inner.state = ConnectionState::Failed;
                    true
                }
                _ => false,
            }
        };
        if drop_live {
            self.drop_live_channel(false).await;
        }
    }

    async fn drop_live_channel(&self, graceful: bool) {
        let channel = self.shared.live.lock().await.take();
        if let Some(mut channel) = channel {
            if graceful {
                if let Err(e) = channel.sink.send(Message::Close(None)).await {
                    debug!("Live channel close handshake failed: {e}");
                }
            }
            channel.reader.abort();
            self.shared.demote_live(channel.generation);
        }
    }
}

async fn read_live(shared: Weak<Shared>, mut stream: SplitStream<WsStream>, generation: u64) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Live channel read failed: {e}");
                break;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        debug!("Live channel closed by collector");
        shared.demote_live(generation);
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn state(&self) -> ConnectionState {
        self.lock().state
    }

    fn live_connection_code(&self) -> Option<String> {
        let inner = self.lock();
        if inner.state != ConnectionState::LiveActive {
            return None;
        }
        inner
            .session
            .as_ref()?
            .live_session_token
            .as_deref()
            .map(connection_code)
    }

    async fn configure(&self, endpoint: Option<EndpointConfig>) {
        {
            let mut inner = self.lock();
            if inner.endpoint == endpoint {
                return;
            }
            debug!(
                "Collector endpoint set to {:?}",
                endpoint.as_ref().map(|e| e.endpoint.as_str())
            );
            inner.endpoint = endpoint;
            inner.session = None;
            inner.state = ConnectionState::Disconnected;
            inner.live_generation += 1;
        }
        self.drop_live_channel(true).await;
    }

    async fn authorize(&self) -> Result<(), TransportError> {
        // A new handshake replaces the session the live channel was opened with.
        self.drop_live_channel(true).await;
        let endpoint = {
            let mut inner = self.lock();
            let endpoint = inner
                .endpoint
                .clone()
                .ok_or(TransportError::NotConfigured)?;
            inner.state = ConnectionState::Authenticating;
            endpoint
        };

        let result = self.register(&endpoint).await;

        let mut inner = self.lock();
        if inner.endpoint.as_ref() != Some(&endpoint) {
            return Err(TransportError::Network(
                "endpoint changed during authorization".to_string(),
            ));
        }
        match result {
            Ok(grant) => {
                debug!("Authorized with collector at {}", endpoint.endpoint);
                inner.session = Some(Session {
                    auth_token: grant.auth_token,
                    live_session_token: grant.live_session_token,
                });
                inner.state = ConnectionState::Connected;
                Ok(())
            }
            Err(TransportError::NotAuthorized) => {
                warn!("Collector at {} rejected the sender secret", endpoint.endpoint);
                inner.session = None;
                inner.state = ConnectionState::Disconnected;
                Err(TransportError::NotAuthorized)
            }
            Err(TransportError::NotConfigured) => {
                inner.state = ConnectionState::Disconnected;
                Err(TransportError::NotConfigured)
            }
            Err(e) => {
                inner.state = ConnectionState::Failed;
                Err(e)
            }
        }
    }

    async fn start_live(&self) -> Result<(), TransportError> {
        let (endpoint, session) = self.session()?;
        let url = ws_url(&endpoint.endpoint, LIVE_PATH)?;
        let mut request = url.as_str().into_client_request()?;
        {
            let headers = request.headers_mut();
            headers.insert(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(&session.auth_token).map_err(TransportError::serialization)?,
            );
            if let Some(token) = &session.live_session_token {
                headers.insert(
                    HeaderName::from_static("x-live-session"),
                    HeaderValue::from_str(token).map_err(TransportError::serialization)?,
                );
            }
        }

        self.drop_live_channel(false).await;
        let timeout = self.shared.request_timeout;
        let (stream, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                TransportError::Network(format!("live handshake timed out after {timeout:?}"))
            })??;
        let (sink, stream) = stream.split();

        let mut live = self.shared.live.lock().await;
        if let Some(previous) = live.take() {
            previous.reader.abort();
        }

        let generation = {
            let mut inner = self.lock();
            if inner.session.as_ref() != Some(&session) {
                return Err(TransportError::NotAuthorized);
            }
            inner.live_generation += 1;
            inner.state = ConnectionState::LiveActive;
            inner.live_generation
        };
        let reader = tokio::spawn(read_live(Arc::downgrade(&self.shared), stream, generation));
        *live = Some(LiveChannel {
            sink,
            reader,
            generation,
        });
        debug!(
            "Live channel open at {url} ({AUTHORIZATION_HEADER}, {LIVE_SESSION_HEADER} presented)"
        );
        Ok(())
    }

    async fn stop_live(&self) {
        self.drop_live_channel(true).await;
    }

    async fn send_live(&self, batch: &Batch) -> Result<(), TransportError> {
        let envelope = encode_live_envelope(self.shared.app.sender_id(), &batch.records)?;
        let mut live = self.shared.live.lock().await;
        let Some(channel) = live.as_mut() else {
            return Err(TransportError::Network("live channel is not open".to_string()));
        };
        if let Err(e) = channel.sink.send(Message::Text(envelope)).await {
            if let Some(channel) = live.take() {
                channel.reader.abort();
                self.shared.demote_live(channel.generation);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_archive(&self, batch: &Batch) -> Result<(), TransportError> {
        let (endpoint, session) = self.session()?;
        let url = http_url(&endpoint.endpoint, SEND_PATH)?;
        let body = encode_batch(batch);

        let mut request = self
            .shared
            .client
            .post(url)
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .header(AUTHORIZATION_HEADER, &session.auth_token);
        if let Some(token) = &session.live_session_token {
            request = request.header(LIVE_SESSION_HEADER, token);
        }
        request = if self.shared.compression_level > 0 {
            let compressed = zstd::encode_all(body.as_slice(), self.shared.compression_level)
                .map_err(TransportError::serialization)?;
            request.header(CONTENT_ENCODING, "zstd").body(compressed)
        } else {
            request.body(body)
        };

        let result = match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &result {
            self.record_failure(&session.auth_token, e).await;
        }
        result
    }

    async fn close(&self) {
        self.drop_live_channel(true).await;
        let mut inner = self.lock();
        inner.session = None;
        inner.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogLevel, LogRecord};
    use mockito::Matcher;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    const GRANT: &str = r#"{"authToken":"auth-1","liveSessionToken":"live-1"}"#;

    fn app() -> ApplicationInfo {
        ApplicationInfo {
            app_id: "com.example.app".to_string(),
            version: "1.2.3".to_string(),
            build: "42".to_string(),
            os: "linux".to_string(),
            device_model: "test".to_string(),
            device_id: "device-1".to_string(),
        }
    }

    fn transport(endpoint: &str, compression_level: i32) -> HttpTransport {
        let config = Config {
            endpoint: Some(endpoint.to_string()),
            secret: Some("s3cret".to_string()),
            compression_level,
            ..Config::default()
        };
        HttpTransport::new(&config, app())
    }

    fn batch() -> Batch {
        Batch::new(
            "b-1",
            vec![LogRecord {
                position: 7,
                timestamp: 1_700_000_000.0,
                level: LogLevel::Info,
                message: "hello".to_string(),
                label: "net".to_string(),
                meta: None,
                source: None,
            }],
        )
    }

    #[tokio::test]
    async fn test_authorize_then_send_archive() {
        let mut server = mockito::Server::new_async().await;
        let register = server
            .mock("POST", "/api/v1/source")
            .match_header("content-type", PROTOBUF_CONTENT_TYPE)
            .with_status(200)
            .with_body(GRANT)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/api/v1/send")
            .match_header("authorization", "auth-1")
            .match_header("x-live-session", "live-1")
            .match_header("content-encoding", Matcher::Missing)
            .with_status(202)
            .create_async()
            .await;

        let transport = transport(&server.url(), 0);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        transport.authorize().await.expect("authorize");
        assert_eq!(transport.state(), ConnectionState::Connected);
        transport.send_archive(&batch()).await.expect("send");

        register.assert_async().await;
        send.assert_async().await;
    }

    #[tokio::test]
    async fn test_archive_upload_is_compressed_when_configured() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/source")
            .with_body(GRANT)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/api/v1/send")
            .match_header("content-encoding", "zstd")
            .with_status(200)
            .create_async()
            .await;

        let transport = transport(&server.url(), 3);
        transport.authorize().await.expect("authorize");
        transport.send_archive(&batch()).await.expect("send");
        send.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_secret_is_not_authorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/source")
            .with_status(401)
            .create_async()
            .await;

        let transport = transport(&server.url(), 0);
        assert_eq!(
            transport.authorize().await,
            Err(TransportError::NotAuthorized)
        );
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_server_error_fails_the_handshake() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/source")
            .with_status(503)
            .create_async()
            .await;

        let transport = transport(&server.url(), 0);
        assert!(matches!(
            transport.authorize().await,
            Err(TransportError::Network(_))
        ));
        assert_eq!(transport.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_malformed_grant_is_a_serialization_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/source")
            .with_body("not json")
            .create_async()
            .await;

        let transport = transport(&server.url(), 0);
        assert!(matches!(
            transport.authorize().await,
            Err(TransportError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_send_requires_configuration_and_session() {
        let unconfigured = HttpTransport::new(&Config::default(), app());
        assert_eq!(
            unconfigured.authorize().await,
            Err(TransportError::NotConfigured)
        );
        assert_eq!(
            unconfigured.send_archive(&batch()).await,
            Err(TransportError::NotConfigured)
        );

        let unauthorized = transport("http://127.0.0.1:9", 0);
        assert_eq!(
            unauthorized.send_archive(&batch()).await,
            Err(TransportError::NotAuthorized)
        );
        assert!(matches!(
            unauthorized.send_live(&batch()).await,
            Err(TransportError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_drops_the_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/source")
            .with_body(GRANT)
            .create_async()
            .await;
        server
            .mock("POST", "/api/v1/send")
            .with_status(403)
            .create_async()
            .await;

        let transport = transport(&server.url(), 0);
        transport.authorize().await.expect("authorize");
        assert_eq!(
            transport.send_archive(&batch()).await,
            Err(TransportError::NotAuthorized)
        );
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_reconfigure_resets_the_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/source")
            .with_body(GRANT)
            .create_async()
            .await;

        let transport = transport(&server.url(), 0);
        transport.authorize().await.expect("authorize");
        transport
            .configure(Some(EndpointConfig::new(server.url(), "s3cret")))
            .await;
        assert!(transport.is_connected());

        transport
            .configure(Some(EndpointConfig::new("http://127.0.0.1:9", "s3cret")))
            .await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        transport.configure(None).await;
        assert_eq!(
            transport.authorize().await,
            Err(TransportError::NotConfigured)
        );
    }

    #[tokio::test]
    async fn test_live_channel_streams_envelopes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (headers_tx, headers_rx) = oneshot::channel();
        let collector = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_hdr_async(stream, move |request: &Request, response: Response| {
                let header = |name: &str| {
                    request
                        .headers()
                        .get(name)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string)
                };
                let _ = headers_tx.send((
                    request.uri().path().to_string(),
                    header("authorization"),
                    header("x-live-session"),
                ));
                Ok(response)
            })
            .await
            .expect("handshake");
            let frame = ws.next().await.expect("frame").expect("message");
            ws.close(None).await.expect("close");
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                while ws.next().await.is_some() {}
            })
            .await;
            frame
        });

        let transport = transport(&format!("http://{addr}"), 0);
        {
            let mut inner = transport.lock();
            inner.session = Some(Session {
                auth_token: "auth-1".to_string(),
                live_session_token: Some("live-1".to_string()),
            });
            inner.state = ConnectionState::Connected;
        }
        assert_eq!(transport.live_connection_code(), None);

        transport.start_live().await.expect("start live");
        assert!(transport.is_live());
        assert_eq!(
            transport.live_connection_code(),
            Some(connection_code("live-1"))
        );
        transport.send_live(&batch()).await.expect("send live");

        let (path, authorization, live_session) = headers_rx.await.expect("headers");
        assert_eq!(path, "/api/v1/live");
        assert_eq!(authorization.as_deref(), Some("auth-1"));
        assert_eq!(live_session.as_deref(), Some("live-1"));

        let Message::Text(text) = collector.await.expect("collector") else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["type"], "v0/logMessageBatch");
        assert_eq!(value["payload"]["senderId"], "device-1");
        assert_eq!(value["payload"]["messages"][0]["position"], 7);

        for _ in 0..100 {
            if transport.state() == ConnectionState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(transport.live_connection_code(), None);
    }

    #[tokio::test]
    async fn test_stalled_live_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Accepts the connection and never answers the upgrade.
        let stalled = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let config = Config {
            endpoint: Some(format!("http://{addr}")),
            secret: Some("s3cret".to_string()),
            request_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let transport = HttpTransport::new(&config, app());
        {
            let mut inner = transport.lock();
            inner.session = Some(Session {
                auth_token: "auth-1".to_string(),
                live_session_token: None,
            });
            inner.state = ConnectionState::Connected;
        }

        let result = tokio::time::timeout(Duration::from_secs(3), transport.start_live())
            .await
            .expect("start_live must give up on its own");
        assert!(matches!(result, Err(TransportError::Network(_))));
        assert!(!transport.is_live());

        // The live lock is free again, so teardown does not wait on the handshake.
        tokio::time::timeout(Duration::from_secs(1), transport.close())
            .await
            .expect("close");
        stalled.abort();
    }
}
