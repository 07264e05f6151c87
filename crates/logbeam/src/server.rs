// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! LAN live view: a small WebSocket server that streams every locally
//! produced record to the viewers connected on [`LIVE_VIEW_PATH`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dispatcher::RecordSink;
use crate::errors::ServerError;
use crate::record::LogRecord;
use crate::wire::encode_live_envelope;

pub const LIVE_VIEW_PATH: &str = "/live";
const VIEWER_QUEUE_CAPACITY: usize = 256;

struct Viewer {
    id: u64,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct Viewers {
    list: Mutex<Vec<Viewer>>,
    next_id: AtomicU64,
}

impl Viewers {
    fn lock(&self) -> MutexGuard<'_, Vec<Viewer>> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, tx: mpsc::Sender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Viewer { id, tx });
        id
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|viewer| viewer.id != id);
    }
}

pub struct LiveViewServer {
    addr: SocketAddr,
    sender_id: String,
    viewers: Arc<Viewers>,
    cancel: CancellationToken,
}

impl LiveViewServer {
    /// Binds the listener and starts accepting viewers in the background.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        sender_id: impl Into<String>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let viewers = Arc::new(Viewers::default());
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::clone(&viewers), cancel.clone()));
        debug!("Live view server listening on {addr}");
        Ok(Self {
            addr,
            sender_id: sender_id.into(),
            viewers,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The URL viewers connect to, also what discovery announces.
    pub fn endpoint_url(&self) -> String {
        format!("ws://{}{}", self.addr, LIVE_VIEW_PATH)
    }

    pub fn viewer_count(&self) -> usize {
        let mut viewers = self.viewers.lock();
        viewers.retain(|viewer| !viewer.tx.is_closed());
        viewers.len()
    }

    /// Sends one envelope to every viewer and returns how many accepted it.
    /// Closed viewers are pruned first; a viewer whose queue is full is dropped.
    pub fn broadcast(&self, records: &[LogRecord]) -> usize {
        let envelope = match encode_live_envelope(&self.sender_id, records) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Failed to encode live view envelope: {e}");
                return 0;
            }
        };
        let message = Message::Text(envelope);

        let mut viewers = self.viewers.lock();
        viewers.retain(|viewer| !viewer.tx.is_closed());
        let mut delivered = 0;
        viewers.retain(|viewer| match viewer.tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Live viewer {} is not keeping up, disconnecting it", viewer.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LiveViewServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl RecordSink for LiveViewServer {
    fn on_record(&self, record: &LogRecord) {
        self.broadcast(std::slice::from_ref(record));
    }
}

async fn serve(listener: TcpListener, viewers: Arc<Viewers>, cancel: CancellationToken) {
    let mut joinset = JoinSet::new();
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Live view server error: {e}");
                    break;
                }
                Ok((stream, _)) => stream,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Live viewer handler panicked: {:?}", e);
                    }
                }
                continue;
            },
        };
        joinset.spawn(handle_viewer(stream, Arc::clone(&viewers), cancel.clone()));
    }
    joinset.shutdown().await;
    debug!("Live view server stopped");
}

async fn handle_viewer(stream: TcpStream, viewers: Arc<Viewers>, cancel: CancellationToken) {
    let check_path = |request: &Request, response: Response| {
        if request.uri().path() == LIVE_VIEW_PATH {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };
    let ws = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Rejected live view connection: {e}");
            return;
        }
    };

    let (mut sink, mut incoming) = ws.split();
    let (tx, mut rx) = mpsc::channel(VIEWER_QUEUE_CAPACITY);
    let id = viewers.register(tx);
    debug!("Live viewer {id} connected");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outgoing = rx.recv() => {
                let Some(message) = outgoing else { break };
                if let Err(e) = sink.send(message).await {
                    debug!("Live viewer {id} write failed: {e}");
                    break;
                }
            }
            received = incoming.next() => match received {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Live viewer {id} read failed: {e}");
                    break;
                }
            },
        }
    }

    viewers.remove(id);
    debug!("Live viewer {id} disconnected");
}
