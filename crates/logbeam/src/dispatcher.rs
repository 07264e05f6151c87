// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The serialized context that owns every buffer and drives delivery.
//!
//! Callers talk to it through a [`DispatcherHandle`]; logging never waits on the
//! network. Sends run as spawned tasks and report back with a
//! `SendCompleted` command, so buffer state is only ever touched from
//! [`DispatcherService::run`]. Each channel has at most one batch on the wire.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffConfig, BackoffState};
use crate::buffer::{Buffer, BufferKind};
use crate::errors::TransportError;
use crate::record::{Batch, BatchId, LogRecord};
use crate::redaction::{redact, LogEvent};
use crate::sequencer::PositionSequencer;
use crate::transport::{ConnectionState, EndpointConfig, Transport};

/// Observer of every record as it enters the buffers.
pub trait RecordSink: Send + Sync {
    fn on_record(&self, record: &LogRecord);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatus {
    pub connection: ConnectionState,
    pub live_connection_code: Option<String>,
    pub live_empty: bool,
    pub archive_empty: bool,
    pub live_in_flight: bool,
    pub archive_in_flight: bool,
    pub delivered_batches: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Live,
    Archive,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Live => f.write_str("live"),
            Channel::Archive => f.write_str("archive"),
        }
    }
}

type Reply = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug)]
pub enum DispatcherCommand {
    Log(LogEvent),
    SetSensitive(bool),
    Configure(Option<EndpointConfig>, oneshot::Sender<()>),
    Configured(oneshot::Sender<()>),
    Connect(Reply),
    Authorized(Result<(), TransportError>),
    StartLive(Reply),
    LiveStarted(Result<(), TransportError>),
    StopLive(oneshot::Sender<()>),
    SendCompleted {
        channel: ChannelId,
        batch_id: BatchId,
        result: Result<(), TransportError>,
    },
    Sweep,
    Stop(oneshot::Sender<()>),
    Closed,
    Status(oneshot::Sender<PipelineStatus>),
    Shutdown,
}

/// Opaque channel tag carried by completion commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId(Channel);

#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherCommand>,
}

fn not_running() -> TransportError {
    TransportError::Network("dispatcher is not running".to_string())
}

impl DispatcherHandle {
    /// Enqueues an event. Never fails from the caller's point of view.
    pub fn log(&self, event: LogEvent) {
        if self.tx.send(DispatcherCommand::Log(event)).is_err() {
            debug!("Dispatcher stopped, dropping log event");
        }
    }

    pub fn set_sensitive(&self, sensitive: bool) {
        if self
            .tx
            .send(DispatcherCommand::SetSensitive(sensitive))
            .is_err()
        {
            debug!("Dispatcher stopped, ignoring sensitivity change");
        }
    }

    pub async fn configure(&self, endpoint: Option<EndpointConfig>) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DispatcherCommand::Configure(endpoint, response_tx))
            .map_err(|e| format!("Failed to send configure command: {}", e))?;
        response_rx
            .await
            .map_err(|e| format!("Failed to receive configure response: {}", e))
    }

    /// Asks for a connection and waits for the first authorization attempt.
    /// The dispatcher keeps retrying in the background when it fails.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DispatcherCommand::Connect(response_tx))
            .map_err(|_| not_running())?;
        response_rx.await.map_err(|_| not_running())?
    }

    pub async fn start_live(&self) -> Result<(), TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DispatcherCommand::StartLive(response_tx))
            .map_err(|_| not_running())?;
        response_rx.await.map_err(|_| not_running())?
    }

    pub async fn stop_live(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DispatcherCommand::StopLive(response_tx))
            .map_err(|e| format!("Failed to send stop_live command: {}", e))?;
        response_rx
            .await
            .map_err(|e| format!("Failed to receive stop_live response: {}", e))
    }

    /// Lets in-flight sends finish, then closes the transport. Safe when idle.
    pub async fn stop(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DispatcherCommand::Stop(response_tx))
            .map_err(|e| format!("Failed to send stop command: {}", e))?;
        response_rx
            .await
            .map_err(|e| format!("Failed to receive stop response: {}", e))
    }

    pub async fn status(&self) -> Result<PipelineStatus, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DispatcherCommand::Status(response_tx))
            .map_err(|e| format!("Failed to send status command: {}", e))?;
        response_rx
            .await
            .map_err(|e| format!("Failed to receive status response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<DispatcherCommand>> {
        self.tx.send(DispatcherCommand::Shutdown)
    }
}

struct Slot {
    buffer: Box<dyn Buffer>,
    in_flight: Option<BatchId>,
    backoff: BackoffState,
    retry_at: Option<Instant>,
}

impl Slot {
    fn new(buffer: Box<dyn Buffer>, backoff: BackoffConfig) -> Self {
        Self {
            buffer,
            in_flight: None,
            backoff: BackoffState::new(backoff),
            retry_at: None,
        }
    }
}

pub struct DispatcherOptions {
    pub sensitive: bool,
    pub backoff: BackoffConfig,
    pub sinks: Vec<Arc<dyn RecordSink>>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            sensitive: false,
            backoff: BackoffConfig::default(),
            sinks: Vec::new(),
        }
    }
}

pub struct DispatcherService {
    rx: mpsc::UnboundedReceiver<DispatcherCommand>,
    tx: mpsc::WeakUnboundedSender<DispatcherCommand>,
    transport: Arc<dyn Transport>,
    sequencer: PositionSequencer,
    live: Slot,
    archive: Slot,
    sensitive: bool,
    sinks: Vec<Arc<dyn RecordSink>>,

    want_connection: bool,
    /// Set when the transport has no endpoint; cleared by configure or connect.
    unconfigured: bool,
    authorizing: bool,
    auth_backoff: BackoffState,
    auth_retry_at: Option<Instant>,
    /// Outcome of the latest failed authorization, cleared on success.
    auth_error: Option<TransportError>,
    connect_waiters: Vec<Reply>,

    want_live: bool,
    live_starting: bool,
    live_backoff: BackoffState,
    live_retry_at: Option<Instant>,
    live_waiters: Vec<Reply>,

    stopping: bool,
    closing: bool,
    stop_waiters: Vec<oneshot::Sender<()>>,

    sweep_at: Option<Instant>,
    delivered_batches: u64,
}

impl DispatcherService {
    pub fn new(
        transport: Arc<dyn Transport>,
        sequencer: PositionSequencer,
        live: Box<dyn Buffer>,
        archive: Box<dyn Buffer>,
        options: DispatcherOptions,
    ) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backoff = options.backoff;
        let service = Self {
            rx,
            tx: tx.downgrade(),
            transport,
            sequencer,
            live: Slot::new(live, backoff),
            archive: Slot::new(archive, backoff),
            sensitive: options.sensitive,
            sinks: options.sinks,
            want_connection: false,
            unconfigured: false,
            authorizing: false,
            auth_backoff: BackoffState::new(backoff),
            auth_retry_at: None,
            auth_error: None,
            connect_waiters: Vec::new(),
            want_live: false,
            live_starting: false,
            live_backoff: BackoffState::new(backoff),
            live_retry_at: None,
            live_waiters: Vec::new(),
            stopping: false,
            closing: false,
            stop_waiters: Vec::new(),
            sweep_at: None,
            delivered_batches: 0,
        };
        (service, DispatcherHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Dispatcher service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                DispatcherCommand::Log(event) => self.on_log(event),
                DispatcherCommand::SetSensitive(sensitive) => {
                    debug!("Sensitivity policy set to {sensitive}");
                    self.sensitive = sensitive;
                }
                DispatcherCommand::Configure(endpoint, response_tx) => {
                    self.on_configure(endpoint, response_tx)
                }
                DispatcherCommand::Configured(response_tx) => {
                    self.unconfigured = false;
                    self.auth_error = None;
                    self.auth_backoff.register_success();
                    self.auth_retry_at = None;
                    let _ = response_tx.send(());
                    self.resume();
                }
                DispatcherCommand::Connect(response_tx) => self.on_connect(response_tx),
                DispatcherCommand::Authorized(result) => self.on_authorized(result),
                DispatcherCommand::StartLive(response_tx) => self.on_start_live(response_tx),
                DispatcherCommand::LiveStarted(result) => self.on_live_started(result),
                DispatcherCommand::StopLive(response_tx) => self.on_stop_live(response_tx),
                DispatcherCommand::SendCompleted {
                    channel: ChannelId(channel),
                    batch_id,
                    result,
                } => self.on_send_completed(channel, batch_id, result),
                DispatcherCommand::Sweep => {
                    if self.sweep_at.is_some_and(|at| at <= Instant::now()) {
                        self.sweep_at = None;
                    }
                    self.resume();
                }
                DispatcherCommand::Stop(response_tx) => self.on_stop(response_tx),
                DispatcherCommand::Closed => {
                    self.closing = false;
                    self.stopping = false;
                    info!("Log pipeline stopped");
                    for waiter in self.stop_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    self.tick();
                }
                DispatcherCommand::Status(response_tx) => {
                    if response_tx.send(self.status()).is_err() {
                        error!("Failed to send status response - receiver dropped");
                    }
                }
                DispatcherCommand::Shutdown => {
                    debug!("Dispatcher service shutting down");
                    break;
                }
            }
        }

        debug!("Dispatcher service stopped");
    }

    fn status(&self) -> PipelineStatus {
        PipelineStatus {
            connection: self.transport.state(),
            live_connection_code: self.transport.live_connection_code(),
            live_empty: self.live.buffer.is_empty(),
            archive_empty: self.archive.buffer.is_empty(),
            live_in_flight: self.live.in_flight.is_some(),
            archive_in_flight: self.archive.in_flight.is_some(),
            delivered_batches: self.delivered_batches,
        }
    }

    fn on_log(&mut self, event: LogEvent) {
        let position = self.sequencer.next();
        let record = redact(event, position, self.sensitive);
        for sink in &self.sinks {
            sink.on_record(&record);
        }
        if self.live.buffer.kind() != BufferKind::Null {
            self.live.buffer.add(record.clone());
        }
        self.archive.buffer.add(record);
        self.tick();
    }

    fn on_configure(&mut self, endpoint: Option<EndpointConfig>, response_tx: oneshot::Sender<()>) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            transport.configure(endpoint).await;
            let _ = tx.send(DispatcherCommand::Configured(response_tx));
        });
    }

    fn on_connect(&mut self, response_tx: Reply) {
        self.want_connection = true;
        if self.transport.is_connected() && !self.stopping {
            let _ = response_tx.send(Ok(()));
            self.tick();
            return;
        }
        self.connect_waiters.push(response_tx);
        // An explicit request skips any pending backoff.
        self.unconfigured = false;
        self.auth_retry_at = None;
        self.tick();
    }

    fn on_authorized(&mut self, result: Result<(), TransportError>) {
        self.authorizing = false;
        match &result {
            Ok(()) => {
                info!("Connected to collector");
                self.auth_backoff.register_success();
                self.auth_retry_at = None;
                self.auth_error = None;
            }
            Err(TransportError::NotConfigured) => {
                debug!("No collector endpoint configured, buffering until one is set");
                self.unconfigured = true;
            }
            Err(e) => {
                let delay = self.auth_backoff.register_error();
                warn!("Failed to authorize with collector, retrying in {delay:?}: {e}");
                self.auth_retry_at = Some(Instant::now() + delay);
                self.schedule_sweep(delay);
            }
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        if let Err(e) = &result {
            // The live channel keeps being wanted; it comes up once a retry succeeds.
            self.auth_error = Some(e.clone());
            for waiter in self.live_waiters.drain(..) {
                let _ = waiter.send(Err(e.clone()));
            }
        }
        self.resume();
    }

    fn on_start_live(&mut self, response_tx: Reply) {
        self.want_live = true;
        if self.transport.is_live() {
            let _ = response_tx.send(Ok(()));
            return;
        }
        if !self.want_connection && !self.transport.is_connected() {
            let _ = response_tx.send(Err(TransportError::NotAuthorized));
            return;
        }
        if !self.authorizing && !self.transport.is_connected() {
            if let Some(e) = &self.auth_error {
                let _ = response_tx.send(Err(e.clone()));
                self.tick();
                return;
            }
        }
        self.live_waiters.push(response_tx);
        self.live_retry_at = None;
        self.tick();
    }

    fn on_live_started(&mut self, result: Result<(), TransportError>) {
        self.live_starting = false;
        match &result {
            Ok(()) => {
                info!("Live channel started");
                self.live_backoff.register_success();
                self.live_retry_at = None;
            }
            Err(e) => {
                let delay = self.live_backoff.register_error();
                warn!("Failed to start live channel, retrying in {delay:?}: {e}");
                self.live_retry_at = Some(Instant::now() + delay);
                self.schedule_sweep(delay);
            }
        }
        for waiter in self.live_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        self.resume();
    }

    fn on_stop_live(&mut self, response_tx: oneshot::Sender<()>) {
        self.want_live = false;
        for waiter in self.live_waiters.drain(..) {
            let _ = waiter.send(Err(TransportError::NotConfigured));
        }
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            transport.stop_live().await;
            let _ = response_tx.send(());
        });
    }

    fn on_send_completed(
        &mut self,
        channel: Channel,
        batch_id: BatchId,
        result: Result<(), TransportError>,
    ) {
        let slot = self.slot_mut(channel);
        if slot.in_flight.as_deref() == Some(batch_id.as_str()) {
            slot.in_flight = None;
        }
        match result {
            Ok(()) => {
                slot.buffer.remove_batch(&batch_id);
                slot.backoff.register_success();
                slot.retry_at = None;
                self.delivered_batches += 1;
                debug!("Delivered {channel} batch {batch_id}");
            }
            Err(e) => {
                let delay = slot.backoff.register_error();
                slot.retry_at = Some(Instant::now() + delay);
                match e {
                    TransportError::Serialization(_) => error!(
                        "{channel} batch {batch_id} cannot be encoded and is stuck, retrying in {delay:?}: {e}"
                    ),
                    TransportError::NotAuthorized => {
                        warn!("Collector rejected {channel} batch {batch_id}, re-authorizing");
                        self.auth_retry_at = None;
                    }
                    TransportError::NotConfigured => {
                        debug!("{channel} batch {batch_id} parked, no collector configured");
                    }
                    TransportError::Network(_) => warn!(
                        "Failed to send {channel} batch {batch_id}, retrying in {delay:?}: {e}"
                    ),
                }
                self.schedule_sweep(delay);
            }
        }
        self.resume();
    }

    fn on_stop(&mut self, response_tx: oneshot::Sender<()>) {
        self.want_connection = false;
        self.want_live = false;
        self.stopping = true;
        self.auth_error = None;
        self.stop_waiters.push(response_tx);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(TransportError::NotConfigured));
        }
        for waiter in self.live_waiters.drain(..) {
            let _ = waiter.send(Err(TransportError::NotConfigured));
        }
        self.maybe_finish_stop();
    }

    /// Continues after a completion: finishes a pending stop or sweeps.
    fn resume(&mut self) {
        if self.stopping {
            self.maybe_finish_stop();
        } else {
            self.tick();
        }
    }

    fn maybe_finish_stop(&mut self) {
        let busy = self.closing
            || self.authorizing
            || self.live_starting
            || self.live.in_flight.is_some()
            || self.archive.in_flight.is_some();
        if !self.stopping || busy {
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.closing = true;
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            transport.close().await;
            let _ = tx.send(DispatcherCommand::Closed);
        });
    }

    fn tick(&mut self) {
        if self.stopping {
            return;
        }
        self.maybe_authorize();
        self.maybe_start_live();
        self.advance(Channel::Live);
        self.advance(Channel::Archive);
    }

    fn maybe_authorize(&mut self) {
        if !self.want_connection
            || self.unconfigured
            || self.authorizing
            || self.transport.is_connected()
            || self.transport.state() == ConnectionState::Authenticating
        {
            return;
        }
        if let Some(at) = self.auth_retry_at {
            let now = Instant::now();
            if now < at {
                self.schedule_sweep(at - now);
                return;
            }
            self.auth_retry_at = None;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.authorizing = true;
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let result = transport.authorize().await;
            let _ = tx.send(DispatcherCommand::Authorized(result));
        });
    }

    fn maybe_start_live(&mut self) {
        if !self.want_live
            || self.live_starting
            || self.authorizing
            || !self.transport.is_connected()
            || self.transport.is_live()
        {
            return;
        }
        if let Some(at) = self.live_retry_at {
            let now = Instant::now();
            if now < at {
                self.schedule_sweep(at - now);
                return;
            }
            self.live_retry_at = None;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.live_starting = true;
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let result = transport.start_live().await;
            let _ = tx.send(DispatcherCommand::LiveStarted(result));
        });
    }

    fn slot_mut(&mut self, channel: Channel) -> &mut Slot {
        match channel {
            Channel::Live => &mut self.live,
            Channel::Archive => &mut self.archive,
        }
    }

    /// Sends the oldest batch of `channel` unless one is already on the wire.
    fn advance(&mut self, channel: Channel) {
        let ready = match channel {
            Channel::Live => self.transport.is_live(),
            Channel::Archive => self.transport.is_connected(),
        };
        if !ready {
            return;
        }
        let now = Instant::now();
        let slot = self.slot_mut(channel);
        if slot.buffer.kind() == BufferKind::Null || slot.in_flight.is_some() {
            return;
        }
        if let Some(at) = slot.retry_at {
            if now < at {
                self.schedule_sweep(at - now);
                return;
            }
            slot.retry_at = None;
        }
        loop {
            let slot = self.slot_mut(channel);
            let Some(batch) = slot.buffer.next_batch() else {
                return;
            };
            if batch.is_empty() {
                slot.buffer.remove_batch(&batch.id);
                continue;
            }
            self.dispatch(channel, batch);
            return;
        }
    }

    fn dispatch(&mut self, channel: Channel, batch: Batch) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.slot_mut(channel).in_flight = Some(batch.id.clone());
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let result = match channel {
                Channel::Live => transport.send_live(&batch).await,
                Channel::Archive => transport.send_archive(&batch).await,
            };
            let _ = tx.send(DispatcherCommand::SendCompleted {
                channel: ChannelId(channel),
                batch_id: batch.id,
                result,
            });
        });
    }

    fn schedule_sweep(&mut self, delay: Duration) {
        let at = Instant::now() + delay;
        if self.sweep_at.is_some_and(|scheduled| scheduled <= at) {
            return;
        }
        self.sweep_at = Some(at);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(DispatcherCommand::Sweep);
            }
        });
    }
}
