// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffConfig;
use crate::buffer::{ArchiveBuffer, Buffer, LiveBuffer, NullBuffer};
use crate::config::Config;
use crate::discovery::DiscoveryPublisher;
use crate::dispatcher::{
    DispatcherHandle, DispatcherOptions, DispatcherService, PipelineStatus, RecordSink,
};
use crate::errors::{PipelineError, StorageError, TransportError};
use crate::record::ApplicationInfo;
use crate::redaction::LogEvent;
use crate::sequencer::{FilePositionStore, PositionSequencer};
use crate::server::LiveViewServer;
use crate::transport::{EndpointConfig, HttpTransport, Transport};

/// A running pipeline for one sender.
pub struct Shipper {
    handle: DispatcherHandle,
    app: ApplicationInfo,
    config: Config,
    live_view: Option<Arc<LiveViewServer>>,
    publisher: Mutex<Option<DiscoveryPublisher>>,
    task: JoinHandle<()>,
}

impl Shipper {
    /// Starts a pipeline talking to the collector over HTTP.
    pub async fn start(config: Config, app: ApplicationInfo) -> Result<Self, PipelineError> {
        let transport = Arc::new(HttpTransport::new(&config, app.clone()));
        Self::with_transport(config, app, transport).await
    }

    pub async fn with_transport(
        config: Config,
        app: ApplicationInfo,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, PipelineError> {
        fs::create_dir_all(&config.storage_dir).map_err(StorageError::from)?;
        let sequencer = PositionSequencer::new(
            Box::new(FilePositionStore::new(config.position_path())),
            config.position_persist_interval,
        );

        let live: Box<dyn Buffer> = if config.live_enabled {
            Box::new(LiveBuffer::new(config.live_capacity))
        } else {
            Box::new(NullBuffer)
        };
        let archive: Box<dyn Buffer> = if config.archive_enabled {
            Box::new(ArchiveBuffer::open(
                config.archive_dir(),
                config.archive_batch_size,
            )?)
        } else {
            Box::new(NullBuffer)
        };

        let live_view = match config.live_view_port {
            Some(port) => {
                let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
                let server = LiveViewServer::bind(addr, app.sender_id()).await?;
                info!("Live view available at {}", server.endpoint_url());
                Some(Arc::new(server))
            }
            None => None,
        };
        let mut sinks: Vec<Arc<dyn RecordSink>> = Vec::new();
        if let Some(server) = &live_view {
            sinks.push(Arc::clone(server) as Arc<dyn RecordSink>);
        }

        let (service, handle) = DispatcherService::new(
            transport,
            sequencer,
            live,
            archive,
            DispatcherOptions {
                sensitive: config.sensitive,
                backoff: BackoffConfig::from(&config),
                sinks,
            },
        );
        let task = tokio::spawn(service.run());

        let shipper = Self {
            handle,
            app,
            config,
            live_view,
            publisher: Mutex::new(None),
            task,
        };
        shipper.advertise()?;
        Ok(shipper)
    }

    /// Publishes the advertised endpoint when discovery is enabled and nothing
    /// is published yet.
    fn advertise(&self) -> Result<(), PipelineError> {
        if !self.config.discovery_enabled || self.publisher().is_some() {
            return Ok(());
        }
        match self.advertised_endpoint() {
            Some(endpoint_url) => self.publish(endpoint_url),
            None => {
                warn!("Discovery enabled but there is no endpoint to advertise");
                Ok(())
            }
        }
    }

    fn publisher(&self) -> MutexGuard<'_, Option<DiscoveryPublisher>> {
        self.publisher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live view server when running, otherwise the configured collector.
    fn advertised_endpoint(&self) -> Option<String> {
        self.live_view
            .as_ref()
            .map(|server| server.endpoint_url())
            .or_else(|| self.config.endpoint.clone())
    }

    /// A cloneable handle for logging from other tasks and threads.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn log(&self, event: LogEvent) {
        self.handle.log(event);
    }

    /// Applies to records buffered from now on; earlier records keep the
    /// policy that was current when they were buffered.
    pub fn set_sensitive(&self, sensitive: bool) {
        self.handle.set_sensitive(sensitive);
    }

    pub async fn configure(&self, endpoint: Option<EndpointConfig>) {
        if let Some(publisher) = self.publisher().as_ref() {
            if self.live_view.is_none() {
                if let Some(endpoint) = &endpoint {
                    publisher.update_endpoint(endpoint.endpoint.clone());
                }
            }
        }
        if let Err(e) = self.handle.configure(endpoint).await {
            error!("Failed to configure collector endpoint: {e}");
        }
    }

    /// Connects to the collector. Discovery withdrawn by [`Shipper::stop`] is
    /// published again first.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if let Err(e) = self.advertise() {
            warn!("Could not advertise on the local network: {e}");
        }
        self.handle.connect().await
    }

    pub async fn start_live(&self) -> Result<(), TransportError> {
        self.handle.start_live().await
    }

    pub async fn stop_live(&self) {
        if let Err(e) = self.handle.stop_live().await {
            error!("Failed to stop live channel: {e}");
        }
    }

    /// Advertises `endpoint_url` on the LAN, replacing any prior advertisement.
    pub fn publish(&self, endpoint_url: impl Into<String>) -> Result<(), PipelineError> {
        let endpoint_url = endpoint_url.into();
        let mut publisher = self.publisher();
        if let Some(existing) = publisher.as_ref() {
            existing.update_endpoint(endpoint_url);
            return Ok(());
        }
        debug!("Advertising {endpoint_url} on the local network");
        *publisher = Some(DiscoveryPublisher::start(
            self.config.discovery.clone(),
            self.app.sender_id(),
            endpoint_url,
        )?);
        Ok(())
    }

    pub fn unpublish(&self) {
        if let Some(publisher) = self.publisher().take() {
            publisher.unpublish();
        }
    }

    /// Unpublishes discovery, invalidates the session and closes the
    /// transport once in-flight sends finish. A no-op when nothing is active.
    /// The next [`Shipper::connect`] publishes discovery again.
    pub async fn stop(&self) {
        self.unpublish();
        if let Err(e) = self.handle.stop().await {
            error!("Failed to stop log pipeline: {e}");
        }
    }

    pub async fn status(&self) -> Option<PipelineStatus> {
        match self.handle.status().await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("Pipeline status unavailable: {e}");
                None
            }
        }
    }

    pub fn live_view_url(&self) -> Option<String> {
        self.live_view.as_ref().map(|server| server.endpoint_url())
    }

    /// Stops the pipeline and waits for the dispatcher to exit.
    pub async fn shutdown(self) {
        self.stop().await;
        if let Some(server) = &self.live_view {
            server.shutdown();
        }
        if let Err(e) = self.handle.shutdown() {
            debug!("Dispatcher already stopped: {e}");
        }
        if let Err(e) = self.task.await {
            error!("Dispatcher task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;
    use crate::sequencer::PositionStore;
    use crate::transport::ConnectionState;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            storage_dir: dir.to_path_buf(),
            archive_batch_size: 2,
            ..Config::default()
        }
    }

    fn app() -> ApplicationInfo {
        ApplicationInfo {
            device_id: "device-1".to_string(),
            ..ApplicationInfo::default()
        }
    }

    #[tokio::test]
    async fn test_unconfigured_pipeline_buffers_durably() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shipper = Shipper::start(config(dir.path()), app())
            .await
            .expect("start");

        for n in 0..5 {
            shipper.log(LogEvent::new(LogLevel::Info, "boot", format!("step {n}")));
        }
        assert_eq!(
            shipper.connect().await,
            Err(TransportError::NotConfigured)
        );
        let status = shipper.status().await.expect("status");
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert!(!status.archive_empty);
        assert_eq!(status.delivered_batches, 0);
        shipper.shutdown().await;

        let position = FilePositionStore::new(dir.path().join("position"))
            .load()
            .expect("load");
        assert_eq!(position, Some(4));
        let pending = ArchiveBuffer::open(dir.path().join("archive"), 2)
            .expect("reopen")
            .pending_batches();
        assert_eq!(pending, 3);
    }

    #[tokio::test]
    async fn test_stop_is_a_noop_when_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shipper = Shipper::start(config(dir.path()), app())
            .await
            .expect("start");
        shipper.stop().await;
        shipper.stop().await;
        let status = shipper.status().await.expect("status");
        assert_eq!(status.connection, ConnectionState::Disconnected);
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_view_and_discovery_are_wired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config(dir.path());
        config.live_view_port = Some(0);
        config.discovery_enabled = true;
        config.discovery.group = "127.0.0.1:0".parse().expect("addr");
        let shipper = Shipper::start(config, app()).await.expect("start");

        let url = shipper.live_view_url().expect("live view url");
        assert!(url.starts_with("ws://0.0.0.0:"));
        assert!(url.ends_with("/live"));
        assert!(shipper.publisher().is_some());

        shipper.stop().await;
        assert!(shipper.publisher().is_none());

        // Without a collector the connect fails, but the live view is back on
        // the network.
        assert_eq!(
            shipper.connect().await,
            Err(TransportError::NotConfigured)
        );
        assert!(shipper.publisher().is_some());

        shipper.stop().await;
        assert!(shipper.publisher().is_none());
        shipper.shutdown().await;
    }
}
