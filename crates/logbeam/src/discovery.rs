// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Zero-configuration discovery of collectors on the local network.
//!
//! Publishers answer `query` datagrams with an `announce` carrying their
//! endpoint URL and sender id, and re-announce to the multicast group on an
//! interval. Browsers query the group and surface each sender's current
//! endpoint to their subscribers; a new endpoint from the same sender
//! replaces the one it advertised before. A subscription
//! never completes on its own; it ends on [`Subscription::unsubscribe`] or
//! when dropped.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::DiscoveryError;

pub const DEFAULT_DISCOVERY_GROUP: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 42, 99)), 42999);
pub const DEFAULT_SERVICE_TYPE: &str = "_logbeam._tcp";
const MAX_PACKET_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Multicast group, or a unicast address to reach a single publisher.
    pub group: SocketAddr,
    pub service_type: String,
    pub announce_interval: Duration,
    pub query_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_DISCOVERY_GROUP,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            announce_interval: Duration::from_secs(5),
            query_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
enum Packet {
    Query {
        service_type: String,
    },
    Announce {
        service_type: String,
        sender_id: String,
        endpoint_url: String,
    },
}

/// A collector endpoint found on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredService {
    /// The publishing sender's id.
    pub service_name: String,
    pub endpoint_url: String,
}

fn bind_socket(group: SocketAddr, listen_on_group: bool) -> Result<UdpSocket, DiscoveryError> {
    let multicast = group.ip().is_multicast();
    let bind_addr = match (listen_on_group, multicast, group.ip()) {
        (true, false, _) => group,
        (true, true, IpAddr::V4(_)) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), group.port()),
        (true, true, IpAddr::V6(_)) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), group.port()),
        (false, _, IpAddr::V4(_)) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        (false, _, IpAddr::V6(_)) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    };

    let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;
    if listen_on_group && multicast {
        match group.ip() {
            IpAddr::V4(ip) => socket.join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(ip) => socket.join_multicast_v6(&ip, 0)?,
        }
    }
    Ok(UdpSocket::from_std(socket.into())?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Announcement {
    sender_id: String,
    endpoint_url: String,
}

/// Advertises this sender's endpoint until unpublished or dropped.
pub struct DiscoveryPublisher {
    local_addr: SocketAddr,
    announcement: watch::Sender<Option<Announcement>>,
    cancel: CancellationToken,
}

impl DiscoveryPublisher {
    pub fn start(
        config: DiscoveryConfig,
        sender_id: impl Into<String>,
        endpoint_url: impl Into<String>,
    ) -> Result<Self, DiscoveryError> {
        let socket = bind_socket(config.group, true)?;
        let local_addr = socket.local_addr()?;
        let (announcement, announcement_rx) = watch::channel(Some(Announcement {
            sender_id: sender_id.into(),
            endpoint_url: endpoint_url.into(),
        }));
        let cancel = CancellationToken::new();
        tokio::spawn(publish(socket, config, announcement_rx, cancel.clone()));
        debug!("Discovery publisher listening on {local_addr}");
        Ok(Self {
            local_addr,
            announcement,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replaces the advertised endpoint; the new record is announced at once.
    pub fn update_endpoint(&self, endpoint_url: impl Into<String>) {
        let endpoint_url = endpoint_url.into();
        self.announcement.send_modify(|current| {
            if let Some(announcement) = current {
                announcement.endpoint_url = endpoint_url;
            }
        });
    }

    /// Withdraws the advertisement. Later queries go unanswered.
    pub fn unpublish(&self) {
        self.announcement.send_replace(None);
        self.cancel.cancel();
    }
}

impl Drop for DiscoveryPublisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn announce_packet(service_type: &str, announcement: &Announcement) -> Result<Vec<u8>, DiscoveryError> {
    Ok(serde_json::to_vec(&Packet::Announce {
        service_type: service_type.to_string(),
        sender_id: announcement.sender_id.clone(),
        endpoint_url: announcement.endpoint_url.clone(),
    })?)
}

async fn send_announcement(
    socket: &UdpSocket,
    config: &DiscoveryConfig,
    announcement: &watch::Receiver<Option<Announcement>>,
    target: SocketAddr,
) {
    let packet = match announcement.borrow().as_ref() {
        Some(current) => announce_packet(&config.service_type, current),
        None => return,
    };
    match packet {
        Ok(packet) => {
            if let Err(e) = socket.send_to(&packet, target).await {
                debug!("Failed to send discovery announcement to {target}: {e}");
            }
        }
        Err(e) => warn!("Failed to encode discovery announcement: {e}"),
    }
}

async fn publish(
    socket: UdpSocket,
    config: DiscoveryConfig,
    mut announcement: watch::Receiver<Option<Announcement>>,
    cancel: CancellationToken,
) {
    let multicast = config.group.ip().is_multicast();
    let mut interval = tokio::time::interval(config.announce_interval);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick(), if multicast => {
                send_announcement(&socket, &config, &announcement, config.group).await;
            }
            changed = announcement.changed() => {
                if changed.is_err() {
                    break;
                }
                if multicast {
                    send_announcement(&socket, &config, &announcement, config.group).await;
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match serde_json::from_slice::<Packet>(&buf[..len]) {
                    Ok(Packet::Query { service_type }) if service_type == config.service_type => {
                        send_announcement(&socket, &config, &announcement, from).await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Ignoring malformed discovery packet from {from}: {e}"),
                },
                Err(e) => debug!("Discovery publisher receive failed: {e}"),
            },
        }
    }
    debug!("Discovery publisher stopped");
}

#[derive(Default)]
struct BrowserState {
    /// Current endpoint per sender, in discovery order.
    known: Vec<DiscoveredService>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<DiscoveredService>>,
    next_id: u64,
}

/// Resolves collector endpoints announced on the network.
pub struct DiscoveryBrowser {
    state: Arc<Mutex<BrowserState>>,
    cancel: CancellationToken,
}

fn lock(state: &Mutex<BrowserState>) -> MutexGuard<'_, BrowserState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiscoveryBrowser {
    pub fn start(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let socket = bind_socket(config.group, false)?;
        let query = serde_json::to_vec(&Packet::Query {
            service_type: config.service_type.clone(),
        })?;
        let state = Arc::new(Mutex::new(BrowserState::default()));
        let cancel = CancellationToken::new();
        tokio::spawn(browse(
            socket,
            config,
            query,
            Arc::clone(&state),
            cancel.clone(),
        ));
        Ok(Self { state, cancel })
    }

    /// Each sender's current endpoint is delivered first, then changes as they appear.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        for service in &state.known {
            let _ = tx.send(service.clone());
        }
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, tx);
        Subscription {
            id,
            rx,
            state: Arc::clone(&self.state),
        }
    }

    pub fn known_services(&self) -> Vec<DiscoveredService> {
        lock(&self.state).known.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DiscoveryBrowser {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn record_service(state: &Mutex<BrowserState>, service: DiscoveredService) {
    let mut state = lock(state);
    match state
        .known
        .iter_mut()
        .find(|known| known.service_name == service.service_name)
    {
        Some(known) if known.endpoint_url == service.endpoint_url => return,
        Some(known) => {
            debug!(
                "Collector {} moved from {} to {}",
                service.service_name, known.endpoint_url, service.endpoint_url
            );
            known.endpoint_url = service.endpoint_url.clone();
        }
        None => {
            debug!(
                "Discovered collector {} at {}",
                service.service_name, service.endpoint_url
            );
            state.known.push(service.clone());
        }
    }
    state
        .subscribers
        .retain(|_, subscriber| subscriber.send(service.clone()).is_ok());
}

async fn browse(
    socket: UdpSocket,
    config: DiscoveryConfig,
    query: Vec<u8>,
    state: Arc<Mutex<BrowserState>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.query_interval);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = socket.send_to(&query, config.group).await {
                    debug!("Failed to send discovery query to {}: {e}", config.group);
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match serde_json::from_slice::<Packet>(&buf[..len]) {
                    Ok(Packet::Announce { service_type, sender_id, endpoint_url })
                        if service_type == config.service_type =>
                    {
                        record_service(&state, DiscoveredService {
                            service_name: sender_id,
                            endpoint_url: resolve_endpoint(endpoint_url, from),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Ignoring malformed discovery packet from {from}: {e}"),
                },
                Err(e) => debug!("Discovery browser receive failed: {e}"),
            },
        }
    }
    debug!("Discovery browser stopped");
}

/// Publishers bound to every interface announce `0.0.0.0`; substitute the
/// address the announcement arrived from.
fn resolve_endpoint(endpoint_url: String, from: SocketAddr) -> String {
    let Ok(mut url) = Url::parse(&endpoint_url) else {
        return endpoint_url;
    };
    let unspecified = matches!(url.host_str(), Some("0.0.0.0" | "[::]"));
    if unspecified && url.set_ip_host(from.ip()).is_ok() {
        return url.to_string();
    }
    endpoint_url
}

/// Stream of discovered services owned by the caller.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DiscoveredService>,
    state: Arc<Mutex<BrowserState>>,
}

impl Subscription {
    /// Waits for the next service. `None` only once the browser is gone.
    pub async fn recv(&mut self) -> Option<DiscoveredService> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.state).subscribers.remove(&self.id);
    }
}
