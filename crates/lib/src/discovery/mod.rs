//! Peer discovery over UDP broadcast.
//!
//! One task owns the socket and the [`PeerTable`]. It announces the local
//! peer on a fixed interval, refreshes the table from received
//! announcements and evicts silent peers, publishing a fresh snapshot
//! through a `watch` channel after every change.

pub mod address;
mod announcement;
mod peer_table;

pub use announcement::{Announcement, AnnouncementType};
pub use peer_table::PeerTable;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::clock::Clock;
use crate::config::DiscoveryConfig;
use crate::sync::error::SyncError;
use crate::sync::peer_types::PeerInfo;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Discovery service, ready to [`start`](Discovery::start).
#[derive(Debug)]
pub struct Discovery {
    local: PeerInfo,
    config: DiscoveryConfig,
    clock: Arc<dyn Clock>,
    announce: bool,
}

impl Discovery {
    /// Discovery that announces `local` and tracks other peers.
    pub fn new(local: PeerInfo, config: DiscoveryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            local,
            config,
            clock,
            announce: true,
        }
    }

    /// Discovery that only listens. `local.peer_id` is still used to drop
    /// our own datagrams.
    pub fn listen_only(local: PeerInfo, config: DiscoveryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            announce: false,
            ..Self::new(local, config, clock)
        }
    }

    /// Bind the discovery socket and spawn the discovery task.
    ///
    /// Bind failures are [`SyncError::Discovery`]; the rest of the engine
    /// keeps working with manually entered addresses.
    pub async fn start(self, cancel: CancellationToken) -> Result<DiscoveryHandle, SyncError> {
        let socket = bind_socket(self.config.port)?;
        let local_addr = socket.local_addr()?;
        let target: SocketAddr = format!("{}:{}", self.config.broadcast_address, self.config.port)
            .parse()
            .map_err(|e| {
                SyncError::Discovery(format!(
                    "invalid broadcast address {}: {e}",
                    self.config.broadcast_address
                ))
            })?;

        info!(%local_addr, %target, announce = self.announce, "Discovery listening");

        let (peers_tx, peers_rx) = watch::channel(Vec::new());
        let task_cancel = cancel.child_token();
        let worker = DiscoveryTask {
            socket,
            target,
            table: PeerTable::new(),
            peers_tx,
            local: self.local,
            config: self.config,
            clock: self.clock,
            announce: self.announce,
        };
        let task = tokio::spawn(
            worker
                .run(task_cancel.clone())
                .instrument(info_span!("discovery")),
        );

        Ok(DiscoveryHandle {
            peers: peers_rx,
            cancel: task_cancel,
            task,
            local_addr,
        })
    }
}

/// Handle to a running discovery task.
#[derive(Debug)]
pub struct DiscoveryHandle {
    peers: watch::Receiver<Vec<PeerInfo>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl DiscoveryHandle {
    /// Subscribe to peer table snapshots.
    pub fn peers(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.peers.clone()
    }

    /// Current peer table.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.borrow().clone()
    }

    /// Address the discovery socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the discovery task and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Discovery task ended abnormally: {e}");
        }
    }
}

struct DiscoveryTask {
    socket: UdpSocket,
    target: SocketAddr,
    table: PeerTable,
    peers_tx: watch::Sender<Vec<PeerInfo>>,
    local: PeerInfo,
    config: DiscoveryConfig,
    clock: Arc<dyn Clock>,
    announce: bool,
}

impl DiscoveryTask {
    async fn run(mut self, cancel: CancellationToken) {
        let mut announce_tick = interval(self.config.announce_interval());
        announce_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = interval(self.config.cleanup_interval());
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first cleanup
        cleanup_tick.tick().await;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Discovery stopped");
                    break;
                }

                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                        Err(e) => warn!("Discovery receive failed: {e}"),
                    }
                }

                _ = announce_tick.tick(), if self.announce => {
                    self.send_announcement().await;
                }

                _ = cleanup_tick.tick() => {
                    let evicted = self.table.evict_stale(self.clock.now(), self.config.peer_ttl());
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "Evicted silent peers");
                        self.publish();
                    }
                }
            }
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let announcement = match Announcement::parse(bytes) {
            Ok(a) => a,
            Err(e) => {
                debug!(%from, "Dropping datagram: {e}");
                return;
            }
        };
        if announcement.device_id == self.local.peer_id {
            return;
        }

        let info = announcement.into_peer_info(from.ip(), self.clock.now());
        trace!(peer = %info.peer_id, address = %info.endpoint(), "Announcement received");
        if self.table.observe(info.clone()) {
            info!(peer = %info.peer_id, name = %info.display_name, address = %info.endpoint(), "Discovered peer");
        }
        self.publish();
    }

    async fn send_announcement(&self) {
        let bytes = match Announcement::new(&self.local, self.clock.now()).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode announcement: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, self.target).await {
            debug!(target = %self.target, "Announcement not sent: {e}");
        }
    }

    fn publish(&self) {
        self.peers_tx.send_replace(self.table.snapshot());
    }
}

/// UDP socket with address reuse and broadcast enabled, bound on all
/// interfaces.
fn bind_socket(port: u16) -> Result<UdpSocket, SyncError> {
    let discovery_err = |e: std::io::Error| SyncError::Discovery(format!("port {port}: {e}"));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(discovery_err)?;
    socket.set_reuse_address(true).map_err(discovery_err)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(discovery_err)?;
    socket.set_broadcast(true).map_err(discovery_err)?;
    socket.set_nonblocking(true).map_err(discovery_err)?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
        .map_err(discovery_err)?;

    UdpSocket::from_std(socket.into()).map_err(discovery_err)
}
