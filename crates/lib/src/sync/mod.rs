//! The sync engine.
//!
//! [`SyncEngine`] ties the other components together: it runs the
//! transport and discovery, answers and applies data messages through the
//! [`ThreeWayMerger`], arbitrates live timers and drives queued push/pull
//! jobs with retry. It is an explicit component: construct it with its
//! collaborators, then [`start`](SyncEngine::start) and
//! [`stop`](SyncEngine::stop) it.
//!
//! ## Tasks
//!
//! While running, the engine owns two tasks besides the transport and
//! discovery ones:
//!
//! - the inbound handler, consuming transport events and discovery
//!   snapshots (`handler.rs`)
//! - the background worker, draining the job queue and running the health
//!   check (`background.rs`)
//!
//! Push and pull themselves live in `ops.rs`.

mod background;
pub mod error;
pub mod events;
mod handler;
pub mod history;
pub mod lock;
mod ops;
pub mod peer_types;
pub mod queue;
pub mod session;
pub mod timers;
pub mod validation;

pub use events::{DataUpdated, SyncErrorEvent, SyncEvents, SyncPhase, SyncProgress};
pub use history::{PeerSyncStats, SyncHistory, SyncHistoryEntry};
pub use lock::{SyncLock, SyncLockGuard};
pub use queue::{JobQueue, RetryDecision, RetryPolicy, SyncDirection, SyncJob};
pub use timers::{LiveTimerState, LiveTimers, TimerConflict};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use self::background::WorkerCommand;
use self::error::SyncError;
use self::peer_types::{PeerId, PeerInfo};
use self::session::SessionWindow;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, ThreeWayMerger};
use crate::discovery::{Discovery, DiscoveryHandle, address};
use crate::protocol::{EncodedPayload, PayloadCodec};
use crate::storage::Storage;
use crate::transport::{SyncTransport, WebSocketTransport};

const COMMAND_BUFFER: usize = 64;

/// Whether a push sends everything or only what changed since the last
/// successful sync with the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    Full,
    #[default]
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Incremental => f.write_str("incremental"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" | "incr" => Ok(SyncMode::Incremental),
            other => Err(format!("unknown sync mode {other:?} (expected full or incremental)")),
        }
    }
}

/// Outcome of one successful push or pull.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub peer: PeerId,
    pub direction: SyncDirection,
    pub mode: SyncMode,
    /// Records sent (push) or received (pull).
    pub records: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A pull waiting for its `dataResponse`.
struct PendingPull {
    peer: PeerId,
    respond: oneshot::Sender<Result<EncodedPayload, SyncError>>,
}

/// Everything that only exists while the engine runs.
struct Running {
    cancel: CancellationToken,
    transport: Arc<dyn SyncTransport>,
    discovery: Option<DiscoveryHandle>,
    commands: mpsc::Sender<WorkerCommand>,
    tasks: Vec<JoinHandle<()>>,
}

struct EngineInner {
    local: RwLock<PeerInfo>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn Storage>,
    merger: ThreeWayMerger,
    codec: PayloadCodec,
    lock: SyncLock,
    queue: JobQueue,
    history: Mutex<SyncHistory>,
    timers: Mutex<LiveTimers>,
    sessions: Mutex<SessionWindow>,
    pending: Mutex<HashMap<String, PendingPull>>,
    connected: Mutex<BTreeMap<PeerId, PeerInfo>>,
    dialing: Mutex<HashSet<PeerId>>,
    events: SyncEvents,
    running: Mutex<Option<Running>>,
    /// Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
}

/// The LAN sync engine. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("peer_id", &self.local_info().peer_id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncEngine {
    /// Create a stopped engine.
    ///
    /// # Arguments
    /// * `local` - This device's identity; the port is replaced by the one
    ///   actually bound on [`start`](Self::start)
    /// * `config` - Engine configuration
    /// * `storage` - Where records are read from and merged into
    /// * `clock` - Time source for metadata, TTLs, retries and locks
    pub fn new(
        local: PeerInfo,
        config: SyncConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let orchestrator = &config.sync;
        let resolver = ConflictResolver::new(local.peer_id.clone(), orchestrator.strategy, clock.clone());
        let inner = EngineInner {
            merger: ThreeWayMerger::new(resolver),
            codec: PayloadCodec::new(orchestrator.compression_threshold, orchestrator.max_payload_bytes),
            lock: SyncLock::new(orchestrator.lock_timeout(), clock.clone()),
            queue: JobQueue::new(RetryPolicy::from_config(orchestrator)),
            history: Mutex::new(SyncHistory::new(orchestrator.history_capacity)),
            timers: Mutex::new(LiveTimers::new()),
            sessions: Mutex::new(SessionWindow::new(orchestrator.session_window)),
            pending: Mutex::new(HashMap::new()),
            connected: Mutex::new(BTreeMap::new()),
            dialing: Mutex::new(HashSet::new()),
            events: SyncEvents::new(),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            local: RwLock::new(local),
            config,
            clock,
            storage,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start the server, discovery and the engine tasks.
    ///
    /// Returns the address the sync server bound to. A discovery failure is
    /// reported on the error stream and the engine runs without it.
    pub async fn start(&self) -> Result<SocketAddr, SyncError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Ok(address) = self.server_address() {
            return Err(SyncError::ServerAlreadyRunning { address });
        }
        let config = &self.inner.config;
        let cancel = CancellationToken::new();

        let mut local = self.local_info();
        if config.discovery.advertise_address.is_some()
            || local.address.is_empty()
            || local.address == "0.0.0.0"
        {
            if let Some(address) = address::advertise_address(config.discovery.advertise_address.as_deref()) {
                local.address = address;
            }
        }

        let (transport, transport_events) = WebSocketTransport::new(
            local,
            config.transport.clone(),
            self.inner.clock.clone(),
            cancel.child_token(),
        );
        let addr = transport.start_server().await?;
        let local = transport.local_info();
        *self.inner.local.write().unwrap() = local.clone();
        let transport: Arc<dyn SyncTransport> = Arc::new(transport);

        let discovery = if config.discovery.enabled {
            let discovery = Discovery::new(local.clone(), config.discovery.clone(), self.inner.clock.clone());
            match discovery.start(cancel.child_token()).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    self.inner.events.report(None, &e);
                    None
                }
            }
        } else {
            None
        };
        let discovered = discovery.as_ref().map(DiscoveryHandle::peers);

        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        *self.inner.running.lock().unwrap() = Some(Running {
            cancel: cancel.clone(),
            transport,
            discovery,
            commands,
            tasks: Vec::new(),
        });

        let span = info_span!("sync_engine", peer = %local.peer_id);
        let inbound = tokio::spawn(
            handler::run(self.clone(), transport_events, discovered, cancel.clone()).instrument(span.clone()),
        );
        let worker = tokio::spawn(background::run(self.clone(), commands_rx, cancel).instrument(span));
        if let Some(running) = self.inner.running.lock().unwrap().as_mut() {
            running.tasks.extend([inbound, worker]);
        }

        info!(%addr, peer = %local.peer_id, name = %local.display_name, "Sync engine started");
        Ok(addr)
    }

    /// Stop every task, close all connections and drop queued jobs and
    /// pending pulls.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let running = self.inner.running.lock().unwrap().take();
        let Some(running) = running else {
            return Err(SyncError::NotRunning);
        };

        running.cancel.cancel();
        running.transport.shutdown();
        if let Some(discovery) = running.discovery {
            discovery.stop().await;
        }
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {e}");
            }
        }

        let dropped_jobs = self.inner.queue.clear();
        let dropped_pulls = {
            let mut pending = self.inner.pending.lock().unwrap();
            let count = pending.len();
            // Dropping the senders fails the waiting pulls
            pending.clear();
            count
        };
        self.inner.timers.lock().unwrap().clear_remote();
        self.inner.connected.lock().unwrap().clear();
        self.inner.dialing.lock().unwrap().clear();
        self.publish_connected();
        self.publish_timers();
        self.inner.events.publish_discovered(Vec::new());

        info!(dropped_jobs, dropped_pulls, "Sync engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled())
    }

    /// This device's identity as announced to peers.
    pub fn local_info(&self) -> PeerInfo {
        self.inner.local.read().unwrap().clone()
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local.read().unwrap().peer_id.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Subscription point for every event stream.
    pub fn events(&self) -> &SyncEvents {
        &self.inner.events
    }

    pub fn lock(&self) -> &SyncLock {
        &self.inner.lock
    }

    /// Address of the running sync server.
    pub fn server_address(&self) -> Result<String, SyncError> {
        self.transport()?.get_server_address()
    }

    /// Dial a peer by address. The connection registers like an inbound
    /// one and reconnects on loss.
    pub async fn connect(&self, address: &str, port: u16) -> Result<PeerInfo, SyncError> {
        self.transport()?.connect(address, port).await
    }

    /// Close the connection to `peer`. Returns whether one existed.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let Ok(transport) = self.transport() else {
            return false;
        };
        let existed = transport.disconnect(peer);
        // The transport emits no event for a local close
        self.forget_connection(peer);
        self.publish_connected();
        self.publish_timers();
        existed
    }

    /// Peers with an open connection, as the engine sees them.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.inner.connected.lock().unwrap().values().cloned().collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.connected.lock().unwrap().contains_key(peer)
    }

    /// Current discovery peer table.
    pub fn discovered_peers(&self) -> Vec<PeerInfo> {
        self.inner.events.discovered_peers().borrow().clone()
    }

    /// Every running timer, local and remote.
    pub fn active_timers(&self) -> Vec<LiveTimerState> {
        self.inner.timers.lock().unwrap().snapshot(self.inner.clock.now())
    }

    /// Retained history entries, oldest first.
    pub fn history(&self) -> Vec<SyncHistoryEntry> {
        self.inner.history.lock().unwrap().entries()
    }

    pub fn peer_stats(&self, peer: &PeerId) -> Option<PeerSyncStats> {
        self.inner.history.lock().unwrap().stats(peer)
    }

    pub fn success_rate(&self) -> f64 {
        self.inner.history.lock().unwrap().success_rate()
    }

    /// Jobs waiting in the queue, in drain order.
    pub fn queued_jobs(&self) -> Vec<SyncJob> {
        self.inner.queue.snapshot()
    }

    /// Queue a push or pull for `peer` in the configured mode.
    pub fn enqueue(&self, peer: &PeerId, direction: SyncDirection) -> SyncJob {
        self.enqueue_with_mode(peer, direction, self.inner.config.sync.mode)
    }

    pub fn enqueue_with_mode(&self, peer: &PeerId, direction: SyncDirection, mode: SyncMode) -> SyncJob {
        let job = self
            .inner
            .queue
            .enqueue(SyncJob::new(peer.clone(), direction, mode, self.inner.clock.now()));
        self.wake_worker();
        job
    }

    fn wake_worker(&self) {
        let commands = self.inner.running.lock().unwrap().as_ref().map(|r| r.commands.clone());
        if let Some(commands) = commands {
            // A full channel means a drain is already pending
            let _ = commands.try_send(WorkerCommand::Drain);
        }
    }

    fn transport(&self) -> Result<Arc<dyn SyncTransport>, SyncError> {
        self.inner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.transport.clone())
            .ok_or(SyncError::NotRunning)
    }

    /// Fails once the engine is stopping; multi-step syncs check this
    /// between steps.
    fn ensure_enabled(&self) -> Result<(), SyncError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SyncError::OperationCancelled)
        }
    }

    fn publish_connected(&self) {
        let peers = self.connected_peers();
        self.inner.events.publish_connected(peers);
    }

    fn publish_timers(&self) {
        let timers = self.active_timers();
        self.inner.events.publish_timers(timers);
    }
}
