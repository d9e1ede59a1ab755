use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lansync::{
    Clock, EntityType, FixedClock, PeerId, PeerInfo, Record, ReplicaMetadata, SyncConfig,
    SyncEngine,
    storage::{InMemoryStorage, Storage},
};

/// How long async assertions wait before failing.
pub const WAIT: Duration = Duration::from_secs(5);

/// 2024-03-01 at the given wall time, UTC.
pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
}

/// Config for loopback tests: no discovery, ephemeral port, short timers.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.discovery.enabled = false;
    config.transport.bind_address = "127.0.0.1".to_string();
    config.transport.port = 0;
    config.transport.port_fallback_attempts = 0;
    config.transport.handshake_timeout_ms = 2_000;
    config.transport.reconnect.min_delay_ms = 10;
    config.transport.reconnect.max_delay_ms = 40;
    config.transport.reconnect.max_attempts = 3;
    config.sync.sync_on_connect = false;
    config.sync.queue_drain_interval_ms = 20;
    config.sync.min_retry_delay_ms = 10;
    config.sync.max_retry_delay_ms = 40;
    config.sync.request_timeout_ms = 2_000;
    config
}

/// A stopped engine with its storage and clock exposed.
pub struct TestNode {
    pub engine: SyncEngine,
    pub storage: Arc<InMemoryStorage>,
    pub clock: Arc<FixedClock>,
}

impl TestNode {
    pub fn new(name: &str, config: SyncConfig, start: DateTime<Utc>) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        Self::with_storage(name, config, start, storage.clone(), storage)
    }

    /// A node whose engine goes through `backend`, which must be backed by
    /// `storage`.
    fn with_storage(
        name: &str,
        config: SyncConfig,
        start: DateTime<Utc>,
        storage: Arc<InMemoryStorage>,
        backend: Arc<dyn Storage>,
    ) -> Self {
        let clock = Arc::new(FixedClock::at(start));
        let local = PeerInfo::new(PeerId::generate(), name, "127.0.0.1", 0, clock.now());
        let engine = SyncEngine::new(local, config, backend, clock.clone() as Arc<dyn Clock>);
        Self {
            engine,
            storage,
            clock,
        }
    }

    /// A started node whose storage calls are logged by [`RecordingStorage`].
    pub async fn recorded(name: &str) -> (Self, Arc<RecordingStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let recording = Arc::new(RecordingStorage::new(storage.clone()));
        let node = Self::with_storage(name, test_config(), at(10, 0, 0), storage, recording.clone());
        node.engine.start().await.unwrap();
        (node, recording)
    }

    /// A started node with the default test config.
    pub async fn started(name: &str) -> Self {
        let node = Self::new(name, test_config(), at(10, 0, 0));
        node.engine.start().await.unwrap();
        node
    }

    pub fn id(&self) -> PeerId {
        self.engine.local_peer()
    }

    pub fn port(&self) -> u16 {
        self.engine.local_info().port
    }
}

/// Dial `b` from `a` and wait until both engines list each other.
pub async fn connect_pair(a: &TestNode, b: &TestNode) {
    a.engine.connect("127.0.0.1", b.port()).await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    wait_until("both sides connected", || {
        a.engine.is_connected(&b_id) && b.engine.is_connected(&a_id)
    })
    .await;
}

/// Poll `condition` until it holds, panicking after [`WAIT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async flavour of [`wait_until`] for conditions that read storage.
pub async fn wait_for_storage<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Storage wrapper that logs which writes the engine issues.
#[derive(Debug)]
pub struct RecordingStorage {
    inner: Arc<InMemoryStorage>,
    calls: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingStorage {
    fn new(inner: Arc<InMemoryStorage>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn log(&self, call: &'static str, id: &str) {
        self.calls.lock().unwrap().push((call, id.to_string()));
    }

    /// Calls named `call`, by record id, oldest first.
    pub fn calls(&self, call: &str) -> Vec<String> {
        let calls = self.calls.lock().unwrap();
        calls.iter().filter(|(name, _)| *name == call).map(|(_, id)| id.clone()).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn get_all(&self, entity_type: EntityType) -> lansync::Result<Vec<Record>> {
        self.inner.get_all(entity_type).await
    }

    async fn get(&self, entity_type: EntityType, id: &str) -> lansync::Result<Option<Record>> {
        self.log("get", id);
        self.inner.get(entity_type, id).await
    }

    async fn upsert(&self, record: Record) -> lansync::Result<()> {
        self.log("upsert", record.id());
        self.inner.upsert(record).await
    }

    async fn mark_deleted(
        &self,
        entity_type: EntityType,
        id: &str,
        by: &PeerId,
        at: DateTime<Utc>,
    ) -> lansync::Result<Record> {
        self.log("mark_deleted", id);
        self.inner.mark_deleted(entity_type, id, by, at).await
    }

    async fn get_replica_metadata(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> lansync::Result<Option<ReplicaMetadata>> {
        self.log("get_replica_metadata", id);
        self.inner.get_replica_metadata(entity_type, id).await
    }

    async fn save_replica_metadata(
        &self,
        entity_type: EntityType,
        id: &str,
        metadata: ReplicaMetadata,
    ) -> lansync::Result<()> {
        self.log("save_replica_metadata", id);
        self.inner.save_replica_metadata(entity_type, id, metadata).await
    }
}
