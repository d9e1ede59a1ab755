//! Engine configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. Durations are stored as milliseconds and exposed as
//! [`Duration`]s through accessor methods.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::conflict::ResolutionStrategy;
use crate::sync::SyncMode;

/// Default WebSocket server port.
pub const DEFAULT_SYNC_PORT: u16 = 8765;
/// Default UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8766;

/// Top-level configuration for a [`crate::SyncEngine`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub discovery: DiscoveryConfig,
    pub transport: TransportConfig,
    pub sync: OrchestratorConfig,
}

impl SyncConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Write this config as pretty JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// UDP discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub port: u16,
    pub broadcast_address: String,
    /// Address to advertise instead of the auto-selected one.
    pub advertise_address: Option<String>,
    pub announce_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    pub peer_ttl_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: "255.255.255.255".to_string(),
            advertise_address: None,
            announce_interval_ms: 3_000,
            cleanup_interval_ms: 30_000,
            peer_ttl_ms: 60_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }
}

/// WebSocket server and client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    pub bind_address: String,
    pub port: u16,
    /// Extra ports tried (port+1..=port+n) when the configured one is taken.
    pub port_fallback_attempts: u16,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// A connection silent for this many heartbeat intervals is dead.
    pub dead_after_missed: u32,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_buffer: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_SYNC_PORT,
            port_fallback_attempts: 4,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            dead_after_missed: 3,
            outbound_buffer: 256,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a connection is closed.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval() * self.dead_after_missed.max(1)
    }
}

/// Client reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
        }
    }
}

/// Orchestrator settings: queueing, retry, locking and payload limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    pub mode: SyncMode,
    pub strategy: ResolutionStrategy,
    /// Enqueue a push as soon as a peer connects.
    pub sync_on_connect: bool,
    /// Dial newly discovered peers automatically.
    pub auto_connect: bool,
    pub queue_drain_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub min_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub max_retries: u32,
    pub lock_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Serialized payloads larger than this are gzip-compressed.
    pub compression_threshold: usize,
    pub max_payload_bytes: usize,
    /// Number of applied session ids remembered for loop prevention.
    pub session_window: usize,
    pub history_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Incremental,
            strategy: ResolutionStrategy::LastWriteWins,
            sync_on_connect: true,
            auto_connect: false,
            queue_drain_interval_ms: 1_000,
            health_check_interval_ms: 60_000,
            min_retry_delay_ms: 2_000,
            max_retry_delay_ms: 300_000,
            max_retries: 5,
            lock_timeout_ms: 300_000,
            request_timeout_ms: 30_000,
            compression_threshold: 8 * 1024,
            max_payload_bytes: 16 * 1024 * 1024,
            session_window: 1024,
            history_capacity: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn queue_drain_interval(&self) -> Duration {
        Duration::from_millis(self.queue_drain_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
