//! Serve command - runs a lansync node until a termination signal.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lansync::conflict::ResolutionStrategy;
use lansync::storage::{InMemoryStorage, Storage};
use lansync::sync::SyncMode;
use lansync::{Clock, PeerId, PeerInfo, SyncConfig, SyncEngine, SystemClock};
use signal_hook::flag as signal_flag;
use tokio::sync::broadcast::error::RecvError;

use crate::cli::{Mode, ServeArgs, Strategy};

const DB_FILE: &str = "lansync.json";
const PEER_ID_FILE: &str = "peer-id";

/// Run the lansync node
pub async fn run(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&args.data_dir)?;
    let config = build_config(args)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let peer_id = load_or_create_peer_id(&args.data_dir.join(PEER_ID_FILE))?;
    let name = args
        .name
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "lansync".to_string());
    let local = PeerInfo::new(peer_id, name, "", config.transport.port, clock.now());

    let db_path = args.data_dir.join(DB_FILE);
    let storage = match InMemoryStorage::load_from_file(&db_path).await {
        Ok(storage) => {
            tracing::info!("Loaded {} records from {}", storage.len().await, db_path.display());
            Arc::new(storage)
        }
        Err(e) => {
            tracing::warn!("Failed to load storage: {e}. Starting empty.");
            Arc::new(InMemoryStorage::new())
        }
    };

    let engine = SyncEngine::new(local, config, storage.clone() as Arc<dyn Storage>, clock);

    // Set up graceful shutdown signal handling
    let term_signal = Arc::new(AtomicBool::new(false));
    for signal in signal_hook::consts::TERM_SIGNALS {
        let _ = signal_flag::register(*signal, Arc::clone(&term_signal));
    }

    let addr = engine.start().await?;
    let info = engine.local_info();
    println!("lansync node {} ({}) listening on ws://{}/ws", info.display_name, info.peer_id, addr);
    println!("  GET /health  - liveness check");
    println!("  GET /info    - peer identity");
    println!();
    println!("Press Ctrl+C to shutdown");

    spawn_event_logging(&engine);

    for target in &args.connect {
        let Some((host, port)) = target.rsplit_once(':') else {
            tracing::warn!("Ignoring --connect {target}: expected host:port");
            continue;
        };
        let port: u16 = match port.parse() {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!("Ignoring --connect {target}: {e}");
                continue;
            }
        };
        match engine.connect(host, port).await {
            Ok(peer) => tracing::info!("Connected to {} ({})", peer.display_name, peer.peer_id),
            Err(e) => tracing::warn!("Failed to connect to {target}, retrying in the background: {e}"),
        }
    }

    while !term_signal.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::info!("Shutdown signal received, saving storage...");

    match storage.save_to_file(&db_path).await {
        Ok(()) => println!("\nStorage saved to {}", db_path.display()),
        Err(e) => {
            tracing::error!("Failed to save storage: {e}");
            eprintln!("Failed to save storage: {e}");
        }
    }
    engine.stop().await?;

    println!("Node shut down");
    Ok(())
}

fn build_config(args: &ServeArgs) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load_from_file(path)?,
        None => SyncConfig::default(),
    };
    config.transport.port = args.port;
    config.discovery.port = args.discovery_port;
    if args.no_discovery {
        config.discovery.enabled = false;
    }
    if args.auto_connect {
        config.sync.auto_connect = true;
    }
    if let Some(mode) = args.mode {
        config.sync.mode = match mode {
            Mode::Full => SyncMode::Full,
            Mode::Incremental => SyncMode::Incremental,
        };
    }
    if let Some(strategy) = args.strategy {
        config.sync.strategy = match strategy {
            Strategy::Lww => ResolutionStrategy::LastWriteWins,
            Strategy::HighestVersion => ResolutionStrategy::HighestVersionWins,
        };
    }
    Ok(config)
}

/// The peer id is generated once and reused across restarts.
fn load_or_create_peer_id(path: &Path) -> std::io::Result<PeerId> {
    match std::fs::read_to_string(path) {
        Ok(id) if !id.trim().is_empty() => Ok(PeerId::new(id.trim())),
        _ => {
            let id = PeerId::generate();
            std::fs::write(path, id.as_str())?;
            tracing::info!("Generated peer id {id}");
            Ok(id)
        }
    }
}

fn spawn_event_logging(engine: &SyncEngine) {
    let mut discovered = engine.events().discovered_peers();
    tokio::spawn(async move {
        while discovered.changed().await.is_ok() {
            let peers = discovered.borrow_and_update().clone();
            let names: Vec<String> = peers
                .iter()
                .map(|p| format!("{}@{}", p.display_name, p.endpoint()))
                .collect();
            tracing::info!(count = peers.len(), "Peer table: {}", names.join(", "));
        }
    });

    let mut updates = engine.events().data_updated();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => tracing::info!(
                    peer = %update.peer,
                    data_type = %update.data_type,
                    changed = update.ids.len(),
                    conflicts = update.conflicts,
                    "Data updated"
                ),
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {n} data events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut errors = engine.events().errors();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(event) => tracing::warn!(peer = ?event.peer, kind = ?event.kind, recoverable = event.recoverable, "{}", event.message),
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {n} error events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
