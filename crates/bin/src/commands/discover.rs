//! Discover command - listens for announcements without announcing.

use std::sync::Arc;
use std::time::Duration;

use lansync::config::DiscoveryConfig;
use lansync::discovery::Discovery;
use lansync::{Clock, PeerId, PeerInfo, SystemClock};
use tokio_util::sync::CancellationToken;

use crate::cli::DiscoverArgs;
use crate::output::print_peers;

/// Run the discover command
pub async fn run(args: &DiscoverArgs) -> Result<(), Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config = DiscoveryConfig {
        port: args.port,
        ..DiscoveryConfig::default()
    };
    // Never announced; only used to ignore our own datagrams
    let listener = PeerInfo::new(PeerId::generate(), "lansync-discover", "", 0, clock.now());

    let cancel = CancellationToken::new();
    let handle = Discovery::listen_only(listener, config, clock)
        .start(cancel.clone())
        .await?;
    eprintln!(
        "Listening on {} for {}s...",
        handle.local_addr(),
        args.seconds
    );

    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    let peers = handle.snapshot();
    handle.stop().await;
    cancel.cancel();

    print_peers(&peers, args.format)?;
    Ok(())
}
