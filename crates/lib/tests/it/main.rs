/*! Integration tests for lansync.
 *
 * This test suite is organized as a single integration test binary
 * following the pattern described by matklad in
 * https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html
 *
 * The module structure mirrors the main library structure:
 * - conflict: Resolver and merger scenarios and properties
 * - discovery: Peer table TTL and announcement handling
 * - transport: WebSocket handshake, HTTP endpoints and reconnect
 * - sync: End-to-end engine behaviour between two live nodes
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lansync=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod conflict;
mod discovery;
mod helpers;
mod sync;
mod transport;
