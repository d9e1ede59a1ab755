//! Background worker: drains the job queue and runs periodic checks.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SyncEngine;
use super::error::SyncError;

/// Commands that can be sent to the background worker
#[derive(Debug)]
pub(super) enum WorkerCommand {
    /// Run every job that is due now instead of waiting for the next tick
    Drain,
    /// Run the health check now and report how many peers it removed
    HealthCheck { response: oneshot::Sender<usize> },
}

/// Main worker loop. Exits when `cancel` fires or every command sender is
/// gone.
pub(super) async fn run(
    engine: SyncEngine,
    mut commands: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
) {
    info!("Starting sync worker");
    let config = &engine.inner.config.sync;
    let mut drain = interval(config.queue_drain_interval());
    let mut health = interval(config.health_check_interval());
    drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip initial tick to avoid an immediate health check
    health.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            cmd = commands.recv() => match cmd {
                Some(WorkerCommand::Drain) => drain_queue(&engine, &cancel).await,
                Some(WorkerCommand::HealthCheck { response }) => {
                    let _ = response.send(periodic_checks(&engine));
                }
                None => break,
            },

            _ = drain.tick() => drain_queue(&engine, &cancel).await,

            _ = health.tick() => {
                periodic_checks(&engine);
            }
        }
    }
    info!("Sync worker shutting down");
}

/// Run due jobs one at a time until none is ready.
async fn drain_queue(engine: &SyncEngine, cancel: &CancellationToken) {
    while let Some(job) = engine.inner.queue.next_ready(engine.inner.clock.now()) {
        debug!(job = %job.id, peer = %job.peer_id, direction = %job.direction, retry = job.retry_count, "Running sync job");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = engine.run_job(job) => {}
        }
    }
}

fn periodic_checks(engine: &SyncEngine) -> usize {
    let released = engine.inner.lock.release_expired();
    if !released.is_empty() {
        info!(peers = ?released, "Released expired sync locks");
    }
    engine.broadcast_timer_updates();
    engine.health_check()
}

impl SyncEngine {
    /// Ask the worker to run the health check now.
    ///
    /// Returns the number of dead connections removed.
    pub async fn request_health_check(&self) -> Result<usize, SyncError> {
        let commands = self
            .inner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(SyncError::NotRunning)?;
        let (response, result) = oneshot::channel();
        commands
            .send(WorkerCommand::HealthCheck { response })
            .await
            .map_err(|_| SyncError::OperationCancelled)?;
        result.await.map_err(|_| SyncError::OperationCancelled)
    }
}
