//! Push, pull and the record/timer operations they are built from.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, info_span, warn};

use super::error::SyncError;
use super::events::{DataUpdated, SyncErrorEvent, SyncPhase};
use super::history::SyncHistoryEntry;
use super::peer_types::PeerId;
use super::queue::{RetryDecision, SyncDirection, SyncJob};
use super::timers::{LiveTimerState, TimerConflict};
use super::validation::validate_payload;
use super::{PendingPull, SyncEngine, SyncMode, SyncReport};
use crate::protocol::{DataPayload, DataRequest, EncodedPayload, Envelope, Message, TimerForceStop};
use crate::record::{EntityType, Record, RecordKind, TimeLogEntry};

/// What [`SyncEngine::apply_payload`] did with one inbound batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Applied {
    pub entity_type: EntityType,
    pub received: usize,
    pub changed: usize,
}

impl SyncEngine {
    /// Push local records to `peer`.
    ///
    /// Live timers shared with the peer are settled first, then each
    /// entity type is sent in dependency order as one `dataUpdate`. In
    /// [`SyncMode::Incremental`] only records modified since the last
    /// successful push to this peer are sent.
    pub async fn sync_with_peer(&self, peer: &PeerId, mode: SyncMode) -> Result<SyncReport, SyncError> {
        self.run_recorded(peer, SyncDirection::Push, mode).await
    }

    /// Request every entity type from `peer` and merge the responses.
    pub async fn pull_from_peer(&self, peer: &PeerId, mode: SyncMode) -> Result<SyncReport, SyncError> {
        self.run_recorded(peer, SyncDirection::Pull, mode).await
    }

    /// Run one push or pull, record it in the history and report progress.
    ///
    /// A run refused by the lock is neither recorded nor surfaced.
    async fn run_recorded(
        &self,
        peer: &PeerId,
        direction: SyncDirection,
        mode: SyncMode,
    ) -> Result<SyncReport, SyncError> {
        let started_at = self.inner.clock.now();
        let span = info_span!("sync", %peer, %direction, %mode);
        let result = async {
            match direction {
                SyncDirection::Push => self.push(peer, mode).await,
                SyncDirection::Pull => self.pull(peer, mode).await,
            }
        }
        .instrument(span)
        .await;
        let finished_at = self.inner.clock.now();

        match result {
            Ok(records) => {
                self.inner.history.lock().unwrap().record(SyncHistoryEntry::success(
                    peer.clone(),
                    direction,
                    started_at,
                    finished_at,
                    records,
                ));
                self.inner.events.progress(peer, SyncPhase::Complete, None, 1.0);
                info!(%peer, %direction, %mode, records, "Sync complete");
                Ok(SyncReport {
                    peer: peer.clone(),
                    direction,
                    mode,
                    records,
                    started_at,
                    finished_at,
                })
            }
            Err(e @ SyncError::OperationInProgress { .. }) => {
                debug!(%peer, %direction, "Sync skipped: {e}");
                Err(e)
            }
            Err(e) => {
                self.inner.history.lock().unwrap().record(SyncHistoryEntry::failure(
                    peer.clone(),
                    direction,
                    started_at,
                    finished_at,
                    e.to_string(),
                ));
                self.inner.events.progress(peer, SyncPhase::Failed, None, 0.0);
                self.inner.events.report(Some(peer), &e);
                Err(e)
            }
        }
    }

    async fn push(&self, peer: &PeerId, mode: SyncMode) -> Result<usize, SyncError> {
        let transport = self.transport()?;
        if !transport.is_connected(peer) {
            return Err(SyncError::DeviceOffline(peer.clone()));
        }
        let _guard = self.inner.lock.try_acquire(peer)?;
        let session_id = uuid::Uuid::new_v4().to_string();

        self.inner.events.progress(peer, SyncPhase::Timers, None, 0.0);
        let conflicts = self.inner.timers.lock().unwrap().settle_with(peer);
        for conflict in conflicts {
            self.apply_timer_conflict(conflict).await?;
        }

        let since = self.since(peer, SyncDirection::Push, mode);
        let total = EntityType::SYNC_ORDER.len();
        let mut sent = 0;
        for (i, entity_type) in EntityType::SYNC_ORDER.into_iter().enumerate() {
            self.ensure_enabled()?;
            let records = self.records_since(entity_type, since).await?;
            if !records.is_empty() {
                let payload = DataPayload::from_records(entity_type, records);
                let count = payload.len();
                let body = self.inner.codec.encode(&payload)?;
                let compressed = body.is_compressed();
                let envelope = Envelope::new(self.local_peer(), self.inner.clock.now(), Message::DataUpdate(body))
                    .with_session(&session_id);
                transport.send(peer, &envelope)?;
                debug!(%entity_type, count, compressed, "Pushed records");
                sent += count;
            }
            let progress = (i + 1) as f32 / total as f32;
            self.inner.events.progress(peer, SyncPhase::Pushing, Some(entity_type), progress);
        }
        Ok(sent)
    }

    async fn pull(&self, peer: &PeerId, mode: SyncMode) -> Result<usize, SyncError> {
        let transport = self.transport()?;
        if !transport.is_connected(peer) {
            return Err(SyncError::DeviceOffline(peer.clone()));
        }
        let _guard = self.inner.lock.try_acquire(peer)?;

        let since = self.since(peer, SyncDirection::Pull, mode);
        let timeout = self.inner.config.sync.request_timeout();
        let total = EntityType::SYNC_ORDER.len();
        let mut received = 0;
        for (i, data_type) in EntityType::SYNC_ORDER.into_iter().enumerate() {
            self.ensure_enabled()?;
            let request = Envelope::new(
                self.local_peer(),
                self.inner.clock.now(),
                Message::DataRequest(DataRequest { data_type, since }),
            );
            let request_id = request.message_id.clone();
            let (respond, response) = oneshot::channel();
            self.inner.pending.lock().unwrap().insert(
                request_id.clone(),
                PendingPull {
                    peer: peer.clone(),
                    respond,
                },
            );
            if let Err(e) = transport.send(peer, &request) {
                self.inner.pending.lock().unwrap().remove(&request_id);
                return Err(e);
            }

            let body = match tokio::time::timeout(timeout, response).await {
                Ok(Ok(result)) => result?,
                // The sender was dropped by stop()
                Ok(Err(_)) => return Err(SyncError::OperationCancelled),
                Err(_) => {
                    self.inner.pending.lock().unwrap().remove(&request_id);
                    return Err(SyncError::OperationTimeout(format!(
                        "{data_type} request to {peer} after {}ms",
                        timeout.as_millis()
                    )));
                }
            };
            let applied = self.apply_payload(peer, body).await?;
            if applied.entity_type != data_type {
                warn!(requested = %data_type, got = %applied.entity_type, "Peer answered with another data type");
            }
            received += applied.received;
            let progress = (i + 1) as f32 / total as f32;
            self.inner.events.progress(peer, SyncPhase::Pulling, Some(data_type), progress);
        }
        Ok(received)
    }

    /// Lower bound for an incremental run, `None` for a full one.
    fn since(&self, peer: &PeerId, direction: SyncDirection, mode: SyncMode) -> Option<DateTime<Utc>> {
        match mode {
            SyncMode::Full => None,
            SyncMode::Incremental => self.inner.history.lock().unwrap().last_successful(peer, direction),
        }
    }

    async fn records_since(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>, SyncError> {
        let records = self.inner.storage.get_all(entity_type).await?;
        Ok(records
            .into_iter()
            .filter(|r| since.is_none_or(|since| r.modified_after(since)))
            .collect())
    }

    /// Decompress, validate and merge one inbound batch into storage.
    ///
    /// Nothing is written unless the whole batch validates and decodes.
    pub(super) async fn apply_payload(&self, peer: &PeerId, body: EncodedPayload) -> Result<Applied, SyncError> {
        let value = self.inner.codec.unwrap(body)?;
        self.apply_value(peer, value).await
    }

    /// [`Self::apply_payload`] for an already decompressed body.
    pub(super) async fn apply_value(&self, peer: &PeerId, value: Value) -> Result<Applied, SyncError> {
        let entity_type = validate_payload(&value)?;
        let payload: DataPayload = serde_json::from_value(value)
            .map_err(|e| SyncError::ValidationFailed(format!("{entity_type} payload: {e}")))?;
        let records = payload.into_records();
        let received = records.len();

        let now = self.inner.clock.now();
        let mut ids = Vec::new();
        let mut conflicts = 0;
        for remote in records {
            let stored = self.inner.storage.get_replica_metadata(entity_type, remote.id()).await?;
            if stored.as_ref() == Some(remote.metadata()) {
                // Re-sent snapshot of what we already hold
                continue;
            }
            let local = self.inner.storage.get(entity_type, remote.id()).await?;
            let merge = self.inner.merger.merge_record(local.clone(), remote, now);
            if !merge.changes_local {
                continue;
            }
            if merge.conflict_type.is_conflict() {
                conflicts += 1;
                debug!(id = merge.record.id(), conflict = ?merge.conflict_type, kind = ?merge.kind, "Resolved conflict");
            }
            let id = merge.record.id().to_string();
            let metadata = merge.record.metadata().clone();
            match local {
                Some(local) if local.with_metadata(metadata.clone()) == merge.record => {
                    self.inner.storage.save_replica_metadata(entity_type, &id, metadata).await?;
                }
                _ => self.inner.storage.upsert(merge.record).await?,
            }
            ids.push(id);
        }

        let changed = ids.len();
        if changed > 0 {
            info!(%peer, %entity_type, received, changed, conflicts, "Applied remote records");
            self.inner.events.data_applied(DataUpdated {
                peer: peer.clone(),
                data_type: entity_type,
                ids,
                conflicts,
            });
        }
        Ok(Applied {
            entity_type,
            received,
            changed,
        })
    }

    /// Answer a `dataRequest` with the matching records. An empty batch is
    /// still sent so the requester's pull can complete.
    pub(super) async fn answer_request(
        &self,
        peer: &PeerId,
        request_id: &str,
        request: DataRequest,
    ) -> Result<(), SyncError> {
        let records = self.records_since(request.data_type, request.since).await?;
        let payload = DataPayload::from_records(request.data_type, records);
        let count = payload.len();
        let body = self.inner.codec.encode(&payload)?;
        let reply = Envelope::new(self.local_peer(), self.inner.clock.now(), Message::DataResponse(body))
            .in_reply_to(request_id);
        self.transport()?.send(peer, &reply)?;
        debug!(%peer, data_type = %request.data_type, count, "Answered data request");
        Ok(())
    }

    /// Run a dequeued job, rescheduling it on failure.
    pub(super) async fn run_job(&self, job: SyncJob) {
        let result = self.run_recorded(&job.peer_id, job.direction, job.mode).await;
        let Err(err) = result else {
            return;
        };
        if !err.is_recoverable() {
            self.give_up(job, &err);
            return;
        }
        match self.inner.queue.retry(job, self.inner.clock.now()) {
            RetryDecision::Scheduled { delay, retry_count } => {
                debug!(retry_count, delay_ms = delay.as_millis() as u64, "Sync job rescheduled");
            }
            RetryDecision::GaveUp { job } => self.give_up(job, &err),
        }
    }

    fn give_up(&self, job: SyncJob, err: &SyncError) {
        let now = self.inner.clock.now();
        let message = format!(
            "{} with {} failed permanently after {} retries: {err}",
            job.direction, job.peer_id, job.retry_count
        );
        self.inner.history.lock().unwrap().record(SyncHistoryEntry::failure(
            job.peer_id.clone(),
            job.direction,
            job.created_at,
            now,
            message.clone(),
        ));
        self.inner.events.surface(SyncErrorEvent {
            peer: Some(job.peer_id),
            kind: err.kind(),
            message,
            recoverable: false,
        });
    }

    /// Start timing `entity_id` on this device.
    ///
    /// Opens a time-log entry, announces the timer to every connected peer
    /// and settles it against remote timers on the same entity. A timer
    /// already running locally on the entity is stopped first.
    pub async fn start_timer(&self, entity_id: &str, label: &str) -> Result<LiveTimerState, SyncError> {
        let running = self.inner.timers.lock().unwrap().local(entity_id).is_some();
        if running {
            self.stop_timer(entity_id).await?;
        }

        let local = self.local_peer();
        let now = self.inner.clock.now();
        let mut entry = TimeLogEntry::start(uuid::Uuid::new_v4().to_string(), label, now, &local);
        entry.task_id = Some(entity_id.to_string());
        self.inner.storage.upsert(entry.clone().into_record()).await?;

        let timer = LiveTimerState::new(entity_id, label, now, local).with_time_log(&entry.id);
        let conflicts = self.inner.timers.lock().unwrap().start_local(timer.clone());
        self.broadcast(Message::TimerStart(timer.clone()));
        for conflict in conflicts {
            self.apply_timer_conflict(conflict).await?;
        }
        self.publish_timers();
        info!(entity_id, time_log = %entry.id, "Timer started");
        Ok(timer)
    }

    /// Stop the local timer on `entity_id` and close its time-log entry.
    ///
    /// Returns the closed entry, or `None` if no timer was running.
    pub async fn stop_timer(&self, entity_id: &str) -> Result<Option<TimeLogEntry>, SyncError> {
        let Some(timer) = self.inner.timers.lock().unwrap().stop_local(entity_id) else {
            return Ok(None);
        };
        let now = self.inner.clock.now();
        let closed = self.close_time_log(&timer, now).await?;
        self.broadcast(Message::TimerStop(timer.at(now)));
        self.publish_timers();
        info!(entity_id, "Timer stopped");
        Ok(closed)
    }

    /// Send the current elapsed time of every local timer to all peers.
    pub fn broadcast_timer_updates(&self) {
        let now = self.inner.clock.now();
        let timers = self.inner.timers.lock().unwrap().local_timers();
        for timer in timers {
            self.broadcast(Message::TimerUpdate(timer.at(now)));
        }
        self.publish_timers();
    }

    pub(super) async fn apply_timer_conflict(&self, conflict: TimerConflict) -> Result<(), SyncError> {
        match conflict {
            TimerConflict::LocalWins { local, remote } => {
                info!(
                    entity_id = %local.entity_id,
                    loser = %remote.peer_id,
                    "Local timer wins, asking peer to stop"
                );
                let stop = TimerForceStop {
                    entity_id: local.entity_id.clone(),
                    winner_start_time: local.start_time,
                    winner_peer_id: local.peer_id.clone(),
                };
                let envelope = Envelope::new(self.local_peer(), self.inner.clock.now(), Message::TimerForceStop(stop));
                if let Ok(transport) = self.transport()
                    && let Err(e) = transport.send(&remote.peer_id, &envelope)
                {
                    self.inner.events.report(Some(&remote.peer_id), &e);
                }
            }
            TimerConflict::RemoteWins { local, remote } => {
                info!(
                    entity_id = %local.entity_id,
                    winner = %remote.peer_id,
                    "Remote timer wins, closing local entry"
                );
                self.yield_timer(&local, remote.start_time, &remote.peer_id).await?;
            }
        }
        self.publish_timers();
        Ok(())
    }

    /// Handle a `timerForceStop` from the winning peer.
    pub(super) async fn force_stop_timer(&self, from: &PeerId, stop: TimerForceStop) -> Result<(), SyncError> {
        let Some(local) = self.inner.timers.lock().unwrap().stop_local(&stop.entity_id) else {
            debug!(entity_id = %stop.entity_id, %from, "Force-stop for a timer that is not running");
            return Ok(());
        };
        info!(entity_id = %stop.entity_id, winner = %stop.winner_peer_id, "Timer force-stopped by peer");
        self.yield_timer(&local, stop.winner_start_time, from).await?;
        self.publish_timers();
        Ok(())
    }

    /// Close a losing local timer's entry at `end`, tell peers it stopped
    /// and queue a push so `winner` gets the closed entry.
    async fn yield_timer(&self, local: &LiveTimerState, end: DateTime<Utc>, winner: &PeerId) -> Result<(), SyncError> {
        if let Some(entry) = self.close_time_log(local, end).await? {
            self.inner.events.data_applied(DataUpdated {
                peer: winner.clone(),
                data_type: EntityType::TimeLogEntry,
                ids: vec![entry.id],
                conflicts: 1,
            });
        }
        self.broadcast(Message::TimerStop(local.at(end)));
        if self.is_running() {
            self.enqueue(winner, SyncDirection::Push);
        }
        Ok(())
    }

    /// Close the open time-log entry behind `timer`, if any.
    async fn close_time_log(&self, timer: &LiveTimerState, end: DateTime<Utc>) -> Result<Option<TimeLogEntry>, SyncError> {
        let Some(id) = timer.time_log_id.as_deref() else {
            return Ok(None);
        };
        let stored = self.inner.storage.get(EntityType::TimeLogEntry, id).await?;
        let Some(entry) = stored.and_then(TimeLogEntry::from_record) else {
            warn!(time_log = id, "Timer has no stored time-log entry");
            return Ok(None);
        };
        if !entry.is_open() {
            return Ok(None);
        }
        let closed = entry.closed_at(end, &self.local_peer(), self.inner.clock.now());
        self.inner.storage.upsert(closed.clone().into_record()).await?;
        Ok(Some(closed))
    }

    /// Send `message` to every connected peer. A no-op while stopped.
    fn broadcast(&self, message: Message) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let envelope = Envelope::new(self.local_peer(), self.inner.clock.now(), message);
        for peer in transport.connected_peers() {
            if let Err(e) = transport.send(&peer.peer_id, &envelope) {
                self.inner.events.report(Some(&peer.peer_id), &e);
            }
        }
    }

    /// Tear down peers the engine lists as connected whose transport
    /// connection is gone. Returns how many were removed.
    pub fn health_check(&self) -> usize {
        let Ok(transport) = self.transport() else {
            return 0;
        };
        let pruned = transport.prune_dead();
        let stale: Vec<PeerId> = self
            .inner
            .connected
            .lock()
            .unwrap()
            .keys()
            .filter(|peer| !transport.is_connected(peer))
            .cloned()
            .collect();
        for peer in &stale {
            transport.disconnect(peer);
            self.forget_connection(peer);
            warn!(%peer, "Health check removed a dead connection");
        }
        if !stale.is_empty() {
            self.publish_connected();
            self.publish_timers();
        }
        debug!(pruned, removed = stale.len(), "Health check done");
        stale.len()
    }

    /// Drop engine state tied to one connection.
    pub(super) fn forget_connection(&self, peer: &PeerId) {
        self.inner.connected.lock().unwrap().remove(peer);
        self.inner.timers.lock().unwrap().clear_peer(peer);
        let failed: Vec<PendingPull> = {
            let mut pending = self.inner.pending.lock().unwrap();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| &p.peer == peer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for pull in failed {
            let _ = pull.respond.send(Err(SyncError::ConnectionLost { peer: peer.clone() }));
        }
    }
}
