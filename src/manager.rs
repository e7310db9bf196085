//! Download Lifecycle Manager
//!
//! Orchestrates start/pause/resume/delete, applies swarm session events to
//! the persisted record, and rebuilds sessions after a restart. The store
//! is authoritative for what should be happening; the registry reflects
//! what is live in this process.
//!
//! Per-id serialization: engine events and user actions can race on the
//! same download (a pause against an in-flight ready event), so every
//! record mutation happens under that download's async lock.

use crate::config::Config;
use crate::engine::{SessionEvent, SessionInfo, SessionSource, SwarmEngine, SwarmSession};
use crate::error::{Error, Result};
use crate::registry::SessionRegistry;
use crate::resolver::{ResolvedSource, SourceResolver};
use crate::store::{MemoryStore, RecordStore, SqliteStore};
use crate::types::{
    DownloadEvent, DownloadId, DownloadRecord, DownloadStatus, DownloadView, StartRequest,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Maximum number of lifecycle events to buffer for subscribers
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The download lifecycle manager
pub struct DownloadManager {
    /// Weak self-reference for spawning background tasks from `&self` methods
    self_ref: Weak<Self>,

    config: Config,
    engine: Arc<dyn SwarmEngine>,
    store: Arc<dyn RecordStore>,
    registry: SessionRegistry,
    resolver: SourceResolver,

    /// Lifecycle event broadcaster
    event_tx: broadcast::Sender<DownloadEvent>,

    /// Per-download async locks serializing event application against
    /// user actions
    locks: parking_lot::Mutex<HashMap<DownloadId, Arc<tokio::sync::Mutex<()>>>>,

    /// Downloads with a session added to the engine but not yet ready.
    /// Keeps recovery idempotent: an attaching id is never re-added.
    attaching: parking_lot::RwLock<HashSet<DownloadId>>,

    /// In-flight resume ready-waits, cancellable by delete/shutdown
    resume_waits: parking_lot::Mutex<HashMap<DownloadId, CancellationToken>>,

    /// Tokens ending active stream/remux bodies, one shared per download.
    /// Pause and delete cancel them; client disconnects need no token.
    stream_guards: parking_lot::Mutex<HashMap<DownloadId, CancellationToken>>,

    shutdown: CancellationToken,
}

impl DownloadManager {
    /// Obtain a strong `Arc<Self>` reference for spawning background tasks
    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or(Error::Shutdown)
    }

    /// Create a manager with an injected record store
    pub fn with_store(
        config: Config,
        engine: Arc<dyn SwarmEngine>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let resolver = SourceResolver::new(config.fetch_timeout, config.host_rewrite.clone())?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            engine,
            store,
            registry: SessionRegistry::new(),
            resolver,
            event_tx,
            locks: parking_lot::Mutex::new(HashMap::new()),
            attaching: parking_lot::RwLock::new(HashSet::new()),
            resume_waits: parking_lot::Mutex::new(HashMap::new()),
            stream_guards: parking_lot::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Create a manager, opening the store the configuration names
    /// (SQLite when `database_path` is set, in-memory otherwise).
    pub async fn new(config: Config, engine: Arc<dyn SwarmEngine>) -> Result<Arc<Self>> {
        let store: Arc<dyn RecordStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::open(path).await?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, engine, store)
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Live session for a download, if one exists in this process
    pub fn session(&self, id: DownloadId) -> Option<Arc<dyn SwarmSession>> {
        self.registry.get(id)
    }

    /// Number of live sessions in the registry
    pub fn live_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Check that the backing store is reachable
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }

    fn lock_handle(&self, id: DownloadId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Token guarding stream bodies for this download. All concurrent
    /// streams of one id share a token; cancelling it ends them all.
    pub(crate) fn stream_guard(&self, id: DownloadId) -> CancellationToken {
        self.stream_guards
            .lock()
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn cancel_streams(&self, id: DownloadId) {
        if let Some(guard) = self.stream_guards.lock().remove(&id) {
            guard.cancel();
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Start a download, or return the existing record for the same source.
    ///
    /// Idempotent by `source_reference`: a second start returns the first
    /// record unchanged. A completed record without a live session is
    /// transparently re-added for seeding; a failed record is restarted in
    /// place. Swarm readiness is asynchronous and never blocks the caller.
    pub async fn start(&self, req: StartRequest) -> Result<DownloadRecord> {
        self.check_running()?;

        if req.reference.is_empty() {
            return Err(Error::UnresolvableSource {
                reference: req.reference,
            });
        }

        if let Some(existing) = self.store.find_by_source(&req.reference).await? {
            return self.start_existing(existing).await;
        }

        // Resolve and add before creating the record: resolver and engine
        // failures during start surface synchronously, leaving no record.
        let source = self.resolved_source(&req.reference).await?;
        let session = self
            .engine
            .add(source, &self.config.download_root)
            .await?;

        let record = DownloadRecord::new(&req);
        if let Err(e) = self.store.insert(&record).await {
            // Lost an insert race or the store is down; either way the
            // session we just added has no record to report into.
            let _ = session.destroy(true).await;
            if let Some(existing) = self.store.find_by_source(&req.reference).await? {
                return Ok(existing);
            }
            return Err(e);
        }

        tracing::info!(id = %record.id, name = %record.display_name, "download started");
        self.attach_session(record.id, session)?;
        let _ = self.event_tx.send(DownloadEvent::Added { id: record.id });

        Ok(record)
    }

    async fn start_existing(&self, record: DownloadRecord) -> Result<DownloadRecord> {
        let id = record.id;

        match record.status {
            DownloadStatus::Failed => {
                // Explicit retry: restart in place, same record id
                let lock = self.lock_handle(id);
                let _guard = lock.lock().await;

                let mut record = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                if record.status != DownloadStatus::Failed {
                    return Ok(record);
                }

                let source = self.resolved_source(&record.source_reference).await?;
                let session = self
                    .engine
                    .add(source, &self.config.download_root)
                    .await?;

                record.error = None;
                self.set_status(&mut record, DownloadStatus::Queued).await?;
                self.attach_session(id, session)?;
                tracing::info!(id = %id, "failed download restarted");
                Ok(record)
            }
            DownloadStatus::Completed => {
                // Re-add for continued seeding; the record is returned
                // unchanged and stays completed. The liveness check and the
                // re-add must sit under the same per-id lock, or two
                // concurrent duplicate starts both pass the check and the
                // loser's session is orphaned inside the engine.
                let lock = self.lock_handle(id);
                let _guard = lock.lock().await;

                let record = self
                    .store
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                if record.status != DownloadStatus::Completed
                    || self.registry.contains(id)
                    || self.attaching.read().contains(&id)
                {
                    return Ok(record);
                }

                let source = self.resolved_source(&record.source_reference).await?;
                let session = self
                    .engine
                    .add(source, &self.config.download_root)
                    .await?;
                self.attach_session(id, session)?;
                tracing::debug!(id = %id, "completed download re-added for seeding");
                Ok(record)
            }
            _ => Ok(record),
        }
    }

    async fn resolved_source(&self, reference: &str) -> Result<SessionSource> {
        Ok(match self.resolver.resolve(reference).await? {
            ResolvedSource::Magnet(uri) => SessionSource::Magnet(uri),
            ResolvedSource::TorrentBytes(bytes) => SessionSource::TorrentBytes(bytes),
        })
    }

    /// Register the event consumer for a newly added session
    fn attach_session(&self, id: DownloadId, session: Arc<dyn SwarmSession>) -> Result<()> {
        let Some(events) = session.take_events() else {
            return Err(Error::Internal(format!(
                "session events for {} already consumed",
                id
            )));
        };
        self.attaching.write().insert(id);
        self.spawn_event_loop(id, session, events)
    }

    fn spawn_event_loop(
        &self,
        id: DownloadId,
        session: Arc<dyn SwarmSession>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) -> Result<()> {
        let manager = self.arc()?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if let Err(e) = manager.apply_session_event(id, &session, event).await {
                                tracing::warn!(id = %id, "failed to apply session event: {}", e);
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        Ok(())
    }

    /// Apply one engine event to the record, serialized per id.
    ///
    /// Events for a single session arrive in emission order (ready before
    /// done; done/failed terminal), so each handler only has to reconcile
    /// against user actions, not against reordered events.
    async fn apply_session_event(
        &self,
        id: DownloadId,
        session: &Arc<dyn SwarmSession>,
        event: SessionEvent,
    ) -> Result<()> {
        let lock = self.lock_handle(id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.store.get(id).await? else {
            // Deleted while the session was attaching; tear it down
            self.attaching.write().remove(&id);
            let _ = session.destroy(false).await;
            return Ok(());
        };

        match event {
            SessionEvent::Ready(info) => {
                self.attaching.write().remove(&id);
                if record.status == DownloadStatus::Paused {
                    // A pause won the race; this session is already gone
                    return Ok(());
                }

                self.apply_ready_info(&mut record, &info);
                self.registry.insert(id, Arc::clone(session));

                if record.status == DownloadStatus::Completed {
                    // Seeding re-add: registered, but the record stays put
                    self.store.update(&record).await?;
                } else {
                    self.set_status(&mut record, DownloadStatus::Downloading)
                        .await?;
                }
                tracing::info!(id = %id, info_hash = %info.info_hash, "session ready");
            }
            SessionEvent::Done => {
                if record.status == DownloadStatus::Completed {
                    return Ok(());
                }
                record.completed_at = Some(Utc::now());
                self.set_status(&mut record, DownloadStatus::Completed)
                    .await?;
                // Session stays in the registry for seeding
                let _ = self.event_tx.send(DownloadEvent::Completed { id });
                tracing::info!(id = %id, "download completed");
            }
            SessionEvent::Failed(message) => {
                self.attaching.write().remove(&id);
                self.registry.remove(id);
                record.error = Some(message.clone());
                self.set_status(&mut record, DownloadStatus::Failed).await?;
                // Partial data stays on disk for a later retry
                let _ = self.event_tx.send(DownloadEvent::Failed { id, error: message });
                tracing::warn!(id = %id, error = %record.error.as_deref().unwrap_or(""), "download failed");
            }
        }

        Ok(())
    }

    /// Fold ready-event metadata into the record. `info_hash` and
    /// `save_path` are write-once; the source reference becomes the
    /// canonical magnet URI.
    fn apply_ready_info(&self, record: &mut DownloadRecord, info: &SessionInfo) {
        if record.info_hash.is_none() {
            record.info_hash = Some(info.info_hash.clone());
        }
        if record.save_path.is_none() {
            record.save_path = Some(info.save_path.clone());
        }
        if !info.magnet_uri.is_empty() {
            record.source_reference = info.magnet_uri.clone();
        }
        if !info.name.is_empty() {
            record.display_name = info.name.clone();
        }
        record.size_bytes = Some(info.total_bytes);
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
    }

    /// Pause a download by tearing its session down, keeping data on disk.
    ///
    /// The engine has no native pause; resume re-adds the session from the
    /// stored reference. Requires a live session: pausing a queued or
    /// already-paused download fails with `NotActive` carrying the current
    /// status.
    pub async fn pause(&self, id: DownloadId) -> Result<()> {
        self.check_running()?;
        let lock = self.lock_handle(id);
        let _guard = lock.lock().await;

        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let Some(session) = self.registry.get(id) else {
            return Err(Error::NotActive {
                action: "pause",
                current: record.status,
            });
        };

        session.destroy(true).await?;
        self.registry.remove(id);
        self.attaching.write().remove(&id);
        self.cancel_streams(id);

        self.set_status(&mut record, DownloadStatus::Paused).await?;
        let _ = self.event_tx.send(DownloadEvent::Paused { id });
        tracing::info!(id = %id, "download paused");
        Ok(())
    }

    /// Resume a paused download by re-adding its session.
    ///
    /// Blocks until the session reports ready, bounded by the configured
    /// `ready_timeout`. On timeout the status is left untouched and the
    /// error is retryable. A concurrent delete cancels the wait.
    pub async fn resume(&self, id: DownloadId) -> Result<DownloadRecord> {
        self.check_running()?;

        let (session, mut events) = {
            let lock = self.lock_handle(id);
            let _guard = lock.lock().await;

            let record = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if record.status != DownloadStatus::Paused {
                return Err(Error::NotActive {
                    action: "resume",
                    current: record.status,
                });
            }

            let source = self.resolved_source(&record.source_reference).await?;
            let session = self
                .engine
                .add(source, &self.config.download_root)
                .await?;
            let events = session.take_events().ok_or_else(|| {
                Error::Internal(format!("session events for {} already consumed", id))
            })?;
            (session, events)
        };

        let cancel = CancellationToken::new();
        self.resume_waits.lock().insert(id, cancel.clone());

        // Wait for readiness without holding the per-id lock, so the
        // cancelling operations can make progress.
        let outcome = self
            .wait_for_ready(&mut events, &cancel, self.config.ready_timeout)
            .await;
        self.resume_waits.lock().remove(&id);

        match outcome {
            ReadyWait::Ready(info) => {
                let lock = self.lock_handle(id);
                let _guard = lock.lock().await;

                let Some(mut record) = self.store.get(id).await? else {
                    let _ = session.destroy(false).await;
                    return Err(Error::NotFound(id.to_string()));
                };

                self.apply_ready_info(&mut record, &info);
                self.registry.insert(id, Arc::clone(&session));
                self.set_status(&mut record, DownloadStatus::Downloading)
                    .await?;
                self.spawn_event_loop(id, session, events)?;

                let _ = self.event_tx.send(DownloadEvent::Resumed { id });
                tracing::info!(id = %id, "download resumed");
                Ok(record)
            }
            ReadyWait::Failed(message) => {
                // Surfaced synchronously; the record stays paused
                let _ = session.destroy(true).await;
                Err(Error::Unrecoverable(message))
            }
            ReadyWait::TimedOut => {
                let _ = session.destroy(true).await;
                Err(Error::ReadyTimeout {
                    id: id.to_string(),
                    timeout: self.config.ready_timeout,
                })
            }
            ReadyWait::Cancelled => {
                let _ = session.destroy(false).await;
                Err(Error::NotFound(id.to_string()))
            }
            ReadyWait::Shutdown => {
                let _ = session.destroy(true).await;
                Err(Error::Shutdown)
            }
        }
    }

    async fn wait_for_ready(
        &self,
        events: &mut mpsc::Receiver<SessionEvent>,
        cancel: &CancellationToken,
        timeout: std::time::Duration,
    ) -> ReadyWait {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return ReadyWait::Shutdown,
                _ = cancel.cancelled() => return ReadyWait::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return ReadyWait::TimedOut,
                event = events.recv() => match event {
                    Some(SessionEvent::Ready(info)) => return ReadyWait::Ready(info),
                    Some(SessionEvent::Failed(message)) => return ReadyWait::Failed(message),
                    Some(SessionEvent::Done) => continue,
                    None => return ReadyWait::Failed("session closed before ready".to_string()),
                }
            }
        }
    }

    /// Delete a download: destroy any live session discarding its data,
    /// remove on-disk content, and drop the record.
    pub async fn delete(&self, id: DownloadId) -> Result<()> {
        self.check_running()?;

        // Wake any in-flight resume-wait and end any stream bodies before
        // taking the lock
        if let Some(cancel) = self.resume_waits.lock().remove(&id) {
            cancel.cancel();
        }
        self.cancel_streams(id);

        let lock = self.lock_handle(id);
        let _guard = lock.lock().await;

        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if let Some(session) = self.registry.remove(id) {
            session.destroy(false).await?;
        } else if let Some(rel) = &record.save_path {
            // No live engine to discard for us; remove the data directly
            if let Ok(path) = crate::stream::contained_path(&self.config.download_root, rel) {
                let result = if path.is_dir() {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                if let Err(e) = result {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(id = %id, "failed to remove download data: {}", e);
                    }
                }
            }
        }
        self.attaching.write().remove(&id);

        self.store.delete(id).await?;
        self.locks.lock().remove(&id);
        let _ = self.event_tx.send(DownloadEvent::Removed { id });
        tracing::info!(id = %id, "download deleted");
        Ok(())
    }

    /// Rebuild swarm sessions after a process restart.
    ///
    /// Re-adds every `queued`/`downloading` record from its stored source
    /// reference. Failures are isolated per record and marked on it with a
    /// distinguishing message; one bad record never aborts the others.
    /// Paused records stay paused; completed records are re-added for
    /// seeding only when the configuration asks for it. Idempotent: ids
    /// with a live or attaching session are skipped.
    pub async fn recover(&self) -> Result<()> {
        self.check_running()?;
        let records = self.store.load_all().await?;
        let total = records.len();
        let mut reattached = 0usize;

        for record in records {
            let id = record.id;
            if self.registry.contains(id) || self.attaching.read().contains(&id) {
                continue;
            }

            let wanted = match record.status {
                DownloadStatus::Queued | DownloadStatus::Downloading => true,
                DownloadStatus::Completed => self.config.reseed_on_start,
                DownloadStatus::Paused | DownloadStatus::Failed => false,
            };
            if !wanted {
                continue;
            }

            if let Err(e) = self.recover_one(&record).await {
                tracing::warn!(id = %id, "recovery failed: {}", e);
                let mut record = record;
                record.error = Some(format!("startup recovery failed: {}", e));
                if record.status != DownloadStatus::Failed {
                    self.set_status(&mut record, DownloadStatus::Failed).await?;
                    let _ = self.event_tx.send(DownloadEvent::Failed {
                        id,
                        error: record.error.clone().unwrap_or_default(),
                    });
                } else {
                    self.store.update(&record).await?;
                }
            } else {
                reattached += 1;
            }
        }

        tracing::info!(total, reattached, "startup recovery finished");
        Ok(())
    }

    async fn recover_one(&self, record: &DownloadRecord) -> Result<()> {
        let source = self.resolved_source(&record.source_reference).await?;
        let session = self
            .engine
            .add(source, &self.config.download_root)
            .await?;
        self.attach_session(record.id, session)
    }

    /// Load a record enriched with live stats when a session exists here
    pub async fn get(&self, id: DownloadId) -> Result<DownloadView> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(self.enrich(record))
    }

    /// List records, optionally for one owner, enriched with live stats
    pub async fn list(&self, owner_id: Option<&str>) -> Result<Vec<DownloadView>> {
        let records = self.store.list(owner_id).await?;
        Ok(records.into_iter().map(|r| self.enrich(r)).collect())
    }

    fn enrich(&self, record: DownloadRecord) -> DownloadView {
        let live = self.registry.get(record.id).map(|s| s.stats());
        DownloadView { record, live }
    }

    async fn set_status(&self, record: &mut DownloadRecord, new: DownloadStatus) -> Result<()> {
        let old = record.status;
        record.status = new;
        self.store.update(record).await?;
        if old != new {
            let _ = self.event_tx.send(DownloadEvent::StateChanged {
                id: record.id,
                old_status: old,
                new_status: new,
            });
        }
        Ok(())
    }

    /// Shut the manager down, tearing live sessions down with files kept
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down download manager");
        self.shutdown.cancel();

        for cancel in self.resume_waits.lock().drain().map(|(_, c)| c) {
            cancel.cancel();
        }
        for guard in self.stream_guards.lock().drain().map(|(_, g)| g) {
            guard.cancel();
        }

        for (id, session) in self.registry.drain() {
            if let Err(e) = session.destroy(true).await {
                tracing::warn!(id = %id, "failed to destroy session on shutdown: {}", e);
            }
        }
        self.attaching.write().clear();
        Ok(())
    }
}

enum ReadyWait {
    Ready(SessionInfo),
    Failed(String),
    TimedOut,
    Cancelled,
    Shutdown,
}
