//! Shared test fixtures
//!
//! A scripted swarm engine whose sessions emit exactly the events a test
//! tells them to, plus helpers for building managers and waiting on
//! lifecycle events.

#![allow(dead_code)]

use async_trait::async_trait;
use mediaswarm::{
    Config, DownloadEvent, DownloadManager, Error, LiveStats, MemoryStore, Result, SessionEvent,
    SessionInfo, SessionSource, StartRequest, SwarmEngine, SwarmFileEntry, SwarmSession,
};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

/// A swarm engine whose sessions are driven by the test
pub struct FakeEngine {
    sessions_tx: mpsc::UnboundedSender<Arc<FakeSession>>,
    pub add_count: AtomicUsize,
    /// When set, `add` refuses with an unrecoverable error
    pub fail_adds: AtomicBool,
    /// Artificial latency inside `add`, for racing operations against it
    pub add_delay: parking_lot::Mutex<Duration>,
}

impl FakeEngine {
    /// Create the engine and a receiver yielding each session as it is added
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<FakeSession>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions_tx: tx,
                add_count: AtomicUsize::new(0),
                fail_adds: AtomicBool::new(false),
                add_delay: parking_lot::Mutex::new(Duration::ZERO),
            }),
            rx,
        )
    }

    pub fn adds(&self) -> usize {
        self.add_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwarmEngine for FakeEngine {
    async fn add(
        &self,
        source: SessionSource,
        _download_root: &Path,
    ) -> Result<Arc<dyn SwarmSession>> {
        let delay = *self.add_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(Error::Unrecoverable("engine refused the source".to_string()));
        }
        self.add_count.fetch_add(1, Ordering::SeqCst);

        let session = Arc::new(FakeSession::new(source));
        let _ = self.sessions_tx.send(Arc::clone(&session));
        Ok(session)
    }
}

/// A session the test scripts by emitting events on demand
pub struct FakeSession {
    pub source: SessionSource,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    /// `Some(keep_files)` once destroyed
    pub destroyed: parking_lot::Mutex<Option<bool>>,
    pub files: parking_lot::Mutex<Vec<SwarmFileEntry>>,
    pub content: parking_lot::Mutex<Vec<u8>>,
    pub stats: parking_lot::Mutex<LiveStats>,
}

impl FakeSession {
    fn new(source: SessionSource) -> Self {
        let (tx, rx) = mpsc::channel(8);
        Self {
            source,
            events_tx: tx,
            events_rx: parking_lot::Mutex::new(Some(rx)),
            destroyed: parking_lot::Mutex::new(None),
            files: parking_lot::Mutex::new(Vec::new()),
            content: parking_lot::Mutex::new(Vec::new()),
            stats: parking_lot::Mutex::new(LiveStats::default()),
        }
    }

    pub async fn emit_ready(&self, info: SessionInfo) {
        self.events_tx
            .send(SessionEvent::Ready(info))
            .await
            .expect("event receiver dropped");
    }

    pub async fn emit_done(&self) {
        self.events_tx
            .send(SessionEvent::Done)
            .await
            .expect("event receiver dropped");
    }

    pub async fn emit_failed(&self, message: &str) {
        self.events_tx
            .send(SessionEvent::Failed(message.to_string()))
            .await
            .expect("event receiver dropped");
    }

    pub fn destroyed_keeping_files(&self) -> Option<bool> {
        *self.destroyed.lock()
    }

    /// Populate the session with one video file backed by `content`
    pub fn set_video_file(&self, path: impl Into<PathBuf>, content: Vec<u8>, bytes_done: u64) {
        let length = content.len() as u64;
        *self.files.lock() = vec![SwarmFileEntry {
            path: path.into(),
            length,
            bytes_done,
        }];
        *self.content.lock() = content;
    }
}

#[async_trait]
impl SwarmSession for FakeSession {
    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    fn stats(&self) -> LiveStats {
        self.stats.lock().clone()
    }

    fn files(&self) -> Vec<SwarmFileEntry> {
        self.files.lock().clone()
    }

    fn supports_range(&self) -> bool {
        true
    }

    async fn read_file(
        &self,
        _file_index: usize,
        range: Range<u64>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let content = self.content.lock();
        let start = (range.start as usize).min(content.len());
        let end = (range.end as usize).min(content.len());
        Ok(Box::new(std::io::Cursor::new(content[start..end].to_vec())))
    }

    async fn destroy(&self, keep_files: bool) -> Result<()> {
        *self.destroyed.lock() = Some(keep_files);
        Ok(())
    }
}

/// Build a manager over a temp download root, a memory store, and a fake
/// engine with a short ready-wait for resume tests.
pub fn test_manager(
    temp: &TempDir,
) -> (
    Arc<DownloadManager>,
    Arc<FakeEngine>,
    mpsc::UnboundedReceiver<Arc<FakeSession>>,
    Arc<MemoryStore>,
) {
    let (engine, sessions) = FakeEngine::new();
    let store = Arc::new(MemoryStore::new());
    let config = Config::new()
        .download_root(temp.path())
        .ready_timeout(Duration::from_millis(500));
    let manager = DownloadManager::with_store(config, engine.clone(), store.clone())
        .expect("failed to build manager");
    (manager, engine, sessions, store)
}

/// Wait for the next session the engine hands out
pub async fn next_session(
    sessions: &mut mpsc::UnboundedReceiver<Arc<FakeSession>>,
) -> Arc<FakeSession> {
    timeout(Duration::from_secs(2), sessions.recv())
        .await
        .expect("timed out waiting for engine add")
        .expect("engine dropped")
}

/// Helper to wait for a specific lifecycle event
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    predicate: F,
    timeout_duration: Duration,
) -> Option<DownloadEvent>
where
    F: Fn(&DownloadEvent) -> bool,
{
    let result = timeout(timeout_duration, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await;
    result.unwrap_or(None)
}

pub fn magnet_request(reference: &str, name: &str) -> StartRequest {
    StartRequest {
        reference: reference.to_string(),
        display_name: name.to_string(),
        owner_id: "user-1".to_string(),
        media_id: None,
        origin: None,
        quality: None,
        language: None,
    }
}

pub fn ready_info(info_hash: &str, name: &str, total_bytes: u64) -> SessionInfo {
    SessionInfo {
        info_hash: info_hash.to_string(),
        magnet_uri: format!("magnet:?xt=urn:btih:{}", info_hash),
        name: name.to_string(),
        total_bytes,
        save_path: PathBuf::from(name),
    }
}
