//! librqbit-backed swarm engine
//!
//! Binds the `SwarmEngine`/`SwarmSession` traits to an embedded
//! [`librqbit::Session`]. One librqbit session hosts every torrent; each
//! `add` call produces a managed-torrent handle wrapped as a `SwarmSession`.

use super::{SessionEvent, SessionInfo, SessionSource, SwarmEngine, SwarmFileEntry, SwarmSession};
use crate::error::{Error, Result};
use crate::types::LiveStats;
use async_trait::async_trait;
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio::sync::mpsc;

pub struct RqbitEngine {
    session: Arc<Session>,
}

impl RqbitEngine {
    /// Create an engine whose librqbit session defaults its output to
    /// `download_root`.
    pub async fn new(download_root: &Path) -> Result<Self> {
        let session = Session::new(download_root.to_path_buf())
            .await
            .map_err(|e| Error::Internal(format!("failed to create swarm session: {}", e)))?;
        Ok(Self { session })
    }
}

#[async_trait]
impl SwarmEngine for RqbitEngine {
    async fn add(
        &self,
        source: SessionSource,
        download_root: &Path,
    ) -> Result<Arc<dyn SwarmSession>> {
        let add = match &source {
            SessionSource::Magnet(uri) => AddTorrent::from_url(uri),
            SessionSource::TorrentBytes(bytes) => AddTorrent::from_bytes(bytes.to_vec()),
        };

        let opts = AddTorrentOptions {
            output_folder: Some(download_root.to_string_lossy().to_string()),
            overwrite: true,
            ..Default::default()
        };

        let response = self
            .session
            .add_torrent(add, Some(opts))
            .await
            .map_err(|e| Error::Unrecoverable(format!("engine rejected source: {}", e)))?;

        let handle = match response {
            AddTorrentResponse::Added(_, handle) => handle,
            AddTorrentResponse::AlreadyManaged(_, handle) => handle,
            AddTorrentResponse::ListOnly(_) => {
                return Err(Error::Internal(
                    "engine returned list-only response for a live add".to_string(),
                ))
            }
        };

        let (tx, rx) = mpsc::channel(8);
        let session = RqbitSession {
            session: self.session.clone(),
            handle: handle.clone(),
            download_root: download_root.to_path_buf(),
            events: parking_lot::Mutex::new(Some(rx)),
        };

        tokio::spawn(drive_events(handle, session.download_root.clone(), tx));

        Ok(Arc::new(session))
    }
}

/// Watch a managed torrent and translate its phases into session events.
async fn drive_events(
    handle: Arc<ManagedTorrent>,
    download_root: PathBuf,
    tx: mpsc::Sender<SessionEvent>,
) {
    if let Err(e) = handle.wait_until_initialized().await {
        let _ = tx.send(SessionEvent::Failed(e.to_string())).await;
        return;
    }

    let info = {
        let name = handle.name().unwrap_or_default();
        let save_path = handle
            .shared()
            .options
            .output_folder
            .strip_prefix(&download_root)
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
            .join(&name);
        SessionInfo {
            info_hash: handle.info_hash().as_string(),
            magnet_uri: format!("magnet:?xt=urn:btih:{}", handle.info_hash().as_string()),
            name,
            total_bytes: handle.shared().lengths.total_length(),
            save_path,
        }
    };

    if tx.send(SessionEvent::Ready(info)).await.is_err() {
        return;
    }

    match handle.wait_until_completed().await {
        Ok(()) => {
            let _ = tx.send(SessionEvent::Done).await;
        }
        Err(e) => {
            let _ = tx.send(SessionEvent::Failed(e.to_string())).await;
        }
    }
}

struct RqbitSession {
    session: Arc<Session>,
    handle: Arc<ManagedTorrent>,
    download_root: PathBuf,
    events: parking_lot::Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

#[async_trait]
impl SwarmSession for RqbitSession {
    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.lock().take()
    }

    fn stats(&self) -> LiveStats {
        let stats = self.handle.stats();
        let total = stats.total_bytes.max(1);
        LiveStats {
            progress: stats.progress_bytes as f64 / total as f64,
            done: stats.finished,
            paused: false,
            download_speed: stats
                .live
                .as_ref()
                .map(|l| (l.download_speed.mbps * 1024.0 * 1024.0) as u64)
                .unwrap_or(0),
            upload_speed: stats
                .live
                .as_ref()
                .map(|l| (l.upload_speed.mbps * 1024.0 * 1024.0) as u64)
                .unwrap_or(0),
            peers: stats
                .live
                .as_ref()
                .map(|l| l.snapshot.peer_stats.live as u32)
                .unwrap_or(0),
            eta_seconds: stats
                .live
                .as_ref()
                .and_then(|l| l.time_remaining.as_ref())
                .map(|t| t.duration().as_secs()),
        }
    }

    fn files(&self) -> Vec<SwarmFileEntry> {
        let stats = self.handle.stats();
        self.handle
            .shared()
            .file_infos
            .iter()
            .enumerate()
            .map(|(i, fi)| SwarmFileEntry {
                path: fi.relative_filename.clone(),
                length: fi.len,
                bytes_done: stats
                    .file_progress
                    .get(i)
                    .copied()
                    .unwrap_or(0)
                    .min(fi.len),
            })
            .collect()
    }

    fn supports_range(&self) -> bool {
        true
    }

    async fn read_file(
        &self,
        file_index: usize,
        range: Range<u64>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut stream = self
            .handle
            .stream(file_index)
            .map_err(|e| Error::Internal(format!("engine stream failed: {}", e)))?;
        stream
            .seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| Error::Internal(format!("engine seek failed: {}", e)))?;
        let len = range.end.saturating_sub(range.start);
        Ok(Box::new(tokio::io::AsyncReadExt::take(stream, len)))
    }

    async fn destroy(&self, keep_files: bool) -> Result<()> {
        self.session
            .delete(self.handle.id().into(), !keep_files)
            .await
            .map_err(|e| Error::Internal(format!("engine teardown failed: {}", e)))?;
        Ok(())
    }
}
