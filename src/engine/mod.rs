//! Swarm Engine Adapter
//!
//! Narrow trait boundary over the embedded torrent engine. The manager only
//! ever talks to `SwarmEngine`/`SwarmSession`, so tests drive the lifecycle
//! with a scripted fake and the real binding stays behind a feature gate.

#[cfg(feature = "rqbit")]
pub mod rqbit;

#[cfg(feature = "rqbit")]
pub use rqbit::RqbitEngine;

use crate::error::Result;
use crate::types::LiveStats;
use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// A normalized source the engine can begin swarm participation from
#[derive(Debug, Clone)]
pub enum SessionSource {
    Magnet(String),
    TorrentBytes(Bytes),
}

/// Events a swarm session emits over its lifetime.
///
/// `Ready` always precedes `Done`; `Done` and `Failed` are terminal for the
/// session. A session that never resolves metadata emits only `Failed`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Metadata resolved; the session is transferring (or verifying)
    Ready(SessionInfo),
    /// Every piece verified
    Done,
    /// Terminal engine error
    Failed(String),
}

/// Metadata resolved when a session becomes ready
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub info_hash: String,
    /// Canonical magnet URI for this torrent
    pub magnet_uri: String,
    pub name: String,
    pub total_bytes: u64,
    /// Content location relative to the download root
    pub save_path: PathBuf,
}

/// A file within a live session
#[derive(Debug, Clone)]
pub struct SwarmFileEntry {
    /// Path relative to the session's save path
    pub path: PathBuf,
    pub length: u64,
    pub bytes_done: u64,
}

/// Factory for swarm sessions
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Begin swarm participation for a source, saving under `download_root`
    async fn add(
        &self,
        source: SessionSource,
        download_root: &Path,
    ) -> Result<Arc<dyn SwarmSession>>;
}

/// An active swarm session for one torrent
#[async_trait]
pub trait SwarmSession: Send + Sync {
    /// Take the session's event stream. Yields `None` after the first call;
    /// there is exactly one consumer (the lifecycle manager).
    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>>;

    /// Live transfer statistics
    fn stats(&self) -> LiveStats;

    /// Files in the session (empty until ready)
    fn files(&self) -> Vec<SwarmFileEntry>;

    /// Whether `read_file` can serve an arbitrary byte range before the
    /// download completes
    fn supports_range(&self) -> bool;

    /// Read a byte range of one file through the session. Blocks on pieces
    /// that are not yet available when the engine supports streaming.
    async fn read_file(
        &self,
        file_index: usize,
        range: Range<u64>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Tear the session down. `keep_files` controls whether downloaded data
    /// stays on disk.
    async fn destroy(&self, keep_files: bool) -> Result<()>;
}
