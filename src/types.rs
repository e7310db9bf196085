//! Core types crossing the subsystem boundary
//!
//! Persisted records, lifecycle states, live swarm statistics, and the
//! events the manager broadcasts. All of these serialize, so they can be
//! used over IPC or any message-passing interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadId(Uuid);

impl DownloadId {
    /// Create a new random download ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from the canonical string form
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a download
///
/// Transitions only along `queued -> downloading -> completed`, with
/// `downloading <-> paused`, and any state `-> failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Record created, swarm metadata not yet resolved
    Queued,
    /// Session is live and transferring (or seeding after completion events)
    Downloading,
    /// Session torn down by the user, data kept on disk
    Paused,
    /// All pieces verified; session may remain live for seeding
    Completed,
    /// Terminal swarm or recovery error, message stored on the record
    Failed,
}

impl DownloadStatus {
    /// States that should have (or be about to have) a live swarm session
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Downloading)
    }

    /// Terminal for a given session attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown download status: {}", other)),
        }
    }
}

/// Persisted download intent — the single source of truth across restarts.
///
/// `info_hash` and `save_path` are write-once-after-ready: they are `None`
/// until the swarm session resolves metadata and never change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    /// Original magnet URI or indexer URL; replaced by the canonical magnet
    /// URI once the session is ready
    pub source_reference: String,
    pub info_hash: Option<String>,
    pub display_name: String,
    pub size_bytes: Option<u64>,
    pub status: DownloadStatus,
    /// Relative path under the download root where content lands
    pub save_path: Option<PathBuf>,
    /// Last failure message, present only when status is Failed
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub owner_id: String,
    /// Opaque linkage to a catalog media item
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    /// Origin tracker/indexer name (metadata only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl DownloadRecord {
    /// Create a fresh queued record for a start request
    pub fn new(req: &StartRequest) -> Self {
        Self {
            id: DownloadId::new(),
            source_reference: req.reference.clone(),
            info_hash: None,
            display_name: req.display_name.clone(),
            size_bytes: None,
            status: DownloadStatus::Queued,
            save_path: None,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            owner_id: req.owner_id.clone(),
            media_id: req.media_id.clone(),
            origin: req.origin.clone(),
            quality: req.quality.clone(),
            language: req.language.clone(),
        }
    }
}

/// Request to start (or idempotently re-start) a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Magnet URI or indexer URL
    pub reference: String,
    pub display_name: String,
    pub owner_id: String,
    #[serde(default)]
    pub media_id: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Live statistics read from an active swarm session — never persisted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveStats {
    /// Completion ratio in [0.0, 1.0]
    pub progress: f64,
    pub done: bool,
    pub paused: bool,
    /// Bytes per second
    pub download_speed: u64,
    /// Bytes per second
    pub upload_speed: u64,
    pub peers: u32,
    /// Estimated seconds until completion, when computable
    pub eta_seconds: Option<u64>,
}

/// A file inside a swarm session or on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the session's save path
    pub path: PathBuf,
    pub length: u64,
    pub bytes_done: u64,
}

impl FileEntry {
    /// Per-file completion ratio in [0.0, 1.0]
    pub fn progress(&self) -> f64 {
        if self.length == 0 {
            1.0
        } else {
            self.bytes_done as f64 / self.length as f64
        }
    }
}

/// A record enriched with live session data when one exists in this process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadView {
    #[serde(flatten)]
    pub record: DownloadRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStats>,
}

/// Events broadcast by the lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DownloadEvent {
    /// Record created and session add requested
    Added { id: DownloadId },
    /// Status transitioned
    StateChanged {
        id: DownloadId,
        old_status: DownloadStatus,
        new_status: DownloadStatus,
    },
    /// All pieces verified
    Completed { id: DownloadId },
    /// Session failed terminally
    Failed { id: DownloadId, error: String },
    /// Session torn down, data kept
    Paused { id: DownloadId },
    /// Session re-added after a pause
    Resumed { id: DownloadId },
    /// Record deleted
    Removed { id: DownloadId },
}
