//! # mediaswarm
//!
//! Torrent download lifecycle and media streaming for a self-hosted media
//! companion.
//!
//! ## Features
//!
//! - **Lifecycle management**: start/pause/resume/delete with a persisted
//!   record store that survives process restarts
//! - **Startup recovery**: in-flight downloads are re-attached to the swarm
//!   engine after a crash, with per-record failure isolation
//! - **Source resolution**: magnet URIs, indexer `.torrent` URLs, and
//!   redirect-to-magnet handling with credential redaction
//! - **Streaming while downloading**: HTTP byte-range serving from the live
//!   swarm session or from disk, with on-the-fly Matroska remux
//! - **Async**: built on Tokio; the swarm engine is a trait boundary, with
//!   an optional `librqbit` binding behind the `rqbit` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mediaswarm::{Config, DownloadManager, StartRequest};
//! use std::sync::Arc;
//!
//! # async fn example(engine: Arc<dyn mediaswarm::SwarmEngine>) -> mediaswarm::Result<()> {
//! let config = Config::new()
//!     .download_root("/data/downloads")
//!     .database_path("/data/downloads.db");
//! let manager = DownloadManager::new(config, engine).await?;
//!
//! // Rebuild sessions for downloads that were in flight before a restart
//! manager.recover().await?;
//!
//! let record = manager
//!     .start(StartRequest {
//!         reference: "magnet:?xt=urn:btih:...".to_string(),
//!         display_name: "Example.Movie.1080p".to_string(),
//!         owner_id: "user-1".to_string(),
//!         media_id: None,
//!         origin: None,
//!         quality: None,
//!         language: None,
//!     })
//!     .await?;
//! println!("started {}", record.id);
//! # Ok(())
//! # }
//! ```

// Modules
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod stream;
pub mod types;

// Re-exports for convenience
pub use config::{Config, HostRewrite};
pub use engine::{
    SessionEvent, SessionInfo, SessionSource, SwarmEngine, SwarmFileEntry, SwarmSession,
};
pub use error::{Error, IndexerErrorKind, Result};
pub use manager::DownloadManager;
pub use registry::SessionRegistry;
pub use resolver::{ResolvedSource, SourceResolver};
pub use types::{
    DownloadEvent, DownloadId, DownloadRecord, DownloadStatus, DownloadView, FileEntry, LiveStats,
    StartRequest,
};

// Storage exports
pub use store::{MemoryStore, RecordStore, SqliteStore};

#[cfg(feature = "rqbit")]
pub use engine::RqbitEngine;
