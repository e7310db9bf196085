//! Subsystem configuration
//!
//! Environment-driven settings: the download root, record database, indexer
//! host rewriting for containerized deployments, and the timeouts bounding
//! resolver fetches and resume waits.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Rewrites indexer hostnames before resolution.
///
/// Inside a container, an indexer registered as `localhost` by the UI is
/// reachable only via the container gateway. The rewrite is a pure string
/// substitution of the loopback authority and never touches public hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRewrite {
    pub enabled: bool,
    /// Replacement host (e.g. `host.docker.internal`)
    pub target: String,
}

impl HostRewrite {
    /// Apply the rewrite to a reference, substituting only loopback hosts.
    pub fn apply(&self, reference: &str) -> String {
        if !self.enabled || self.target.is_empty() {
            return reference.to_string();
        }
        reference
            .replace("//localhost", &format!("//{}", self.target))
            .replace("//127.0.0.1", &format!("//{}", self.target))
    }
}

/// Main configuration for the download subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory under which all downloaded content lands
    pub download_root: PathBuf,

    /// Record database path (None = in-memory records, lost on restart)
    pub database_path: Option<PathBuf>,

    /// Bound on the Source Resolver's indexer GET
    pub fetch_timeout: Duration,

    /// Bound on the wait for a re-added session to become ready
    pub ready_timeout: Duration,

    /// Indexer host rewriting, applied before resolution
    pub host_rewrite: Option<HostRewrite>,

    /// Re-add completed downloads for seeding during startup recovery.
    /// Off by default: seeding restarts only on an explicit duplicate start.
    pub reseed_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("."),
            database_path: None,
            fetch_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(30),
            host_rewrite: None,
            reseed_on_start: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download root
    pub fn download_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_root = path.into();
        self
    }

    /// Set the record database path
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Set the resolver fetch timeout
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the resume ready-wait timeout
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Enable indexer host rewriting to the given target
    pub fn rewrite_host(mut self, target: impl Into<String>) -> Self {
        self.host_rewrite = Some(HostRewrite {
            enabled: true,
            target: target.into(),
        });
        self
    }

    /// Re-add completed downloads for seeding at startup
    pub fn reseed_on_start(mut self, enabled: bool) -> Self {
        self.reseed_on_start = enabled;
        self
    }

    /// Build a configuration from the environment.
    ///
    /// Reads `MEDIASWARM_DOWNLOAD_ROOT`, `MEDIASWARM_DB_PATH`,
    /// `MEDIASWARM_INDEXER_REWRITE`, `MEDIASWARM_INDEXER_HOST`, and
    /// `MEDIASWARM_RESEED_ON_START`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("MEDIASWARM_DOWNLOAD_ROOT") {
            config.download_root = PathBuf::from(root);
        }
        if let Ok(db) = std::env::var("MEDIASWARM_DB_PATH") {
            config.database_path = Some(PathBuf::from(db));
        }

        let rewrite_enabled = std::env::var("MEDIASWARM_INDEXER_REWRITE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if let Ok(target) = std::env::var("MEDIASWARM_INDEXER_HOST") {
            config.host_rewrite = Some(HostRewrite {
                enabled: rewrite_enabled,
                target,
            });
        }

        if let Ok(v) = std::env::var("MEDIASWARM_RESEED_ON_START") {
            config.reseed_on_start = v == "1" || v.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.download_root.exists() {
            return Err(Error::storage(
                &self.download_root,
                "download root does not exist",
            ));
        }
        if !self.download_root.is_dir() {
            return Err(Error::storage(
                &self.download_root,
                "download root is not a directory",
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(Error::Internal(
                "fetch_timeout must be non-zero".to_string(),
            ));
        }
        if self.ready_timeout.is_zero() {
            return Err(Error::Internal(
                "ready_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
