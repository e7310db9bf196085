//! Swarm Session Registry
//!
//! In-memory map of download id to live session handle. Purely a liveness
//! cache: a record without an entry here simply has no session in this
//! process, which is a normal state (paused, completed, or pre-recovery),
//! not an error. Never persisted.

use crate::engine::SwarmSession;
use crate::types::DownloadId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<DownloadId, Arc<dyn SwarmSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: DownloadId) -> Option<Arc<dyn SwarmSession>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn insert(&self, id: DownloadId, session: Arc<dyn SwarmSession>) {
        self.sessions.write().insert(id, session);
    }

    pub fn remove(&self, id: DownloadId) -> Option<Arc<dyn SwarmSession>> {
        self.sessions.write().remove(&id)
    }

    pub fn contains(&self, id: DownloadId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of every live session (shutdown teardown)
    pub fn drain(&self) -> Vec<(DownloadId, Arc<dyn SwarmSession>)> {
        self.sessions.write().drain().collect()
    }
}
