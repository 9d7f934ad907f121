//! Mapping Store
//!
//! Authoritative, persisted record of granted mappings. Every mutation runs
//! under one exclusive lock and rewrites the whole state file before the lock
//! is released. The file is replaced atomically (temp file + rename), so a
//! reader never observes partial content.
//!
//! A failed persist does not undo the in-memory mutation; callers treat it
//! as a failure of the surrounding operation.

use super::{Mapping, MappingKey};
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

/// State file name inside the state directory
pub const STATE_FILE: &str = "mappings.json";

/// Published after every committed mutation
pub type Snapshot = Arc<Vec<Mapping>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    mappings: Vec<Mapping>,
}

pub struct MappingStore {
    mappings: RwLock<Vec<Mapping>>,
    path: PathBuf,
    metrics: Arc<MetricsRegistry>,
    snapshots: watch::Sender<Snapshot>,
}

impl MappingStore {
    /// Create an empty store backed by `<state_dir>/mappings.json`
    pub fn new(state_dir: impl AsRef<Path>, metrics: Arc<MetricsRegistry>) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            mappings: RwLock::new(Vec::new()),
            path: state_dir.as_ref().join(STATE_FILE),
            metrics,
            snapshots,
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to post-commit snapshots
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Load the backing file, dropping entries already expired at `now`.
    ///
    /// A missing file yields an empty store. On malformed content the store
    /// is left untouched and the error returned.
    pub async fn load(&self, now: DateTime<Utc>) -> Result<usize> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", self.path.display());
                self.metrics.record_state("load", true);
                return Ok(0);
            }
            Err(e) => {
                self.metrics.record_state("load", false);
                return Err(Error::Io(e));
            }
        };

        let state: StateFile = match serde_json::from_slice(&data) {
            Ok(state) => state,
            Err(e) => {
                self.metrics.record_state("load", false);
                return Err(Error::Json(e));
            }
        };

        let total = state.mappings.len();
        let mut live: Vec<Mapping> = Vec::with_capacity(total);
        for mapping in state.mappings {
            if mapping.is_expired(now) {
                continue;
            }
            // A hand-edited file could repeat a tuple; keep the first.
            if live.iter().any(|m| m.key() == mapping.key()) {
                warn!("Dropping duplicate mapping {} from state file", mapping.key());
                continue;
            }
            live.push(mapping);
        }
        debug!(
            "Loaded {} mappings ({} expired or duplicate dropped)",
            live.len(),
            total - live.len()
        );

        let mut mappings = self.mappings.write().await;
        *mappings = live;
        self.metrics.record_state("load", true);
        self.publish(&mappings);
        Ok(mappings.len())
    }

    /// Look up a mapping by its 4-tuple
    pub async fn find(&self, key: &MappingKey) -> Option<Mapping> {
        self.mappings
            .read()
            .await
            .iter()
            .find(|m| m.key() == *key)
            .cloned()
    }

    /// Number of mappings held by one client address
    pub async fn count_by_address(&self, address: Ipv4Addr) -> usize {
        self.mappings
            .read()
            .await
            .iter()
            .filter(|m| m.internal_address == address)
            .count()
    }

    /// Insert a new mapping and persist.
    ///
    /// Fails with `DuplicateMapping`, without mutating, if the tuple exists.
    pub async fn add(&self, mapping: Mapping) -> Result<()> {
        let mut mappings = self.mappings.write().await;
        if mappings.iter().any(|m| m.key() == mapping.key()) {
            return Err(Error::DuplicateMapping);
        }
        mappings.push(mapping);
        let result = self.persist(&mappings).await;
        self.publish(&mappings);
        result
    }

    /// Refresh the lifetime of an existing mapping and persist
    pub async fn update(
        &self,
        key: &MappingKey,
        lifetime_secs: u32,
        now: DateTime<Utc>,
    ) -> Result<Mapping> {
        let mut mappings = self.mappings.write().await;
        let mapping = mappings
            .iter_mut()
            .find(|m| m.key() == *key)
            .ok_or(Error::MappingNotFound)?;
        mapping.refresh(lifetime_secs, now);
        let updated = mapping.clone();
        let result = self.persist(&mappings).await;
        self.publish(&mappings);
        result.map(|_| updated)
    }

    /// Remove a mapping and persist, returning what was removed
    pub async fn remove(&self, key: &MappingKey) -> Result<Mapping> {
        let mut mappings = self.mappings.write().await;
        let index = mappings
            .iter()
            .position(|m| m.key() == *key)
            .ok_or(Error::MappingNotFound)?;
        let removed = mappings.remove(index);
        let result = self.persist(&mappings).await;
        self.publish(&mappings);
        result.map(|_| removed)
    }

    /// Record the kernel rule handle for a mapping and persist
    pub async fn set_handle(&self, key: &MappingKey, handle: u64) -> Result<()> {
        let mut mappings = self.mappings.write().await;
        let mapping = mappings
            .iter_mut()
            .find(|m| m.key() == *key)
            .ok_or(Error::MappingNotFound)?;
        mapping.rule_handle = handle;
        let result = self.persist(&mappings).await;
        self.publish(&mappings);
        result
    }

    /// Drop every mapping expired at `now`, persisting the survivors once.
    ///
    /// The removed mappings are returned even if the persist fails, since
    /// they are already gone from memory.
    pub async fn remove_expired(&self, now: DateTime<Utc>) -> Vec<Mapping> {
        let mut mappings = self.mappings.write().await;
        let (expired, kept): (Vec<Mapping>, Vec<Mapping>) =
            mappings.drain(..).partition(|m| m.is_expired(now));
        *mappings = kept;

        if !expired.is_empty() {
            if let Err(e) = self.persist(&mappings).await {
                warn!("Failed to persist state after expiry sweep: {}", e);
            }
            self.publish(&mappings);
        }
        expired
    }

    /// Copy of all current mappings
    pub async fn snapshot(&self) -> Vec<Mapping> {
        self.mappings.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.mappings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.mappings.read().await.is_empty()
    }

    /// Write the whole collection to a temp file, then rename over the target.
    /// Must be called with the write lock held.
    async fn persist(&self, mappings: &[Mapping]) -> Result<()> {
        let result = self.write_state(mappings).await;
        self.metrics.record_state("save", result.is_ok());
        match &result {
            Ok(()) => debug!("Saved {} mappings to {}", mappings.len(), self.path.display()),
            Err(e) => warn!("Failed to save state: {}", e),
        }
        result
    }

    async fn write_state(&self, mappings: &[Mapping]) -> Result<()> {
        #[derive(Serialize)]
        struct StateFileRef<'a> {
            mappings: &'a [Mapping],
        }

        let data = serde_json::to_vec_pretty(&StateFileRef { mappings })?;

        let persist_err = |source| Error::Persist {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(persist_err)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &data)
            .await
            .map_err(persist_err)?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(persist_err)?;
        Ok(())
    }

    fn publish(&self, mappings: &[Mapping]) {
        self.snapshots.send_replace(Arc::new(mappings.to_vec()));
    }
}
