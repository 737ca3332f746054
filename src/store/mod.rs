//! Entity Store
//!
//! Transactional storage for clusters, nodes, devices, bricks, volumes and
//! pending operations. Entries live in named buckets keyed by id and are
//! only ever read or written through a [`Tx`].

pub mod brick;
pub mod cluster;
pub mod device;
pub mod node;
pub mod pending;
pub mod volume;

pub use brick::*;
pub use cluster::*;
pub use device::*;
pub use node::*;
pub use pending::*;
pub use volume::*;

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Entry Trait
// =============================================================================

/// A record stored in one bucket of the database
pub trait DbEntry: Serialize + DeserializeOwned {
    /// Bucket holding all entries of this kind
    const BUCKET: &'static str;
    /// Human readable kind used in errors
    const KIND: &'static str;

    fn id(&self) -> &str;
}

/// Generate a new entity id: 128 random bits as 32 hex characters
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Check that an id has the fixed 32 hex character format
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit())
}

/// Administrative state shared by nodes and devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    #[default]
    Online,
    Offline,
    Failed,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Online => write!(f, "online"),
            EntryState::Offline => write!(f, "offline"),
            EntryState::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Buckets
// =============================================================================

type Bucket = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Buckets(BTreeMap<String, Bucket>);

type WriteSet = BTreeMap<(&'static str, String), Option<serde_json::Value>>;

impl Buckets {
    fn apply(&mut self, writes: WriteSet) {
        for ((bucket, id), value) in writes {
            let bucket = self.0.entry(bucket.to_string()).or_default();
            match value {
                Some(value) => {
                    bucket.insert(id, value);
                }
                None => {
                    bucket.remove(&id);
                }
            }
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A transaction over the database
///
/// Reads observe the committed state plus this transaction's own writes.
/// Writes are buffered and only applied when the enclosing
/// [`Db::update`] closure returns `Ok`.
pub struct Tx<'a> {
    base: &'a Buckets,
    writes: WriteSet,
    writable: bool,
}

impl<'a> Tx<'a> {
    fn new(base: &'a Buckets, writable: bool) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
            writable,
        }
    }

    fn lookup(&self, bucket: &'static str, id: &str) -> Option<&serde_json::Value> {
        if let Some(write) = self.writes.get(&(bucket, id.to_string())) {
            return write.as_ref();
        }
        self.base.0.get(bucket).and_then(|b| b.get(id))
    }

    /// Load an entry, failing with NotFound when absent
    pub fn get<T: DbEntry>(&self, id: &str) -> Result<T> {
        let value = self
            .lookup(T::BUCKET, id)
            .ok_or_else(|| Error::not_found(T::KIND, id))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Load an entry if present
    pub fn try_get<T: DbEntry>(&self, id: &str) -> Result<Option<T>> {
        match self.lookup(T::BUCKET, id) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Check whether an entry exists
    pub fn contains<T: DbEntry>(&self, id: &str) -> bool {
        self.lookup(T::BUCKET, id).is_some()
    }

    /// Save an entry, replacing any previous version
    pub fn put<T: DbEntry>(&mut self, entry: &T) -> Result<()> {
        self.ensure_writable()?;
        let value = serde_json::to_value(entry)?;
        self.writes
            .insert((T::BUCKET, entry.id().to_string()), Some(value));
        Ok(())
    }

    /// Delete an entry
    pub fn delete<T: DbEntry>(&mut self, id: &str) -> Result<()> {
        self.ensure_writable()?;
        if !self.contains::<T>(id) {
            return Err(Error::not_found(T::KIND, id));
        }
        self.writes.insert((T::BUCKET, id.to_string()), None);
        Ok(())
    }

    /// All ids in the bucket of `T`, sorted
    pub fn ids<T: DbEntry>(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self
            .base
            .0
            .get(T::BUCKET)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();

        for ((bucket, id), value) in &self.writes {
            if *bucket != T::BUCKET {
                continue;
            }
            if value.is_some() {
                ids.insert(id.clone());
            } else {
                ids.remove(id);
            }
        }

        ids.into_iter().collect()
    }

    /// Load every entry of kind `T`
    pub fn list<T: DbEntry>(&self) -> Result<Vec<T>> {
        self.ids::<T>().iter().map(|id| self.get::<T>(id)).collect()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::Internal("write attempted in a read-only transaction".into()))
        }
    }

    fn into_writes(self) -> WriteSet {
        self.writes
    }
}

// =============================================================================
// Database
// =============================================================================

/// Transactional entity database
///
/// `update` holds the write lock for the whole closure, so read-write
/// transactions are serializable. An optional snapshot file is rewritten
/// atomically after every committed update.
pub struct Db {
    data: RwLock<Buckets>,
    path: Option<PathBuf>,
}

impl Db {
    /// Create an empty in-memory database
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(Buckets::default()),
            path: None,
        })
    }

    /// Open a database backed by a JSON snapshot file
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let raw = std::fs::read(&path)?;
            let buckets: Buckets = serde_json::from_slice(&raw)?;
            info!(
                "Loaded database {} ({} buckets)",
                path.display(),
                buckets.0.len()
            );
            buckets
        } else {
            info!("Creating new database at {}", path.display());
            Buckets::default()
        };

        Ok(Arc::new(Self {
            data: RwLock::new(data),
            path: Some(path),
        }))
    }

    /// Run a read-only transaction
    pub fn view<R>(&self, f: impl FnOnce(&Tx<'_>) -> Result<R>) -> Result<R> {
        let guard = self.data.read();
        let tx = Tx::new(&guard, false);
        f(&tx)
    }

    /// Run a read-write transaction
    ///
    /// Writes are committed only if `f` returns `Ok`; on error nothing the
    /// closure did is visible to anyone.
    pub fn update<R>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<R>) -> Result<R> {
        let mut guard = self.data.write();
        let mut tx = Tx::new(&guard, true);
        let out = f(&mut tx)?;
        let writes = tx.into_writes();

        if writes.is_empty() {
            return Ok(out);
        }

        match &self.path {
            Some(path) => {
                let mut next = guard.clone();
                next.apply(writes);
                persist(path, &next)?;
                *guard = next;
            }
            None => guard.apply(writes),
        }

        Ok(out)
    }
}

fn persist(path: &Path, buckets: &Buckets) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let raw = serde_json::to_vec(buckets)?;
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)?;
    debug!("Persisted database snapshot to {}", path.display());
    Ok(())
}
