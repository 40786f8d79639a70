//! File catalog and schema registry.
//!
//! The catalog is the authoritative record of every data file: an in-memory
//! map guarded by a single writer lock, written through to a JSON document in
//! the object store on every mutation. Readers work from snapshots and never
//! block writers for long.
//!
//! Logical paths are tier-relative (`source/part=x/file.parquet`); the
//! physical object lives under `hot/` or `cold/` depending on the entry's
//! tier, and migration flips the tier by renaming the object.

use crate::error::{Error, Result};

use chrono::{DateTime, Duration, Utc};
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const FILES_DOC: &str = "catalog/files.json";
const SCHEMAS_DOC: &str = "catalog/schemas.json";
const CHECKPOINT_DOC: &str = "catalog/catalog.checkpoint.json";

/// Storage tier of a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Hot,
    Cold,
}

impl Tier {
    pub fn prefix(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Cold => "cold",
        }
    }
}

fn default_tier() -> Tier {
    Tier::Hot
}

/// Catalog entry for one data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    pub write_id: String,
    pub size_bytes: u64,
    pub row_count: u64,
    pub columns: Vec<String>,
    pub min_ts: Option<DateTime<Utc>>,
    pub max_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Entries persisted before tiering default to hot
    #[serde(default = "default_tier")]
    pub tier: Tier,
}

/// One entry in the schema registry, keyed by the sorted column set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub columns: Vec<String>,
    pub files: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Aggregate catalog statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogStats {
    pub total_files: usize,
    pub total_bytes: u64,
    pub total_rows: u64,
    pub schema_count: usize,
    pub oldest_file: Option<DateTime<Utc>>,
    pub newest_file: Option<DateTime<Utc>>,
}

/// Registry key for a column set: sorted names joined with a unit separator,
/// so column order in a write never mints a new schema and no legal column
/// name can collide with the joined form of another set.
pub fn schema_key(columns: &[String]) -> String {
    let mut sorted: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
    sorted.sort_unstable();
    sorted.join("\u{1f}")
}

/// JSON-backed file catalog with an in-memory authoritative copy.
pub struct Catalog {
    store: Arc<dyn ObjectStore>,
    files: RwLock<BTreeMap<String, FileMeta>>,
    schemas: RwLock<BTreeMap<String, SchemaEntry>>,
    // Serializes mutate-then-persist sequences
    writer: tokio::sync::Mutex<()>,
}

impl Catalog {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            files: RwLock::new(BTreeMap::new()),
            schemas: RwLock::new(BTreeMap::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Load persisted state. Missing documents are a fresh catalog, not an
    /// error.
    pub async fn load(&self) -> Result<()> {
        if let Some(bytes) = self.read_doc(FILES_DOC).await? {
            let files: BTreeMap<String, FileMeta> = serde_json::from_slice(&bytes)?;
            info!(files = files.len(), "Loaded file catalog");
            *self.files.write() = files;
        }
        if let Some(bytes) = self.read_doc(SCHEMAS_DOC).await? {
            let schemas: BTreeMap<String, SchemaEntry> = serde_json::from_slice(&bytes)?;
            info!(schemas = schemas.len(), "Loaded schema registry");
            *self.schemas.write() = schemas;
        }
        Ok(())
    }

    async fn read_doc(&self, key: &str) -> Result<Option<bytes::Bytes>> {
        match self.store.get(&StorePath::from(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_files(&self) -> Result<()> {
        let snapshot = self.files.read().clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        self.store
            .put(&StorePath::from(FILES_DOC), PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    async fn persist_schemas(&self) -> Result<()> {
        let snapshot = self.schemas.read().clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        self.store
            .put(&StorePath::from(SCHEMAS_DOC), PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    /// Register (or re-register) a file. Write-through: the in-memory map and
    /// the persisted document update together under the writer lock.
    pub async fn register(&self, meta: FileMeta) -> Result<()> {
        let _guard = self.writer.lock().await;

        {
            let mut files = self.files.write();
            files.insert(meta.path.clone(), meta.clone());
        }

        if !meta.columns.is_empty() {
            let key = schema_key(&meta.columns);
            let now = Utc::now();
            let mut schemas = self.schemas.write();
            let entry = schemas.entry(key).or_insert_with(|| SchemaEntry {
                columns: meta.columns.clone(),
                files: Vec::new(),
                first_seen: now,
                last_updated: now,
            });
            if !entry.files.contains(&meta.path) {
                entry.files.push(meta.path.clone());
                entry.last_updated = now;
            }
        }

        self.persist_files().await?;
        self.persist_schemas().await?;
        debug!(path = %meta.path, rows = meta.row_count, "Registered file");
        Ok(())
    }

    /// Drop a file from the catalog and from any schema entries.
    pub async fn remove(&self, path: &str) -> Result<Option<FileMeta>> {
        let _guard = self.writer.lock().await;

        let removed = self.files.write().remove(path);
        if removed.is_some() {
            {
                let mut schemas = self.schemas.write();
                for entry in schemas.values_mut() {
                    entry.files.retain(|f| f != path);
                }
                schemas.retain(|_, entry| !entry.files.is_empty());
            }
            self.persist_files().await?;
            self.persist_schemas().await?;
        }
        Ok(removed)
    }

    pub fn get(&self, path: &str) -> Option<FileMeta> {
        self.files.read().get(path).cloned()
    }

    /// Snapshot of entries whose logical path starts with `prefix`.
    pub fn list(&self, prefix: &str) -> Vec<FileMeta> {
        self.files
            .read()
            .values()
            .filter(|meta| meta.path.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn schemas(&self) -> BTreeMap<String, SchemaEntry> {
        self.schemas.read().clone()
    }

    pub fn stats(&self) -> CatalogStats {
        let files = self.files.read();
        CatalogStats {
            total_files: files.len(),
            total_bytes: files.values().map(|m| m.size_bytes).sum(),
            total_rows: files.values().map(|m| m.row_count).sum(),
            schema_count: self.schemas.read().len(),
            oldest_file: files.values().map(|m| m.created_at).min(),
            newest_file: files.values().map(|m| m.created_at).max(),
        }
    }

    /// Physical object-store location of a catalog entry.
    pub fn physical_path(meta: &FileMeta) -> StorePath {
        StorePath::from(format!("{}/{}", meta.tier.prefix(), meta.path))
    }

    /// Candidate files for a query needing `required_columns`, newest first.
    ///
    /// Entries whose backing object has gone missing are reported and left
    /// out of planning, but stay in the catalog for the operator to inspect.
    pub async fn files_for_query(
        &self,
        prefix: &str,
        required_columns: &[String],
    ) -> Result<Vec<FileMeta>> {
        let mut candidates: Vec<FileMeta> = {
            let files = self.files.read();
            files
                .values()
                .filter(|meta| meta.path.starts_with(prefix))
                .filter(|meta| {
                    required_columns
                        .iter()
                        .all(|c| meta.columns.iter().any(|fc| fc == c))
                })
                .cloned()
                .collect()
        };

        let mut present = Vec::with_capacity(candidates.len());
        for meta in candidates.drain(..) {
            match self.store.head(&Self::physical_path(&meta)).await {
                Ok(_) => present.push(meta),
                Err(object_store::Error::NotFound { .. }) => {
                    warn!(path = %meta.path, "Catalog entry has no backing object; excluding from plan");
                }
                Err(e) => return Err(e.into()),
            }
        }

        present.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(present)
    }

    /// Move hot files whose newest data predates the cutoff to cold storage.
    ///
    /// Each file is renamed `hot/<path>` -> `cold/<path>` before its tier
    /// flips; per-file failures are logged and skipped. Returns the number of
    /// files moved.
    pub async fn migrate_cold(&self, cutoff_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(cutoff_days);
        let candidates: Vec<FileMeta> = {
            let files = self.files.read();
            files
                .values()
                .filter(|m| m.tier == Tier::Hot)
                .cloned()
                .collect()
        };

        let mut moved = 0usize;
        for meta in candidates {
            let Some(max_ts) = meta.max_ts else {
                debug!(path = %meta.path, "Skipping migration; file has no time range");
                continue;
            };
            if max_ts >= cutoff {
                continue;
            }

            let from = StorePath::from(format!("{}/{}", Tier::Hot.prefix(), meta.path));
            let to = StorePath::from(format!("{}/{}", Tier::Cold.prefix(), meta.path));
            match self.store.rename(&from, &to).await {
                Ok(()) => {}
                Err(object_store::Error::NotFound { .. }) => {
                    warn!(path = %meta.path, "Hot object missing during migration; skipping");
                    continue;
                }
                Err(e) => {
                    warn!(path = %meta.path, error = %e, "Migration rename failed; skipping");
                    continue;
                }
            }

            let _guard = self.writer.lock().await;
            if let Some(entry) = self.files.write().get_mut(&meta.path) {
                entry.tier = Tier::Cold;
            }
            self.persist_files().await?;
            moved += 1;
            info!(path = %meta.path, "Migrated file to cold storage");
        }

        Ok(moved)
    }

    /// Snapshot the file map to the checkpoint document.
    pub async fn checkpoint(&self) -> Result<()> {
        let snapshot = self.files.read().clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        self.store
            .put(&StorePath::from(CHECKPOINT_DOC), PutPayload::from(bytes))
            .await?;
        info!(files = snapshot.len(), "Wrote catalog checkpoint");
        Ok(())
    }

    /// Restore the file map from the latest checkpoint, if one exists.
    pub async fn restore_checkpoint(&self) -> Result<bool> {
        let Some(bytes) = self.read_doc(CHECKPOINT_DOC).await? else {
            return Ok(false);
        };
        let files: BTreeMap<String, FileMeta> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Catalog(format!("corrupt checkpoint: {}", e)))?;
        info!(files = files.len(), "Restored catalog from checkpoint");
        *self.files.write() = files;
        Ok(true)
    }
}
