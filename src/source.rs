//! Data sources: the write path, streaming search, and aggregation.
//!
//! A [`DataSource`] owns one object store namespace plus its WAL, catalog,
//! and column index. A write is durable once the WAL accepts it; everything
//! after that (Parquet write, catalog registration, indexing) either
//! completes the entry or marks it failed. Failed entries are never rolled
//! back; the caller re-drives the write under a fresh id.
//!
//! [`SourceManager`] fans queries out across sources in parallel and keeps
//! one source's failure from touching its siblings.

use crate::catalog::{Catalog, CatalogStats, FileMeta, Tier};
use crate::columnar;
use crate::error::{Error, Result};
use crate::index::{IndexManager, IndexStatus};
use crate::optimizer::{AggregateSpec, ColumnSample, StatsSource, TableStats};
use crate::predicate::{self, Predicate};
use crate::scaler::AutoScaler;
use crate::value::{Record, ScalarValue};
use crate::wal::{OperationStatus, WalConfig, WalEntry, WalStatus, WriteAheadLog};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Logical prefix for data files inside a source's namespace.
const DATA_PREFIX: &str = "data";

/// Per-source configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub source_id: String,
    pub name: String,
    /// Columns that fan writes out into `col=value` directories.
    pub partition_columns: Vec<String>,
    /// Columns maintained in the file index.
    pub index_columns: Vec<String>,
    /// Column carrying event time (epoch millis or RFC 3339).
    pub time_column: String,
    /// Distinct values kept per index entry before the set is dropped.
    pub index_cardinality_cap: usize,
}

impl SourceConfig {
    pub fn new(source_id: impl Into<String>) -> Self {
        let source_id = source_id.into();
        Self {
            name: source_id.clone(),
            source_id,
            partition_columns: Vec::new(),
            index_columns: Vec::new(),
            time_column: "timestamp".to_string(),
            index_cardinality_cap: 100,
        }
    }
}

/// Outcome of a completed write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteReceipt {
    pub write_id: Uuid,
    pub files: Vec<String>,
    pub row_count: usize,
}

/// Running aggregation state; mergeable across files and sources.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AggregateState {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AggregateState {
    pub fn fold(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    pub fn merge(&mut self, other: &AggregateState) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn finalize(&self, function: crate::optimizer::AggregateFunction) -> Option<f64> {
        use crate::optimizer::AggregateFunction::*;
        match function {
            Count => Some(self.count as f64),
            Sum => Some(self.sum),
            Avg => {
                if self.count == 0 {
                    None
                } else {
                    Some(self.sum / self.count as f64)
                }
            }
            Min => self.min,
            Max => self.max,
        }
    }
}

/// What recovery found and repaired.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub wal_entries_replayed: usize,
    pub files_reregistered: usize,
    pub pending_marked_failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub catalog: CatalogStats,
    pub index: IndexStatus,
    pub wal: WalStatus,
}

/// One queryable data source.
pub struct DataSource {
    config: SourceConfig,
    store: Arc<dyn ObjectStore>,
    wal: Arc<WriteAheadLog>,
    catalog: Arc<Catalog>,
    index: Arc<IndexManager>,
}

impl DataSource {
    /// Open a source over its own object-store namespace and WAL directory.
    pub async fn open(
        config: SourceConfig,
        store: Arc<dyn ObjectStore>,
        wal_config: WalConfig,
    ) -> Result<Arc<Self>> {
        let wal = Arc::new(WriteAheadLog::open(wal_config).await?);
        let catalog = Arc::new(Catalog::new(store.clone()));
        let index = Arc::new(IndexManager::new(
            store.clone(),
            config.index_columns.clone(),
            config.index_cardinality_cap,
        ));
        catalog.load().await?;
        index.load().await?;
        info!(source_id = %config.source_id, "Opened data source");
        Ok(Arc::new(Self {
            config,
            store,
            wal,
            catalog,
            index,
        }))
    }

    pub fn source_id(&self) -> &str {
        &self.config.source_id
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub(crate) fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub(crate) fn index(&self) -> &Arc<IndexManager> {
        &self.index
    }

    pub(crate) fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Durably ingest a batch of rows.
    ///
    /// The WAL append is the durability point. Failures after it mark the
    /// entry failed and surface as [`Error::WriteFailed`]; any files already
    /// written stay where they are.
    pub async fn write(&self, rows: Vec<Record>) -> Result<WriteReceipt> {
        if rows.is_empty() {
            return Err(Error::Query("write with zero rows".to_string()));
        }

        let write_id = Uuid::new_v4();
        let entry = WalEntry::write(write_id, rows.clone());
        self.wal.append(&entry).await?;

        match self.apply_write(write_id, rows).await {
            Ok(receipt) => {
                self.wal
                    .update_status(write_id, OperationStatus::Completed, None)
                    .await?;
                if self.wal.take_checkpoint_due().await {
                    if let Err(e) = self.catalog.checkpoint().await {
                        warn!(error = %e, "Catalog checkpoint failed");
                    }
                }
                Ok(receipt)
            }
            Err(e) => {
                let reason = e.to_string();
                error!(%write_id, error = %reason, "Write failed after WAL append");
                if let Err(status_err) = self
                    .wal
                    .update_status(write_id, OperationStatus::Failed, Some(reason.clone()))
                    .await
                {
                    error!(%write_id, error = %status_err, "Failed to record write failure");
                }
                Err(Error::WriteFailed {
                    write_id: write_id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn apply_write(&self, write_id: Uuid, rows: Vec<Record>) -> Result<WriteReceipt> {
        let row_count = rows.len();
        let mut files = Vec::new();

        for (dir, partition_rows) in self.partition_rows(rows) {
            let file_name = format!(
                "{}_{}.parquet",
                Utc::now().format("%Y%m%d%H%M%S%3f"),
                &write_id.to_string()[..8]
            );
            let logical_path = format!("{}/{}", dir, file_name);
            let bytes = columnar::rows_to_parquet(&partition_rows)?;
            let size_bytes = bytes.len() as u64;

            let physical = StorePath::from(format!("{}/{}", Tier::Hot.prefix(), logical_path));
            self.store.put(&physical, PutPayload::from(bytes)).await?;

            let meta = self.derive_meta(&logical_path, write_id, size_bytes, &partition_rows);
            self.catalog.register(meta).await?;
            self.index.update_file(&logical_path, &partition_rows).await?;
            files.push(logical_path);
        }

        debug!(%write_id, files = files.len(), rows = row_count, "Write applied");
        Ok(WriteReceipt {
            write_id,
            files,
            row_count,
        })
    }

    /// Group rows into partition directories under `data/`.
    fn partition_rows(&self, rows: Vec<Record>) -> BTreeMap<String, Vec<Record>> {
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for row in rows {
            let mut dir = DATA_PREFIX.to_string();
            for column in &self.config.partition_columns {
                let value = row
                    .get(column)
                    .filter(|v| !v.is_null())
                    .map(|v| sanitize_partition_value(&v.to_string()))
                    .unwrap_or_else(|| "null".to_string());
                dir.push('/');
                dir.push_str(column);
                dir.push('=');
                dir.push_str(&value);
            }
            groups.entry(dir).or_default().push(row);
        }
        groups
    }

    pub(crate) fn derive_meta(
        &self,
        logical_path: &str,
        write_id: Uuid,
        size_bytes: u64,
        rows: &[Record],
    ) -> FileMeta {
        let columns: BTreeSet<String> = rows.iter().flat_map(|r| r.keys().cloned()).collect();
        let range = columnar::time_range(rows, &self.config.time_column);
        FileMeta {
            path: logical_path.to_string(),
            write_id: write_id.to_string(),
            size_bytes,
            row_count: rows.len() as u64,
            columns: columns.into_iter().collect(),
            min_ts: range.map(|(lo, _)| lo),
            max_ts: range.map(|(_, hi)| hi),
            created_at: Utc::now(),
            tier: Tier::Hot,
        }
    }

    pub(crate) async fn read_rows(&self, meta: &FileMeta) -> Result<Vec<Record>> {
        let bytes = self
            .store
            .get(&Catalog::physical_path(meta))
            .await?
            .bytes()
            .await?;
        columnar::parquet_to_rows(bytes)
    }

    /// Open a lazy search over this source.
    ///
    /// Candidates come from the catalog newest-first, then the index prunes
    /// files whose statistics rule the predicates out. Nothing is read until
    /// the stream is pulled.
    pub async fn search(
        &self,
        predicates: Vec<Predicate>,
        limit: Option<usize>,
        offset: usize,
        cancel: CancellationToken,
    ) -> Result<SearchStream> {
        let required: Vec<String> = predicates
            .iter()
            .map(|p| p.column().to_string())
            .collect();
        let candidates = self
            .catalog
            .files_for_query(DATA_PREFIX, &required)
            .await?;

        let by_path: BTreeMap<String, FileMeta> = candidates
            .iter()
            .map(|m| (m.path.clone(), m.clone()))
            .collect();
        let ordered: Vec<String> = candidates.iter().map(|m| m.path.clone()).collect();
        let kept = self.index.prune(ordered, &predicates);

        let files: VecDeque<FileMeta> = kept
            .into_iter()
            .filter_map(|path| by_path.get(&path).cloned())
            .collect();

        debug!(
            source_id = %self.config.source_id,
            files = files.len(),
            "Search stream opened"
        );
        Ok(SearchStream {
            store: self.store.clone(),
            files,
            predicates,
            remaining_offset: offset,
            remaining_limit: limit,
            processed_rows: 0,
            returned_rows: 0,
            cancel,
        })
    }

    /// Convenience wrapper that drains a search into memory.
    pub async fn search_collect(
        &self,
        predicates: Vec<Predicate>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Record>> {
        let mut stream = self
            .search(predicates, limit, offset, CancellationToken::new())
            .await?;
        let mut rows = Vec::new();
        while let Some(batch) = stream.next_batch().await? {
            rows.extend(batch);
        }
        Ok(rows)
    }

    /// Streaming aggregation over matching rows. All requested aggregations
    /// fold during one scan; the returned states parallel `specs`.
    ///
    /// Unreadable files are logged and skipped so one bad object cannot sink
    /// the whole aggregate.
    pub async fn aggregate(
        &self,
        specs: &[AggregateSpec],
        predicates: &[Predicate],
    ) -> Result<Vec<AggregateState>> {
        let required: Vec<String> = predicates
            .iter()
            .map(|p| p.column().to_string())
            .collect();
        let candidates = self
            .catalog
            .files_for_query(DATA_PREFIX, &required)
            .await?;
        let by_path: BTreeMap<String, FileMeta> = candidates
            .iter()
            .map(|m| (m.path.clone(), m.clone()))
            .collect();
        let kept = self.index.prune(
            candidates.iter().map(|m| m.path.clone()).collect(),
            predicates,
        );

        let mut states = vec![AggregateState::default(); specs.len()];
        for path in kept {
            let Some(meta) = by_path.get(&path) else {
                continue;
            };
            let rows = match self.read_rows(meta).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(path = %meta.path, error = %e, "Skipping unreadable file in aggregation");
                    continue;
                }
            };
            for row in rows {
                if !predicate::matches_all(predicates, &row) {
                    continue;
                }
                for (spec, state) in specs.iter().zip(states.iter_mut()) {
                    let value = spec
                        .column
                        .as_deref()
                        .and_then(|c| row.get(c))
                        .and_then(ScalarValue::as_f64);
                    state.fold(value);
                }
            }
        }
        Ok(states)
    }

    /// Rebuild catalog and index state after a restart.
    ///
    /// The persisted catalog is loaded first (falling back to the last
    /// checkpoint), then the store is scanned for data files the catalog
    /// lost; their metadata is re-derived from the Parquet bytes themselves.
    /// WAL entries still pending are marked failed for the caller to re-drive.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        if let Err(e) = self.catalog.load().await {
            warn!(error = %e, "Catalog load failed; trying checkpoint");
            self.catalog.restore_checkpoint().await?;
        }

        report.wal_entries_replayed = self.wal.replay(|_| {}).await?;

        // Scan the hot tier for files the catalog does not know
        let prefix = StorePath::from(format!("{}/{}", Tier::Hot.prefix(), DATA_PREFIX));
        let mut listing = self.store.list(Some(&prefix));
        let mut orphaned: Vec<String> = Vec::new();
        while let Some(item) = futures::StreamExt::next(&mut listing).await {
            let object = item?;
            let full = object.location.to_string();
            let Some(logical) = full.strip_prefix("hot/") else {
                continue;
            };
            if logical.ends_with(".parquet") && self.catalog.get(logical).is_none() {
                orphaned.push(logical.to_string());
            }
        }

        for logical in orphaned {
            let physical = StorePath::from(format!("{}/{}", Tier::Hot.prefix(), logical));
            let bytes = match self.store.get(&physical).await {
                Ok(result) => result.bytes().await?,
                Err(e) => {
                    warn!(path = %logical, error = %e, "Orphaned file vanished during recovery");
                    continue;
                }
            };
            let size_bytes = bytes.len() as u64;
            let rows = match columnar::parquet_to_rows(bytes) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(path = %logical, error = %e, "Skipping unreadable orphan during recovery");
                    continue;
                }
            };
            let meta = self.derive_meta(&logical, Uuid::new_v4(), size_bytes, &rows);
            self.catalog.register(meta).await?;
            self.index.update_file(&logical, &rows).await?;
            report.files_reregistered += 1;
        }

        for entry in self.wal.pending_operations().await? {
            self.wal
                .update_status(
                    entry.operation_id,
                    OperationStatus::Failed,
                    Some("incomplete at recovery".to_string()),
                )
                .await?;
            report.pending_marked_failed += 1;
        }

        info!(
            source_id = %self.config.source_id,
            reregistered = report.files_reregistered,
            failed = report.pending_marked_failed,
            "Source recovery finished"
        );
        Ok(report)
    }

    pub async fn status(&self) -> Result<SourceStatus> {
        Ok(SourceStatus {
            source_id: self.config.source_id.clone(),
            catalog: self.catalog.stats(),
            index: self.index.status(),
            wal: self.wal.status().await?,
        })
    }
}

fn sanitize_partition_value(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == '/' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Lazy, pull-based result sequence over pruned files.
///
/// Each `next_batch` call reads at most one file, applies the row filter,
/// and honors offset and limit across file boundaries. Dropping the stream
/// early or cancelling the token stops all further reads.
pub struct SearchStream {
    store: Arc<dyn ObjectStore>,
    files: VecDeque<FileMeta>,
    predicates: Vec<Predicate>,
    remaining_offset: usize,
    remaining_limit: Option<usize>,
    pub processed_rows: u64,
    pub returned_rows: u64,
    cancel: CancellationToken,
}

impl SearchStream {
    /// Next non-empty batch of matching rows, or `None` when exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if self.remaining_limit == Some(0) {
                return Ok(None);
            }
            let Some(meta) = self.files.pop_front() else {
                return Ok(None);
            };

            let rows = match self.read_file(&meta).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(path = %meta.path, error = %e, "Skipping unreadable file in search");
                    continue;
                }
            };
            self.processed_rows += rows.len() as u64;

            let mut matched: Vec<Record> = rows
                .into_iter()
                .filter(|row| predicate::matches_all(&self.predicates, row))
                .collect();

            if self.remaining_offset > 0 {
                if matched.len() <= self.remaining_offset {
                    self.remaining_offset -= matched.len();
                    continue;
                }
                matched.drain(..self.remaining_offset);
                self.remaining_offset = 0;
            }

            if let Some(limit) = self.remaining_limit {
                if matched.len() > limit {
                    matched.truncate(limit);
                }
                self.remaining_limit = Some(limit - matched.len());
            }

            if matched.is_empty() {
                continue;
            }
            self.returned_rows += matched.len() as u64;
            return Ok(Some(matched));
        }
    }

    async fn read_file(&self, meta: &FileMeta) -> Result<Vec<Record>> {
        let bytes = self
            .store
            .get(&Catalog::physical_path(meta))
            .await?
            .bytes()
            .await?;
        columnar::parquet_to_rows(bytes)
    }
}

/// Per-source outcome of a fan-out query.
#[derive(Debug, Serialize)]
pub struct SourceSearchResult {
    pub source_id: String,
    pub rows: Vec<Record>,
    pub error: Option<String>,
}

/// Registry of data sources with parallel query fan-out.
pub struct SourceManager {
    sources: DashMap<String, Arc<DataSource>>,
    scaler: Arc<AutoScaler>,
}

impl SourceManager {
    pub fn new(scaler: Arc<AutoScaler>) -> Self {
        Self {
            sources: DashMap::new(),
            scaler,
        }
    }

    pub fn register(&self, source: Arc<DataSource>) -> Result<()> {
        let id = source.source_id().to_string();
        if self.sources.contains_key(&id) {
            return Err(Error::SourceExists(id));
        }
        info!(source_id = %id, "Registered data source");
        self.sources.insert(id, source);
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Result<Arc<DataSource>> {
        self.sources
            .get(source_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SourceNotFound(source_id.to_string()))
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|e| e.key().clone()).collect()
    }

    pub fn sources(&self) -> Vec<Arc<DataSource>> {
        self.sources.iter().map(|e| e.value().clone()).collect()
    }

    /// Search several sources in parallel.
    ///
    /// Each source runs in its own task; a failing source reports its error
    /// in place without affecting the others.
    pub async fn search(
        &self,
        source_ids: &[String],
        predicates: Vec<Predicate>,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<SourceSearchResult> {
        let started = Instant::now();
        self.scaler.query_started();

        let mut handles = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            let source_id = source_id.clone();
            let source = self.sources.get(&source_id).map(|e| e.value().clone());
            let predicates = predicates.clone();
            handles.push(tokio::spawn(async move {
                let Some(source) = source else {
                    return SourceSearchResult {
                        source_id: source_id.clone(),
                        rows: Vec::new(),
                        error: Some(format!("Data source not found: {}", source_id)),
                    };
                };
                match source.search_collect(predicates, limit, offset).await {
                    Ok(rows) => SourceSearchResult {
                        source_id,
                        rows,
                        error: None,
                    },
                    Err(e) => SourceSearchResult {
                        source_id,
                        rows: Vec::new(),
                        error: Some(e.to_string()),
                    },
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(error = %e, "Search task panicked");
                }
            }
        }

        self.scaler.query_finished(started.elapsed());
        results
    }

    /// Aggregate across sources, keyed by each spec's alias. Partial states
    /// merge before finalizing so `avg` stays correct over the union.
    pub async fn aggregate(
        &self,
        source_ids: &[String],
        specs: Vec<AggregateSpec>,
        predicates: Vec<Predicate>,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        let started = Instant::now();
        self.scaler.query_started();

        let specs = Arc::new(specs);
        let mut handles = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            let source = self.get(source_id)?;
            let specs = specs.clone();
            let predicates = predicates.clone();
            handles.push(tokio::spawn(async move {
                source.aggregate(&specs, &predicates).await
            }));
        }

        let mut combined = vec![AggregateState::default(); specs.len()];
        for handle in handles {
            match handle.await {
                Ok(Ok(states)) => {
                    for (acc, state) in combined.iter_mut().zip(&states) {
                        acc.merge(state);
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Source aggregation failed; excluded from result");
                }
                Err(e) => {
                    error!(error = %e, "Aggregation task panicked");
                }
            }
        }

        self.scaler.query_finished(started.elapsed());
        Ok(specs
            .iter()
            .zip(combined)
            .map(|(spec, state)| (spec.alias.clone(), state.finalize(spec.function)))
            .collect())
    }

    pub async fn statuses(&self) -> Vec<SourceStatus> {
        let mut out = Vec::new();
        for source in self.sources() {
            match source.status().await {
                Ok(status) => out.push(status),
                Err(e) => warn!(source_id = %source.source_id(), error = %e, "Status unavailable"),
            }
        }
        out
    }
}

#[async_trait]
impl StatsSource for SourceManager {
    async fn table_stats(&self, source_id: &str) -> Result<TableStats> {
        let source = self.get(source_id)?;
        let stats = source.catalog().stats();
        Ok(TableStats {
            row_count: stats.total_rows,
            file_count: stats.total_files,
            size_bytes: stats.total_bytes,
        })
    }

    async fn sample_columns(
        &self,
        source_id: &str,
        max_files: usize,
    ) -> Result<BTreeMap<String, ColumnSample>> {
        let source = self.get(source_id)?;
        let mut files = source.catalog().list(DATA_PREFIX);
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        files.truncate(max_files);

        let mut samples: BTreeMap<String, ColumnSample> = BTreeMap::new();
        let cap = source.config().index_cardinality_cap;
        for meta in files {
            let rows = match source.read_rows(&meta).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(path = %meta.path, error = %e, "Skipping file during stats sampling");
                    continue;
                }
            };
            let columns: BTreeSet<String> =
                rows.iter().flat_map(|r| r.keys().cloned()).collect();
            for column in columns {
                let summary = columnar::summarize_column(&rows, &column, cap);
                let entry = samples.entry(column).or_default();
                entry.null_count += summary.null_count;
                // A capped set reads as high cardinality
                entry.distinct_count = entry
                    .distinct_count
                    .max(summary.distinct.map(|d| d.len()).unwrap_or(cap * 10));
            }
        }
        Ok(samples)
    }

    fn has_index(&self, source_id: &str, column: &str) -> bool {
        self.get(source_id)
            .map(|source| {
                source
                    .config()
                    .index_columns
                    .iter()
                    .any(|c| c == column)
            })
            .unwrap_or(false)
    }
}
