//! Small-file compaction.
//!
//! Writes land as many small Parquet files; the compactor merges them into
//! files near the target size, partition directory by partition directory, so
//! merged output never crosses a partition boundary. Replaced inputs move to
//! a dated backup area instead of being deleted, and backups past retention
//! are purged asynchronously.
//!
//! A full pass runs only inside the configured maintenance window; outside
//! it, only sources in urgent shape (twice the normal thresholds) are
//! touched. Jobs are isolated: one failing job lands on the failed list and
//! leaves its inputs untouched, while sibling jobs proceed.

use crate::catalog::{FileMeta, Tier};
use crate::columnar;
use crate::error::{Error, Result};
use crate::source::{DataSource, SourceManager};
use crate::value::Record;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BACKUP_PREFIX: &str = "backup";
/// Completed/failed job records kept for status reporting.
const JOB_HISTORY_CAP: usize = 100;

/// When and how aggressively to compact.
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    /// Files below this size are merge candidates.
    pub min_file_size_bytes: u64,
    /// Aim merged output near this size.
    pub target_file_size_bytes: u64,
    /// Never produce output above this size.
    pub max_file_size_bytes: u64,
    /// Small-file count that triggers a pass.
    pub small_file_threshold: usize,
    /// Total file count that triggers a pass regardless of sizes.
    pub total_file_threshold: usize,
    /// Small files older than this are compacted even below the count
    /// thresholds.
    pub stale_after_hours: i64,
    pub max_concurrent_jobs: usize,
    /// Input files per job, at most.
    pub batch_size: usize,
    /// Maintenance window, hours of day [start, end).
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub interval_minutes: u64,
    pub backup_retention_days: i64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_file_size_bytes: 50 * 1024 * 1024,
            target_file_size_bytes: 256 * 1024 * 1024,
            max_file_size_bytes: 512 * 1024 * 1024,
            small_file_threshold: 10,
            total_file_threshold: 100,
            stale_after_hours: 6,
            max_concurrent_jobs: 3,
            batch_size: 20,
            window_start_hour: 2,
            window_end_hour: 6,
            interval_minutes: 60,
            backup_retention_days: 7,
        }
    }
}

/// Record of one merge job.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionJob {
    pub job_id: Uuid,
    pub source_id: String,
    pub partition_dir: String,
    pub partition_columns: Vec<String>,
    pub input_files: Vec<String>,
    pub output_file: Option<String>,
    pub rows_in: u64,
    pub rows_out: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// File-shape analysis for one source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceAnalysis {
    pub total_files: usize,
    pub small_files: usize,
    pub total_bytes: u64,
    pub oldest_small_age_hours: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionStatus {
    pub active_jobs: u64,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub files_merged_total: u64,
    pub last_completed: Option<CompactionJob>,
    pub last_failed: Option<CompactionJob>,
}

/// Background compaction manager.
pub struct Compactor {
    policy: CompactionPolicy,
    sources: Arc<SourceManager>,
    active_jobs: AtomicU64,
    files_merged: AtomicU64,
    completed: Mutex<Vec<CompactionJob>>,
    failed: Mutex<Vec<CompactionJob>>,
    shutdown: CancellationToken,
}

impl Compactor {
    pub fn new(policy: CompactionPolicy, sources: Arc<SourceManager>) -> Self {
        Self {
            policy,
            sources,
            active_jobs: AtomicU64::new(0),
            files_merged: AtomicU64::new(0),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn in_maintenance_window(&self, now: DateTime<Utc>) -> bool {
        let hour = now.hour();
        if self.policy.window_start_hour <= self.policy.window_end_hour {
            hour >= self.policy.window_start_hour && hour < self.policy.window_end_hour
        } else {
            // Window wraps midnight
            hour >= self.policy.window_start_hour || hour < self.policy.window_end_hour
        }
    }

    /// Inspect one source's hot files.
    pub fn analyze(&self, source: &DataSource) -> SourceAnalysis {
        let now = Utc::now();
        let files: Vec<FileMeta> = source
            .catalog()
            .list("data")
            .into_iter()
            .filter(|m| m.tier == Tier::Hot)
            .collect();

        let mut analysis = SourceAnalysis {
            total_files: files.len(),
            ..SourceAnalysis::default()
        };
        for meta in &files {
            analysis.total_bytes += meta.size_bytes;
            if meta.size_bytes < self.policy.min_file_size_bytes {
                analysis.small_files += 1;
                let age = (now - meta.created_at).num_hours();
                analysis.oldest_small_age_hours = Some(
                    analysis
                        .oldest_small_age_hours
                        .map_or(age, |cur| cur.max(age)),
                );
            }
        }
        analysis
    }

    fn should_compact(&self, analysis: &SourceAnalysis, urgency_multiplier: usize) -> bool {
        if analysis.small_files < 2 {
            return false;
        }
        analysis.small_files >= self.policy.small_file_threshold * urgency_multiplier
            || analysis.total_files >= self.policy.total_file_threshold * urgency_multiplier
            || (urgency_multiplier == 1
                && analysis
                    .oldest_small_age_hours
                    .map(|age| age >= self.policy.stale_after_hours)
                    .unwrap_or(false))
    }

    /// One scheduler pass over every source.
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        let in_window = self.in_maintenance_window(now);
        let urgency = if in_window { 1 } else { 2 };

        for source in self.sources.sources() {
            let analysis = self.analyze(&source);
            if !self.should_compact(&analysis, urgency) {
                continue;
            }
            info!(
                source_id = %source.source_id(),
                small_files = analysis.small_files,
                total_files = analysis.total_files,
                in_window,
                "Compacting source"
            );
            self.compact_source(&source).await;
        }
    }

    /// Run up to `max_concurrent_jobs` eligible jobs for one source. Jobs
    /// past the cap are not queued; the next scheduling cycle replans and
    /// picks them up.
    async fn compact_source(&self, source: &Arc<DataSource>) -> usize {
        let mut jobs = self.plan_jobs(source);
        if jobs.is_empty() {
            return 0;
        }
        let cap = self.policy.max_concurrent_jobs.max(1);
        if jobs.len() > cap {
            debug!(
                source_id = %source.source_id(),
                deferred = jobs.len() - cap,
                "Deferring merge jobs past the concurrency cap"
            );
            jobs.truncate(cap);
        }

        let mut ran = 0usize;
        let futures: Vec<_> = jobs
            .iter()
            .map(|group| self.run_job(source.clone(), group.clone()))
            .collect();
        for job in futures::future::join_all(futures).await {
            ran += 1;
            if job.error.is_some() {
                push_bounded(&self.failed, job);
            } else {
                self.files_merged
                    .fetch_add(job.input_files.len() as u64, Ordering::AcqRel);
                push_bounded(&self.completed, job);
            }
        }

        // Backup cleanup runs off the compaction path
        let store = source.store().clone();
        let retention = self.policy.backup_retention_days;
        tokio::spawn(async move {
            if let Err(e) = purge_expired_backups(store, retention).await {
                warn!(error = %e, "Backup purge failed");
            }
        });

        ran
    }

    /// Group small hot files by partition directory into merge batches.
    fn plan_jobs(&self, source: &DataSource) -> Vec<Vec<FileMeta>> {
        let mut by_dir: BTreeMap<String, Vec<FileMeta>> = BTreeMap::new();
        for meta in source.catalog().list("data") {
            if meta.tier != Tier::Hot || meta.size_bytes >= self.policy.min_file_size_bytes {
                continue;
            }
            let dir = parent_dir(&meta.path);
            by_dir.entry(dir).or_default().push(meta);
        }

        let mut jobs = Vec::new();
        for (_, mut files) in by_dir {
            files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            for group in files.chunks(self.policy.batch_size) {
                if group.len() < 2 {
                    continue;
                }
                // Do not build outputs past the hard size cap
                let mut batch = Vec::new();
                let mut batch_bytes = 0u64;
                for meta in group {
                    if batch_bytes + meta.size_bytes > self.policy.max_file_size_bytes
                        && batch.len() >= 2
                    {
                        break;
                    }
                    batch_bytes += meta.size_bytes;
                    batch.push(meta.clone());
                }
                if batch.len() >= 2 {
                    jobs.push(batch);
                }
            }
        }
        jobs
    }

    /// Merge one group of files into a single output in the same partition
    /// directory.
    async fn run_job(&self, source: Arc<DataSource>, inputs: Vec<FileMeta>) -> CompactionJob {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
        let dir = parent_dir(&inputs[0].path);
        let mut job = CompactionJob {
            job_id: Uuid::new_v4(),
            source_id: source.source_id().to_string(),
            partition_columns: partition_columns_of(&dir),
            partition_dir: dir,
            input_files: inputs.iter().map(|m| m.path.clone()).collect(),
            output_file: None,
            rows_in: inputs.iter().map(|m| m.row_count).sum(),
            rows_out: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };

        match self.merge_files(&source, &inputs, &mut job).await {
            Ok(()) => {
                info!(
                    job_id = %job.job_id,
                    inputs = job.input_files.len(),
                    rows = job.rows_out,
                    output = job.output_file.as_deref().unwrap_or(""),
                    "Compaction job finished"
                );
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Compaction job failed");
                job.error = Some(e.to_string());
            }
        }
        job.finished_at = Some(Utc::now());
        self.active_jobs.fetch_sub(1, Ordering::AcqRel);
        job
    }

    async fn merge_files(
        &self,
        source: &Arc<DataSource>,
        inputs: &[FileMeta],
        job: &mut CompactionJob,
    ) -> Result<()> {
        let mut rows: Vec<Record> = Vec::new();
        for meta in inputs {
            rows.extend(source.read_rows(meta).await?);
        }
        if rows.is_empty() {
            return Err(Error::Compaction("no rows in input files".to_string()));
        }
        job.rows_out = rows.len() as u64;

        let output_path = format!(
            "{}/compacted_{}_{}.parquet",
            job.partition_dir,
            Utc::now().format("%Y%m%d%H%M%S"),
            &job.job_id.to_string()[..8]
        );
        let bytes = columnar::rows_to_parquet(&rows)?;
        let size_bytes = bytes.len() as u64;
        let physical = StorePath::from(format!("{}/{}", Tier::Hot.prefix(), output_path));
        source.store().put(&physical, PutPayload::from(bytes)).await?;

        let meta = source.derive_meta(&output_path, job.job_id, size_bytes, &rows);
        source.catalog().register(meta).await?;
        source.index().update_file(&output_path, &rows).await?;
        job.output_file = Some(output_path);

        // Inputs go to a dated backup; the catalog forgets them only after
        // the object has actually moved
        let date_dir = Utc::now().format("%Y%m%d").to_string();
        for input in inputs {
            let from = StorePath::from(format!("{}/{}", Tier::Hot.prefix(), input.path));
            let to = StorePath::from(format!("{}/{}/{}", BACKUP_PREFIX, date_dir, input.path));
            source.store().rename(&from, &to).await?;
            source.catalog().remove(&input.path).await?;
            source.index().remove_file(&input.path).await?;
        }
        Ok(())
    }

    /// Compact one source immediately, ignoring the maintenance window.
    /// Returns whether any job ran.
    pub async fn trigger_manual(&self, source_id: &str) -> Result<bool> {
        let source = self.sources.get(source_id)?;
        let analysis = self.analyze(&source);
        if analysis.small_files < 2 {
            debug!(source_id, "Nothing to compact");
            return Ok(false);
        }
        Ok(self.compact_source(&source).await > 0)
    }

    pub fn status(&self) -> CompactionStatus {
        let completed = self.completed.lock();
        let failed = self.failed.lock();
        CompactionStatus {
            active_jobs: self.active_jobs.load(Ordering::Acquire),
            completed_jobs: completed.len(),
            failed_jobs: failed.len(),
            files_merged_total: self.files_merged.load(Ordering::Acquire),
            last_completed: completed.last().cloned(),
            last_failed: failed.last().cloned(),
        }
    }

    /// Scheduler loop. Exits on cancellation.
    pub async fn run(&self) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            self.policy.interval_minutes * 60,
        ));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => self.run_cycle(Utc::now()).await,
                _ = self.shutdown.cancelled() => break,
            }
        }
    }
}

fn push_bounded(list: &Mutex<Vec<CompactionJob>>, job: CompactionJob) {
    let mut list = list.lock();
    if list.len() == JOB_HISTORY_CAP {
        list.remove(0);
    }
    list.push(job);
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// Partition column names encoded in a directory path as `col=value`.
fn partition_columns_of(dir: &str) -> Vec<String> {
    dir.split('/')
        .filter_map(|segment| segment.split_once('=').map(|(col, _)| col.to_string()))
        .collect()
}

/// Delete backup directories whose date stamp is past retention.
async fn purge_expired_backups(store: Arc<dyn ObjectStore>, retention_days: i64) -> Result<()> {
    let cutoff = (Utc::now() - ChronoDuration::days(retention_days)).date_naive();
    let prefix = StorePath::from(BACKUP_PREFIX);
    let mut listing = store.list(Some(&prefix));
    let mut expired: Vec<StorePath> = Vec::new();

    while let Some(item) = futures::StreamExt::next(&mut listing).await {
        let object = item?;
        let location = object.location.to_string();
        let Some(date_segment) = location.split('/').nth(1) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(date_segment, "%Y%m%d") else {
            warn!(path = %location, "Backup path without a parseable date stamp");
            continue;
        };
        if date < cutoff {
            expired.push(object.location);
        }
    }

    for location in expired {
        match store.delete(&location).await {
            Ok(()) => debug!(path = %location, "Purged expired backup"),
            Err(e) => warn!(path = %location, error = %e, "Backup delete failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaler::{AutoScaler, ResourceSample, ScalingPolicy, StaticProbe};
    use crate::source::SourceConfig;
    use crate::value::ScalarValue;
    use crate::wal::WalConfig;
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn test_manager() -> Arc<SourceManager> {
        let scaler = Arc::new(AutoScaler::new(
            ScalingPolicy::default(),
            Arc::new(StaticProbe(ResourceSample {
                cpu_percent: 0.0,
                memory_percent: 0.0,
                available_memory_bytes: 0,
                io_wait_percent: 0.0,
            })),
        ));
        Arc::new(SourceManager::new(scaler))
    }

    async fn source_with_writes(dir: &TempDir, batches: usize, rows_per_batch: usize) -> Arc<DataSource> {
        let source = DataSource::open(
            SourceConfig::new("events"),
            Arc::new(InMemory::new()),
            WalConfig {
                dir: dir.path().to_path_buf(),
                flush_threshold: 1,
                ..WalConfig::default()
            },
        )
        .await
        .unwrap();

        for batch in 0..batches {
            let rows: Vec<Record> = (0..rows_per_batch)
                .map(|i| {
                    [
                        (
                            "v".to_string(),
                            ScalarValue::Int((batch * rows_per_batch + i) as i64),
                        ),
                        (
                            "timestamp".to_string(),
                            ScalarValue::Int(Utc::now().timestamp_millis()),
                        ),
                    ]
                    .into_iter()
                    .collect()
                })
                .collect();
            source.write(rows).await.unwrap();
        }
        source
    }

    fn lenient_policy() -> CompactionPolicy {
        CompactionPolicy {
            small_file_threshold: 2,
            stale_after_hours: 0,
            ..CompactionPolicy::default()
        }
    }

    #[tokio::test]
    async fn manual_compaction_conserves_rows() {
        let dir = TempDir::new().unwrap();
        let source = source_with_writes(&dir, 3, 100).await;
        let manager = test_manager();
        manager.register(source.clone()).unwrap();

        let compactor = Compactor::new(lenient_policy(), manager);
        assert!(compactor.trigger_manual("events").await.unwrap());

        let stats = source.catalog().stats();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.total_rows, 300);

        let rows = source.search_collect(Vec::new(), None, 0).await.unwrap();
        assert_eq!(rows.len(), 300);

        let status = compactor.status();
        assert_eq!(status.completed_jobs, 1);
        assert_eq!(status.failed_jobs, 0);
        assert_eq!(status.files_merged_total, 3);
    }

    #[tokio::test]
    async fn inputs_move_to_dated_backup() {
        let dir = TempDir::new().unwrap();
        let source = source_with_writes(&dir, 3, 10).await;
        let manager = test_manager();
        manager.register(source.clone()).unwrap();

        let originals: Vec<String> = source
            .catalog()
            .list("data")
            .into_iter()
            .map(|m| m.path)
            .collect();
        assert_eq!(originals.len(), 3);

        let compactor = Compactor::new(lenient_policy(), manager);
        compactor.trigger_manual("events").await.unwrap();

        let date_dir = Utc::now().format("%Y%m%d").to_string();
        for original in originals {
            let backup = StorePath::from(format!("{}/{}/{}", BACKUP_PREFIX, date_dir, original));
            assert!(source.store().head(&backup).await.is_ok());
            let hot = StorePath::from(format!("hot/{}", original));
            assert!(source.store().head(&hot).await.is_err());
        }
    }

    #[tokio::test]
    async fn compaction_stays_inside_partitions() {
        let dir = TempDir::new().unwrap();
        let mut config = SourceConfig::new("events");
        config.partition_columns = vec!["region".to_string()];
        let source = DataSource::open(
            config,
            Arc::new(InMemory::new()),
            WalConfig {
                dir: dir.path().to_path_buf(),
                flush_threshold: 1,
                ..WalConfig::default()
            },
        )
        .await
        .unwrap();

        for _ in 0..2 {
            let rows: Vec<Record> = ["N", "S"]
                .iter()
                .map(|region| {
                    [("region".to_string(), ScalarValue::from(*region))]
                        .into_iter()
                        .collect()
                })
                .collect();
            source.write(rows).await.unwrap();
        }

        let manager = test_manager();
        manager.register(source.clone()).unwrap();
        let compactor = Compactor::new(lenient_policy(), manager);
        compactor.trigger_manual("events").await.unwrap();

        // One merged file per partition
        let files = source.catalog().list("data");
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|m| m.path.contains("region=")));

        let status = compactor.status();
        let last = status.last_completed.unwrap();
        assert_eq!(last.partition_columns, vec!["region".to_string()]);
    }

    #[tokio::test]
    async fn urgent_mode_outside_window() {
        let dir = TempDir::new().unwrap();
        let source = source_with_writes(&dir, 3, 10).await;
        let manager = test_manager();
        manager.register(source).unwrap();

        let policy = CompactionPolicy {
            small_file_threshold: 2,
            // A window that is never "now"
            window_start_hour: 25,
            window_end_hour: 25,
            ..CompactionPolicy::default()
        };
        let compactor = Compactor::new(policy, manager);

        // 3 small files: >= 2x threshold (4) is false, so nothing runs
        compactor.run_cycle(Utc::now()).await;
        assert_eq!(compactor.status().completed_jobs, 0);
    }

    #[tokio::test]
    async fn stale_small_files_compact_in_window() {
        let dir = TempDir::new().unwrap();
        let source = source_with_writes(&dir, 2, 10).await;
        let manager = test_manager();
        manager.register(source).unwrap();

        let policy = CompactionPolicy {
            small_file_threshold: 50,
            total_file_threshold: 1000,
            stale_after_hours: 0,
            window_start_hour: 0,
            window_end_hour: 24,
            ..CompactionPolicy::default()
        };
        let compactor = Compactor::new(policy, manager);
        compactor.run_cycle(Utc::now()).await;
        assert_eq!(compactor.status().completed_jobs, 1);
    }

    #[tokio::test]
    async fn too_few_small_files_do_nothing() {
        let dir = TempDir::new().unwrap();
        let source = source_with_writes(&dir, 1, 10).await;
        let manager = test_manager();
        manager.register(source).unwrap();

        let compactor = Compactor::new(lenient_policy(), manager);
        assert!(!compactor.trigger_manual("events").await.unwrap());
    }

    #[tokio::test]
    async fn jobs_past_concurrency_cap_wait_for_next_cycle() {
        let dir = TempDir::new().unwrap();
        let mut config = SourceConfig::new("events");
        config.partition_columns = vec!["region".to_string()];
        let source = DataSource::open(
            config,
            Arc::new(InMemory::new()),
            WalConfig {
                dir: dir.path().to_path_buf(),
                flush_threshold: 1,
                ..WalConfig::default()
            },
        )
        .await
        .unwrap();

        // Three partitions with two small files each: three plannable jobs
        for _ in 0..2 {
            let rows: Vec<Record> = ["N", "S", "E"]
                .iter()
                .map(|region| {
                    [("region".to_string(), ScalarValue::from(*region))]
                        .into_iter()
                        .collect()
                })
                .collect();
            source.write(rows).await.unwrap();
        }

        let manager = test_manager();
        manager.register(source.clone()).unwrap();
        let policy = CompactionPolicy {
            max_concurrent_jobs: 1,
            ..lenient_policy()
        };
        let compactor = Compactor::new(policy, manager);

        // One cycle runs one job; the rest wait for later cycles
        assert!(compactor.trigger_manual("events").await.unwrap());
        assert_eq!(compactor.status().completed_jobs, 1);
        assert_eq!(source.catalog().stats().total_files, 5);

        assert!(compactor.trigger_manual("events").await.unwrap());
        assert!(compactor.trigger_manual("events").await.unwrap());
        assert_eq!(compactor.status().completed_jobs, 3);
        assert_eq!(source.catalog().stats().total_files, 3);
    }

    #[test]
    fn partition_column_parsing() {
        assert_eq!(
            partition_columns_of("data/region=N/day=3"),
            vec!["region".to_string(), "day".to_string()]
        );
        assert!(partition_columns_of("data").is_empty());
    }
}
