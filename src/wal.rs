//! Write-ahead log with buffered appends and rotating JSONL segments.
//!
//! Entries accumulate in an in-memory buffer and reach disk when the buffer
//! hits the flush threshold, when the flush timer fires, or at shutdown.
//! Segments are timestamp-named line-delimited JSON files rotated once they
//! pass the size cap; rotated-out segments can be gzip-compressed. Operation
//! status changes (completed/failed) are appended as separate update lines
//! and merged during replay.
//!
//! A flush failure poisons the log: the flush loop stops and every later
//! append reports the original error instead of pretending to be durable.

use crate::error::{Error, Result};
use crate::value::Record;

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".jsonl";
const COMPRESSED_SUFFIX: &str = ".jsonl.gz";

/// Kind of logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Write,
    Delete,
}

/// Lifecycle of a logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

/// A durable operation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub rows: Vec<Record>,
    pub timestamp: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WalEntry {
    pub fn write(operation_id: Uuid, rows: Vec<Record>) -> Self {
        Self {
            operation_id,
            kind: OperationKind::Write,
            rows,
            timestamp: Utc::now(),
            status: OperationStatus::Pending,
            error: None,
        }
    }
}

/// One line in a segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum WalLine {
    Entry(WalEntry),
    StatusUpdate {
        operation_id: Uuid,
        status: OperationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding segment files.
    pub dir: PathBuf,
    /// Buffered lines before a forced flush.
    pub flush_threshold: usize,
    /// Flush timer period in milliseconds.
    pub flush_interval_ms: u64,
    /// Rotate the active segment once it exceeds this many bytes.
    pub max_segment_bytes: u64,
    /// Gzip segments when they rotate out.
    pub compress_rotated: bool,
    /// Entries between catalog checkpoints.
    pub checkpoint_every: u64,
    /// Reclaim fully-settled segments older than this.
    pub retention_hours: i64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./wal"),
            flush_threshold: 50,
            flush_interval_ms: 500,
            max_segment_bytes: 5 * 1024 * 1024,
            compress_rotated: true,
            checkpoint_every: 100,
            retention_hours: 24,
        }
    }
}

/// Point-in-time WAL state.
#[derive(Debug, Clone, Serialize)]
pub struct WalStatus {
    pub segment_count: usize,
    pub total_bytes: u64,
    pub pending_operations: usize,
    pub buffered_lines: usize,
    pub current_segment: Option<String>,
    pub poisoned: bool,
}

struct WalInner {
    buffer: Vec<String>,
    active_path: Option<PathBuf>,
    active_size: u64,
    rotation_seq: u64,
    entries_since_checkpoint: u64,
    poisoned: Option<String>,
}

/// Buffered, rotating write-ahead log.
pub struct WriteAheadLog {
    config: WalConfig,
    inner: Mutex<WalInner>,
    shutdown: CancellationToken,
}

impl WriteAheadLog {
    pub async fn open(config: WalConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;
        info!(dir = %config.dir.display(), "Opened write-ahead log");
        Ok(Self {
            config,
            inner: Mutex::new(WalInner {
                buffer: Vec::new(),
                active_path: None,
                active_size: 0,
                rotation_seq: 0,
                entries_since_checkpoint: 0,
                poisoned: None,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Append an operation entry. Durability is deferred until the next
    /// flush; a poisoned log rejects the append outright.
    pub async fn append(&self, entry: &WalEntry) -> Result<()> {
        let line = serde_json::to_string(&WalLine::Entry(entry.clone()))?;
        let mut inner = self.inner.lock().await;
        if let Some(reason) = &inner.poisoned {
            return Err(Error::WalPoisoned(reason.clone()));
        }
        inner.buffer.push(line);
        inner.entries_since_checkpoint += 1;
        if inner.buffer.len() >= self.config.flush_threshold {
            self.flush_locked(&mut inner).await?;
        }
        Ok(())
    }

    /// Record a status transition for a previously appended operation.
    pub async fn update_status(
        &self,
        operation_id: Uuid,
        status: OperationStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let line = serde_json::to_string(&WalLine::StatusUpdate {
            operation_id,
            status,
            error: error_message,
            timestamp: Utc::now(),
        })?;
        let mut inner = self.inner.lock().await;
        if let Some(reason) = &inner.poisoned {
            return Err(Error::WalPoisoned(reason.clone()));
        }
        inner.buffer.push(line);
        if inner.buffer.len() >= self.config.flush_threshold {
            self.flush_locked(&mut inner).await?;
        }
        Ok(())
    }

    /// Force buffered lines to disk.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(reason) = &inner.poisoned {
            return Err(Error::WalPoisoned(reason.clone()));
        }
        self.flush_locked(&mut inner).await
    }

    async fn flush_locked(&self, inner: &mut WalInner) -> Result<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer(inner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = e.to_string();
                error!(error = %reason, "WAL flush failed; poisoning log");
                inner.poisoned = Some(reason.clone());
                Err(Error::WalPoisoned(reason))
            }
        }
    }

    async fn write_buffer(&self, inner: &mut WalInner) -> Result<()> {
        if inner.active_path.is_none() || inner.active_size > self.config.max_segment_bytes {
            self.rotate(inner).await?;
        }
        let path = inner
            .active_path
            .clone()
            .ok_or_else(|| Error::Wal("no active segment after rotation".to_string()))?;

        let mut payload = String::new();
        for line in &inner.buffer {
            payload.push_str(line);
            payload.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, payload.as_bytes()).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        file.sync_data().await?;

        inner.active_size += payload.len() as u64;
        debug!(
            lines = inner.buffer.len(),
            segment = %path.display(),
            "Flushed WAL buffer"
        );
        inner.buffer.clear();
        Ok(())
    }

    /// Close out the active segment and start a fresh one.
    async fn rotate(&self, inner: &mut WalInner) -> Result<()> {
        if let Some(old) = inner.active_path.take() {
            if self.config.compress_rotated {
                if let Err(e) = compress_segment(&old) {
                    // Leave the uncompressed segment in place; replay reads both
                    warn!(segment = %old.display(), error = %e, "Segment compression failed");
                }
            }
        }

        inner.rotation_seq += 1;
        let name = format!(
            "{}{}_{:06}{}",
            SEGMENT_PREFIX,
            Utc::now().format("%Y%m%d_%H%M%S"),
            inner.rotation_seq,
            SEGMENT_SUFFIX
        );
        let path = self.config.dir.join(name);
        inner.active_path = Some(path.clone());
        inner.active_size = 0;
        info!(segment = %path.display(), "Rotated to new WAL segment");
        Ok(())
    }

    /// Replay all settled entry state in creation order.
    ///
    /// Lines that fail to decode are logged and skipped. Status-update lines
    /// are folded into their entries before `apply` sees them.
    pub async fn replay<F>(&self, mut apply: F) -> Result<usize>
    where
        F: FnMut(&WalEntry),
    {
        let entries = self.read_entries().await?;
        let count = entries.len();
        for entry in &entries {
            apply(entry);
        }
        Ok(count)
    }

    /// Entries whose latest status is still pending.
    pub async fn pending_operations(&self) -> Result<Vec<WalEntry>> {
        let entries = self.read_entries().await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.status == OperationStatus::Pending)
            .collect())
    }

    async fn read_entries(&self) -> Result<Vec<WalEntry>> {
        // Flush so replay observes everything appended so far
        {
            let mut inner = self.inner.lock().await;
            if inner.poisoned.is_none() {
                self.flush_locked(&mut inner).await?;
            }
        }

        let mut entries: Vec<WalEntry> = Vec::new();
        let mut positions: HashMap<Uuid, usize> = HashMap::new();

        for segment in self.list_segments().await? {
            let lines = match read_segment_lines(&segment) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(segment = %segment.display(), error = %e, "Skipping unreadable WAL segment");
                    continue;
                }
            };
            for (line_no, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalLine>(line) {
                    Ok(WalLine::Entry(entry)) => {
                        positions.insert(entry.operation_id, entries.len());
                        entries.push(entry);
                    }
                    Ok(WalLine::StatusUpdate {
                        operation_id,
                        status,
                        error,
                        ..
                    }) => {
                        if let Some(&idx) = positions.get(&operation_id) {
                            entries[idx].status = status;
                            entries[idx].error = error;
                        }
                    }
                    Err(e) => {
                        warn!(
                            segment = %segment.display(),
                            line = line_no + 1,
                            error = %e,
                            "Skipping malformed WAL line"
                        );
                    }
                }
            }
        }

        Ok(entries)
    }

    async fn list_segments(&self) -> Result<Vec<PathBuf>> {
        let mut segments = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.dir).await?;
        while let Some(dent) = dir.next_entry().await? {
            let name = dent.file_name().to_string_lossy().to_string();
            if name.starts_with(SEGMENT_PREFIX)
                && (name.ends_with(SEGMENT_SUFFIX) || name.ends_with(COMPRESSED_SUFFIX))
            {
                segments.push(dent.path());
            }
        }
        // Timestamped names sort into creation order
        segments.sort();
        Ok(segments)
    }

    /// Report (and reset) whether enough entries accumulated for a catalog
    /// checkpoint.
    pub async fn take_checkpoint_due(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.entries_since_checkpoint >= self.config.checkpoint_every {
            inner.entries_since_checkpoint = 0;
            true
        } else {
            false
        }
    }

    /// Remove segments past retention whose operations have all settled.
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::hours(self.config.retention_hours);
        let active = {
            let inner = self.inner.lock().await;
            inner.active_path.clone()
        };

        let mut removed = 0usize;
        for segment in self.list_segments().await? {
            if Some(&segment) == active.as_ref() {
                continue;
            }
            let modified: DateTime<Utc> = match tokio::fs::metadata(&segment)
                .await
                .and_then(|m| m.modified())
            {
                Ok(t) => t.into(),
                Err(e) => {
                    warn!(segment = %segment.display(), error = %e, "Cannot stat WAL segment");
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }
            if segment_has_pending(&segment)? {
                debug!(segment = %segment.display(), "Retaining expired segment with pending operations");
                continue;
            }
            tokio::fs::remove_file(&segment).await?;
            info!(segment = %segment.display(), "Reclaimed expired WAL segment");
            removed += 1;
        }
        Ok(removed)
    }

    pub async fn status(&self) -> Result<WalStatus> {
        let (buffered, active, poisoned) = {
            let inner = self.inner.lock().await;
            (
                inner.buffer.len(),
                inner.active_path.clone(),
                inner.poisoned.is_some(),
            )
        };

        let segments = self.list_segments().await?;
        let mut total_bytes = 0u64;
        for segment in &segments {
            if let Ok(meta) = tokio::fs::metadata(segment).await {
                total_bytes += meta.len();
            }
        }
        let pending = self.pending_operations().await?.len();

        Ok(WalStatus {
            segment_count: segments.len(),
            total_bytes,
            pending_operations: pending,
            buffered_lines: buffered,
            current_segment: active.map(|p| p.display().to_string()),
            poisoned,
        })
    }

    /// Timer-driven flush and retention loop. Exits on cancellation or on a
    /// poisoned log.
    pub async fn run(&self) {
        let mut flush_tick =
            tokio::time::interval(std::time::Duration::from_millis(self.config.flush_interval_ms));
        let mut retention_tick =
            tokio::time::interval(std::time::Duration::from_secs(15 * 60));
        // First tick of an interval fires immediately
        flush_tick.tick().await;
        retention_tick.tick().await;

        loop {
            tokio::select! {
                _ = flush_tick.tick() => {
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "WAL flush loop stopping");
                        break;
                    }
                }
                _ = retention_tick.tick() => {
                    if let Err(e) = self.reclaim_expired().await {
                        warn!(error = %e, "WAL retention pass failed");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "Final WAL flush failed during shutdown");
                    }
                    break;
                }
            }
        }
    }
}

fn compress_segment(path: &Path) -> Result<()> {
    let data = std::fs::read(path)?;
    let gz_path = path.with_extension("jsonl.gz");
    let file = std::fs::File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(file, flate2::Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    std::fs::remove_file(path)?;
    debug!(segment = %gz_path.display(), "Compressed rotated WAL segment");
    Ok(())
}

fn read_segment_lines(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut lines = Vec::new();
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let mut decoder = GzDecoder::new(file);
        let mut text = String::new();
        decoder.read_to_string(&mut text)?;
        lines.extend(text.lines().map(|l| l.to_string()));
    } else {
        for line in BufReader::new(file).lines() {
            lines.push(line?);
        }
    }
    Ok(lines)
}

fn segment_has_pending(path: &Path) -> Result<bool> {
    let lines = read_segment_lines(path)?;
    let mut status: HashMap<Uuid, OperationStatus> = HashMap::new();
    for line in lines {
        match serde_json::from_str::<WalLine>(&line) {
            Ok(WalLine::Entry(entry)) => {
                status.insert(entry.operation_id, entry.status);
            }
            Ok(WalLine::StatusUpdate {
                operation_id,
                status: s,
                ..
            }) => {
                status.insert(operation_id, s);
            }
            Err(_) => continue,
        }
    }
    Ok(status.values().any(|s| *s == OperationStatus::Pending))
}
