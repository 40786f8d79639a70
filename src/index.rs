//! Per-column file indexes used to prune files before they are opened.
//!
//! Every indexed column keeps one entry per file: min, max, null count, and
//! the exact distinct set when cardinality stayed under the cap. Pruning is
//! conservative in one direction only: a file may survive when it holds no
//! matching rows, but a file with matching rows is never pruned. Anything
//! the index cannot decide (no entry, incomparable values, an evaluation
//! problem) passes the file through.

use crate::columnar::{self, ColumnSummary};
use crate::error::Result;
use crate::predicate::Predicate;
use crate::value::{Record, ScalarValue};

use chrono::{DateTime, Utc};
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const INDEX_DOC: &str = "index/indices.json";

/// Index record for one (column, file) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub min: Option<ScalarValue>,
    pub max: Option<ScalarValue>,
    pub null_count: u64,
    /// Exact distinct values; absent when cardinality exceeded the cap.
    pub distinct: Option<Vec<ScalarValue>>,
    pub row_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated view of one column across all indexed files.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnStatistics {
    pub column: String,
    pub files_indexed: usize,
    pub total_nulls: u64,
    pub min: Option<ScalarValue>,
    pub max: Option<ScalarValue>,
    /// Distinct count, only when every file kept its exact set.
    pub distinct_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub indexed_columns: Vec<String>,
    pub total_entries: usize,
    pub cardinality_cap: usize,
}

type IndexMap = BTreeMap<String, BTreeMap<String, IndexEntry>>;

/// Write-through index over the configured columns.
pub struct IndexManager {
    store: Arc<dyn ObjectStore>,
    columns: Vec<String>,
    cardinality_cap: usize,
    // column -> file path -> entry
    entries: RwLock<IndexMap>,
    writer: tokio::sync::Mutex<()>,
}

impl IndexManager {
    pub fn new(store: Arc<dyn ObjectStore>, columns: Vec<String>, cardinality_cap: usize) -> Self {
        Self {
            store,
            columns,
            cardinality_cap,
            entries: RwLock::new(BTreeMap::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        match self.store.get(&StorePath::from(INDEX_DOC)).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                let map: IndexMap = serde_json::from_slice(&bytes)?;
                let total: usize = map.values().map(|files| files.len()).sum();
                info!(columns = map.len(), entries = total, "Loaded column indexes");
                *self.entries.write() = map;
            }
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.entries.read().clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        self.store
            .put(&StorePath::from(INDEX_DOC), PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    /// Index a freshly written file from its rows.
    pub async fn update_file(&self, path: &str, rows: &[Record]) -> Result<()> {
        let _guard = self.writer.lock().await;

        {
            let mut entries = self.entries.write();
            for column in &self.columns {
                let ColumnSummary {
                    min,
                    max,
                    null_count,
                    distinct,
                } = columnar::summarize_column(rows, column, self.cardinality_cap);
                if min.is_none() && max.is_none() && null_count == rows.len() as u64 {
                    // Column absent from this file
                    continue;
                }
                entries.entry(column.clone()).or_default().insert(
                    path.to_string(),
                    IndexEntry {
                        min,
                        max,
                        null_count,
                        distinct,
                        row_count: rows.len() as u64,
                        updated_at: Utc::now(),
                    },
                );
            }
        }

        self.persist().await?;
        debug!(path, "Updated column indexes");
        Ok(())
    }

    /// Drop all entries for a file.
    pub async fn remove_file(&self, path: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        {
            let mut entries = self.entries.write();
            for files in entries.values_mut() {
                files.remove(path);
            }
            entries.retain(|_, files| !files.is_empty());
        }
        self.persist().await
    }

    /// Rebuild the whole index from scratch.
    pub async fn rebuild(&self, files: &[(String, Vec<Record>)]) -> Result<()> {
        {
            let _guard = self.writer.lock().await;
            self.entries.write().clear();
        }
        for (path, rows) in files {
            self.update_file(path, rows).await?;
        }
        info!(files = files.len(), "Rebuilt column indexes");
        Ok(())
    }

    /// Keep only the files that might satisfy every predicate.
    ///
    /// Input order is preserved so the caller's recency ordering survives.
    pub fn prune(&self, files: Vec<String>, predicates: &[Predicate]) -> Vec<String> {
        if predicates.is_empty() {
            return files;
        }
        let entries = self.entries.read();
        let before = files.len();
        let kept: Vec<String> = files
            .into_iter()
            .filter(|path| {
                predicates.iter().all(|p| {
                    match entries.get(p.column()).and_then(|files| files.get(path)) {
                        Some(entry) => entry_may_match(entry, p),
                        // Unindexed column: cannot rule the file out
                        None => true,
                    }
                })
            })
            .collect();
        if kept.len() < before {
            debug!(before, after = kept.len(), "Index pruned candidate files");
        }
        kept
    }

    pub fn column_statistics(&self, column: &str) -> Option<ColumnStatistics> {
        let entries = self.entries.read();
        let files = entries.get(column)?;
        if files.is_empty() {
            return None;
        }

        let mut min: Option<ScalarValue> = None;
        let mut max: Option<ScalarValue> = None;
        let mut total_nulls = 0u64;
        let mut distinct: Option<std::collections::BTreeSet<String>> =
            Some(std::collections::BTreeSet::new());

        for entry in files.values() {
            total_nulls += entry.null_count;
            if let Some(m) = &entry.min {
                let take = match &min {
                    None => true,
                    Some(cur) => matches!(m.partial_cmp(cur), Some(Ordering::Less)),
                };
                if take {
                    min = Some(m.clone());
                }
            }
            if let Some(m) = &entry.max {
                let take = match &max {
                    None => true,
                    Some(cur) => matches!(m.partial_cmp(cur), Some(Ordering::Greater)),
                };
                if take {
                    max = Some(m.clone());
                }
            }
            match (&mut distinct, &entry.distinct) {
                (Some(set), Some(values)) => {
                    for v in values {
                        set.insert(format!("{}:{}", v.type_name(), v));
                    }
                }
                // One capped file makes the global count unknown
                _ => distinct = None,
            }
        }

        Some(ColumnStatistics {
            column: column.to_string(),
            files_indexed: files.len(),
            total_nulls,
            min,
            max,
            distinct_count: distinct.map(|set| set.len()),
        })
    }

    pub fn status(&self) -> IndexStatus {
        let entries = self.entries.read();
        IndexStatus {
            indexed_columns: entries.keys().cloned().collect(),
            total_entries: entries.values().map(|files| files.len()).sum(),
            cardinality_cap: self.cardinality_cap,
        }
    }
}

/// Can a file with these statistics contain a row matching the predicate?
fn entry_may_match(entry: &IndexEntry, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::Eq { value, .. } => match &entry.distinct {
            Some(values) => values.iter().any(|v| v == value),
            None => value_in_range(value, entry),
        },
        Predicate::Gt { value, .. } => match &entry.max {
            Some(max) => matches!(max.partial_cmp(value), Some(Ordering::Greater) | None),
            None => true,
        },
        Predicate::Gte { value, .. } => match &entry.max {
            Some(max) => !matches!(max.partial_cmp(value), Some(Ordering::Less)),
            None => true,
        },
        Predicate::Lt { value, .. } => match &entry.min {
            Some(min) => matches!(min.partial_cmp(value), Some(Ordering::Less) | None),
            None => true,
        },
        Predicate::Lte { value, .. } => match &entry.min {
            Some(min) => !matches!(min.partial_cmp(value), Some(Ordering::Greater)),
            None => true,
        },
        Predicate::In { values, .. } => match &entry.distinct {
            Some(present) => values.iter().any(|v| present.iter().any(|p| p == v)),
            None => values.iter().any(|v| value_in_range(v, entry)),
        },
        // Substring patterns cannot be decided from min/max
        Predicate::Like { .. } => true,
    }
}

fn value_in_range(value: &ScalarValue, entry: &IndexEntry) -> bool {
    let above_min = match &entry.min {
        Some(min) => !matches!(value.partial_cmp(min), Some(Ordering::Less)),
        None => true,
    };
    let below_max = match &entry.max {
        Some(max) => !matches!(value.partial_cmp(max), Some(Ordering::Greater)),
        None => true,
    };
    // Incomparable values fall out as "maybe"
    let comparable = entry
        .min
        .as_ref()
        .map(|m| value.partial_cmp(m).is_some())
        .unwrap_or(true);
    !comparable || (above_min && below_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn rows_with(column: &str, values: &[ScalarValue]) -> Vec<Record> {
        values
            .iter()
            .map(|v| [(column.to_string(), v.clone())].into_iter().collect())
            .collect()
    }

    fn manager(columns: &[&str]) -> IndexManager {
        IndexManager::new(
            Arc::new(InMemory::new()),
            columns.iter().map(|c| c.to_string()).collect(),
            100,
        )
    }

    #[tokio::test]
    async fn eq_prunes_outside_distinct_set() {
        let index = manager(&["region"]);
        let rows = rows_with(
            "region",
            &[
                ScalarValue::from("N"),
                ScalarValue::from("S"),
                ScalarValue::from("E"),
                ScalarValue::from("W"),
            ],
        );
        index.update_file("f1.parquet", &rows).await.unwrap();

        let eq = |v: &str| Predicate::Eq {
            column: "region".to_string(),
            value: ScalarValue::from(v),
        };
        assert!(index
            .prune(vec!["f1.parquet".into()], &[eq("Q")])
            .is_empty());
        assert_eq!(index.prune(vec!["f1.parquet".into()], &[eq("S")]).len(), 1);
    }

    #[tokio::test]
    async fn range_pruning_uses_min_max() {
        let index = manager(&["v"]);
        let rows = rows_with(
            "v",
            &(0..200).map(ScalarValue::Int).collect::<Vec<_>>(),
        );
        // 200 distinct values exceeds the cap, so only min/max survive
        index.update_file("f1.parquet", &rows).await.unwrap();

        let keep = |p: Predicate| index.prune(vec!["f1.parquet".into()], &[p]).len() == 1;
        assert!(keep(Predicate::Gt {
            column: "v".into(),
            value: ScalarValue::Int(150)
        }));
        assert!(!keep(Predicate::Gt {
            column: "v".into(),
            value: ScalarValue::Int(199)
        }));
        assert!(keep(Predicate::Gte {
            column: "v".into(),
            value: ScalarValue::Int(199)
        }));
        assert!(!keep(Predicate::Lt {
            column: "v".into(),
            value: ScalarValue::Int(0)
        }));
        assert!(keep(Predicate::Lte {
            column: "v".into(),
            value: ScalarValue::Int(0)
        }));
        assert!(keep(Predicate::Eq {
            column: "v".into(),
            value: ScalarValue::Int(42)
        }));
        assert!(!keep(Predicate::Eq {
            column: "v".into(),
            value: ScalarValue::Int(500)
        }));
    }

    #[tokio::test]
    async fn in_and_like_semantics() {
        let index = manager(&["region"]);
        let rows = rows_with("region", &[ScalarValue::from("N"), ScalarValue::from("S")]);
        index.update_file("f1.parquet", &rows).await.unwrap();

        let overlap = Predicate::In {
            column: "region".into(),
            values: vec![ScalarValue::from("S"), ScalarValue::from("X")],
        };
        let disjoint = Predicate::In {
            column: "region".into(),
            values: vec![ScalarValue::from("Q"), ScalarValue::from("X")],
        };
        assert_eq!(index.prune(vec!["f1.parquet".into()], &[overlap]).len(), 1);
        assert!(index.prune(vec!["f1.parquet".into()], &[disjoint]).is_empty());

        // Like never prunes
        let like = Predicate::Like {
            column: "region".into(),
            pattern: "Z%".into(),
        };
        assert_eq!(index.prune(vec!["f1.parquet".into()], &[like]).len(), 1);
    }

    #[tokio::test]
    async fn unindexed_column_passes_through() {
        let index = manager(&["region"]);
        let p = Predicate::Eq {
            column: "other".into(),
            value: ScalarValue::Int(1),
        };
        assert_eq!(index.prune(vec!["f1.parquet".into()], &[p]).len(), 1);
    }

    #[tokio::test]
    async fn incomparable_values_pass_through() {
        let index = manager(&["v"]);
        let rows = rows_with("v", &(0..200).map(ScalarValue::Int).collect::<Vec<_>>());
        index.update_file("f1.parquet", &rows).await.unwrap();

        // A string probe against a numeric range cannot be decided
        let p = Predicate::Eq {
            column: "v".into(),
            value: ScalarValue::from("not a number"),
        };
        assert_eq!(index.prune(vec!["f1.parquet".into()], &[p]).len(), 1);
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let index = IndexManager::new(store.clone(), vec!["v".to_string()], 100);
        index
            .update_file("f1.parquet", &rows_with("v", &[ScalarValue::Int(7)]))
            .await
            .unwrap();

        let fresh = IndexManager::new(store, vec!["v".to_string()], 100);
        fresh.load().await.unwrap();
        let stats = fresh.column_statistics("v").unwrap();
        assert_eq!(stats.files_indexed, 1);
        assert_eq!(stats.min, Some(ScalarValue::Int(7)));
        assert_eq!(stats.distinct_count, Some(1));
    }

    #[tokio::test]
    async fn remove_file_drops_entries() {
        let index = manager(&["v"]);
        index
            .update_file("f1.parquet", &rows_with("v", &[ScalarValue::Int(1)]))
            .await
            .unwrap();
        index.remove_file("f1.parquet").await.unwrap();
        assert!(index.column_statistics("v").is_none());
        assert_eq!(index.status().total_entries, 0);
    }
}
