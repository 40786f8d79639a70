//! # StrataLake
//!
//! A multi-tenant, file-based data-lake storage engine.
//!
//! StrataLake ingests schemaless rows through a write-ahead log, lays them
//! down as partitioned Parquet files, and keeps a JSON-backed catalog and
//! per-column index so queries open as few files as possible.
//!
//! ## Key pieces
//!
//! - **Write path**: WAL append, partition fan-out to Parquet, catalog
//!   registration, index update
//! - **Search**: catalog candidate selection, index pruning, lazy
//!   newest-first streaming with row filters
//! - **Compaction**: merges small files inside their partition directories
//!   during a maintenance window
//! - **Auto-scaling**: rolling resource metrics drive a bounded worker count
//! - **Cost-based planning**: four candidate plans priced by a learned,
//!   versioned cost model
//!
//! Everything hangs off an explicit [`Engine`] context; there are no global
//! singletons, and background loops are plain tasks that stop on a shared
//! cancellation signal.

pub mod catalog;
pub mod columnar;
pub mod compactor;
pub mod config;
pub mod index;
pub mod optimizer;
pub mod predicate;
pub mod scaler;
pub mod source;
pub mod telemetry;
pub mod value;
pub mod wal;

mod error;

pub use error::{Error, Result};

use crate::compactor::{CompactionPolicy, CompactionStatus, Compactor};
use crate::config::ComponentFactory;
use crate::optimizer::{
    AggregateSpec, ExecutionPlan, OptimizerStats, QueryOptimizer, QueryRequest, StatsSource,
};
use crate::predicate::Predicate;
use crate::scaler::{AutoScaler, MetricsProbe, ScalerStatus, ScalingPolicy, StaticProbe};
use crate::source::{
    DataSource, SourceConfig, SourceManager, SourceSearchResult, SourceStatus, WriteReceipt,
};
use crate::value::Record;
use crate::wal::WalConfig;

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Where objects live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Local,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" | "file" | "fs" => Ok(Self::Local),
            other => Err(format!(
                "unknown storage backend '{}'; expected one of memory, local",
                other
            )),
        }
    }
}

/// Object storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local backend and all WAL segments.
    pub base_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            base_path: PathBuf::from("./data"),
        }
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tenant_id: String,
    pub storage: StorageConfig,
    /// WAL settings applied to every source (the directory is set per
    /// source).
    pub wal: WalConfig,
    pub compaction: CompactionPolicy,
    pub scaling: ScalingPolicy,
    pub max_concurrent_searches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            storage: StorageConfig::default(),
            wal: WalConfig::default(),
            compaction: CompactionPolicy::default(),
            scaling: ScalingPolicy::default(),
            max_concurrent_searches: 10,
        }
    }
}

/// Full engine status snapshot.
#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub tenant_id: String,
    pub sources: Vec<SourceStatus>,
    pub compaction: CompactionStatus,
    pub scaler: ScalerStatus,
    pub optimizer: OptimizerStats,
}

/// The engine context: owns every component and their background tasks.
pub struct Engine {
    config: EngineConfig,
    factory: ComponentFactory,
    sources: Arc<SourceManager>,
    scaler: Arc<AutoScaler>,
    compactor: Arc<Compactor>,
    optimizer: Arc<QueryOptimizer>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine with a custom metrics probe.
    pub fn with_probe(config: EngineConfig, probe: Arc<dyn MetricsProbe>) -> Self {
        let factory = ComponentFactory::new(config.storage.clone());
        let scaler = Arc::new(AutoScaler::new(config.scaling.clone(), probe));
        let sources = Arc::new(SourceManager::new(scaler.clone()));
        let compactor = Arc::new(Compactor::new(config.compaction.clone(), sources.clone()));
        let optimizer = Arc::new(QueryOptimizer::new(
            sources.clone() as Arc<dyn StatsSource>,
            config.max_concurrent_searches,
        ));
        scaler.register_cache(optimizer.clone());

        info!(tenant_id = %config.tenant_id, "Engine constructed");
        Self {
            config,
            factory,
            sources,
            scaler,
            compactor,
            optimizer,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Build an engine without host metrics; the scaler sees a quiet machine
    /// until samples are fed in.
    pub fn new(config: EngineConfig) -> Self {
        let probe = Arc::new(StaticProbe(scaler::ResourceSample {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            available_memory_bytes: 0,
            io_wait_percent: 0.0,
        }));
        Self::with_probe(config, probe)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a source, run its recovery, register it, and start its WAL loop.
    pub async fn add_source(&self, source_config: SourceConfig) -> Result<Arc<DataSource>> {
        let store = self
            .factory
            .create_source_store(&source_config.source_id)?;
        let wal_config = WalConfig {
            dir: self.factory.wal_dir(&source_config.source_id),
            ..self.config.wal.clone()
        };
        let source = DataSource::open(source_config, store, wal_config).await?;
        let report = source.recover().await?;
        if report.pending_marked_failed > 0 {
            warn!(
                source_id = %source.source_id(),
                failed = report.pending_marked_failed,
                "Recovery marked incomplete writes as failed"
            );
        }
        self.sources.register(source.clone())?;

        let wal = source.wal().clone();
        self.tasks
            .lock()
            .push(tokio::spawn(async move { wal.run().await }));
        Ok(source)
    }

    /// Start the compaction, scaling, and statistics-refresh loops.
    pub fn start(&self) {
        let compactor = self.compactor.clone();
        let scaler = self.scaler.clone();
        let optimizer = self.optimizer.clone();
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(async move { compactor.run().await }));
        tasks.push(tokio::spawn(async move { scaler.run().await }));
        tasks.push(tokio::spawn(async move { optimizer.run().await }));
        info!("Engine background loops started");
    }

    /// Stop every background loop and wait for it.
    pub async fn shutdown(&self) {
        self.compactor.shutdown_token().cancel();
        self.scaler.shutdown_token().cancel();
        self.optimizer.shutdown_token().cancel();
        for source in self.sources.sources() {
            source.wal().shutdown_token().cancel();
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Engine shut down");
    }

    /// Durably write rows into one source.
    pub async fn write(&self, source_id: &str, rows: Vec<Record>) -> Result<WriteReceipt> {
        self.sources.get(source_id)?.write(rows).await
    }

    /// Search across sources in parallel.
    pub async fn search(
        &self,
        source_ids: &[String],
        predicates: Vec<Predicate>,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<SourceSearchResult> {
        self.sources
            .search(source_ids, predicates, limit, offset)
            .await
    }

    /// Aggregate across sources in one pass; results are keyed by each
    /// spec's alias.
    pub async fn aggregate(
        &self,
        source_ids: &[String],
        specs: Vec<AggregateSpec>,
        predicates: Vec<Predicate>,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        self.sources.aggregate(source_ids, specs, predicates).await
    }

    /// Plan a query without executing it.
    pub async fn optimize(&self, request: &QueryRequest) -> ExecutionPlan {
        self.optimizer.optimize(request).await
    }

    /// Feed an actual execution back into the cost model.
    pub fn record_execution(&self, plan_id: &str, actual_time_ms: f64, rows: u64, success: bool) {
        self.optimizer
            .record_execution(plan_id, actual_time_ms, rows, success);
    }

    /// Compact one source now. Returns whether any job ran.
    pub async fn compact(&self, source_id: &str) -> Result<bool> {
        self.compactor.trigger_manual(source_id).await
    }

    /// Move aged files out of the hot tier across every source. Returns the
    /// total number of files moved.
    pub async fn migrate_cold(&self, cutoff_days: i64) -> Result<usize> {
        let mut moved = 0;
        for source in self.sources.sources() {
            moved += source.catalog().migrate_cold(cutoff_days).await?;
        }
        Ok(moved)
    }

    /// Tier migration for a single source.
    pub async fn migrate_cold_source(&self, source_id: &str, cutoff_days: i64) -> Result<usize> {
        let source = self.sources.get(source_id)?;
        source.catalog().migrate_cold(cutoff_days).await
    }

    pub fn sources(&self) -> &Arc<SourceManager> {
        &self.sources
    }

    pub fn scaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    pub fn optimizer(&self) -> &Arc<QueryOptimizer> {
        &self.optimizer
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            tenant_id: self.config.tenant_id.clone(),
            sources: self.sources.statuses().await,
            compaction: self.compactor.status(),
            scaler: self.scaler.status(),
            optimizer: self.optimizer.stats(),
        }
    }
}

/// Re-exports for convenience
pub mod prelude {
    pub use crate::compactor::{CompactionPolicy, Compactor};
    pub use crate::optimizer::{
        AggregateFunction, AggregateSpec, ExecutionPlan, QueryOptimizer, QueryRequest,
    };
    pub use crate::predicate::Predicate;
    pub use crate::scaler::{AutoScaler, MetricsProbe, ResourceSample, ScalingPolicy};
    pub use crate::source::{DataSource, SourceConfig, SourceManager};
    pub use crate::value::{Record, ScalarValue};
    pub use crate::wal::{WalConfig, WriteAheadLog};
    pub use crate::{Engine, EngineConfig, Error, Result, StorageBackend, StorageConfig};
}
