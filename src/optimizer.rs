//! Cost-based query planning.
//!
//! For every query the optimizer produces up to four candidate plans over the
//! same operator tree (sequential, index-assisted, parallel, and
//! partition-pruned), prices each with the current cost model, and keeps the
//! cheapest; cost ties resolve to the earliest-generated candidate. Statistics
//! come from the catalog plus column samples drawn from a handful of files,
//! and are cached until evicted. Any failure while planning degrades to a
//! fixed-cost default plan rather than failing the query.
//!
//! The cost model is a versioned struct. Execution feedback is the only thing
//! that mutates it, under one lock, and every accepted adjustment bumps the
//! version so concurrent planners can tell which model priced a plan.

use crate::error::Result;
use crate::predicate::Predicate;
use crate::scaler::EvictableCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Column names treated as partition-like when estimating pruning.
const PARTITION_LIKE_COLUMNS: [&str; 5] = ["date", "timestamp", "year", "month", "day"];
/// Files sampled per source when collecting column statistics.
const STATS_SAMPLE_FILES: usize = 3;
/// Execution feedback points kept per plan id.
const EXECUTION_HISTORY_CAP: usize = 100;
/// Feedback points needed before the cost model moves.
const MIN_FEEDBACK_POINTS: usize = 5;
/// Interval of the background statistics refresh.
const STATS_REFRESH_INTERVAL_SECS: u64 = 300;

/// Operators appearing in an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Scan,
    Filter,
    Aggregate,
    Limit,
}

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOperator {
    pub kind: OperatorKind,
    pub source_id: Option<String>,
    pub rows_out: u64,
    pub detail: String,
}

/// Cost breakdown for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostEstimate {
    pub cpu: f64,
    pub io: f64,
    pub memory: f64,
    pub network: f64,
    pub total: f64,
}

impl CostEstimate {
    pub fn zero() -> Self {
        Self {
            cpu: 0.0,
            io: 0.0,
            memory: 0.0,
            network: 0.0,
            total: 0.0,
        }
    }

    fn finalized(mut self) -> Self {
        self.total = self.cpu + self.io + self.memory + self.network;
        self
    }
}

/// A priced candidate plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub operators: Vec<PlanOperator>,
    pub cost: CostEstimate,
    pub estimated_time_ms: f64,
    pub parallelism_factor: usize,
    pub index_usage: Vec<String>,
    /// source id -> fraction of files expected to be pruned
    pub file_pruning: BTreeMap<String, f64>,
}

/// Versioned cost-model coefficients.
#[derive(Debug, Clone, Serialize)]
pub struct CostModel {
    pub version: u64,
    pub cpu_per_row: f64,
    pub io_per_mb: f64,
    pub memory_per_mb: f64,
    pub network_per_mb: f64,
    pub index_benefit: f64,
    pub partition_pruning: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            version: 0,
            cpu_per_row: 0.001,
            io_per_mb: 0.1,
            memory_per_mb: 0.01,
            network_per_mb: 0.05,
            index_benefit: 0.8,
            partition_pruning: 0.7,
        }
    }
}

/// Table-level statistics for one source.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TableStats {
    pub row_count: u64,
    pub file_count: usize,
    pub size_bytes: u64,
}

/// Column sample used for selectivity estimation.
#[derive(Debug, Clone, Default)]
pub struct ColumnSample {
    pub distinct_count: usize,
    pub null_count: u64,
}

/// Aggregation requested by a query. Results are reported under `alias`.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSpec {
    pub function: AggregateFunction,
    pub column: Option<String>,
    pub alias: String,
}

impl AggregateSpec {
    /// Spec with an alias derived from the function and column, e.g.
    /// `sum_latency` or `count`.
    pub fn new(function: AggregateFunction, column: Option<String>) -> Self {
        let alias = match &column {
            Some(c) => format!("{}_{}", function.name(), c),
            None => function.name().to_string(),
        };
        Self {
            function,
            column,
            alias,
        }
    }

    pub fn aliased(
        function: AggregateFunction,
        column: Option<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            function,
            column,
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// The inputs a plan is built from.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub source_ids: Vec<String>,
    pub predicates: Vec<Predicate>,
    pub aggregations: Vec<AggregateSpec>,
    pub limit: Option<usize>,
}

/// Where the optimizer gets its statistics.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn table_stats(&self, source_id: &str) -> Result<TableStats>;
    /// Column samples drawn from up to `max_files` files.
    async fn sample_columns(
        &self,
        source_id: &str,
        max_files: usize,
    ) -> Result<BTreeMap<String, ColumnSample>>;
    fn has_index(&self, source_id: &str, column: &str) -> bool;
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStats {
    pub tables_analyzed: usize,
    pub cost_model: CostModel,
    pub execution_history: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
struct ExecutionPoint {
    #[allow(dead_code)]
    at: DateTime<Utc>,
    actual_time_ms: f64,
    #[allow(dead_code)]
    actual_rows: u64,
    success: bool,
}

/// Cost-based query optimizer.
pub struct QueryOptimizer {
    stats_source: std::sync::Arc<dyn StatsSource>,
    max_parallelism: usize,
    table_stats: DashMap<String, TableStats>,
    column_stats: DashMap<String, BTreeMap<String, ColumnSample>>,
    cost_model: RwLock<CostModel>,
    execution_history: RwLock<HashMap<String, VecDeque<ExecutionPoint>>>,
    shutdown: CancellationToken,
}

impl QueryOptimizer {
    pub fn new(stats_source: std::sync::Arc<dyn StatsSource>, max_parallelism: usize) -> Self {
        info!(max_parallelism, "Cost-based optimizer initialized");
        Self {
            stats_source,
            max_parallelism: max_parallelism.max(1),
            table_stats: DashMap::new(),
            column_stats: DashMap::new(),
            cost_model: RwLock::new(CostModel::default()),
            execution_history: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Plan a query. Never fails: statistics or planning trouble degrades to
    /// the fixed default plan.
    pub async fn optimize(&self, request: &QueryRequest) -> ExecutionPlan {
        match self.try_optimize(request).await {
            Ok(plan) => {
                info!(
                    plan_id = %plan.plan_id,
                    cost = plan.cost.total,
                    parallelism = plan.parallelism_factor,
                    "Selected execution plan"
                );
                plan
            }
            Err(e) => {
                warn!(error = %e, "Plan generation failed; using default plan");
                Self::default_plan(request)
            }
        }
    }

    async fn try_optimize(&self, request: &QueryRequest) -> Result<ExecutionPlan> {
        self.collect_statistics(&request.source_ids).await?;

        let model = self.cost_model.read().clone();
        let mut candidates = Vec::with_capacity(4);

        let sequential = self.sequential_plan(request, &model);
        candidates.push(self.parallel_plan(request, &sequential));
        candidates.push(self.index_plan(request, &sequential, &model));
        candidates.push(self.partition_pruned_plan(request, &sequential, &model));

        let mut best = sequential;
        // First strictly cheaper candidate wins; ties keep the earlier plan
        for candidate in candidates.into_iter().flatten() {
            debug!(
                plan_id = %candidate.plan_id,
                cost = candidate.cost.total,
                "Candidate plan"
            );
            if candidate.cost.total < best.cost.total {
                best = candidate;
            }
        }
        Ok(best)
    }

    async fn collect_statistics(&self, source_ids: &[String]) -> Result<()> {
        for source_id in source_ids {
            if self.table_stats.contains_key(source_id) {
                continue;
            }
            let table = self.stats_source.table_stats(source_id).await?;
            let columns = self
                .stats_source
                .sample_columns(source_id, STATS_SAMPLE_FILES)
                .await?;
            debug!(
                source_id,
                rows = table.row_count,
                files = table.file_count,
                "Collected table statistics"
            );
            self.table_stats.insert(source_id.clone(), table);
            self.column_stats.insert(source_id.clone(), columns);
        }
        Ok(())
    }

    fn sequential_plan(&self, request: &QueryRequest, model: &CostModel) -> ExecutionPlan {
        let mut operators = Vec::new();
        let mut cost = CostEstimate::zero();
        let mut rows_out = 0u64;

        for source_id in &request.source_ids {
            let stats = self
                .table_stats
                .get(source_id)
                .map(|s| *s)
                .unwrap_or_default();
            let size_mb = stats.size_bytes as f64 / (1024.0 * 1024.0);

            cost.cpu += stats.row_count as f64 * model.cpu_per_row;
            cost.io += size_mb * model.io_per_mb;
            cost.memory += size_mb.min(100.0) * model.memory_per_mb;
            operators.push(PlanOperator {
                kind: OperatorKind::Scan,
                source_id: Some(source_id.clone()),
                rows_out: stats.row_count,
                detail: format!("{} files", stats.file_count),
            });
            rows_out += stats.row_count;

            if !request.predicates.is_empty() {
                let selectivity = self.filter_selectivity(source_id, &request.predicates);
                let filtered = (stats.row_count as f64 * selectivity) as u64;
                cost.cpu += filtered as f64 * model.cpu_per_row * 0.5;
                operators.push(PlanOperator {
                    kind: OperatorKind::Filter,
                    source_id: Some(source_id.clone()),
                    rows_out: filtered,
                    detail: format!("selectivity {:.4}", selectivity),
                });
                rows_out = rows_out - stats.row_count + filtered;
            }
        }

        if !request.aggregations.is_empty() {
            let input_rows = operators.last().map(|op| op.rows_out).unwrap_or(1000);
            cost.cpu +=
                input_rows as f64 * request.aggregations.len() as f64 * model.cpu_per_row * 2.0;
            cost.memory += input_rows as f64 * 0.001;
            operators.push(PlanOperator {
                kind: OperatorKind::Aggregate,
                source_id: None,
                rows_out: 1,
                detail: format!("{} aggregations", request.aggregations.len()),
            });
            rows_out = 1;
        }

        if let Some(limit) = request.limit {
            operators.push(PlanOperator {
                kind: OperatorKind::Limit,
                source_id: None,
                rows_out: rows_out.min(limit as u64),
                detail: format!("limit {}", limit),
            });
        }

        let cost = cost.finalized();
        ExecutionPlan {
            plan_id: "sequential_plan".to_string(),
            estimated_time_ms: cost.total * 100.0,
            parallelism_factor: 1,
            index_usage: Vec::new(),
            file_pruning: BTreeMap::new(),
            operators,
            cost,
        }
    }

    fn parallel_plan(
        &self,
        request: &QueryRequest,
        sequential: &ExecutionPlan,
    ) -> Option<ExecutionPlan> {
        let parallelism = request.source_ids.len().clamp(1, self.max_parallelism);
        let p = parallelism as f64;
        let cost = CostEstimate {
            cpu: sequential.cost.cpu / p,
            io: sequential.cost.io / p,
            memory: sequential.cost.memory * p,
            network: sequential.cost.network,
            total: 0.0,
        }
        .finalized();

        Some(ExecutionPlan {
            plan_id: "parallel_plan".to_string(),
            operators: sequential.operators.clone(),
            estimated_time_ms: cost.total * 100.0 / p,
            parallelism_factor: parallelism,
            index_usage: Vec::new(),
            file_pruning: BTreeMap::new(),
            cost,
        })
    }

    fn index_plan(
        &self,
        request: &QueryRequest,
        sequential: &ExecutionPlan,
        model: &CostModel,
    ) -> Option<ExecutionPlan> {
        let mut index_usage = Vec::new();
        for source_id in &request.source_ids {
            for predicate in &request.predicates {
                if self.stats_source.has_index(source_id, predicate.column()) {
                    index_usage.push(format!("{}.{}", source_id, predicate.column()));
                }
            }
        }
        if index_usage.is_empty() {
            return None;
        }

        let cost = CostEstimate {
            cpu: sequential.cost.cpu * model.index_benefit,
            io: sequential.cost.io * model.index_benefit,
            memory: sequential.cost.memory,
            network: sequential.cost.network,
            total: 0.0,
        }
        .finalized();

        Some(ExecutionPlan {
            plan_id: "index_plan".to_string(),
            operators: sequential.operators.clone(),
            estimated_time_ms: cost.total * 100.0,
            parallelism_factor: 1,
            index_usage,
            file_pruning: BTreeMap::new(),
            cost,
        })
    }

    fn partition_pruned_plan(
        &self,
        request: &QueryRequest,
        sequential: &ExecutionPlan,
        model: &CostModel,
    ) -> Option<ExecutionPlan> {
        let mut pruning: BTreeMap<String, f64> = BTreeMap::new();
        for source_id in &request.source_ids {
            let ratio = Self::partition_pruned_ratio(&request.predicates);
            if ratio > 0.0 {
                pruning.insert(source_id.clone(), ratio);
            }
        }
        if pruning.is_empty() {
            return None;
        }

        let avg_pruning = pruning.values().sum::<f64>() / pruning.len() as f64;
        let benefit = 1.0 - avg_pruning * model.partition_pruning;
        let cost = CostEstimate {
            cpu: sequential.cost.cpu * benefit,
            io: sequential.cost.io * benefit,
            memory: sequential.cost.memory * benefit,
            network: sequential.cost.network,
            total: 0.0,
        }
        .finalized();

        Some(ExecutionPlan {
            plan_id: "partition_pruned_plan".to_string(),
            operators: sequential.operators.clone(),
            estimated_time_ms: cost.total * 100.0,
            parallelism_factor: 1,
            index_usage: Vec::new(),
            file_pruning: pruning,
            cost,
        })
    }

    /// Fraction of files a partition-aware scan could skip, from the first
    /// predicate over a partition-like column.
    fn partition_pruned_ratio(predicates: &[Predicate]) -> f64 {
        for predicate in predicates {
            let column = predicate.column().to_ascii_lowercase();
            if !PARTITION_LIKE_COLUMNS.contains(&column.as_str()) {
                continue;
            }
            return match predicate {
                Predicate::Eq { .. } | Predicate::In { .. } => 0.9,
                Predicate::Gt { .. }
                | Predicate::Lt { .. }
                | Predicate::Gte { .. }
                | Predicate::Lte { .. } => 0.5,
                Predicate::Like { .. } => 0.0,
            };
        }
        0.0
    }

    /// Combined selectivity of a predicate set against one source.
    pub fn filter_selectivity(&self, source_id: &str, predicates: &[Predicate]) -> f64 {
        let columns = self.column_stats.get(source_id);
        let mut selectivity = 1.0f64;

        for predicate in predicates {
            let sample = columns
                .as_ref()
                .and_then(|cols| cols.get(predicate.column()));
            let Some(sample) = sample else {
                selectivity *= 0.5;
                continue;
            };
            let distinct = sample.distinct_count.max(1) as f64;
            selectivity *= match predicate {
                Predicate::Eq { .. } => 1.0 / distinct,
                Predicate::Gt { .. }
                | Predicate::Lt { .. }
                | Predicate::Gte { .. }
                | Predicate::Lte { .. } => 0.3,
                Predicate::In { values, .. } => (values.len() as f64 / distinct).min(1.0),
                Predicate::Like { .. } => 0.2,
            };
        }

        selectivity.max(0.001)
    }

    fn default_plan(request: &QueryRequest) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: "default_plan".to_string(),
            operators: vec![PlanOperator {
                kind: OperatorKind::Scan,
                source_id: None,
                rows_out: 1000,
                detail: format!("{} sources", request.source_ids.len()),
            }],
            cost: CostEstimate {
                cpu: 10.0,
                io: 10.0,
                memory: 5.0,
                network: 0.0,
                total: 25.0,
            },
            estimated_time_ms: 1000.0,
            parallelism_factor: 1,
            index_usage: Vec::new(),
            file_pruning: BTreeMap::new(),
        }
    }

    /// Feed back an actual execution so the cost model can learn.
    pub fn record_execution(
        &self,
        plan_id: &str,
        actual_time_ms: f64,
        actual_rows: u64,
        success: bool,
    ) {
        let avg_recent = {
            let mut history = self.execution_history.write();
            let points = history.entry(plan_id.to_string()).or_default();
            if points.len() == EXECUTION_HISTORY_CAP {
                points.pop_front();
            }
            points.push_back(ExecutionPoint {
                at: Utc::now(),
                actual_time_ms,
                actual_rows,
                success,
            });
            if points.len() < MIN_FEEDBACK_POINTS {
                return;
            }
            let recent: Vec<f64> = points
                .iter()
                .rev()
                .take(MIN_FEEDBACK_POINTS)
                .map(|p| p.actual_time_ms)
                .collect();
            recent.iter().sum::<f64>() / recent.len() as f64
        };

        if avg_recent <= 0.0 {
            return;
        }
        let adjustment = actual_time_ms / avg_recent;
        // Only damped, in-range deviations move the model
        if adjustment > 0.5 && adjustment < 2.0 {
            let mut model = self.cost_model.write();
            let nudge = 1.0 + (adjustment - 1.0) * 0.1;
            model.cpu_per_row *= nudge;
            model.io_per_mb *= nudge;
            model.version += 1;
            debug!(
                plan_id,
                version = model.version,
                adjustment,
                "Adjusted cost model from execution feedback"
            );
        }
    }

    pub fn cost_model(&self) -> CostModel {
        self.cost_model.read().clone()
    }

    /// Drop cached statistics so the next query re-collects them.
    pub fn clear_statistics(&self) {
        self.table_stats.clear();
        self.column_stats.clear();
    }

    /// Re-sample statistics for every source currently cached. Sources whose
    /// statistics cannot be read fall out of the cache and are re-collected
    /// lazily on their next query.
    pub async fn refresh_statistics(&self) {
        let source_ids: Vec<String> = self.table_stats.iter().map(|e| e.key().clone()).collect();
        for source_id in source_ids {
            let table = match self.stats_source.table_stats(&source_id).await {
                Ok(table) => table,
                Err(e) => {
                    warn!(source_id, error = %e, "Statistics refresh failed; dropping cache entry");
                    self.table_stats.remove(&source_id);
                    self.column_stats.remove(&source_id);
                    continue;
                }
            };
            match self
                .stats_source
                .sample_columns(&source_id, STATS_SAMPLE_FILES)
                .await
            {
                Ok(columns) => {
                    debug!(source_id, rows = table.row_count, "Refreshed table statistics");
                    self.table_stats.insert(source_id.clone(), table);
                    self.column_stats.insert(source_id, columns);
                }
                Err(e) => {
                    warn!(source_id, error = %e, "Column sampling failed; dropping cache entry");
                    self.table_stats.remove(&source_id);
                    self.column_stats.remove(&source_id);
                }
            }
        }
    }

    /// Periodic statistics refresh loop. Exits on cancellation.
    pub async fn run(&self) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            STATS_REFRESH_INTERVAL_SECS,
        ));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => self.refresh_statistics().await,
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            tables_analyzed: self.table_stats.len(),
            cost_model: self.cost_model.read().clone(),
            execution_history: self
                .execution_history
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
        }
    }
}

impl EvictableCache for QueryOptimizer {
    fn evict_to(&self, _target_bytes: u64) {
        self.clear_statistics();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;
    use std::sync::Arc;

    struct FakeStats {
        table: parking_lot::Mutex<TableStats>,
        columns: BTreeMap<String, ColumnSample>,
        indexed: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl StatsSource for FakeStats {
        async fn table_stats(&self, _source_id: &str) -> Result<TableStats> {
            if self.fail {
                return Err(crate::Error::Internal("stats unavailable".to_string()));
            }
            Ok(*self.table.lock())
        }

        async fn sample_columns(
            &self,
            _source_id: &str,
            _max_files: usize,
        ) -> Result<BTreeMap<String, ColumnSample>> {
            Ok(self.columns.clone())
        }

        fn has_index(&self, _source_id: &str, column: &str) -> bool {
            self.indexed.iter().any(|c| c == column)
        }
    }

    fn stats_source(indexed: &[&str]) -> Arc<FakeStats> {
        let mut columns = BTreeMap::new();
        columns.insert(
            "region".to_string(),
            ColumnSample {
                distinct_count: 4,
                null_count: 0,
            },
        );
        Arc::new(FakeStats {
            table: parking_lot::Mutex::new(TableStats {
                row_count: 100_000,
                file_count: 10,
                size_bytes: 50 * 1024 * 1024,
            }),
            columns,
            indexed: indexed.iter().map(|c| c.to_string()).collect(),
            fail: false,
        })
    }

    fn request(predicates: Vec<Predicate>, sources: usize) -> QueryRequest {
        QueryRequest {
            source_ids: (0..sources).map(|i| format!("s{}", i)).collect(),
            predicates,
            aggregations: Vec::new(),
            limit: None,
        }
    }

    #[tokio::test]
    async fn index_plan_wins_when_column_is_indexed() {
        let optimizer = QueryOptimizer::new(stats_source(&["region"]), 8);
        let req = request(
            vec![Predicate::Eq {
                column: "region".into(),
                value: ScalarValue::from("N"),
            }],
            1,
        );
        let plan = optimizer.optimize(&req).await;
        assert_eq!(plan.plan_id, "index_plan");
        assert_eq!(plan.index_usage, vec!["s0.region".to_string()]);
    }

    #[tokio::test]
    async fn no_index_plan_without_indexed_column() {
        let optimizer = QueryOptimizer::new(stats_source(&[]), 1);
        let req = request(
            vec![Predicate::Eq {
                column: "region".into(),
                value: ScalarValue::from("N"),
            }],
            1,
        );
        let plan = optimizer.optimize(&req).await;
        assert_ne!(plan.plan_id, "index_plan");
    }

    #[tokio::test]
    async fn parallel_plan_wins_for_many_sources() {
        let optimizer = QueryOptimizer::new(stats_source(&[]), 8);
        let plan = optimizer.optimize(&request(Vec::new(), 4)).await;
        assert_eq!(plan.plan_id, "parallel_plan");
        assert_eq!(plan.parallelism_factor, 4);
    }

    #[tokio::test]
    async fn partition_predicate_enables_pruned_plan() {
        let optimizer = QueryOptimizer::new(stats_source(&[]), 1);
        let req = request(
            vec![Predicate::Eq {
                column: "date".into(),
                value: ScalarValue::from("2026-08-01"),
            }],
            1,
        );
        let plan = optimizer.optimize(&req).await;
        assert_eq!(plan.plan_id, "partition_pruned_plan");
        assert_eq!(plan.file_pruning.get("s0"), Some(&0.9));
    }

    #[tokio::test]
    async fn stats_failure_falls_back_to_default_plan() {
        let source = Arc::new(FakeStats {
            table: parking_lot::Mutex::new(TableStats::default()),
            columns: BTreeMap::new(),
            indexed: Vec::new(),
            fail: true,
        });
        let optimizer = QueryOptimizer::new(source, 4);
        let plan = optimizer.optimize(&request(Vec::new(), 2)).await;
        assert_eq!(plan.plan_id, "default_plan");
        assert_eq!(plan.cost.total, 25.0);
        assert_eq!(plan.cost.cpu, 10.0);
    }

    #[tokio::test]
    async fn selectivity_model() {
        let optimizer = QueryOptimizer::new(stats_source(&[]), 1);
        optimizer
            .collect_statistics(&["s0".to_string()])
            .await
            .unwrap();

        let eq = vec![Predicate::Eq {
            column: "region".into(),
            value: ScalarValue::from("N"),
        }];
        assert!((optimizer.filter_selectivity("s0", &eq) - 0.25).abs() < 1e-9);

        let range = vec![Predicate::Gt {
            column: "region".into(),
            value: ScalarValue::from("A"),
        }];
        assert!((optimizer.filter_selectivity("s0", &range) - 0.3).abs() < 1e-9);

        let in_set = vec![Predicate::In {
            column: "region".into(),
            values: vec![ScalarValue::from("N"), ScalarValue::from("S")],
        }];
        assert!((optimizer.filter_selectivity("s0", &in_set) - 0.5).abs() < 1e-9);

        let unknown = vec![Predicate::Eq {
            column: "mystery".into(),
            value: ScalarValue::Int(1),
        }];
        assert!((optimizer.filter_selectivity("s0", &unknown) - 0.5).abs() < 1e-9);

        // Stacked predicates floor at the minimum selectivity
        let many: Vec<Predicate> = (0..10)
            .map(|_| Predicate::Eq {
                column: "region".into(),
                value: ScalarValue::from("N"),
            })
            .collect();
        assert!(optimizer.filter_selectivity("s0", &many) >= 0.001);
    }

    #[tokio::test]
    async fn higher_selectivity_never_costs_less() {
        let optimizer = QueryOptimizer::new(stats_source(&[]), 1);
        optimizer
            .collect_statistics(&["s0".to_string()])
            .await
            .unwrap();
        let model = optimizer.cost_model();

        let narrow = request(
            vec![Predicate::Eq {
                column: "region".into(),
                value: ScalarValue::from("N"),
            }],
            1,
        );
        let wide = request(
            vec![Predicate::Gt {
                column: "region".into(),
                value: ScalarValue::from("A"),
            }],
            1,
        );
        let narrow_cost = optimizer.sequential_plan(&narrow, &model).cost.total;
        let wide_cost = optimizer.sequential_plan(&wide, &model).cost.total;
        assert!(wide_cost >= narrow_cost);
    }

    #[tokio::test]
    async fn feedback_is_damped_and_versioned() {
        let optimizer = QueryOptimizer::new(stats_source(&[]), 1);
        let before = optimizer.cost_model();

        for _ in 0..4 {
            optimizer.record_execution("sequential_plan", 100.0, 10, true);
        }
        // Not enough points yet
        assert_eq!(optimizer.cost_model().version, before.version);

        optimizer.record_execution("sequential_plan", 150.0, 10, true);
        let after = optimizer.cost_model();
        assert_eq!(after.version, before.version + 1);
        assert!(after.cpu_per_row > before.cpu_per_row);
        assert!(after.cpu_per_row < before.cpu_per_row * 1.2);

        // A wild outlier is ignored
        let settled = optimizer.cost_model();
        optimizer.record_execution("sequential_plan", 10_000.0, 10, true);
        assert_eq!(optimizer.cost_model().version, settled.version);
    }

    #[tokio::test]
    async fn refresh_resamples_cached_statistics() {
        let source = stats_source(&[]);
        let optimizer = QueryOptimizer::new(source.clone(), 1);
        optimizer
            .collect_statistics(&["s0".to_string()])
            .await
            .unwrap();
        assert_eq!(optimizer.table_stats.get("s0").unwrap().row_count, 100_000);

        source.table.lock().row_count = 250_000;
        // A cache hit does not re-collect
        optimizer
            .collect_statistics(&["s0".to_string()])
            .await
            .unwrap();
        assert_eq!(optimizer.table_stats.get("s0").unwrap().row_count, 100_000);

        // The periodic refresh does
        optimizer.refresh_statistics().await;
        assert_eq!(optimizer.table_stats.get("s0").unwrap().row_count, 250_000);
    }

    #[tokio::test]
    async fn tied_costs_resolve_by_generation_order() {
        // Zero-byte tables drop io and memory cost to zero, so a 2-way
        // parallel plan and an index plan at benefit 0.5 price identically.
        let mut columns = BTreeMap::new();
        columns.insert(
            "region".to_string(),
            ColumnSample {
                distinct_count: 4,
                null_count: 0,
            },
        );
        let source = Arc::new(FakeStats {
            table: parking_lot::Mutex::new(TableStats {
                row_count: 100_000,
                file_count: 10,
                size_bytes: 0,
            }),
            columns,
            indexed: vec!["region".to_string()],
            fail: false,
        });
        let optimizer = QueryOptimizer::new(source, 2);
        optimizer.cost_model.write().index_benefit = 0.5;

        let req = request(
            vec![Predicate::Eq {
                column: "region".into(),
                value: ScalarValue::from("N"),
            }],
            2,
        );
        let plan = optimizer.optimize(&req).await;
        // The parallel candidate is generated first and keeps the tie
        assert_eq!(plan.plan_id, "parallel_plan");
    }

    #[tokio::test]
    async fn eviction_clears_cached_statistics() {
        let optimizer = QueryOptimizer::new(stats_source(&[]), 1);
        optimizer
            .collect_statistics(&["s0".to_string()])
            .await
            .unwrap();
        assert_eq!(optimizer.stats().tables_analyzed, 1);
        optimizer.evict_to(0);
        assert_eq!(optimizer.stats().tables_analyzed, 0);
    }
}
