//! Reactive worker auto-scaling from rolling resource metrics.
//!
//! The scaler keeps a bounded history of resource samples and averages the
//! most recent few before deciding anything, so a single hot sample never
//! triggers a resize. Scale-up fires when ANY pressure signal crosses its
//! threshold; scale-down requires ALL signals to be comfortably low. The two
//! directions hold independent cooldowns, which gives the loop hysteresis.
//!
//! Memory pressure is handled separately from worker scaling: past the
//! pressure threshold the scaler asks every registered cache to shrink to a
//! budget derived from currently available memory.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scaling thresholds and limits.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_factor: f64,
    pub scale_down_factor: f64,
    pub cpu_up_percent: f64,
    pub cpu_down_percent: f64,
    pub memory_up_percent: f64,
    pub memory_down_percent: f64,
    /// Active queries / max concurrent queries.
    pub query_ratio_up: f64,
    pub query_ratio_down: f64,
    pub queue_up_length: usize,
    pub latency_up_ms: f64,
    pub latency_down_ms: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// Memory percent above which caches are told to shrink.
    pub memory_pressure_percent: f64,
    /// Cache budget as a share of available memory after a pressure event.
    pub cache_budget_ratio: f64,
    pub max_concurrent_queries: usize,
    pub evaluation_interval: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 50,
            scale_up_factor: 1.5,
            scale_down_factor: 0.7,
            cpu_up_percent: 70.0,
            cpu_down_percent: 30.0,
            memory_up_percent: 80.0,
            memory_down_percent: 40.0,
            query_ratio_up: 0.8,
            query_ratio_down: 0.3,
            queue_up_length: 10,
            latency_up_ms: 30_000.0,
            latency_down_ms: 15_000.0,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
            memory_pressure_percent: 85.0,
            cache_budget_ratio: 0.3,
            max_concurrent_queries: 10,
            evaluation_interval: Duration::from_secs(30),
        }
    }
}

/// One resource observation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub available_memory_bytes: u64,
    pub io_wait_percent: f64,
}

/// Supplies resource samples to the scaler loop.
pub trait MetricsProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Fixed probe for tests and environments without host metrics.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub ResourceSample);

impl MetricsProbe for StaticProbe {
    fn sample(&self) -> ResourceSample {
        self.0
    }
}

/// A cache that can shed memory on demand.
pub trait EvictableCache: Send + Sync {
    fn evict_to(&self, target_bytes: u64);
}

/// The direction a single evaluation settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up,
    Down,
    Hold,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalerStatus {
    pub current_workers: usize,
    pub scaling_in_progress: bool,
    pub active_queries: usize,
    pub queue_length: usize,
    pub avg_latency_ms: f64,
    pub samples_held: usize,
    pub last_sample: Option<ResourceSample>,
}

struct ScalerState {
    history: VecDeque<ResourceSample>,
    latencies_ms: VecDeque<f64>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    caches: Vec<Arc<dyn EvictableCache>>,
}

const HISTORY_CAP: usize = 100;
const LATENCY_CAP: usize = 100;
/// Samples averaged per decision.
const DECISION_WINDOW: usize = 3;

/// Worker auto-scaler.
pub struct AutoScaler {
    policy: ScalingPolicy,
    probe: Arc<dyn MetricsProbe>,
    workers: AtomicUsize,
    active_queries: AtomicUsize,
    queue_length: AtomicUsize,
    scaling_in_progress: AtomicBool,
    state: Mutex<ScalerState>,
    shutdown: CancellationToken,
}

impl AutoScaler {
    pub fn new(policy: ScalingPolicy, probe: Arc<dyn MetricsProbe>) -> Self {
        let initial = policy.min_workers;
        Self {
            policy,
            probe,
            workers: AtomicUsize::new(initial),
            active_queries: AtomicUsize::new(0),
            queue_length: AtomicUsize::new(0),
            scaling_in_progress: AtomicBool::new(false),
            state: Mutex::new(ScalerState {
                history: VecDeque::with_capacity(HISTORY_CAP),
                latencies_ms: VecDeque::with_capacity(LATENCY_CAP),
                last_scale_up: None,
                last_scale_down: None,
                caches: Vec::new(),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn current_workers(&self) -> usize {
        self.workers.load(Ordering::Acquire)
    }

    /// Register a cache for pressure-driven eviction.
    pub fn register_cache(&self, cache: Arc<dyn EvictableCache>) {
        self.state.lock().caches.push(cache);
    }

    pub fn query_started(&self) {
        self.active_queries.fetch_add(1, Ordering::AcqRel);
    }

    pub fn query_finished(&self, latency: Duration) {
        let prev = self.active_queries.load(Ordering::Acquire);
        if prev > 0 {
            self.active_queries.fetch_sub(1, Ordering::AcqRel);
        }
        let mut state = self.state.lock();
        if state.latencies_ms.len() == LATENCY_CAP {
            state.latencies_ms.pop_front();
        }
        state.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
    }

    pub fn query_enqueued(&self) {
        self.queue_length.fetch_add(1, Ordering::AcqRel);
    }

    pub fn query_dequeued(&self) {
        let prev = self.queue_length.load(Ordering::Acquire);
        if prev > 0 {
            self.queue_length.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Record one resource sample into the rolling history.
    pub fn observe(&self, sample: ResourceSample) {
        let mut state = self.state.lock();
        if state.history.len() == HISTORY_CAP {
            state.history.pop_front();
        }
        state.history.push_back(sample);
    }

    fn recent_average(history: &VecDeque<ResourceSample>) -> Option<ResourceSample> {
        if history.is_empty() {
            return None;
        }
        let take = history.len().min(DECISION_WINDOW);
        let slice: Vec<&ResourceSample> = history.iter().rev().take(take).collect();
        let n = slice.len() as f64;
        Some(ResourceSample {
            cpu_percent: slice.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
            memory_percent: slice.iter().map(|s| s.memory_percent).sum::<f64>() / n,
            available_memory_bytes: (slice
                .iter()
                .map(|s| s.available_memory_bytes as f64)
                .sum::<f64>()
                / n) as u64,
            io_wait_percent: slice.iter().map(|s| s.io_wait_percent).sum::<f64>() / n,
        })
    }

    fn avg_latency_ms(state: &ScalerState) -> f64 {
        if state.latencies_ms.is_empty() {
            return 0.0;
        }
        state.latencies_ms.iter().sum::<f64>() / state.latencies_ms.len() as f64
    }

    /// Run one evaluation over the current history.
    pub fn evaluate(&self) -> ScaleDecision {
        let (avg, latency_ms, up_cooled, down_cooled) = {
            let state = self.state.lock();
            let Some(avg) = Self::recent_average(&state.history) else {
                return ScaleDecision::Hold;
            };
            let up_cooled = state
                .last_scale_up
                .map(|t| t.elapsed() >= self.policy.scale_up_cooldown)
                .unwrap_or(true);
            let down_cooled = state
                .last_scale_down
                .map(|t| t.elapsed() >= self.policy.scale_down_cooldown)
                .unwrap_or(true);
            (avg, Self::avg_latency_ms(&state), up_cooled, down_cooled)
        };

        let active = self.active_queries.load(Ordering::Acquire);
        let queue = self.queue_length.load(Ordering::Acquire);
        let query_ratio = active as f64 / self.policy.max_concurrent_queries.max(1) as f64;

        self.handle_memory_pressure(&avg);

        let should_up = avg.cpu_percent > self.policy.cpu_up_percent
            || avg.memory_percent > self.policy.memory_up_percent
            || query_ratio > self.policy.query_ratio_up
            || queue > self.policy.queue_up_length
            || latency_ms > self.policy.latency_up_ms;

        let should_down = avg.cpu_percent < self.policy.cpu_down_percent
            && avg.memory_percent < self.policy.memory_down_percent
            && query_ratio < self.policy.query_ratio_down
            && queue == 0
            && latency_ms < self.policy.latency_down_ms;

        if should_up && up_cooled {
            self.apply_scale(self.policy.scale_up_factor, ScaleDecision::Up);
            ScaleDecision::Up
        } else if should_down && down_cooled {
            self.apply_scale(self.policy.scale_down_factor, ScaleDecision::Down);
            ScaleDecision::Down
        } else {
            ScaleDecision::Hold
        }
    }

    fn apply_scale(&self, factor: f64, direction: ScaleDecision) {
        if self
            .scaling_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Scaling already in progress; skipping");
            return;
        }

        let current = self.workers.load(Ordering::Acquire);
        let target = ((current as f64 * factor).ceil() as usize)
            .clamp(self.policy.min_workers, self.policy.max_workers);

        if target != current {
            self.workers.store(target, Ordering::Release);
            info!(from = current, to = target, ?direction, "Scaled worker pool");
        }

        {
            let mut state = self.state.lock();
            match direction {
                ScaleDecision::Up => state.last_scale_up = Some(Instant::now()),
                ScaleDecision::Down => state.last_scale_down = Some(Instant::now()),
                ScaleDecision::Hold => {}
            }
        }

        self.scaling_in_progress.store(false, Ordering::Release);
    }

    fn handle_memory_pressure(&self, avg: &ResourceSample) {
        if avg.memory_percent <= self.policy.memory_pressure_percent {
            return;
        }
        let budget =
            (avg.available_memory_bytes as f64 * self.policy.cache_budget_ratio) as u64;
        let caches: Vec<Arc<dyn EvictableCache>> = self.state.lock().caches.clone();
        if caches.is_empty() {
            return;
        }
        warn!(
            memory_percent = avg.memory_percent,
            cache_budget_bytes = budget,
            "Memory pressure; asking caches to shrink"
        );
        for cache in caches {
            cache.evict_to(budget);
        }
    }

    pub fn status(&self) -> ScalerStatus {
        let state = self.state.lock();
        ScalerStatus {
            current_workers: self.workers.load(Ordering::Acquire),
            scaling_in_progress: self.scaling_in_progress.load(Ordering::Acquire),
            active_queries: self.active_queries.load(Ordering::Acquire),
            queue_length: self.queue_length.load(Ordering::Acquire),
            avg_latency_ms: Self::avg_latency_ms(&state),
            samples_held: state.history.len(),
            last_sample: state.history.back().copied(),
        }
    }

    /// Sample-and-evaluate loop. Exits on cancellation.
    pub async fn run(&self) {
        let mut tick = tokio::time::interval(self.policy.evaluation_interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.observe(self.probe.sample());
                    self.evaluate();
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn sample(cpu: f64, mem: f64) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            memory_percent: mem,
            available_memory_bytes: 8 * 1024 * 1024 * 1024,
            io_wait_percent: 0.0,
        }
    }

    fn scaler(policy: ScalingPolicy) -> AutoScaler {
        AutoScaler::new(policy, Arc::new(StaticProbe(sample(0.0, 0.0))))
    }

    #[test]
    fn scale_up_on_any_signal() {
        let s = scaler(ScalingPolicy::default());
        for _ in 0..3 {
            s.observe(sample(90.0, 20.0));
        }
        assert_eq!(s.evaluate(), ScaleDecision::Up);
        assert_eq!(s.current_workers(), 3);
    }

    #[test]
    fn scale_down_requires_all_signals() {
        let mut policy = ScalingPolicy::default();
        policy.min_workers = 2;
        let s = scaler(policy);
        s.workers.store(10, Ordering::Release);

        // CPU low but memory still warm: hold
        for _ in 0..3 {
            s.observe(sample(10.0, 60.0));
        }
        assert_eq!(s.evaluate(), ScaleDecision::Hold);

        // Everything quiet: scale down
        for _ in 0..3 {
            s.observe(sample(10.0, 20.0));
        }
        assert_eq!(s.evaluate(), ScaleDecision::Down);
        assert_eq!(s.current_workers(), 7);
    }

    #[test]
    fn workers_clamped_to_bounds() {
        let mut policy = ScalingPolicy::default();
        policy.max_workers = 4;
        policy.scale_up_cooldown = Duration::ZERO;
        let s = scaler(policy);
        for _ in 0..10 {
            s.observe(sample(95.0, 20.0));
            s.evaluate();
        }
        assert_eq!(s.current_workers(), 4);
    }

    #[test]
    fn cooldown_blocks_repeat_scaling() {
        let s = scaler(ScalingPolicy::default());
        for _ in 0..3 {
            s.observe(sample(90.0, 20.0));
        }
        assert_eq!(s.evaluate(), ScaleDecision::Up);
        // Pressure persists but the up cooldown has not elapsed
        assert_eq!(s.evaluate(), ScaleDecision::Hold);
    }

    #[test]
    fn queue_pressure_triggers_scale_up() {
        let s = scaler(ScalingPolicy::default());
        for _ in 0..3 {
            s.observe(sample(10.0, 10.0));
        }
        for _ in 0..11 {
            s.query_enqueued();
        }
        assert_eq!(s.evaluate(), ScaleDecision::Up);
    }

    #[test]
    fn queued_queries_block_scale_down() {
        let mut policy = ScalingPolicy::default();
        policy.min_workers = 1;
        let s = scaler(policy);
        s.workers.store(8, Ordering::Release);
        for _ in 0..3 {
            s.observe(sample(5.0, 5.0));
        }
        s.query_enqueued();
        assert_eq!(s.evaluate(), ScaleDecision::Hold);
        s.query_dequeued();
        assert_eq!(s.evaluate(), ScaleDecision::Down);
    }

    #[test]
    fn memory_pressure_evicts_caches() {
        struct Recorder(AtomicU64);
        impl EvictableCache for Recorder {
            fn evict_to(&self, target: u64) {
                self.0.store(target, Ordering::Release);
            }
        }

        let s = scaler(ScalingPolicy::default());
        let recorder = Arc::new(Recorder(AtomicU64::new(0)));
        s.register_cache(recorder.clone());

        let mut pressured = sample(50.0, 92.0);
        pressured.available_memory_bytes = 1000;
        for _ in 0..3 {
            s.observe(pressured);
        }
        s.evaluate();
        assert_eq!(recorder.0.load(Ordering::Acquire), 300);
    }

    #[test]
    fn latency_history_is_bounded() {
        let s = scaler(ScalingPolicy::default());
        for _ in 0..LATENCY_CAP + 50 {
            s.query_started();
            s.query_finished(Duration::from_millis(5));
        }
        assert_eq!(s.state.lock().latencies_ms.len(), LATENCY_CAP);
    }
}
