//! # Optimizer Engine
//!
//! Samples the store, evaluates tuning rules past their cooldown, applies
//! actions, measures impact after a settle delay, and reverts rollback-safe
//! configuration changes on degradation against the startup baseline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use taskpulse_shared::config::OptimizerConfig;
use taskpulse_shared::error::{PulseError, PulseResult};
use taskpulse_shared::store::StoreGateway;
use taskpulse_shared::types::{
    OptimizationAction, OptimizationRule, OptimizeCondition, PerformanceBaseline, StoreSample,
};

use super::actions::{apply_action, rollback_action};
use super::rules::default_optimization_rules;

/// Degradation thresholds vs baseline
const LATENCY_DEGRADATION_FACTOR: f64 = 2.0;
const HIT_RATE_DEGRADATION_PP: f64 = 0.10;
const OPS_DEGRADATION_FACTOR: f64 = 0.5;

#[derive(Debug, Default)]
struct OptimizerState {
    rules: HashMap<String, OptimizationRule>,
    history: VecDeque<OptimizationAction>,
    baseline: Option<PerformanceBaseline>,
    current: Option<StoreSample>,
}

/// Status report for `GET /optimization/status`
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStatus {
    pub current_metrics: Option<StoreSample>,
    pub baseline: Option<PerformanceBaseline>,
    pub total_rules: usize,
    pub active_rules: usize,
    pub total_optimizations: u64,
    pub successful_optimizations: u64,
    pub failed_optimizations: u64,
    pub rollbacks_performed: u64,
    pub recent_actions: Vec<OptimizationAction>,
}

/// Closed-loop store tuner
#[derive(Debug)]
pub struct PerformanceOptimizer {
    gateway: StoreGateway,
    config: OptimizerConfig,
    state: tokio::sync::Mutex<OptimizerState>,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rollbacks: AtomicU64,
}

impl PerformanceOptimizer {
    pub fn new(gateway: StoreGateway, config: OptimizerConfig) -> Self {
        let mut rules = HashMap::new();
        for rule in default_optimization_rules() {
            rules.insert(rule.id.clone(), rule);
        }
        Self {
            gateway,
            config,
            state: tokio::sync::Mutex::new(OptimizerState {
                rules,
                ..Default::default()
            }),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Sampling and baseline
    // =========================================================================

    /// One metrics sample from INFO plus a latency probe
    pub async fn sample(&self) -> PulseResult<StoreSample> {
        let health = self.gateway.health_check().await;
        let info = self.gateway.info().await?;
        let field = |name: &str| info.get(name).and_then(|v| v.parse::<f64>().ok());

        let used_memory = field("used_memory").unwrap_or(0.0);
        let maxmemory = field("maxmemory").unwrap_or(0.0);
        let hits = field("keyspace_hits").unwrap_or(0.0);
        let misses = field("keyspace_misses").unwrap_or(0.0);

        let sample = StoreSample {
            memory_used_mb: used_memory / (1024.0 * 1024.0),
            memory_used_percent: if maxmemory > 0.0 {
                used_memory / maxmemory
            } else {
                0.0
            },
            hit_rate: if hits + misses > 0.0 {
                hits / (hits + misses)
            } else {
                1.0
            },
            latency_ms: health.round_trip_ms,
            connected_clients: field("connected_clients").unwrap_or(0.0) as u64,
            ops_per_sec: field("instantaneous_ops_per_sec").unwrap_or(0.0) as u64,
            evicted_keys: field("evicted_keys").unwrap_or(0.0) as u64,
            fragmentation_ratio: field("mem_fragmentation_ratio").unwrap_or(1.0),
            timestamp: Utc::now(),
        };

        let mut state = self.state.lock().await;
        state.current = Some(sample.clone());
        Ok(sample)
    }

    /// Collect the startup samples and record their means as the baseline.
    pub async fn establish_baseline(&self) -> PulseResult<()> {
        let mut samples = Vec::with_capacity(self.config.baseline_samples);
        for _ in 0..self.config.baseline_samples {
            samples.push(self.sample().await?);
            tokio::time::sleep(Duration::from_millis(self.config.baseline_sample_gap_ms)).await;
        }
        if samples.is_empty() {
            return Err(PulseError::Internal("no baseline samples collected".into()));
        }

        let mean = |f: fn(&StoreSample) -> f64| {
            samples.iter().map(f).sum::<f64>() / samples.len() as f64
        };
        let baseline = PerformanceBaseline {
            latency_ms: mean(|s| s.latency_ms),
            hit_rate: mean(|s| s.hit_rate),
            ops_per_sec: mean(|s| s.ops_per_sec as f64),
            memory_used_percent: mean(|s| s.memory_used_percent),
            fragmentation_ratio: mean(|s| s.fragmentation_ratio),
            established_at: Utc::now(),
        };
        info!(
            latency_ms = baseline.latency_ms,
            hit_rate = baseline.hit_rate,
            ops_per_sec = baseline.ops_per_sec,
            "performance baseline established"
        );
        self.state.lock().await.baseline = Some(baseline);
        Ok(())
    }

    // =========================================================================
    // Optimization cycle
    // =========================================================================

    /// One cycle: refresh the sample, apply every enabled rule that is past
    /// its cooldown and whose condition holds.
    pub async fn run_cycle(&self) {
        let sample = match self.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                error!(error = %e, "optimizer sample failed, skipping cycle");
                return;
            }
        };

        let now = Utc::now();
        let due: Vec<OptimizationRule> = {
            let state = self.state.lock().await;
            state
                .rules
                .values()
                .filter(|r| r.can_apply(now) && condition_holds(r.condition, r.threshold, &sample))
                .cloned()
                .collect()
        };

        for rule in due {
            if let Err(e) = self.apply_rule(&rule).await {
                error!(rule = %rule.id, error = %e, "optimization rule failed");
            }
        }
    }

    /// Apply one rule: capture before-metrics, act, wait the settle delay,
    /// capture after-metrics, score.
    pub async fn apply_rule(&self, rule: &OptimizationRule) -> PulseResult<()> {
        let before = self.sample().await.ok();
        let mut action = OptimizationAction {
            id: format!("{}_{}", rule.id, Utc::now().timestamp()),
            rule_id: rule.id.clone(),
            action: rule.action,
            description: format!("Applied rule: {}", rule.name),
            parameters: rule.parameters.clone(),
            timestamp: Utc::now(),
            success: false,
            error_message: None,
            before_metrics: before,
            after_metrics: None,
            impact_score: 0.0,
        };

        self.total.fetch_add(1, Ordering::Relaxed);
        match apply_action(&self.gateway, rule.action, &rule.parameters).await {
            Ok(()) => {
                action.success = true;
                {
                    let mut state = self.state.lock().await;
                    if let Some(stored) = state.rules.get_mut(&rule.id) {
                        stored.last_applied = Some(Utc::now());
                    }
                }

                tokio::time::sleep(Duration::from_secs(self.config.impact_delay_secs)).await;
                if let Ok(after) = self.sample().await {
                    action.impact_score = match &action.before_metrics {
                        Some(before) => impact_score(before, &after),
                        None => 0.0,
                    };
                    action.after_metrics = Some(after);
                }
                self.successful.fetch_add(1, Ordering::Relaxed);
                info!(
                    rule = %rule.id,
                    impact = action.impact_score,
                    "optimization applied"
                );
            }
            Err(e) => {
                action.error_message = Some(e.to_string());
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(rule = %rule.id, error = %e, "optimization rejected");
            }
        }

        let mut state = self.state.lock().await;
        if state.history.len() >= self.config.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(action);
        Ok(())
    }

    /// Apply a rule by id regardless of cooldown (operator override).
    pub async fn manual_apply(&self, rule_id: &str) -> PulseResult<()> {
        let rule = {
            let state = self.state.lock().await;
            state.rules.get(rule_id).cloned()
        };
        match rule {
            Some(rule) => self.apply_rule(&rule).await,
            None => Err(PulseError::NotFound(format!(
                "optimization rule {rule_id}"
            ))),
        }
    }

    // =========================================================================
    // Degradation analysis & rollback
    // =========================================================================

    /// Compare the current sample to the baseline; on degradation revert
    /// recent rollback-safe actions to documented defaults.
    pub async fn analyze(&self) {
        let (baseline, current) = {
            let state = self.state.lock().await;
            (state.baseline.clone(), state.current.clone())
        };
        let (Some(baseline), Some(current)) = (baseline, current) else {
            return;
        };

        let mut degradations = Vec::new();
        if baseline.latency_ms > 0.0
            && current.latency_ms > baseline.latency_ms * LATENCY_DEGRADATION_FACTOR
        {
            degradations.push(format!(
                "latency {:.2}ms vs baseline {:.2}ms",
                current.latency_ms, baseline.latency_ms
            ));
        }
        if current.hit_rate < baseline.hit_rate - HIT_RATE_DEGRADATION_PP {
            degradations.push(format!(
                "hit rate {:.1}% vs baseline {:.1}%",
                current.hit_rate * 100.0,
                baseline.hit_rate * 100.0
            ));
        }
        if baseline.ops_per_sec > 0.0
            && (current.ops_per_sec as f64) < baseline.ops_per_sec * OPS_DEGRADATION_FACTOR
        {
            degradations.push(format!(
                "ops/sec {} vs baseline {:.0}",
                current.ops_per_sec, baseline.ops_per_sec
            ));
        }

        if degradations.is_empty() {
            debug!("no performance degradation detected");
            return;
        }
        warn!(details = ?degradations, "performance degradation detected");
        self.rollback_recent().await;
    }

    async fn rollback_recent(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.rollback_window_secs);
        let candidates: Vec<OptimizationAction> = {
            let state = self.state.lock().await;
            state
                .history
                .iter()
                .filter(|a| a.success && a.timestamp > cutoff && a.action.is_rollback_safe())
                .cloned()
                .collect()
        };

        for action in candidates {
            match rollback_action(&self.gateway, action.action).await {
                Ok(true) => {
                    self.rollbacks.fetch_add(1, Ordering::Relaxed);
                    warn!(action = %action.id, "optimization rolled back");
                }
                Ok(false) => {}
                Err(e) => error!(action = %action.id, error = %e, "rollback failed"),
            }
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self) -> OptimizerStatus {
        let state = self.state.lock().await;
        OptimizerStatus {
            current_metrics: state.current.clone(),
            baseline: state.baseline.clone(),
            total_rules: state.rules.len(),
            active_rules: state.rules.values().filter(|r| r.enabled).count(),
            total_optimizations: self.total.load(Ordering::Relaxed),
            successful_optimizations: self.successful.load(Ordering::Relaxed),
            failed_optimizations: self.failed.load(Ordering::Relaxed),
            rollbacks_performed: self.rollbacks.load(Ordering::Relaxed),
            recent_actions: state.history.iter().rev().take(10).cloned().collect(),
        }
    }
}

fn condition_holds(condition: OptimizeCondition, threshold: f64, sample: &StoreSample) -> bool {
    match condition {
        OptimizeCondition::MemoryHigh => sample.memory_used_percent > threshold,
        OptimizeCondition::HitRateLow => sample.hit_rate < threshold,
        OptimizeCondition::LatencyHigh => sample.latency_ms > threshold,
        OptimizeCondition::ConnectionsHigh => sample.connected_clients as f64 > threshold,
        OptimizeCondition::FragmentationHigh => sample.fragmentation_ratio > threshold,
        OptimizeCondition::EvictionRateHigh => sample.evicted_keys as f64 > threshold,
    }
}

/// Weighted improvement in [0, 100]:
/// 30% latency reduction, 25% hit-rate increase, 20% memory reduction,
/// 15% normalized fragmentation reduction, 10% ops/sec increase (capped).
pub fn impact_score(before: &StoreSample, after: &StoreSample) -> f64 {
    let mut score = 0.0;

    if before.latency_ms > 0.0 && after.latency_ms < before.latency_ms {
        score += (before.latency_ms - after.latency_ms) / before.latency_ms * 30.0;
    }
    if after.hit_rate > before.hit_rate {
        score += (after.hit_rate - before.hit_rate) * 25.0;
    }
    if before.memory_used_percent > 0.0 && after.memory_used_percent < before.memory_used_percent {
        score += (before.memory_used_percent - after.memory_used_percent)
            / before.memory_used_percent
            * 20.0;
    }
    if before.fragmentation_ratio > 1.0 && after.fragmentation_ratio < before.fragmentation_ratio {
        score += (before.fragmentation_ratio - after.fragmentation_ratio)
            / (before.fragmentation_ratio - 1.0)
            * 15.0;
    }
    if before.ops_per_sec > 0 && after.ops_per_sec > before.ops_per_sec {
        let gain = (after.ops_per_sec - before.ops_per_sec) as f64 / before.ops_per_sec as f64;
        score += gain.min(0.5) * 10.0;
    }

    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(latency: f64, hit_rate: f64, memory: f64, frag: f64, ops: u64) -> StoreSample {
        StoreSample {
            memory_used_mb: 0.0,
            memory_used_percent: memory,
            hit_rate,
            latency_ms: latency,
            connected_clients: 0,
            ops_per_sec: ops,
            evicted_keys: 0,
            fragmentation_ratio: frag,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_impact_score_bounds() {
        let before = sample(100.0, 0.5, 0.9, 2.0, 100);
        let perfect = sample(0.0, 1.0, 0.0, 1.0, 1_000);
        let score = impact_score(&before, &perfect);
        assert!(score > 0.0 && score <= 100.0, "score {score}");

        // No improvement anywhere scores zero
        let worse = sample(200.0, 0.4, 0.95, 2.5, 50);
        assert_eq!(impact_score(&before, &worse), 0.0);
    }

    #[test]
    fn test_impact_score_latency_component() {
        let before = sample(100.0, 0.9, 0.5, 1.0, 100);
        // Halved latency, everything else unchanged: 0.5 * 30 = 15
        let after = sample(50.0, 0.9, 0.5, 1.0, 100);
        assert!((impact_score(&before, &after) - 15.0).abs() < 0.01);
    }

    #[test]
    fn test_impact_score_ops_gain_capped() {
        let before = sample(10.0, 0.9, 0.5, 1.0, 100);
        // 10x ops improvement still contributes at most 0.5 * 10 = 5
        let after = sample(10.0, 0.9, 0.5, 1.0, 1_000);
        assert!((impact_score(&before, &after) - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_condition_evaluation() {
        let s = sample(60.0, 0.7, 0.9, 1.8, 100);
        assert!(condition_holds(OptimizeCondition::MemoryHigh, 0.85, &s));
        assert!(condition_holds(OptimizeCondition::HitRateLow, 0.8, &s));
        assert!(condition_holds(OptimizeCondition::LatencyHigh, 50.0, &s));
        assert!(condition_holds(OptimizeCondition::FragmentationHigh, 1.5, &s));
        assert!(!condition_holds(OptimizeCondition::ConnectionsHigh, 8_000.0, &s));
    }
}
