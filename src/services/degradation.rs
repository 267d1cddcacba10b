use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;

use crate::models::policy::{
    DegradationLevel, ModelTier, Policy, SystemMetrics, Thresholds, ThresholdsUpdate,
};
use crate::services::cache::MultiLevelCache;
use crate::services::cost_monitor::CostMonitor;

const HISTORY_LIMIT: usize = 100;

const ECONOMY_MARKERS: &[&str] = &["mini", "flash", "haiku", "lite", "turbo"];
const STANDARD_MARKERS: &[&str] = &["sonnet", "pro", "gpt-4o", "deepseek"];

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub overridden: bool,
    pub metrics: SystemMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradationStatus {
    pub level: DegradationLevel,
    pub computed_level: DegradationLevel,
    pub override_level: Option<DegradationLevel>,
    pub policy: Policy,
    pub thresholds: Thresholds,
    pub metrics: SystemMetrics,
    pub history: Vec<Transition>,
}

/// Number of thresholds `value` has reached, as a level.
fn signal_level(value: f64, thresholds: &[f64; 4]) -> DegradationLevel {
    DegradationLevel::from_index(thresholds.iter().filter(|t| value >= **t).count())
}

/// Worst level implied by any of the three signals. The error rate only
/// counts once the hour holds `min_error_samples` calls.
pub fn evaluate_level(metrics: &SystemMetrics, thresholds: &Thresholds) -> DegradationLevel {
    let errors = if metrics.calls >= thresholds.min_error_samples {
        signal_level(metrics.error_rate, &thresholds.error_rate)
    } else {
        DegradationLevel::Normal
    };
    signal_level(metrics.hourly_cost, &thresholds.hourly_cost)
        .max(errors)
        .max(signal_level(metrics.p95_latency_s, &thresholds.p95_latency_s))
}

/// Whether a model id belongs to the allow-list of `tier`. Premium allows
/// everything; standard also admits economy models.
pub fn tier_allows(tier: ModelTier, model_id: &str) -> bool {
    let id = model_id.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| id.contains(m));
    match tier {
        ModelTier::Premium => true,
        ModelTier::Standard => has(STANDARD_MARKERS) || has(ECONOMY_MARKERS),
        ModelTier::Economy => has(ECONOMY_MARKERS),
    }
}

struct State {
    computed: DegradationLevel,
    override_level: Option<DegradationLevel>,
    metrics: SystemMetrics,
}

/// Owns the process-wide [`Policy`]. Readers take a snapshot from the watch
/// channel and never block the writer.
pub struct DegradationController {
    thresholds: RwLock<Thresholds>,
    state: Mutex<State>,
    policy_tx: watch::Sender<Policy>,
    history: Mutex<VecDeque<Transition>>,
}

impl DegradationController {
    pub fn new(thresholds: Thresholds) -> Self {
        let (policy_tx, _) = watch::channel(Policy::default());
        Self {
            thresholds: RwLock::new(thresholds),
            state: Mutex::new(State {
                computed: DegradationLevel::Normal,
                override_level: None,
                metrics: SystemMetrics::default(),
            }),
            policy_tx,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    pub fn snapshot(&self) -> Policy {
        *self.policy_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Policy> {
        self.policy_tx.subscribe()
    }

    pub fn level(&self) -> DegradationLevel {
        self.snapshot().level
    }

    /// Evaluate fresh metrics and publish the resulting policy.
    pub fn update(&self, metrics: SystemMetrics) -> Policy {
        let thresholds = *self.thresholds.read();
        let computed = evaluate_level(&metrics, &thresholds);
        let mut state = self.state.lock();
        state.computed = computed;
        state.metrics = metrics;
        self.publish(&state)
    }

    /// Pin the level (`Some`) or return to computed levels (`None`).
    pub fn set_override(&self, level: Option<DegradationLevel>) -> Policy {
        tracing::info!(
            "Degradation override {}",
            level.map(|l| l.as_str()).unwrap_or("cleared")
        );
        let mut state = self.state.lock();
        state.override_level = level;
        self.publish(&state)
    }

    pub fn set_thresholds(&self, update: ThresholdsUpdate) -> Thresholds {
        let updated = {
            let mut thresholds = self.thresholds.write();
            thresholds.apply(update);
            *thresholds
        };
        let metrics = self.state.lock().metrics;
        self.update(metrics);
        updated
    }

    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read()
    }

    pub fn history(&self) -> Vec<Transition> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn status(&self) -> DegradationStatus {
        let (computed_level, override_level, metrics) = {
            let state = self.state.lock();
            (state.computed, state.override_level, state.metrics)
        };
        let policy = self.snapshot();
        DegradationStatus {
            level: policy.level,
            computed_level,
            override_level,
            policy,
            thresholds: self.thresholds(),
            metrics,
            history: self.history(),
        }
    }

    /// Publish the level the state currently implies. Runs under the state
    /// lock so an override and a tick cannot interleave their writes.
    fn publish(&self, state: &State) -> Policy {
        let level = state.override_level.unwrap_or(state.computed);
        let metrics = state.metrics;
        let mut previous = level;
        self.policy_tx.send_if_modified(|policy| {
            previous = policy.level;
            if previous == level {
                return false;
            }
            *policy = Policy::for_level(level);
            true
        });
        if previous == level {
            return self.snapshot();
        }
        let policy = Policy::for_level(level);

        let overridden = state.override_level.is_some();
        tracing::warn!(
            "Degradation {} -> {} (hourly_cost={:.2}, error_rate={:.3}, p95={:.1}s, active={}, cache_hit_rate={:.2}{})",
            previous.as_str(),
            level.as_str(),
            metrics.hourly_cost,
            metrics.error_rate,
            metrics.p95_latency_s,
            metrics.active_requests,
            metrics.cache_hit_rate,
            if overridden { ", override" } else { "" }
        );

        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(Transition {
            at: Utc::now(),
            from: previous,
            to: level,
            overridden,
            metrics,
        });
        policy
    }

    /// Re-evaluate on every tick from the cost monitor and cache stats.
    pub async fn run(
        self: Arc<Self>,
        monitor: Arc<CostMonitor>,
        cache: Arc<MultiLevelCache>,
        tick: Duration,
    ) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let mut metrics = monitor.metrics();
            metrics.cache_hit_rate = cache.stats().hit_rate;
            self.update(metrics);
        }
    }
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::usage::CallRecord;
    use crate::services::cache::CacheSettings;

    fn metrics(cost: f64, err: f64, p95: f64) -> SystemMetrics {
        SystemMetrics {
            calls: 100,
            hourly_cost: cost,
            error_rate: err,
            p95_latency_s: p95,
            ..SystemMetrics::default()
        }
    }

    fn failed_call() -> CallRecord {
        CallRecord {
            ts: Utc::now(),
            model: "m".into(),
            in_tokens: 1,
            out_tokens: 1,
            cost: 0.0,
            latency_s: 1.0,
            success: false,
            tool_name: "bazi".into(),
            user_id: "u".into(),
            attempts: 1,
        }
    }

    #[test]
    fn worst_signal_wins() {
        let t = Thresholds::default();
        assert_eq!(evaluate_level(&metrics(0.0, 0.0, 0.0), &t), DegradationLevel::Normal);
        assert_eq!(evaluate_level(&metrics(8.0, 0.0, 0.0), &t), DegradationLevel::Light);
        assert_eq!(evaluate_level(&metrics(9.0, 0.21, 1.0), &t), DegradationLevel::Severe);
        assert_eq!(evaluate_level(&metrics(0.0, 0.0, 45.0), &t), DegradationLevel::Critical);
    }

    #[test]
    fn evaluation_is_monotone_in_every_signal() {
        let t = Thresholds::default();
        let costs = [0.0, 7.9, 8.0, 14.0, 20.0, 30.0, 50.0];
        let errors = [0.0, 0.05, 0.08, 0.15, 0.25, 0.5];
        let latencies = [0.0, 9.0, 16.0, 26.0, 41.0];

        let mut grid = Vec::new();
        for c in costs {
            for e in errors {
                for l in latencies {
                    grid.push(metrics(c, e, l));
                }
            }
        }
        for a in &grid {
            for b in &grid {
                let le = a.hourly_cost <= b.hourly_cost
                    && a.error_rate <= b.error_rate
                    && a.p95_latency_s <= b.p95_latency_s;
                if le {
                    assert!(evaluate_level(a, &t) <= evaluate_level(b, &t), "{a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn error_rate_needs_enough_calls() {
        let t = Thresholds::default();
        let quiet = SystemMetrics {
            calls: 1,
            ..metrics(0.0, 1.0, 0.0)
        };
        assert_eq!(evaluate_level(&quiet, &t), DegradationLevel::Normal);

        let busy = SystemMetrics {
            calls: 20,
            ..metrics(0.0, 0.25, 0.0)
        };
        assert_eq!(evaluate_level(&busy, &t), DegradationLevel::Severe);
    }

    #[test]
    fn one_failed_call_does_not_lock_out_traffic() {
        let controller = DegradationController::default();
        let monitor = CostMonitor::new();
        monitor.record(failed_call());
        let policy = controller.update(monitor.metrics());
        assert_eq!(policy.level, DegradationLevel::Normal);
        assert!(!controller.snapshot().reject_new);
    }

    #[test]
    fn override_survives_a_concurrent_tick() {
        let controller = Arc::new(DegradationController::default());
        let ticker = {
            let controller = controller.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    controller.update(metrics(50.0, 0.0, 0.0));
                    controller.update(metrics(0.0, 0.0, 0.0));
                }
            })
        };
        for _ in 0..500 {
            controller.set_override(Some(DegradationLevel::Light));
        }
        ticker.join().unwrap();
        assert_eq!(controller.level(), DegradationLevel::Light);
        let status = controller.status();
        assert_eq!(status.override_level, Some(DegradationLevel::Light));
    }

    #[test]
    fn tier_allow_lists() {
        assert!(tier_allows(ModelTier::Economy, "gpt-4o-mini"));
        assert!(tier_allows(ModelTier::Economy, "gemini-1.5-flash"));
        assert!(!tier_allows(ModelTier::Economy, "claude-3-5-sonnet"));
        assert!(tier_allows(ModelTier::Standard, "claude-3-5-sonnet"));
        assert!(tier_allows(ModelTier::Standard, "claude-3-haiku"));
        assert!(!tier_allows(ModelTier::Standard, "claude-3-opus"));
        assert!(tier_allows(ModelTier::Premium, "claude-3-opus"));
    }

    #[test]
    fn override_supersedes_metrics_and_transitions_are_kept() {
        let controller = DegradationController::default();
        let rx = controller.subscribe();

        controller.update(metrics(16.0, 0.0, 0.0));
        assert_eq!(rx.borrow().level, DegradationLevel::Moderate);
        assert_eq!(controller.snapshot().max_output_tokens, 1024);

        let policy = controller.set_override(Some(DegradationLevel::Critical));
        assert!(policy.reject_new);
        // metrics no longer move the level while pinned
        controller.update(metrics(0.0, 0.0, 0.0));
        assert_eq!(controller.level(), DegradationLevel::Critical);

        controller.set_override(None);
        assert_eq!(controller.level(), DegradationLevel::Normal);

        let history = controller.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].to, DegradationLevel::Critical);
        assert!(history[1].overridden);
    }

    #[test]
    fn history_is_bounded() {
        let controller = DegradationController::default();
        for i in 0..120 {
            let cost = if i % 2 == 0 { 50.0 } else { 0.0 };
            controller.update(metrics(cost, 0.0, 0.0));
        }
        assert_eq!(controller.history().len(), HISTORY_LIMIT);
    }

    #[test]
    fn threshold_changes_take_effect_immediately() {
        let controller = DegradationController::default();
        controller.update(metrics(5.0, 0.0, 0.0));
        assert_eq!(controller.level(), DegradationLevel::Normal);
        controller.set_thresholds(ThresholdsUpdate {
            hourly_cost: Some([1.0, 2.0, 3.0, 4.0]),
            ..ThresholdsUpdate::default()
        });
        assert_eq!(controller.level(), DegradationLevel::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_loop_reads_the_monitor() {
        let controller = Arc::new(DegradationController::default());
        let monitor = Arc::new(CostMonitor::new());
        let cache = Arc::new(MultiLevelCache::new(CacheSettings::default(), None, None));
        for _ in 0..20 {
            monitor.record(failed_call());
        }

        let mut rx = controller.subscribe();
        let task = tokio::spawn(controller.clone().run(monitor, cache, Duration::from_secs(30)));
        rx.changed().await.unwrap();
        // twenty failed calls in the hour: error rate 1.0
        assert_eq!(rx.borrow().level, DegradationLevel::Critical);
        task.abort();
    }
}
