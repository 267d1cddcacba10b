use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::policy::SystemMetrics;
use crate::models::usage::CallRecord;

const BUCKET_SECS: i64 = 3600;
const RETENTION_HOURS: i64 = 48;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct UsageSummary {
    pub calls: u64,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub cost: f64,
    pub errors: u64,
    pub avg_latency_s: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    pub hours: u32,
    pub total: UsageSummary,
    pub by_model: BTreeMap<String, UsageSummary>,
    pub by_tool: BTreeMap<String, UsageSummary>,
}

/// Call records bucketed by hour. Buckets older than 48h are dropped by
/// [`CostMonitor::cleanup`].
#[derive(Default)]
pub struct CostMonitor {
    buckets: Mutex<BTreeMap<i64, Vec<CallRecord>>>,
    active: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when dropped.
pub struct ActiveRequest {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl CostMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_request(&self) -> ActiveRequest {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveRequest {
            active: self.active.clone(),
        }
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn record(&self, record: CallRecord) {
        let bucket = bucket_of(record.ts);
        self.buckets.lock().entry(bucket).or_default().push(record);
    }

    pub fn metrics(&self) -> SystemMetrics {
        self.metrics_at(Utc::now())
    }

    /// Cost, error rate, and p95 latency over the trailing hour; daily cost over
    /// the trailing 24h. `cache_hit_rate` is left for the caller to fill.
    pub fn metrics_at(&self, now: DateTime<Utc>) -> SystemMetrics {
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::hours(24);

        let mut hourly_cost = 0.0;
        let mut daily_cost = 0.0;
        let mut calls = 0u64;
        let mut failures = 0u64;
        let mut latencies = Vec::new();

        {
            let buckets = self.buckets.lock();
            for records in buckets.range(bucket_of(day_ago)..).map(|(_, r)| r) {
                for r in records.iter().filter(|r| r.ts > day_ago && r.ts <= now) {
                    daily_cost += r.cost;
                    if r.ts > hour_ago {
                        hourly_cost += r.cost;
                        calls += 1;
                        if !r.success {
                            failures += 1;
                        }
                        latencies.push(r.latency_s);
                    }
                }
            }
        }

        SystemMetrics {
            calls,
            hourly_cost,
            daily_cost,
            error_rate: if calls == 0 {
                0.0
            } else {
                failures as f64 / calls as f64
            },
            p95_latency_s: percentile(&mut latencies, 0.95),
            active_requests: self.active_requests(),
            cache_hit_rate: 0.0,
        }
    }

    /// Records newer than `since`, oldest first.
    pub fn records_since(&self, since: DateTime<Utc>) -> Vec<CallRecord> {
        let buckets = self.buckets.lock();
        let mut records: Vec<CallRecord> = buckets
            .range(bucket_of(since)..)
            .flat_map(|(_, r)| r.iter())
            .filter(|r| r.ts > since)
            .cloned()
            .collect();
        drop(buckets);
        records.sort_by_key(|r| r.ts);
        records
    }

    pub fn summary(&self, hours: u32) -> CostSummary {
        self.summary_at(Utc::now(), hours)
    }

    pub fn summary_at(&self, now: DateTime<Utc>, hours: u32) -> CostSummary {
        let since = now - Duration::hours(hours as i64);
        let mut total = Accumulator::default();
        let mut by_model: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut by_tool: BTreeMap<String, Accumulator> = BTreeMap::new();

        let buckets = self.buckets.lock();
        for records in buckets.range(bucket_of(since)..).map(|(_, r)| r) {
            for r in records.iter().filter(|r| r.ts > since && r.ts <= now) {
                total.add(r);
                by_model.entry(r.model.clone()).or_default().add(r);
                by_tool.entry(r.tool_name.clone()).or_default().add(r);
            }
        }
        drop(buckets);

        CostSummary {
            hours,
            total: total.finish(),
            by_model: by_model.into_iter().map(|(k, v)| (k, v.finish())).collect(),
            by_tool: by_tool.into_iter().map(|(k, v)| (k, v.finish())).collect(),
        }
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    /// Drop buckets that ended more than 48h before `now`.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = bucket_of(now - Duration::hours(RETENTION_HOURS));
        let mut buckets = self.buckets.lock();
        let keep = buckets.split_off(&cutoff);
        let dropped = buckets.len();
        *buckets = keep;
        dropped
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

fn bucket_of(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(BUCKET_SECS) * BUCKET_SECS
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = (p * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

#[derive(Default)]
struct Accumulator {
    summary: UsageSummary,
    latency_sum: f64,
}

impl Accumulator {
    fn add(&mut self, r: &CallRecord) {
        self.summary.calls += 1;
        self.summary.in_tokens += r.in_tokens as u64;
        self.summary.out_tokens += r.out_tokens as u64;
        self.summary.cost += r.cost;
        if !r.success {
            self.summary.errors += 1;
        }
        self.latency_sum += r.latency_s;
    }

    fn finish(mut self) -> UsageSummary {
        if self.summary.calls > 0 {
            self.summary.avg_latency_s = self.latency_sum / self.summary.calls as f64;
        }
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: DateTime<Utc>, model: &str, tool: &str, cost: f64, latency: f64, ok: bool) -> CallRecord {
        CallRecord {
            ts,
            model: model.to_string(),
            in_tokens: 100,
            out_tokens: 200,
            cost,
            latency_s: latency,
            success: ok,
            tool_name: tool.to_string(),
            user_id: "ip:127.0.0.1".to_string(),
            attempts: 1,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T12:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn metrics_cover_trailing_windows() {
        let monitor = CostMonitor::new();
        let now = now();
        for i in 0..19 {
            monitor.record(record(now - Duration::minutes(i), "gpt-4o-mini", "bazi", 0.5, 1.0, true));
        }
        monitor.record(record(now - Duration::minutes(5), "gpt-4o-mini", "bazi", 0.5, 30.0, false));
        // outside the hour but inside the day
        monitor.record(record(now - Duration::hours(3), "claude-3-haiku", "tarot", 2.0, 1.0, false));

        let m = monitor.metrics_at(now);
        assert_eq!(m.calls, 20);
        assert!((m.hourly_cost - 10.0).abs() < 1e-9);
        assert!((m.daily_cost - 12.0).abs() < 1e-9);
        assert!((m.error_rate - 0.05).abs() < 1e-9);
        // 20 samples: the 19th smallest is still 1.0, the slowest is the 20th
        assert_eq!(m.p95_latency_s, 1.0);
    }

    #[test]
    fn active_guard_tracks_in_flight_requests() {
        let monitor = CostMonitor::new();
        let a = monitor.begin_request();
        let b = monitor.begin_request();
        assert_eq!(monitor.metrics().active_requests, 2);
        drop(a);
        drop(b);
        assert_eq!(monitor.active_requests(), 0);
    }

    #[test]
    fn summary_groups_by_model_and_tool() {
        let monitor = CostMonitor::new();
        let now = now();
        monitor.record(record(now - Duration::minutes(1), "m1", "bazi", 1.0, 2.0, true));
        monitor.record(record(now - Duration::minutes(2), "m1", "tarot", 1.0, 4.0, false));
        monitor.record(record(now - Duration::minutes(3), "m2", "bazi", 0.5, 1.0, true));
        monitor.record(record(now - Duration::hours(30), "m2", "bazi", 9.0, 1.0, true));

        let s = monitor.summary_at(now, 24);
        assert_eq!(s.total.calls, 3);
        assert_eq!(s.by_model["m1"].calls, 2);
        assert_eq!(s.by_model["m1"].errors, 1);
        assert!((s.by_model["m1"].avg_latency_s - 3.0).abs() < 1e-9);
        assert_eq!(s.by_tool["bazi"].calls, 2);
        assert!((s.by_tool["bazi"].cost - 1.5).abs() < 1e-9);
    }

    #[test]
    fn cleanup_drops_buckets_older_than_two_days() {
        let monitor = CostMonitor::new();
        let now = now();
        monitor.record(record(now - Duration::hours(50), "m", "t", 1.0, 1.0, true));
        monitor.record(record(now - Duration::hours(47), "m", "t", 1.0, 1.0, true));
        monitor.record(record(now, "m", "t", 1.0, 1.0, true));
        assert_eq!(monitor.bucket_count(), 3);
        assert_eq!(monitor.cleanup_at(now), 1);
        assert_eq!(monitor.bucket_count(), 2);
    }

    #[test]
    fn percentile_of_empty_is_zero() {
        assert_eq!(percentile(&mut [], 0.95), 0.0);
        assert_eq!(percentile(&mut [3.0, 1.0, 2.0], 0.5), 2.0);
    }
}
