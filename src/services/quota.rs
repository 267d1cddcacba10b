use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::usage::{is_unlimited, DailyUsage, TierQuota, UserTier};

type UsageMap = Arc<Mutex<HashMap<String, DailyUsage>>>;

#[derive(Debug, Clone)]
pub struct QuotaSettings {
    pub tiers: HashMap<UserTier, TierQuota>,
    /// Explicit tier assignments by user id.
    pub user_tiers: HashMap<String, UserTier>,
    /// Where `usage_YYYY-MM-DD.json` files live. `None` keeps usage in memory only.
    pub data_dir: Option<PathBuf>,
    pub retention_days: u32,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            tiers: UserTier::ALL
                .iter()
                .map(|t| (*t, TierQuota::defaults_for(*t)))
                .collect(),
            user_tiers: HashMap::new(),
            data_dir: None,
            retention_days: 30,
        }
    }
}

/// Remaining allowance for the day. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaRemaining {
    pub calls: Option<i64>,
    pub tokens: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub tier: UserTier,
    pub remaining: QuotaRemaining,
}

/// Per-user daily counters keyed `user_id:YYYY-MM-DD`.
///
/// Updates land in memory immediately. A single background writer persists the
/// touched day's file; [`QuotaLedger::flush`] writes everything synchronously
/// and is meant for shutdown.
pub struct QuotaLedger {
    usage: UsageMap,
    settings: QuotaSettings,
    writer: Option<mpsc::UnboundedSender<NaiveDate>>,
}

impl QuotaLedger {
    /// Must be called inside a Tokio runtime when `data_dir` is set, since the
    /// writer task is spawned here.
    pub fn new(settings: QuotaSettings) -> Self {
        let usage: UsageMap = Arc::new(Mutex::new(HashMap::new()));
        let writer = settings.data_dir.as_ref().map(|dir| {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!("Cannot create usage dir {}: {}", dir.display(), e);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(rx, usage.clone(), dir.clone()));
            tx
        });
        Self {
            usage,
            settings,
            writer,
        }
    }

    pub fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    /// Token claim first, then configured assignment, then `free`.
    pub fn tier_for(&self, user_id: &str, claimed: Option<UserTier>) -> UserTier {
        claimed
            .or_else(|| self.settings.user_tiers.get(user_id).copied())
            .unwrap_or_default()
    }

    pub fn tier_quota(&self, tier: UserTier) -> TierQuota {
        self.settings
            .tiers
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierQuota::defaults_for(tier))
    }

    pub fn check_quota(&self, user_id: &str, tier: UserTier) -> QuotaDecision {
        self.check_quota_on(user_id, tier, Self::today())
    }

    pub fn check_quota_on(&self, user_id: &str, tier: UserTier, date: NaiveDate) -> QuotaDecision {
        let quota = self.tier_quota(tier);
        let usage = self.usage_on(user_id, date);

        let remaining = QuotaRemaining {
            calls: remaining(quota.daily_calls, usage.call_count),
            tokens: remaining(quota.daily_tokens, usage.token_count),
        };

        let reason = if remaining.calls == Some(0) {
            Some(format!("daily call limit of {} reached", quota.daily_calls))
        } else if remaining.tokens == Some(0) {
            Some(format!("daily token limit of {} reached", quota.daily_tokens))
        } else {
            None
        };

        QuotaDecision {
            allowed: reason.is_none(),
            reason,
            tier,
            remaining,
        }
    }

    /// Check and turn a refusal into the admission error.
    pub fn ensure_quota(&self, user_id: &str, tier: UserTier) -> Result<QuotaDecision, AppError> {
        let decision = self.check_quota(user_id, tier);
        match &decision.reason {
            Some(reason) if !decision.allowed => {
                tracing::info!("Quota exceeded for {} ({}): {}", user_id, tier.as_str(), reason);
                Err(AppError::QuotaExceeded(reason.clone()))
            }
            _ => Ok(decision),
        }
    }

    pub fn consume_quota(&self, user_id: &str, tokens: u64, cost: f64) -> DailyUsage {
        self.consume_quota_on(user_id, tokens, cost, Self::today(), Utc::now())
    }

    pub fn consume_quota_on(
        &self,
        user_id: &str,
        tokens: u64,
        cost: f64,
        date: NaiveDate,
        at: DateTime<Utc>,
    ) -> DailyUsage {
        let updated = {
            let mut usage = self.usage.lock();
            let entry = usage
                .entry(DailyUsage::key(user_id, date))
                .or_insert_with(|| DailyUsage::empty(user_id, date));
            entry.call_count += 1;
            entry.token_count += tokens;
            entry.cost += cost;
            entry.last_call_ts = Some(at);
            entry.clone()
        };

        if let Some(tx) = &self.writer {
            if tx.send(date).is_err() {
                tracing::warn!("Usage writer stopped; {} kept in memory only", date);
            }
        }
        updated
    }

    pub fn usage_on(&self, user_id: &str, date: NaiveDate) -> DailyUsage {
        self.usage
            .lock()
            .get(&DailyUsage::key(user_id, date))
            .cloned()
            .unwrap_or_else(|| DailyUsage::empty(user_id, date))
    }

    /// Load one day's file into memory, keeping any larger in-memory counters.
    pub fn load_day(&self, date: NaiveDate) -> usize {
        let Some(dir) = &self.settings.data_dir else {
            return 0;
        };
        let path = usage_path(dir, date);
        let records: BTreeMap<String, DailyUsage> = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable usage file {}: {}", path.display(), e);
                    return 0;
                }
            },
            Err(_) => return 0,
        };

        let mut usage = self.usage.lock();
        let loaded = records.len();
        for (user_id, record) in records {
            let key = DailyUsage::key(&user_id, date);
            match usage.get(&key) {
                Some(existing) if existing.call_count >= record.call_count => {}
                _ => {
                    usage.insert(key, record);
                }
            }
        }
        loaded
    }

    pub fn load_today(&self) -> usize {
        self.load_day(Self::today())
    }

    /// Write every day held in memory. Blocking; used on shutdown.
    pub fn flush(&self) -> std::io::Result<()> {
        let Some(dir) = &self.settings.data_dir else {
            return Ok(());
        };
        let dates: HashSet<NaiveDate> = self.usage.lock().values().map(|u| u.date).collect();
        for date in dates {
            let bytes = snapshot_day(&self.usage, date)?;
            write_atomic_blocking(&usage_path(dir, date), &bytes)?;
        }
        Ok(())
    }

    /// Drop in-memory days before `date` and delete files older than the
    /// retention window. Returns the number of files removed.
    pub fn cleanup(&self, today: NaiveDate) -> usize {
        self.usage.lock().retain(|_, u| u.date >= today);

        let Some(dir) = &self.settings.data_dir else {
            return 0;
        };
        let cutoff = today - chrono::Duration::days(self.settings.retention_days as i64);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(parse_usage_file_name) else {
                continue;
            };
            if date < cutoff {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("Failed to delete {:?}: {}", name, e),
                }
            }
        }
        removed
    }
}

fn remaining(limit: i64, used: u64) -> Option<i64> {
    if is_unlimited(limit) {
        None
    } else {
        Some((limit - used as i64).max(0))
    }
}

fn usage_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("usage_{}.json", date.format("%Y-%m-%d")))
}

fn parse_usage_file_name(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix("usage_")?.strip_suffix(".json")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn snapshot_day(usage: &UsageMap, date: NaiveDate) -> Result<Vec<u8>, serde_json::Error> {
    let day: BTreeMap<String, DailyUsage> = usage
        .lock()
        .values()
        .filter(|u| u.date == date)
        .map(|u| (u.user_id.clone(), u.clone()))
        .collect();
    serde_json::to_vec_pretty(&day)
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

// ── Background writer ──────────────────────────────────────

async fn run_writer(mut rx: mpsc::UnboundedReceiver<NaiveDate>, usage: UsageMap, dir: PathBuf) {
    while let Some(first) = rx.recv().await {
        let mut dates = HashSet::from([first]);
        while let Ok(more) = rx.try_recv() {
            dates.insert(more);
        }

        for date in dates {
            let bytes = match snapshot_day(&usage, date) {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!("Failed to serialise usage for {}: {}", date, e);
                    continue;
                }
            };
            let path = usage_path(&dir, date);
            let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
            let result = async {
                tokio::fs::write(&tmp, &bytes).await?;
                tokio::fs::rename(&tmp, &path).await
            }
            .await;
            if let Err(e) = result {
                tracing::error!("Failed to persist {}: {}", path.display(), e);
                let _ = tokio::fs::remove_file(&tmp).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn free_tier_stops_after_ten_calls() {
        let ledger = QuotaLedger::new(QuotaSettings::default());
        let day = date("2024-01-15");

        for _ in 0..10 {
            assert!(ledger.check_quota_on("gh:alice", UserTier::Free, day).allowed);
            ledger.consume_quota_on("gh:alice", 300, 0.001, day, Utc::now());
        }

        let decision = ledger.check_quota_on("gh:alice", UserTier::Free, day);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining.calls, Some(0));
        assert!(decision.reason.unwrap().contains("10"));

        let usage = ledger.usage_on("gh:alice", day);
        assert_eq!(DailyUsage::key(&usage.user_id, usage.date), "gh:alice:2024-01-15");
        assert_eq!(usage.call_count, 10);
        assert_eq!(usage.token_count, 3000);

        // a new day starts from zero
        assert!(ledger.check_quota_on("gh:alice", UserTier::Free, date("2024-01-16")).allowed);
    }

    #[tokio::test]
    async fn zero_and_negative_limits_are_unlimited() {
        let mut settings = QuotaSettings::default();
        settings.tiers.get_mut(&UserTier::Vip).unwrap().daily_calls = 0;
        let ledger = QuotaLedger::new(settings);
        let day = date("2024-03-01");

        for _ in 0..1000 {
            ledger.consume_quota_on("wx:bob", 10, 0.0, day, Utc::now());
        }
        let vip = ledger.check_quota_on("wx:bob", UserTier::Vip, day);
        assert!(vip.allowed);
        assert_eq!(vip.remaining.calls, None);

        let unlimited = ledger.check_quota_on("wx:bob", UserTier::Unlimited, day);
        assert!(unlimited.allowed);
        assert_eq!(unlimited.remaining.tokens, None);
    }

    #[tokio::test]
    async fn token_limit_also_blocks() {
        let ledger = QuotaLedger::new(QuotaSettings::default());
        let day = date("2024-01-15");
        ledger.consume_quota_on("gh:carol", 50_000, 0.0, day, Utc::now());
        let d = ledger.check_quota_on("gh:carol", UserTier::Free, day);
        assert!(!d.allowed);
        assert_eq!(d.remaining.tokens, Some(0));
    }

    #[tokio::test]
    async fn tier_resolution_order() {
        let mut settings = QuotaSettings::default();
        settings
            .user_tiers
            .insert("gh:vip".to_string(), UserTier::Vip);
        let ledger = QuotaLedger::new(settings);
        assert_eq!(ledger.tier_for("gh:vip", Some(UserTier::Premium)), UserTier::Premium);
        assert_eq!(ledger.tier_for("gh:vip", None), UserTier::Vip);
        assert_eq!(ledger.tier_for("gh:other", None), UserTier::Free);
    }

    #[tokio::test]
    async fn background_writer_and_flush_persist_usage() {
        let dir = tempfile::tempdir().unwrap();
        let settings = QuotaSettings {
            data_dir: Some(dir.path().to_path_buf()),
            ..QuotaSettings::default()
        };
        let day = date("2024-01-15");
        let file = dir.path().join("usage_2024-01-15.json");

        let ledger = QuotaLedger::new(settings.clone());
        ledger.consume_quota_on("gh:alice", 120, 0.01, day, Utc::now());

        let mut written = false;
        for _ in 0..100 {
            if file.exists() {
                written = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(written, "writer never produced {}", file.display());

        ledger.consume_quota_on("gh:alice", 80, 0.01, day, Utc::now());
        ledger.flush().unwrap();

        let reloaded = QuotaLedger::new(settings);
        assert_eq!(reloaded.load_day(day), 1);
        let usage = reloaded.usage_on("gh:alice", day);
        assert_eq!(usage.call_count, 2);
        assert_eq!(usage.token_count, 200);
    }

    #[tokio::test]
    async fn cleanup_removes_files_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = QuotaLedger::new(QuotaSettings {
            data_dir: Some(dir.path().to_path_buf()),
            retention_days: 30,
            ..QuotaSettings::default()
        });
        for name in ["usage_2024-01-01.json", "usage_2024-02-10.json", "notes.json"] {
            std::fs::write(dir.path().join(name), b"{}").unwrap();
        }
        ledger.consume_quota_on("u", 1, 0.0, date("2024-02-14"), Utc::now());

        assert_eq!(ledger.cleanup(date("2024-02-15")), 1);
        assert!(!dir.path().join("usage_2024-01-01.json").exists());
        assert!(dir.path().join("usage_2024-02-10.json").exists());
        assert!(dir.path().join("notes.json").exists());
        assert_eq!(ledger.usage_on("u", date("2024-02-14")).call_count, 0);
    }
}
