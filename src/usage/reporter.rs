//! 使用统计：单 Key 快照、月度费用汇总，以及选择时的费用上限过滤。
//!
//! 月度费用通过 moka 缓存（带 TTL），读取为最终一致：
//! 上限判断可能滞后一个 TTL 周期。

use crate::credential::{Credential, CredentialId};
use crate::quota_pool::registry::KeyEntry;
use crate::quota_pool::tracker::Availability;
use crate::quota_pool::KeyRegistry;
use crate::usage::record::UsageRecord;
use crate::usage::store::UsageStore;
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use futures::future::join_all;
use moka::future::Cache;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_COST_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CostScope {
    All,
    User { user: String, provider: String },
    Credential(CredentialId),
}

impl CostScope {
    fn matches(&self, r: &UsageRecord) -> bool {
        match self {
            CostScope::All => true,
            CostScope::User { user, provider } => {
                r.user.as_deref() == Some(user.as_str()) && &r.provider == provider
            }
            CostScope::Credential(id) => &r.credential_id == id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MonthlyUsage {
    pub cost: f64,
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// 单个 Key 的即时快照。
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub id: CredentialId,
    pub label: String,
    pub key_preview: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub enabled: bool,
    pub priority: u32,
    pub minute_used: u32,
    pub minute_limit: u32,
    pub hour_used: u32,
    pub hour_limit: u32,
    pub day_used: u32,
    pub day_limit: u32,
    pub failure_streak: u32,
    pub is_suspended: bool,
    pub is_eligible: bool,
    /// 下一次可用的时间；`None` 表示当前可用或不会自行恢复（见 `is_eligible`）。
    pub resumes_at: Option<DateTime<Utc>>,
    pub successes_total: u64,
    pub rate_limited_total: u64,
    pub auth_failures_total: u64,
    pub server_failures_total: u64,
    pub unknown_failures_total: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub monthly_cost: f64,
    pub monthly_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_cost_limit: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub total_credentials: usize,
    pub active_credentials: usize,
    pub total_requests_today: u64,
    pub total_cost_this_month: f64,
    pub keys: Vec<KeyStats>,
}

pub struct UsageReporter {
    registry: Arc<KeyRegistry>,
    store: Arc<dyn UsageStore>,
    cost_cache: Cache<CostScope, MonthlyUsage>,
}

impl UsageReporter {
    pub fn new(registry: Arc<KeyRegistry>, store: Arc<dyn UsageStore>, cache_ttl: Duration) -> Self {
        let cost_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(cache_ttl)
            .build();
        Self {
            registry,
            store,
            cost_cache,
        }
    }

    /// 写入一条记录。存储失败只告警，不影响调用结果。
    pub async fn record(&self, record: UsageRecord) {
        let label = record.credential_label.clone();
        if let Err(e) = self.store.append(record).await {
            tracing::warn!(key = %label, "写入调用记录失败：{e:#}");
        }
    }

    /// 丢弃缓存的月度汇总，下一次读取时重新计算。
    pub fn invalidate_costs(&self) {
        self.cost_cache.invalidate_all();
    }

    pub async fn monthly_usage(&self, user: &str, provider: &str) -> MonthlyUsage {
        self.cached(CostScope::User {
            user: user.to_string(),
            provider: provider.to_string(),
        })
        .await
    }

    /// 本月（UTC）该用户在该 provider 上的累计费用。
    pub async fn monthly_cost(&self, user: &str, provider: &str) -> f64 {
        self.monthly_usage(user, provider).await.cost
    }

    pub async fn credential_monthly_usage(&self, id: &str) -> MonthlyUsage {
        self.cached(CostScope::Credential(id.to_string())).await
    }

    /// 超出月度费用上限的 Key。
    ///
    /// 归属用户的 Key 按 (owner, provider) 汇总，共享 Key 按自身汇总。
    pub async fn over_budget(&self, candidates: &[Arc<KeyEntry>]) -> HashSet<CredentialId> {
        let mut out = HashSet::new();
        for entry in candidates {
            let credential = entry.credential();
            let Some(limit) = credential.monthly_cost_limit else {
                continue;
            };
            if !credential.enabled {
                continue;
            }
            let spent = self.budget_usage(&credential).await.cost;
            if spent >= limit {
                tracing::debug!(key = %credential.label, spent, limit, "Key 已达到月度费用上限");
                out.insert(credential.id.clone());
            }
        }
        out
    }

    pub async fn stats(&self, id: &str) -> Option<KeyStats> {
        let entry = self.registry.get(id).await?;
        Some(self.key_stats(&entry, Instant::now(), Utc::now()).await)
    }

    pub async fn status(&self) -> StatusReport {
        let entries = self.registry.entries().await;
        let now = Instant::now();
        let wall = Utc::now();

        let keys = join_all(entries.iter().map(|entry| self.key_stats(entry, now, wall))).await;

        StatusReport {
            generated_at: wall,
            total_credentials: keys.len(),
            active_credentials: keys.iter().filter(|k| k.is_eligible).count(),
            total_requests_today: keys.iter().map(|k| u64::from(k.day_used)).sum(),
            total_cost_this_month: self.cached(CostScope::All).await.cost,
            keys,
        }
    }

    async fn budget_usage(&self, credential: &Credential) -> MonthlyUsage {
        match &credential.owner {
            Some(owner) => self.monthly_usage(owner, &credential.provider).await,
            None => self.credential_monthly_usage(&credential.id).await,
        }
    }

    async fn key_stats(&self, entry: &KeyEntry, now: Instant, wall: DateTime<Utc>) -> KeyStats {
        let credential = entry.credential();
        let (counts, eligible, suspended, availability, streak, counters, last_used) =
            entry.with_tracker(|t| {
                t.purge(now);
                let eligible = credential.enabled && t.is_eligible(now);
                let availability = if credential.enabled {
                    t.next_available_at(now)
                } else {
                    Availability::Never
                };
                (
                    t.counts(),
                    eligible,
                    t.is_suspended(now),
                    availability,
                    t.failure_streak(),
                    t.counters(),
                    t.last_used(),
                )
            });
        let monthly = self.credential_monthly_usage(&credential.id).await;

        let resumes_at = match availability {
            Availability::At(t) => Some(wall + to_delta(t.saturating_duration_since(now))),
            Availability::Now | Availability::Never => None,
        };

        KeyStats {
            id: credential.id.clone(),
            label: credential.label.clone(),
            key_preview: credential.preview(),
            provider: credential.provider.clone(),
            owner: credential.owner.clone(),
            enabled: credential.enabled,
            priority: credential.priority,
            minute_used: counts.minute,
            minute_limit: credential.limits.per_minute,
            hour_used: counts.hour,
            hour_limit: credential.limits.per_hour,
            day_used: counts.day,
            day_limit: credential.limits.per_day,
            failure_streak: streak,
            is_suspended: suspended,
            is_eligible: eligible,
            resumes_at,
            successes_total: counters.successes,
            rate_limited_total: counters.rate_limited,
            auth_failures_total: counters.auth_failures,
            server_failures_total: counters.server_failures,
            unknown_failures_total: counters.unknown_failures,
            last_used: last_used.map(|t| wall - to_delta(now.saturating_duration_since(t))),
            monthly_cost: monthly.cost,
            monthly_requests: monthly.requests,
            monthly_cost_limit: credential.monthly_cost_limit,
        }
    }

    async fn cached(&self, scope: CostScope) -> MonthlyUsage {
        let store = self.store.clone();
        let key = scope.clone();
        let result = self
            .cost_cache
            .try_get_with(key, async move {
                let records = store.since(month_start(Utc::now())).await?;
                Ok::<_, anyhow::Error>(aggregate(&scope, &records))
            })
            .await;
        match result {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("读取月度费用失败：{e:#}");
                MonthlyUsage::default()
            }
        }
    }
}

fn aggregate(scope: &CostScope, records: &[UsageRecord]) -> MonthlyUsage {
    records
        .iter()
        .filter(|r| scope.matches(r))
        .fold(MonthlyUsage::default(), |mut acc, r| {
            acc.cost += r.cost;
            acc.tokens_in = acc.tokens_in.saturating_add(r.tokens_in);
            acc.tokens_out = acc.tokens_out.saturating_add(r.tokens_out);
            if r.is_success() {
                acc.requests += 1;
            }
            acc
        })
}

/// 当月第一天 00:00:00 UTC。
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialDescriptor;
    use crate::usage::record::{AttemptOutcome, Metering};
    use crate::usage::store::MemoryUsageStore;
    use chrono::TimeZone;

    fn credential(json: &str) -> Credential {
        let desc: CredentialDescriptor = sonic_rs::from_str(json).unwrap();
        Credential::from_descriptor(desc, 0)
    }

    fn spend(c: &Credential, user: &str, cost: f64) -> UsageRecord {
        UsageRecord::new(
            c,
            Some(user),
            None,
            AttemptOutcome::Success,
            Duration::from_millis(1),
            Metering {
                cost: Some(cost),
                ..Metering::default()
            },
        )
    }

    async fn setup(creds: Vec<Credential>) -> (Arc<KeyRegistry>, Arc<MemoryUsageStore>, UsageReporter) {
        let registry = Arc::new(KeyRegistry::from_credentials(creds).await);
        let store = Arc::new(MemoryUsageStore::default());
        let reporter = UsageReporter::new(registry.clone(), store.clone(), DEFAULT_COST_CACHE_TTL);
        (registry, store, reporter)
    }

    #[test]
    fn month_start_is_first_instant_of_month() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 13, 45, 10).unwrap();
        assert_eq!(
            month_start(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn monthly_cost_sums_current_month_for_scope() {
        let c = credential(r#"{"id":"k","secret":"sk","provider":"openai"}"#);
        let (_, store, reporter) = setup(vec![c.clone()]).await;

        store.append(spend(&c, "alice", 1.25)).await.unwrap();
        store.append(spend(&c, "alice", 0.75)).await.unwrap();
        store.append(spend(&c, "bob", 9.0)).await.unwrap();
        let mut stale = spend(&c, "alice", 100.0);
        stale.timestamp = month_start(Utc::now()) - TimeDelta::seconds(1);
        store.append(stale).await.unwrap();

        assert!((reporter.monthly_cost("alice", "openai").await - 2.0).abs() < 1e-9);
        assert_eq!(reporter.monthly_cost("alice", "anthropic").await, 0.0);
        assert_eq!(reporter.monthly_usage("bob", "openai").await.requests, 1);
    }

    #[tokio::test]
    async fn over_budget_excludes_keys_at_ceiling() {
        let owned = credential(
            r#"{"id":"own","secret":"a","owner":"alice","provider":"openai","monthly_cost_limit":5.0}"#,
        );
        let shared = credential(r#"{"id":"shared","secret":"b","monthly_cost_limit":1.0}"#);
        let free = credential(r#"{"id":"free","secret":"c"}"#);
        let (registry, store, reporter) =
            setup(vec![owned.clone(), shared.clone(), free.clone()]).await;

        store.append(spend(&owned, "alice", 4.0)).await.unwrap();
        store.append(spend(&shared, "bob", 1.0)).await.unwrap();
        store.append(spend(&free, "bob", 50.0)).await.unwrap();

        let over = reporter.over_budget(&registry.entries().await).await;
        assert_eq!(over, HashSet::from(["shared".to_string()]));

        store.append(spend(&owned, "alice", 1.0)).await.unwrap();
        reporter.invalidate_costs();
        let over = reporter.over_budget(&registry.entries().await).await;
        assert!(over.contains("own"));
    }

    #[tokio::test]
    async fn status_reports_windows_and_aggregates() {
        let a = credential(r#"{"id":"a","secret":"sk-aaaaaaaaaaaa","max_per_minute":1}"#);
        let b = credential(r#"{"id":"b","secret":"sk-bbbbbbbbbbbb","max_per_minute":0}"#);
        let (registry, store, reporter) = setup(vec![a.clone(), b]).await;

        registry.get("a").await.unwrap().record_success(Instant::now());
        store.append(spend(&a, "u", 0.5)).await.unwrap();

        let report = reporter.status().await;
        assert_eq!(report.total_credentials, 2);
        assert_eq!(report.active_credentials, 0);
        assert_eq!(report.total_requests_today, 1);
        assert!((report.total_cost_this_month - 0.5).abs() < 1e-9);

        let ka = report.keys.iter().find(|k| k.id == "a").unwrap();
        assert_eq!((ka.minute_used, ka.minute_limit), (1, 1));
        assert!(ka.resumes_at.is_some());
        assert!(!ka.key_preview.contains("aaaaaaaaaaaa"));

        let kb = report.keys.iter().find(|k| k.id == "b").unwrap();
        assert!(!kb.is_eligible);
        assert!(kb.resumes_at.is_none());
    }

    #[tokio::test]
    async fn stats_for_unknown_key_is_none() {
        let (_, _, reporter) = setup(vec![]).await;
        assert!(reporter.stats("missing").await.is_none());
    }
}
