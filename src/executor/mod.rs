//! 请求执行器：选择 Key → 调用上游 → 按错误分类轮换 / 退避重试 / 失败。
//!
//! 挂起点只有两个：上游调用本身和退避等待；二者都不持有任何锁。

pub mod classify;

pub use classify::{ClassifyError, ErrorClass, classify_status};

use crate::credential::{Credential, CredentialId, RequestScope};
use crate::logging::{self, LogLevel};
use crate::quota_pool::registry::KeyEntry;
use crate::quota_pool::tracker::{Availability, FailureKind};
use crate::quota_pool::{KeyRegistry, selector};
use crate::runtime_config::RuntimeConfig;
use crate::usage::{AttemptOutcome, Metered, Metering, UsageRecord, UsageReporter};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 单次调用最多尝试次数（含首次）。
    pub max_retries: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// 上游未给出重置时间时的限流冷却。
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次（从 0 开始）退避的等待时间：min(base * 2^attempt, cap)。
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

#[derive(Debug, Error)]
pub enum RotationError<E> {
    #[error("没有可用的 Key")]
    NoAvailableKeys,

    #[error("所有 Key 均已尝试失败（共 {attempts} 次）")]
    AllKeysExhausted { attempts: usize },

    #[error(transparent)]
    Upstream(E),
}

impl<E> RotationError<E> {
    pub fn upstream(&self) -> Option<&E> {
        match self {
            RotationError::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

/// 等待可用 Key 时单次休眠的起始值与上限；每轮翻倍。
const WAIT_STEP: Duration = Duration::from_secs(1);
const WAIT_STEP_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub scope: RequestScope,
    pub model: Option<String>,
    /// 覆盖运行时配置中的最大尝试次数。
    pub max_retries: Option<usize>,
    /// 没有可用 Key 时最多等待多久；`None` 时使用运行时配置（默认不等待）。
    pub max_wait: Option<Duration>,
}

impl ExecuteOptions {
    pub fn for_scope(scope: RequestScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }
}

enum LastFailure<E> {
    Rotated,
    Transient(E),
}

/// 一次尝试占用的窗口槽位。
///
/// 未确认成功就被丢弃（失败、或调用方取消了请求）时归还槽位。
struct Claim {
    entry: Arc<KeyEntry>,
    at: Instant,
    settled: bool,
}

impl Claim {
    fn new(entry: Arc<KeyEntry>, at: Instant) -> Self {
        Self {
            entry,
            at,
            settled: false,
        }
    }

    fn try_acquire(entry: Arc<KeyEntry>) -> Option<Self> {
        let now = Instant::now();
        entry.try_acquire(now).then(|| Self::new(entry, now))
    }

    fn confirm(mut self, now: Instant) {
        self.entry.confirm_success(now);
        self.settled = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.settled {
            self.entry.release(self.at);
        }
    }
}

pub struct RequestExecutor {
    registry: Arc<KeyRegistry>,
    usage: Arc<UsageReporter>,
    runtime: Arc<RuntimeConfig>,
}

impl RequestExecutor {
    pub fn new(
        registry: Arc<KeyRegistry>,
        usage: Arc<UsageReporter>,
        runtime: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            registry,
            usage,
            runtime,
        }
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    /// 用选中的 Key 执行 `call`，按错误分类自动轮换或重试。
    ///
    /// `call` 每次尝试被调用一次，参数为本次使用的 Key。
    pub async fn execute<T, E, F, Fut>(
        &self,
        opts: &ExecuteOptions,
        mut call: F,
    ) -> Result<T, RotationError<E>>
    where
        F: FnMut(Arc<Credential>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Metered,
        E: ClassifyError,
    {
        let settings = self.runtime.get();
        let level = settings.log_level();
        let policy = settings.retry_policy();
        let max_attempts = opts.max_retries.unwrap_or(policy.max_retries).max(1);
        let deadline = opts
            .max_wait
            .or_else(|| settings.max_wait())
            .map(|wait| Instant::now() + wait);

        let mut exclude: HashSet<CredentialId> = HashSet::new();
        let mut retry_on: Option<Arc<KeyEntry>> = None;
        let mut last: Option<LastFailure<E>> = None;
        let mut attempts = 0usize;

        while attempts < max_attempts {
            // 暂时性错误优先在同一个 Key 上重试；该 Key 已不可用时重新选择。
            let retried = match retry_on.take() {
                Some(entry) => self.reacquire(entry).await,
                None => None,
            };
            let claim = match retried {
                Some(claim) => claim,
                None => match self.acquire(&opts.scope, &exclude, level, deadline).await {
                    Some(claim) => claim,
                    None if attempts == 0 => {
                        tracing::warn!(user = ?opts.scope.user, "没有可用的 Key");
                        return Err(RotationError::NoAvailableKeys);
                    }
                    None => break,
                },
            };

            attempts += 1;
            let entry = claim.entry.clone();
            let credential = entry.credential();
            let started = Instant::now();
            let result = call(credential.clone()).await;
            let latency = started.elapsed();
            let now = Instant::now();

            let err = match result {
                Ok(value) => {
                    claim.confirm(now);
                    self.record(&credential, opts, AttemptOutcome::Success, latency, value.metering())
                        .await;
                    if level.client_enabled() {
                        tracing::info!(
                            key = %credential.label,
                            attempt = attempts,
                            latency_ms = logging::format_duration_ms(latency),
                            "调用成功"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            // 只有成功的请求计入窗口
            drop(claim);

            match err.classify() {
                ErrorClass::RateLimited { retry_after } => {
                    let cooldown = retry_after.unwrap_or(policy.rate_limit_cooldown);
                    entry.record_rate_limited(now, Some(now + cooldown));
                    self.record(&credential, opts, AttemptOutcome::RateLimited, latency, Metering::default())
                        .await;
                    tracing::warn!(
                        key = %credential.label,
                        attempt = attempts,
                        cooldown_ms = logging::format_duration_ms(cooldown),
                        "Key 被上游限流，切换下一个 Key"
                    );
                    exclude.insert(credential.id.clone());
                    last = Some(LastFailure::Rotated);
                }
                ErrorClass::Auth => {
                    entry.record_failure(now, FailureKind::Auth);
                    self.record(&credential, opts, AttemptOutcome::AuthFailure, latency, Metering::default())
                        .await;
                    tracing::warn!(
                        key = %credential.label,
                        attempt = attempts,
                        error = %err,
                        "Key 认证失败，切换下一个 Key（请检查该 Key 是否仍然有效）"
                    );
                    exclude.insert(credential.id.clone());
                    last = Some(LastFailure::Rotated);
                }
                ErrorClass::Transient => {
                    entry.record_failure(now, FailureKind::Server);
                    self.record(&credential, opts, AttemptOutcome::ServerError, latency, Metering::default())
                        .await;
                    if attempts < max_attempts {
                        let step = u32::try_from(attempts - 1).unwrap_or(u32::MAX);
                        let delay = policy.backoff_delay(step);
                        tracing::warn!(
                            key = %credential.label,
                            attempt = attempts,
                            delay_ms = logging::format_duration_ms(delay),
                            error = %err,
                            "上游暂时性错误，退避后重试"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    retry_on = Some(entry);
                    last = Some(LastFailure::Transient(err));
                }
                ErrorClass::Unknown => {
                    entry.record_failure(now, FailureKind::Unknown);
                    self.record(&credential, opts, AttemptOutcome::UnknownError, latency, Metering::default())
                        .await;
                    if level.client_enabled() {
                        tracing::info!(key = %credential.label, attempt = attempts, error = %err, "上游返回未分类错误，直接返回");
                    }
                    return Err(RotationError::Upstream(err));
                }
            }
        }

        match last {
            Some(LastFailure::Transient(err)) => Err(RotationError::Upstream(err)),
            _ => {
                tracing::warn!(attempts, "所有 Key 均已尝试失败");
                Err(RotationError::AllKeysExhausted { attempts })
            }
        }
    }

    /// 暂时性错误后在同一个 Key 上重新占用槽位；超出月度费用上限或已不可选时返回 `None`。
    async fn reacquire(&self, entry: Arc<KeyEntry>) -> Option<Claim> {
        let over = self.usage.over_budget(std::slice::from_ref(&entry)).await;
        if !over.is_empty() {
            return None;
        }
        Claim::try_acquire(entry)
    }

    /// 选择并占用一个 Key；给出 `deadline` 时，没有可用 Key 就等到最早恢复的那个。
    ///
    /// 单次休眠从 1 秒起翻倍，最长 60 秒，且不超过最早恢复时间与截止时间。
    async fn acquire(
        &self,
        scope: &RequestScope,
        exclude: &HashSet<CredentialId>,
        level: LogLevel,
        deadline: Option<Instant>,
    ) -> Option<Claim> {
        let mut step = WAIT_STEP;
        loop {
            let until = match self.select(scope, exclude, level).await {
                Ok(claim) => return Some(claim),
                Err(Availability::Never) => return None,
                Err(Availability::Now) => None,
                Err(Availability::At(t)) => Some(t),
            };

            let now = Instant::now();
            let remaining = deadline?.checked_duration_since(now).filter(|d| !d.is_zero())?;
            let mut pause = step.min(remaining);
            if let Some(t) = until {
                pause = pause.min(t.saturating_duration_since(now));
            }
            tracing::info!(wait_ms = logging::format_duration_ms(pause), "暂无可用的 Key，等待后重试");
            tokio::time::sleep(pause).await;
            step = step.saturating_mul(2).min(WAIT_STEP_CAP);
        }
    }

    /// 选择并占用一个 Key：排除本次调用已轮换掉的 Key 以及超出月度费用上限的 Key。
    ///
    /// 没有可占用的 Key 时返回剩余候选项最早恢复的时间。
    async fn select(
        &self,
        scope: &RequestScope,
        exclude: &HashSet<CredentialId>,
        level: LogLevel,
    ) -> Result<Claim, Availability> {
        let candidates = self.registry.candidates(scope).await;
        let mut blocked = self.usage.over_budget(&candidates).await;
        blocked.extend(exclude.iter().cloned());

        let now = Instant::now();
        let picked = selector::acquire_excluding(&candidates, now, &blocked);
        if level.selection_enabled() {
            let label = picked
                .as_ref()
                .map(|e| e.credential().label.clone())
                .unwrap_or_else(|| "-".to_string());
            tracing::info!(
                candidates = candidates.len(),
                excluded = blocked.len(),
                picked = %label,
                "选择 Key"
            );
        }
        match picked {
            Some(entry) => Ok(Claim::new(entry, now)),
            None => Err(selector::next_available(&candidates, Instant::now(), &blocked)),
        }
    }

    async fn record(
        &self,
        credential: &Credential,
        opts: &ExecuteOptions,
        outcome: AttemptOutcome,
        latency: Duration,
        metering: Metering,
    ) {
        let record = UsageRecord::new(
            credential,
            opts.scope.user.as_deref(),
            opts.model.as_deref(),
            outcome,
            latency,
            metering,
        );
        self.usage.record(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialDescriptor;
    use crate::quota_pool::tracker::WindowCounts;
    use crate::runtime_config::RuntimeSettings;
    use crate::usage::UsageStore;
    use crate::usage::reporter::DEFAULT_COST_CACHE_TTL;
    use crate::usage::store::MemoryUsageStore;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("rate limited")]
        RateLimited(Option<Duration>),
        #[error("unauthorized")]
        Auth,
        #[error("server error")]
        Server,
        #[error("bad request")]
        BadRequest,
    }

    impl ClassifyError for FakeError {
        fn classify(&self) -> ErrorClass {
            match self {
                FakeError::RateLimited(retry_after) => ErrorClass::RateLimited {
                    retry_after: *retry_after,
                },
                FakeError::Auth => ErrorClass::Auth,
                FakeError::Server => ErrorClass::Transient,
                FakeError::BadRequest => ErrorClass::Unknown,
            }
        }
    }

    struct Harness {
        executor: RequestExecutor,
        registry: Arc<KeyRegistry>,
        store: Arc<MemoryUsageStore>,
        usage: Arc<UsageReporter>,
    }

    fn cred(json: &str) -> Credential {
        let desc: CredentialDescriptor = sonic_rs::from_str(json).unwrap();
        Credential::from_descriptor(desc, 0)
    }

    async fn harness(creds: Vec<Credential>) -> Harness {
        let registry = Arc::new(KeyRegistry::from_credentials(creds).await);
        let store = Arc::new(MemoryUsageStore::default());
        let usage = Arc::new(UsageReporter::new(
            registry.clone(),
            store.clone(),
            DEFAULT_COST_CACHE_TTL,
        ));
        let runtime = Arc::new(RuntimeConfig::new(RuntimeSettings {
            backoff_base_ms: 1,
            backoff_cap_secs: 1,
            ..RuntimeSettings::default()
        }));
        Harness {
            executor: RequestExecutor::new(registry.clone(), usage.clone(), runtime),
            registry,
            store,
            usage,
        }
    }

    /// 依次返回预设结果，之后一律成功；记录每次使用的 Key id。
    struct Script {
        responses: Mutex<VecDeque<Result<(), FakeError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl Script {
        fn new(responses: Vec<Result<(), FakeError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    async fn run(
        h: &Harness,
        script: &Arc<Script>,
        opts: &ExecuteOptions,
    ) -> Result<(), RotationError<FakeError>> {
        h.executor
            .execute(opts, |c: Arc<Credential>| {
                let script = script.clone();
                async move {
                    script.seen.lock().unwrap().push(c.id.clone());
                    script.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
                }
            })
            .await
    }

    #[tokio::test]
    async fn picks_lowest_priority_value() {
        let h = harness(vec![
            cred(r#"{"id":"p3","secret":"s3","priority":3}"#),
            cred(r#"{"id":"p1","secret":"s1","priority":1}"#),
            cred(r#"{"id":"p2","secret":"s2","priority":2}"#),
        ])
        .await;
        let script = Script::new(vec![]);
        run(&h, &script, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(script.seen(), ["p1"]);
    }

    #[tokio::test]
    async fn spills_over_when_minute_ceiling_reached() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1,"max_per_minute":2}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2,"max_per_minute":100}"#),
        ])
        .await;
        let script = Script::new(vec![]);
        for _ in 0..3 {
            run(&h, &script, &ExecuteOptions::default()).await.unwrap();
        }
        assert_eq!(script.seen(), ["a", "a", "b"]);
    }

    #[tokio::test]
    async fn rate_limited_rotates_without_caller_error() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2}"#),
        ])
        .await;
        let script = Script::new(vec![Err(FakeError::RateLimited(None))]);
        run(&h, &script, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(script.seen(), ["a", "b"]);

        let a = h.registry.get("a").await.unwrap();
        let now = Instant::now();
        assert!(!a.is_eligible(now));
        assert!(matches!(a.next_available_at(now), Availability::At(_)));
        assert_eq!(a.with_tracker(|t| t.counters().rate_limited), 1);
    }

    #[tokio::test]
    async fn retry_after_sets_hold_length() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2}"#),
        ])
        .await;
        let script = Script::new(vec![Err(FakeError::RateLimited(Some(Duration::from_secs(5))))]);
        let before = Instant::now();
        run(&h, &script, &ExecuteOptions::default()).await.unwrap();

        let a = h.registry.get("a").await.unwrap();
        let hold = a.with_tracker(|t| t.hold()).unwrap();
        assert!(hold.resolved_at >= before + Duration::from_secs(5));
        assert!(hold.resolved_at < before + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn all_disabled_fails_without_calling_upstream() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","enabled":false}"#),
            cred(r#"{"id":"b","secret":"sb","enabled":false}"#),
        ])
        .await;
        let script = Script::new(vec![]);
        let err = run(&h, &script, &ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, RotationError::NoAvailableKeys));
        assert!(script.seen().is_empty());
        assert_eq!(h.store.len().await, 0);
    }

    #[tokio::test]
    async fn auth_failures_exhaust_keys() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2}"#),
        ])
        .await;
        let script = Script::new(vec![Err(FakeError::Auth), Err(FakeError::Auth)]);
        let err = run(&h, &script, &ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, RotationError::AllKeysExhausted { attempts: 2 }));
        assert_eq!(script.seen(), ["a", "b"]);
        let a = h.registry.get("a").await.unwrap();
        assert_eq!(a.with_tracker(|t| t.counters().auth_failures), 1);
    }

    #[tokio::test]
    async fn max_retries_bounds_rotation() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2}"#),
            cred(r#"{"id":"c","secret":"sc","priority":3}"#),
        ])
        .await;
        let script = Script::new(vec![
            Err(FakeError::RateLimited(None)),
            Err(FakeError::RateLimited(None)),
        ]);
        let opts = ExecuteOptions {
            max_retries: Some(2),
            ..ExecuteOptions::default()
        };
        let err = run(&h, &script, &opts).await.unwrap_err();
        assert!(matches!(err, RotationError::AllKeysExhausted { attempts: 2 }));
        assert_eq!(script.seen(), ["a", "b"]);
    }

    #[tokio::test]
    async fn transient_errors_retry_same_key_then_surface_last_error() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2}"#),
        ])
        .await;
        let script = Script::new(vec![
            Err(FakeError::Server),
            Err(FakeError::Server),
            Err(FakeError::Server),
        ]);
        let err = run(&h, &script, &ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, RotationError::Upstream(FakeError::Server)));
        assert_eq!(script.seen(), ["a", "a", "a"]);

        // 三次连续失败后进入隔离期，下一次调用落到 b。
        let next = Script::new(vec![]);
        run(&h, &next, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(next.seen(), ["b"]);
    }

    #[tokio::test]
    async fn transient_then_success_resets_streak() {
        let h = harness(vec![cred(r#"{"id":"a","secret":"sa"}"#)]).await;
        let script = Script::new(vec![Err(FakeError::Server)]);
        run(&h, &script, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(script.seen(), ["a", "a"]);
        let a = h.registry.get("a").await.unwrap();
        assert_eq!(a.with_tracker(|t| t.failure_streak()), 0);
        assert_eq!(a.with_tracker(|t| t.counts().minute), 1);
    }

    #[tokio::test]
    async fn transient_retry_keeps_key_with_one_slot_left() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1,"max_per_minute":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2}"#),
        ])
        .await;
        let script = Script::new(vec![Err(FakeError::Server)]);
        run(&h, &script, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(script.seen(), ["a", "a"]);

        let a = h.registry.get("a").await.unwrap();
        assert_eq!(a.with_tracker(|t| t.counts().minute), 1);
        let b = h.registry.get("b").await.unwrap();
        assert_eq!(b.with_tracker(|t| t.counts().minute), 0);
    }

    #[tokio::test]
    async fn failed_attempts_do_not_consume_window() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1,"max_per_minute":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2,"max_per_minute":1}"#),
        ])
        .await;
        let script = Script::new(vec![Err(FakeError::Auth), Err(FakeError::BadRequest)]);
        run(&h, &script, &ExecuteOptions::default()).await.unwrap_err();
        assert_eq!(script.seen(), ["a", "b"]);

        for id in ["a", "b"] {
            let entry = h.registry.get(id).await.unwrap();
            assert_eq!(entry.with_tracker(|t| t.counts()), WindowCounts::default());
        }
    }

    #[tokio::test]
    async fn transient_retry_rechecks_monthly_budget() {
        let capped = cred(r#"{"id":"a","secret":"sa","priority":1,"monthly_cost_limit":1.0}"#);
        let h = harness(vec![capped.clone(), cred(r#"{"id":"b","secret":"sb","priority":2}"#)]).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (store, usage) = (h.store.clone(), h.usage.clone());
        let capped = Arc::new(capped);
        h.executor
            .execute(&ExecuteOptions::default(), |c: Arc<Credential>| {
                let seen = seen.clone();
                let (store, usage, capped) = (store.clone(), usage.clone(), capped.clone());
                async move {
                    seen.lock().unwrap().push(c.id.clone());
                    if c.id != "a" {
                        return Ok(());
                    }
                    // 失败的这次请求仍产生了费用，使 a 超出上限
                    store
                        .append(UsageRecord::new(
                            &capped,
                            None,
                            None,
                            AttemptOutcome::Success,
                            Duration::ZERO,
                            Metering {
                                cost: Some(2.0),
                                ..Metering::default()
                            },
                        ))
                        .await
                        .unwrap();
                    usage.invalidate_costs();
                    Err(FakeError::Server)
                }
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn waits_for_rate_limit_hold_to_clear() {
        let h = harness(vec![cred(r#"{"id":"a","secret":"sa"}"#)]).await;
        let a = h.registry.get("a").await.unwrap();
        let held_from = Instant::now();
        a.record_rate_limited(held_from, Some(held_from + Duration::from_millis(50)));

        let script = Script::new(vec![]);
        let err = run(&h, &script, &ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, RotationError::NoAvailableKeys));

        let opts = ExecuteOptions {
            max_wait: Some(Duration::from_secs(5)),
            ..ExecuteOptions::default()
        };
        run(&h, &script, &opts).await.unwrap();
        assert_eq!(script.seen(), ["a"]);
        assert!(held_from.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_gives_up_at_deadline() {
        let h = harness(vec![cred(r#"{"id":"a","secret":"sa"}"#)]).await;
        let a = h.registry.get("a").await.unwrap();
        let now = Instant::now();
        a.record_rate_limited(now, Some(now + Duration::from_secs(60)));

        let opts = ExecuteOptions {
            max_wait: Some(Duration::from_millis(30)),
            ..ExecuteOptions::default()
        };
        let script = Script::new(vec![]);
        let started = Instant::now();
        let err = run(&h, &script, &opts).await.unwrap_err();
        assert!(matches!(err, RotationError::NoAvailableKeys));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(script.seen().is_empty());
    }

    #[tokio::test]
    async fn wait_does_not_block_on_keys_that_never_recover() {
        let h = harness(vec![cred(r#"{"id":"a","secret":"sa","max_per_minute":0}"#)]).await;
        let opts = ExecuteOptions {
            max_wait: Some(Duration::from_secs(60)),
            ..ExecuteOptions::default()
        };
        let script = Script::new(vec![]);
        let started = Instant::now();
        let err = run(&h, &script, &opts).await.unwrap_err();
        assert!(matches!(err, RotationError::NoAvailableKeys));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unknown_error_fails_fast() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2}"#),
        ])
        .await;
        let script = Script::new(vec![Err(FakeError::BadRequest)]);
        let err = run(&h, &script, &ExecuteOptions::default()).await.unwrap_err();
        assert!(matches!(err, RotationError::Upstream(FakeError::BadRequest)));
        assert_eq!(script.seen(), ["a"]);
    }

    #[tokio::test]
    async fn every_attempt_is_recorded() {
        let h = harness(vec![
            cred(r#"{"id":"a","secret":"sa","priority":1}"#),
            cred(r#"{"id":"b","secret":"sb","priority":2,"cost_per_1k_tokens":2.0}"#),
        ])
        .await;
        let opts = ExecuteOptions {
            scope: RequestScope::new(Some("alice".into()), None),
            model: Some("gpt-4o-mini".into()),
            ..ExecuteOptions::default()
        };
        let calls = Arc::new(Mutex::new(0u32));
        let result = h
            .executor
            .execute(&opts, |_c: Arc<Credential>| {
                let calls = calls.clone();
                async move {
                    let mut n = calls.lock().unwrap();
                    *n += 1;
                    if *n == 1 {
                        Err(FakeError::Auth)
                    } else {
                        Ok(Metering::tokens(300, 200))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result.total_tokens(), 500);

        let records = h.store.since(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, AttemptOutcome::AuthFailure);
        assert_eq!(records[1].outcome, AttemptOutcome::Success);
        assert_eq!(records[1].credential_id, "b");
        assert_eq!(records[1].user.as_deref(), Some("alice"));
        assert_eq!(records[1].model.as_deref(), Some("gpt-4o-mini"));
        assert!((records[1].cost - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn over_budget_key_is_skipped() {
        let capped = cred(r#"{"id":"a","secret":"sa","priority":1,"monthly_cost_limit":1.0}"#);
        let h = harness(vec![capped.clone(), cred(r#"{"id":"b","secret":"sb","priority":2}"#)]).await;
        h.store
            .append(UsageRecord::new(
                &capped,
                None,
                None,
                AttemptOutcome::Success,
                Duration::ZERO,
                Metering {
                    cost: Some(1.5),
                    ..Metering::default()
                },
            ))
            .await
            .unwrap();

        let script = Script::new(vec![]);
        run(&h, &script, &ExecuteOptions::default()).await.unwrap();
        assert_eq!(script.seen(), ["b"]);
    }

    #[tokio::test]
    async fn scope_limits_candidates() {
        let h = harness(vec![
            cred(r#"{"id":"mine","secret":"sa","priority":1,"owner":"alice"}"#),
            cred(r#"{"id":"shared","secret":"sb","priority":2}"#),
        ])
        .await;

        let bob = ExecuteOptions::for_scope(RequestScope::new(Some("bob".into()), None));
        let script = Script::new(vec![]);
        run(&h, &script, &bob).await.unwrap();
        assert_eq!(script.seen(), ["shared"]);

        let alice = ExecuteOptions::for_scope(RequestScope::new(Some("alice".into()), None));
        let script = Script::new(vec![]);
        run(&h, &script, &alice).await.unwrap();
        assert_eq!(script.seen(), ["mine"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_respect_minute_ceiling() {
        const K: usize = 12;
        let h = Arc::new(
            harness(vec![cred(&format!(
                r#"{{"id":"a","secret":"sa","max_per_minute":{}}}"#,
                K - 1
            ))])
            .await,
        );

        let barrier = Arc::new(tokio::sync::Barrier::new(K));
        let mut handles = Vec::new();
        for _ in 0..K {
            let h = h.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let script = Script::new(vec![]);
                run(&h, &script, &ExecuteOptions::default()).await
            }));
        }

        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(RotationError::NoAvailableKeys) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, rejected), (K - 1, 1));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(p.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(p.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(p.backoff_delay(40), Duration::from_secs(10));
    }
}
