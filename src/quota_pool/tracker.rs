//! 单个 Key 的配额追踪：分钟/小时/天三个滑动窗口 + 连续失败计数 + 限流冷却。
//!
//! 所有方法都是非挂起的临界区操作，由上层（`KeyEntry`）用每个 Key 一把的互斥锁串行化。
//! 时间统一使用单调时钟 `Instant`，由调用方传入，便于测试注入。

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(60 * 60);
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// 连续失败达到该次数后进入隔离期。
pub const FAILURE_THRESHOLD: u32 = 3;
/// 隔离期时长（自最后一次失败起算）。
pub const QUARANTINE: Duration = Duration::from_secs(5 * 60);
/// 上游未给出重置时间时的默认限流冷却。
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// 每个窗口的请求上限。上限为 0 表示该 Key 永远不可选（软禁用）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 3600,
            per_day: 86400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Auth,
    Server,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

    pub fn length(self) -> Duration {
        match self {
            Window::Minute => MINUTE,
            Window::Hour => HOUR,
            Window::Day => DAY,
        }
    }
}

/// 三个按时间顺序排列的已接纳请求时间戳序列，总是一起写入。
#[derive(Debug, Clone, Default)]
pub struct UsageWindow {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    day: VecDeque<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
}

impl UsageWindow {
    pub fn push(&mut self, now: Instant) {
        self.minute.push_back(now);
        self.hour.push_back(now);
        self.day.push_back(now);
    }

    /// 撤回一条已写入的时间戳；三个窗口各移除一个与 `ts` 相同的条目。
    pub fn remove(&mut self, ts: Instant) {
        remove_last(&mut self.minute, ts);
        remove_last(&mut self.hour, ts);
        remove_last(&mut self.day, ts);
    }

    /// 清理过期条目：`now - ts >= 窗口长度` 即过期，从队首移除。
    pub fn purge(&mut self, now: Instant) {
        purge_front(&mut self.minute, now, MINUTE);
        purge_front(&mut self.hour, now, HOUR);
        purge_front(&mut self.day, now, DAY);
    }

    pub fn counts(&self) -> WindowCounts {
        WindowCounts {
            minute: saturating_len(&self.minute),
            hour: saturating_len(&self.hour),
            day: saturating_len(&self.day),
        }
    }

    fn queue(&self, window: Window) -> &VecDeque<Instant> {
        match window {
            Window::Minute => &self.minute,
            Window::Hour => &self.hour,
            Window::Day => &self.day,
        }
    }

    fn is_empty(&self) -> bool {
        self.day.is_empty() && self.hour.is_empty() && self.minute.is_empty()
    }
}

fn purge_front(queue: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while let Some(&ts) = queue.front() {
        if now.saturating_duration_since(ts) >= length {
            queue.pop_front();
        } else {
            break;
        }
    }
}

fn remove_last(queue: &mut VecDeque<Instant>, ts: Instant) {
    if let Some(idx) = queue.iter().rposition(|t| *t == ts) {
        queue.remove(idx);
    }
}

fn saturating_len(queue: &VecDeque<Instant>) -> u32 {
    u32::try_from(queue.len()).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailureState {
    pub consecutive: u32,
    pub last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitHold {
    pub resolved_at: Instant,
}

/// 累计计数：限流与认证失败分开统计，便于区分“暂时被限流”和“Key 可能已失效”。
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LifetimeCounters {
    pub successes: u64,
    pub rate_limited: u64,
    pub auth_failures: u64,
    pub server_failures: u64,
    pub unknown_failures: u64,
}

/// 不可选的原因；`until` 为 `None` 表示不会自行恢复（例如上限为 0）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    RateLimited { until: Instant },
    Quarantined { until: Instant },
    QuotaExceeded { window: Window, until: Option<Instant> },
}

/// 下一次可用的时间点。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Now,
    At(Instant),
    Never,
}

#[derive(Debug, Clone)]
pub struct QuotaTracker {
    limits: QuotaLimits,
    window: UsageWindow,
    failures: FailureState,
    hold: Option<RateLimitHold>,
    counters: LifetimeCounters,
    last_used: Option<Instant>,
}

impl QuotaTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            window: UsageWindow::default(),
            failures: FailureState::default(),
            hold: None,
            counters: LifetimeCounters::default(),
            last_used: None,
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// 重新配置上限；已有窗口数据保持不变。
    pub fn set_limits(&mut self, limits: QuotaLimits) {
        self.limits = limits;
    }

    /// 记录一次成功请求：窗口未满时写入三个窗口，并重置失败计数、清除限流冷却。
    ///
    /// 返回本次是否被窗口接纳；检查与写入在同一临界区内完成，
    /// 因此并发调用不会超过上限。
    pub fn record_success(&mut self, now: Instant) -> bool {
        self.window.purge(now);
        let admitted = self.first_full_window().is_none();
        if admitted {
            self.window.push(now);
        }
        self.confirm_success(now);
        admitted
    }

    /// 预占一个配额槽位：仅当当前可选时写入窗口。
    ///
    /// 执行器在联系上游之前调用，从而不会对已知会超限的 Key 发出请求。
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if !self.is_eligible(now) {
            return false;
        }
        self.window.push(now);
        self.last_used = Some(now);
        true
    }

    /// 归还 `try_acquire` 在 `claimed_at` 占用的槽位。
    ///
    /// 请求未成功时调用：只有成功的请求才计入窗口。
    pub fn release(&mut self, claimed_at: Instant) {
        self.window.remove(claimed_at);
    }

    /// 已预占槽位的请求成功后调用：重置失败状态，清除限流冷却。
    pub fn confirm_success(&mut self, now: Instant) {
        self.failures = FailureState::default();
        self.hold = None;
        self.counters.successes = self.counters.successes.saturating_add(1);
        self.last_used = Some(now);
    }

    pub fn record_failure(&mut self, now: Instant, kind: FailureKind) {
        self.failures.consecutive = self.failures.consecutive.saturating_add(1);
        self.failures.last_failure = Some(now);
        let counter = match kind {
            FailureKind::Auth => &mut self.counters.auth_failures,
            FailureKind::Server => &mut self.counters.server_failures,
            FailureKind::Unknown => &mut self.counters.unknown_failures,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_rate_limited(&mut self, now: Instant, resolved_at: Option<Instant>) {
        let resolved_at = resolved_at.unwrap_or(now + DEFAULT_RATE_LIMIT_COOLDOWN);
        self.hold = Some(RateLimitHold { resolved_at });
        self.counters.rate_limited = self.counters.rate_limited.saturating_add(1);
    }

    pub fn is_eligible(&mut self, now: Instant) -> bool {
        self.check(now).is_ok()
    }

    /// 检查是否可选，并返回第一个阻塞原因。
    ///
    /// 会顺带清除已到期的限流冷却与隔离状态（隔离到期时连续失败计数归零）。
    pub fn check(&mut self, now: Instant) -> Result<(), Ineligible> {
        if let Some(hold) = self.hold {
            if now < hold.resolved_at {
                return Err(Ineligible::RateLimited {
                    until: hold.resolved_at,
                });
            }
            self.hold = None;
        }

        if let Some(until) = self.quarantined_until(now) {
            return Err(Ineligible::Quarantined { until });
        }

        self.window.purge(now);
        if let Some(window) = self.first_full_window() {
            return Err(Ineligible::QuotaExceeded {
                window,
                until: self.window_frees_at(window),
            });
        }
        Ok(())
    }

    /// 计算下一次可用时间：取所有阻塞原因中最晚恢复的那个。
    pub fn next_available_at(&mut self, now: Instant) -> Availability {
        if self.check(now).is_ok() {
            return Availability::Now;
        }

        let mut latest: Option<Instant> = None;
        let mut bump = |t: Instant| {
            latest = Some(latest.map_or(t, |l| l.max(t)));
        };

        if let Some(hold) = self.hold {
            bump(hold.resolved_at);
        }
        if let Some(until) = self.quarantined_until(now) {
            bump(until);
        }
        for window in Window::ALL {
            if self.count(window) < self.limit(window) {
                continue;
            }
            match self.window_frees_at(window) {
                Some(t) => bump(t),
                None => return Availability::Never,
            }
        }

        latest.map_or(Availability::Now, Availability::At)
    }

    pub fn purge(&mut self, now: Instant) {
        self.window.purge(now);
    }

    pub fn counts(&self) -> WindowCounts {
        self.window.counts()
    }

    pub fn failure_streak(&self) -> u32 {
        self.failures.consecutive
    }

    pub fn hold(&self) -> Option<RateLimitHold> {
        self.hold
    }

    pub fn counters(&self) -> LifetimeCounters {
        self.counters
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    /// 是否处于限流冷却或失败隔离中（与窗口配额无关）。
    pub fn is_suspended(&self, now: Instant) -> bool {
        let held = self.hold.is_some_and(|h| now < h.resolved_at);
        let quarantined = self.failures.consecutive >= FAILURE_THRESHOLD
            && self
                .failures
                .last_failure
                .is_some_and(|t| now.saturating_duration_since(t) < QUARANTINE);
        held || quarantined
    }

    /// 空闲且无任何状态，可被清理任务忽略。
    pub fn is_idle(&self) -> bool {
        self.window.is_empty() && self.hold.is_none() && self.failures.consecutive == 0
    }

    fn quarantined_until(&mut self, now: Instant) -> Option<Instant> {
        if self.failures.consecutive < FAILURE_THRESHOLD {
            return None;
        }
        match self.failures.last_failure {
            Some(last) if now.saturating_duration_since(last) < QUARANTINE => {
                Some(last + QUARANTINE)
            }
            _ => {
                self.failures.consecutive = 0;
                None
            }
        }
    }

    fn limit(&self, window: Window) -> u32 {
        match window {
            Window::Minute => self.limits.per_minute,
            Window::Hour => self.limits.per_hour,
            Window::Day => self.limits.per_day,
        }
    }

    fn count(&self, window: Window) -> u32 {
        saturating_len(self.window.queue(window))
    }

    fn first_full_window(&self) -> Option<Window> {
        Window::ALL
            .into_iter()
            .find(|w| self.count(*w) >= self.limit(*w))
    }

    /// 窗口内计数降到上限以下的时间点：第 (count - limit) 个时间戳过期之时。
    fn window_frees_at(&self, window: Window) -> Option<Instant> {
        let limit = self.limit(window);
        if limit == 0 {
            return None;
        }
        let queue = self.window.queue(window);
        let idx = queue.len().checked_sub(limit as usize)?;
        queue.get(idx).map(|ts| *ts + window.length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_minute: u32, per_hour: u32, per_day: u32) -> QuotaLimits {
        QuotaLimits {
            per_minute,
            per_hour,
            per_day,
        }
    }

    #[test]
    fn eligible_implies_every_window_below_ceiling() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(limits(3, 5, 7));

        for i in 0..20u64 {
            let now = t0 + Duration::from_secs(i * 7);
            if t.is_eligible(now) {
                let c = t.counts();
                assert!(c.minute < 3 && c.hour < 5 && c.day < 7);
                assert!(t.try_acquire(now));
            }
        }
        assert_eq!(t.counts().hour, 5);
    }

    #[test]
    fn entry_expires_exactly_at_window_length() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(limits(1, 100, 100));
        assert!(t.record_success(t0));
        assert!(!t.is_eligible(t0 + Duration::from_secs(59)));
        assert!(t.is_eligible(t0 + MINUTE));
    }

    #[test]
    fn purge_is_idempotent() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(QuotaLimits::default());
        for i in 0..10u64 {
            t.record_success(t0 + Duration::from_secs(i * 20));
        }
        let now = t0 + Duration::from_secs(200);
        t.purge(now);
        let once = t.counts();
        t.purge(now);
        assert_eq!(once, t.counts());
        assert_eq!(once.minute, 3);
        assert_eq!(once.hour, 10);
    }

    #[test]
    fn zero_ceiling_is_never_eligible() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(limits(0, 100, 100));
        assert!(!t.is_eligible(t0));
        assert!(!t.is_eligible(t0 + DAY * 3));
        assert_eq!(t.next_available_at(t0), Availability::Never);
        assert!(!t.try_acquire(t0));
    }

    #[test]
    fn three_failures_quarantine_for_five_minutes() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(QuotaLimits::default());
        t.record_failure(t0, FailureKind::Server);
        t.record_failure(t0, FailureKind::Auth);
        assert!(t.is_eligible(t0));
        let last = t0 + Duration::from_secs(10);
        t.record_failure(last, FailureKind::Unknown);

        assert!(!t.is_eligible(last + Duration::from_secs(299)));
        assert!(t.is_suspended(last + Duration::from_secs(299)));
        assert!(t.is_eligible(last + QUARANTINE));
        assert_eq!(t.failure_streak(), 0);
    }

    #[test]
    fn success_clears_quarantine_immediately() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(QuotaLimits::default());
        for _ in 0..3 {
            t.record_failure(t0, FailureKind::Server);
        }
        assert!(!t.is_eligible(t0 + Duration::from_secs(1)));
        t.record_success(t0 + Duration::from_secs(1));
        assert!(t.is_eligible(t0 + Duration::from_secs(2)));
        assert_eq!(t.failure_streak(), 0);
    }

    #[test]
    fn rate_limit_hold_defaults_to_sixty_seconds() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(QuotaLimits::default());
        t.record_rate_limited(t0, None);
        assert!(matches!(
            t.check(t0 + Duration::from_secs(30)),
            Err(Ineligible::RateLimited { .. })
        ));
        assert!(t.is_eligible(t0 + DEFAULT_RATE_LIMIT_COOLDOWN));
        assert!(t.hold().is_none());
        assert_eq!(t.counters().rate_limited, 1);
    }

    #[test]
    fn rate_limit_hold_clears_on_success() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(QuotaLimits::default());
        t.record_rate_limited(t0, Some(t0 + HOUR));
        t.record_success(t0 + Duration::from_secs(1));
        assert!(t.is_eligible(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn failures_do_not_touch_windows() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(QuotaLimits::default());
        t.record_failure(t0, FailureKind::Server);
        t.record_rate_limited(t0, None);
        assert_eq!(t.counts(), WindowCounts::default());
    }

    #[test]
    fn release_returns_claimed_slot() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let mut t = QuotaTracker::new(limits(2, 100, 100));
        assert!(t.try_acquire(t0));
        assert!(t.try_acquire(t1));
        assert!(!t.is_eligible(t1));

        t.release(t0);
        assert_eq!(t.counts(), WindowCounts { minute: 1, hour: 1, day: 1 });
        assert!(t.try_acquire(t1));
        assert_eq!(t.next_available_at(t1), Availability::At(t1 + MINUTE));

        // 重复归还同一时刻只移除一个条目
        t.release(t1);
        assert_eq!(t.counts().minute, 1);
        t.release(t1);
        t.release(t1);
        assert_eq!(t.counts(), WindowCounts::default());
    }

    #[test]
    fn record_success_refuses_beyond_ceiling() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(limits(2, 100, 100));
        assert!(t.record_success(t0));
        assert!(t.record_success(t0));
        assert!(!t.record_success(t0));
        assert_eq!(t.counts().minute, 2);
        assert_eq!(t.counters().successes, 3);
    }

    #[test]
    fn next_available_at_uses_latest_blocker() {
        let t0 = Instant::now();
        let mut t = QuotaTracker::new(limits(2, 100, 100));
        t.try_acquire(t0);
        t.try_acquire(t0 + Duration::from_secs(10));
        assert_eq!(
            t.next_available_at(t0 + Duration::from_secs(20)),
            Availability::At(t0 + MINUTE)
        );

        t.record_rate_limited(t0 + Duration::from_secs(20), Some(t0 + Duration::from_secs(90)));
        assert_eq!(
            t.next_available_at(t0 + Duration::from_secs(20)),
            Availability::At(t0 + Duration::from_secs(90))
        );
    }
}
