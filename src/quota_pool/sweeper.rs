//! 后台清理任务：周期性清掉各 Key 的过期窗口条目，避免空闲 Key 的时间戳长期堆积。
//!
//! 选择路径本身在每次检查前都会惰性清理，这里只是兜底。

use crate::quota_pool::KeyRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub fn spawn_purge_task(registry: Arc<KeyRegistry>, interval: Duration) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        DEFAULT_PURGE_INTERVAL
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，跳过。
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let swept = sweep_once(&registry, Instant::now()).await;
            tracing::debug!(keys = swept, "配额窗口清理完成");
        }
    })
}

pub async fn sweep_once(registry: &KeyRegistry, now: Instant) -> usize {
    registry.purge_all(now).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{Credential, CredentialDescriptor};
    use crate::quota_pool::tracker::HOUR;

    #[tokio::test]
    async fn sweep_drops_expired_entries() {
        let desc: CredentialDescriptor = sonic_rs::from_str(r#"{"secret":"sk-x"}"#).unwrap();
        let registry = KeyRegistry::from_credentials([Credential::from_descriptor(desc, 0)]).await;
        let entry = registry.get("key_1").await.unwrap();

        let t0 = Instant::now();
        entry.record_success(t0);
        entry.record_success(t0);

        assert_eq!(sweep_once(&registry, t0 + HOUR).await, 1);
        let counts = entry.with_tracker(|t| t.counts());
        assert_eq!((counts.minute, counts.hour, counts.day), (0, 0, 2));
    }
}
