//! Key 注册表：启用/禁用/移除的唯一入口。
//!
//! 两级锁：
//! - 外层 `RwLock<BTreeMap>` 只在取快照或增删时持有，从不跨越 I/O；
//! - 每个 Key 一把 `Mutex<QuotaTracker>`，检查与写入在同一临界区完成。

use crate::credential::{Credential, CredentialId, RequestScope};
use crate::quota_pool::tracker::{Availability, FailureKind, QuotaTracker};
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("未找到 Key: {0}")]
    NotFound(CredentialId),
}

/// 注册表中的一项：可原子替换的策略 + 受互斥锁保护的配额状态。
#[derive(Debug)]
pub struct KeyEntry {
    credential: ArcSwap<Credential>,
    tracker: Mutex<QuotaTracker>,
}

impl KeyEntry {
    pub fn new(credential: Credential) -> Self {
        let tracker = QuotaTracker::new(credential.limits);
        Self {
            credential: ArcSwap::from_pointee(credential),
            tracker: Mutex::new(tracker),
        }
    }

    pub fn credential(&self) -> Arc<Credential> {
        self.credential.load_full()
    }

    pub fn id(&self) -> CredentialId {
        self.credential.load().id.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.credential.load().enabled
    }

    /// 在该 Key 的临界区内访问 tracker。闭包内不得挂起。
    pub fn with_tracker<R>(&self, f: impl FnOnce(&mut QuotaTracker) -> R) -> R {
        let mut guard = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.is_enabled() && self.with_tracker(|t| t.is_eligible(now))
    }

    /// 可选则立即占用一个窗口槽位。
    pub fn try_acquire(&self, now: Instant) -> bool {
        self.is_enabled() && self.with_tracker(|t| t.try_acquire(now))
    }

    pub fn release(&self, claimed_at: Instant) {
        self.with_tracker(|t| t.release(claimed_at));
    }

    pub fn record_success(&self, now: Instant) -> bool {
        self.with_tracker(|t| t.record_success(now))
    }

    pub fn confirm_success(&self, now: Instant) {
        self.with_tracker(|t| t.confirm_success(now));
    }

    pub fn record_failure(&self, now: Instant, kind: FailureKind) {
        self.with_tracker(|t| t.record_failure(now, kind));
    }

    pub fn record_rate_limited(&self, now: Instant, resolved_at: Option<Instant>) {
        self.with_tracker(|t| t.record_rate_limited(now, resolved_at));
    }

    pub fn next_available_at(&self, now: Instant) -> Availability {
        if !self.is_enabled() {
            return Availability::Never;
        }
        self.with_tracker(|t| t.next_available_at(now))
    }

    fn set_enabled(&self, enabled: bool) {
        self.credential.rcu(|current| {
            let mut next = Credential::clone(current);
            next.enabled = enabled;
            next
        });
    }

    /// 替换策略；窗口与失败状态保持不变，仅同步新的窗口上限。
    fn update_policy(&self, credential: Credential) {
        let limits = credential.limits;
        self.credential.store(Arc::new(credential));
        self.with_tracker(|t| t.set_limits(limits));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReloadSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Default)]
pub struct KeyRegistry {
    entries: RwLock<BTreeMap<CredentialId, Arc<KeyEntry>>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let registry = Self::new();
        for c in credentials {
            registry.register(c).await;
        }
        registry
    }

    /// 按 id 幂等注册：已存在时不做任何修改，返回 false。
    pub async fn register(&self, credential: Credential) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&credential.id) {
            return false;
        }
        entries.insert(credential.id.clone(), Arc::new(KeyEntry::new(credential)));
        true
    }

    /// 新增或更新策略（保留已有的配额状态）。
    pub async fn upsert(&self, credential: Credential) -> Arc<KeyEntry> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&credential.id) {
            entry.update_policy(credential);
            return entry.clone();
        }
        let entry = Arc::new(KeyEntry::new(credential));
        entries.insert(entry.id(), entry.clone());
        entry
    }

    /// 移除后，正在使用该 Key 的调用仍持有 `Arc<KeyEntry>`，可正常完成。
    pub async fn remove(&self, id: &str) -> Result<Arc<KeyEntry>, RegistryError> {
        self.entries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn enable(&self, id: &str) -> Result<(), RegistryError> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> Result<(), RegistryError> {
        self.set_enabled(id, false).await
    }

    /// 只修改启用标记，不触碰配额与失败状态。
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        let entry = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.set_enabled(enabled);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<KeyEntry>> {
        self.entries.read().await.get(id).cloned()
    }

    /// 所有启用的 Key（不考虑配额状态），按 id 排序。
    pub async fn list_enabled(&self) -> Vec<Arc<Credential>> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.credential())
            .filter(|c| c.enabled)
            .collect()
    }

    /// 全部条目快照，按 id 排序。
    pub async fn entries(&self) -> Vec<Arc<KeyEntry>> {
        self.entries.read().await.values().cloned().collect()
    }

    /// 能服务于该调用范围的条目快照（含禁用项，由选择器过滤）。
    pub async fn candidates(&self, scope: &RequestScope) -> Vec<Arc<KeyEntry>> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.credential().serves(scope))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 以新的配置列表整体替换：保留仍存在的 Key 的配额状态，新增缺失项，移除多余项。
    pub async fn reload(&self, credentials: Vec<Credential>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut entries = self.entries.write().await;

        let incoming: std::collections::HashSet<CredentialId> =
            credentials.iter().map(|c| c.id.clone()).collect();
        let before = entries.len();
        entries.retain(|id, _| incoming.contains(id));
        summary.removed = before - entries.len();

        for credential in credentials {
            match entries.get(&credential.id) {
                Some(entry) => {
                    if *entry.credential() != credential {
                        entry.update_policy(credential);
                        summary.updated += 1;
                    }
                }
                None => {
                    entries.insert(credential.id.clone(), Arc::new(KeyEntry::new(credential)));
                    summary.added += 1;
                }
            }
        }
        summary
    }

    /// 清理所有 Key 的过期窗口条目。外层锁仅用于取快照。
    pub async fn purge_all(&self, now: Instant) -> usize {
        let entries = self.entries().await;
        for entry in &entries {
            entry.with_tracker(|t| t.purge(now));
        }
        entries.len()
    }
}
