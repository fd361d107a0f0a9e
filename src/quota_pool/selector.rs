//! 选择算法：在启用且当前可选的 Key 中取 (priority 升序, id 升序) 最小者。
//!
//! 同一快照、同一时刻下结果确定。

use crate::credential::CredentialId;
use crate::quota_pool::registry::KeyEntry;
use crate::quota_pool::tracker::Availability;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// 按排序键列出未被排除的候选项。
fn ranked<'a>(
    candidates: &'a [Arc<KeyEntry>],
    exclude: &HashSet<CredentialId>,
) -> Vec<&'a Arc<KeyEntry>> {
    let mut out: Vec<(u32, CredentialId, &Arc<KeyEntry>)> = candidates
        .iter()
        .filter_map(|e| {
            let c = e.credential();
            if !c.enabled || exclude.contains(&c.id) {
                return None;
            }
            Some((c.priority, c.id.clone(), e))
        })
        .collect();
    out.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    out.into_iter().map(|(_, _, e)| e).collect()
}

pub fn pick(candidates: &[Arc<KeyEntry>], now: Instant) -> Option<Arc<KeyEntry>> {
    pick_excluding(candidates, now, &HashSet::new())
}

/// 与 `pick` 相同，但会跳过 exclude 内的 id。只读，不占用配额。
pub fn pick_excluding(
    candidates: &[Arc<KeyEntry>],
    now: Instant,
    exclude: &HashSet<CredentialId>,
) -> Option<Arc<KeyEntry>> {
    ranked(candidates, exclude)
        .into_iter()
        .find(|e| e.is_eligible(now))
        .cloned()
}

/// 选择并占用：按排序依次尝试 `try_acquire`，第一个成功者即为结果。
///
/// 并发调用方抢走某个 Key 的最后一个槽位时，这里会自然落到下一个候选项，
/// 不会对已满的 Key 超发。
pub fn acquire_excluding(
    candidates: &[Arc<KeyEntry>],
    now: Instant,
    exclude: &HashSet<CredentialId>,
) -> Option<Arc<KeyEntry>> {
    ranked(candidates, exclude)
        .into_iter()
        .find(|e| e.try_acquire(now))
        .cloned()
}

/// 未被排除的候选项中最早恢复可用的时间点；全部无法自行恢复时为 `Never`。
pub fn next_available(
    candidates: &[Arc<KeyEntry>],
    now: Instant,
    exclude: &HashSet<CredentialId>,
) -> Availability {
    let mut earliest: Option<Instant> = None;
    for e in ranked(candidates, exclude) {
        match e.next_available_at(now) {
            Availability::Now => return Availability::Now,
            Availability::At(t) => earliest = Some(earliest.map_or(t, |cur| cur.min(t))),
            Availability::Never => {}
        }
    }
    earliest.map_or(Availability::Never, Availability::At)
}
