//! 配额池（Quota Pool）模块。
//!
//! 每个 Key 维护分钟/小时/天三个滑动窗口与失败状态；
//! 选择时按优先级取第一个可选的 Key，并在同一临界区内占用配额槽位。

pub mod registry;
pub mod selector;
pub mod sweeper;
pub mod tracker;

pub use registry::{KeyEntry, KeyRegistry, RegistryError, ReloadSummary};
pub use sweeper::spawn_purge_task;
pub use tracker::{Availability, FailureKind, QuotaLimits, QuotaTracker};
