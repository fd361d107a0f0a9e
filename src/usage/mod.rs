//! 调用记录与使用统计。

pub mod record;
pub mod reporter;
pub mod store;

pub use record::{AttemptOutcome, Metered, Metering, UsageRecord};
pub use reporter::{KeyStats, MonthlyUsage, StatusReport, UsageReporter};
pub use store::{UsageStore, UsageStoreKind};
