use crate::credential::{Credential, CredentialId};
use crate::util::id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    AuthFailure,
    ServerError,
    UnknownError,
}

/// 一次上游调用的计量信息。`cost` 为空时按 Key 的单价估算。
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metering {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: Option<f64>,
}

impl Metering {
    pub fn tokens(tokens_in: u64, tokens_out: u64) -> Self {
        Self {
            tokens_in,
            tokens_out,
            cost: None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in.saturating_add(self.tokens_out)
    }

    /// 实际费用：优先使用上游返回值，否则按 `cost_per_1k_tokens` 折算。
    pub fn price(&self, credential: &Credential) -> f64 {
        if let Some(cost) = self.cost.filter(|c| c.is_finite()) {
            return cost.max(0.0);
        }
        match credential.cost_per_1k_tokens {
            Some(per_1k) => per_1k * self.total_tokens() as f64 / 1000.0,
            None => 0.0,
        }
    }
}

/// 调用结果可报告自身的计量信息（token 数、费用）。
pub trait Metered {
    fn metering(&self) -> Metering {
        Metering::default()
    }
}

impl Metered for () {}

impl Metered for String {}

impl Metered for Metering {
    fn metering(&self) -> Metering {
        *self
    }
}

/// 每次尝试一条，写入后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub credential_id: CredentialId,
    pub credential_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost: f64,
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
}

impl UsageRecord {
    pub fn new(
        credential: &Credential,
        user: Option<&str>,
        model: Option<&str>,
        outcome: AttemptOutcome,
        latency: Duration,
        metering: Metering,
    ) -> Self {
        Self {
            id: id::record_id(),
            timestamp: Utc::now(),
            credential_id: credential.id.clone(),
            credential_label: credential.label.clone(),
            user: user.map(str::to_string),
            provider: credential.provider.clone(),
            model: model.map(str::to_string),
            tokens_in: metering.tokens_in,
            tokens_out: metering.tokens_out,
            cost: metering.price(credential),
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}
