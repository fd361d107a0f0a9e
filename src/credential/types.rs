use crate::logging::mask_secret;
use crate::quota_pool::tracker::QuotaLimits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type CredentialId = String;

pub const DEFAULT_PROVIDER: &str = "default";

/// credentials.json 中的一条 Key 配置。
///
/// 除 `secret` 外所有字段都可省略：`priority`/`label` 按下标补齐，
/// `id` 缺省时退化为 `label`。
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialDescriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default = "default_per_minute")]
    pub max_per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub max_per_hour: u32,
    #[serde(default = "default_per_day")]
    pub max_per_day: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 归属用户；为空表示共享 Key。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_cost_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_tokens: Option<f64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_per_minute() -> u32 {
    QuotaLimits::default().per_minute
}

fn default_per_hour() -> u32 {
    QuotaLimits::default().per_hour
}

fn default_per_day() -> u32 {
    QuotaLimits::default().per_day
}

fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

impl fmt::Debug for CredentialDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialDescriptor")
            .field("id", &self.id)
            .field("secret", &mask_secret(&self.secret))
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("owner", &self.owner)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// 运行期的 Key：身份（secret/label/归属）+ 策略（启用、优先级、窗口上限、费用上限）。
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub id: CredentialId,
    pub secret: String,
    pub label: String,
    pub owner: Option<String>,
    pub provider: String,
    pub enabled: bool,
    /// 越小越优先。
    pub priority: u32,
    pub limits: QuotaLimits,
    pub monthly_cost_limit: Option<f64>,
    pub cost_per_1k_tokens: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// 由配置生成，`index` 为该条目在列表中的位置（从 0 开始）。
    pub fn from_descriptor(desc: CredentialDescriptor, index: usize) -> Self {
        let label = match desc.label.trim() {
            "" => format!("key_{}", index + 1),
            v => v.to_string(),
        };
        let id = match desc.id.trim() {
            "" => label.clone(),
            v => v.to_string(),
        };
        let provider = match desc.provider.trim() {
            "" => DEFAULT_PROVIDER.to_string(),
            v => v.to_string(),
        };
        let owner = desc
            .owner
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty());

        Self {
            id,
            secret: desc.secret.trim().to_string(),
            label,
            owner,
            provider,
            enabled: desc.enabled,
            priority: desc
                .priority
                .unwrap_or_else(|| u32::try_from(index + 1).unwrap_or(u32::MAX)),
            limits: QuotaLimits {
                per_minute: desc.max_per_minute,
                per_hour: desc.max_per_hour,
                per_day: desc.max_per_day,
            },
            monthly_cost_limit: desc.monthly_cost_limit.filter(|v| v.is_finite() && *v > 0.0),
            cost_per_1k_tokens: desc.cost_per_1k_tokens.filter(|v| v.is_finite() && *v >= 0.0),
            created_at: desc.created_at,
        }
    }

    pub fn to_descriptor(&self) -> CredentialDescriptor {
        CredentialDescriptor {
            id: self.id.clone(),
            secret: self.secret.clone(),
            label: self.label.clone(),
            priority: Some(self.priority),
            max_per_minute: self.limits.per_minute,
            max_per_hour: self.limits.per_hour,
            max_per_day: self.limits.per_day,
            enabled: self.enabled,
            owner: self.owner.clone(),
            provider: self.provider.clone(),
            monthly_cost_limit: self.monthly_cost_limit,
            cost_per_1k_tokens: self.cost_per_1k_tokens,
            created_at: self.created_at,
        }
    }

    pub fn preview(&self) -> String {
        mask_secret(&self.secret)
    }

    /// 该 Key 能否服务于此调用范围：归属用户的 Key 只服务本人，provider 需一致。
    pub fn serves(&self, scope: &RequestScope) -> bool {
        if let Some(owner) = &self.owner
            && scope.user.as_deref() != Some(owner.as_str())
        {
            return false;
        }
        if let Some(provider) = &scope.provider
            && &self.provider != provider
        {
            return false;
        }
        true
    }

    /// 排序键：(priority 升序, id 升序)。
    pub fn rank(&self) -> (u32, &str) {
        (self.priority, self.id.as_str())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("secret", &self.preview())
            .field("owner", &self.owner)
            .field("provider", &self.provider)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// 一次调用的归属范围。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestScope {
    pub user: Option<String>,
    pub provider: Option<String>,
}

impl RequestScope {
    pub fn new(user: Option<String>, provider: Option<String>) -> Self {
        Self { user, provider }
    }
}
