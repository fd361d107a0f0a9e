//! 运行时可动态修改的配置。
//!
//! 用于支持 Manager 设置接口"立即生效"的需求。
//! 使用 ArcSwap 实现无锁读取，写入时创建新的配置快照；实例由 main 创建并注入。

use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, parse_dotenv_line};
use crate::executor::RetryPolicy;
use crate::logging::LogLevel;

/// 运行时配置快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// 调试日志级别
    pub debug: String,
    /// Manager API 访问密钥（为空表示不鉴权）
    pub manager_key: String,
    /// 单次调用最多尝试次数
    pub max_retries: usize,
    /// 上游未给出重置时间时的限流冷却
    pub rate_limit_cooldown_secs: u64,
    /// 退避基数（毫秒），第 n 次重试等待 base * 2^n
    pub backoff_base_ms: u64,
    /// 退避上限
    pub backoff_cap_secs: u64,
    /// 没有可用 Key 时最多等待的秒数，0 表示立即失败
    pub max_wait_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            debug: "off".to_string(),
            manager_key: String::new(),
            max_retries: policy.max_retries,
            rate_limit_cooldown_secs: policy.rate_limit_cooldown.as_secs(),
            backoff_base_ms: u64::try_from(policy.backoff_base.as_millis()).unwrap_or(1000),
            backoff_cap_secs: policy.backoff_cap.as_secs(),
            max_wait_secs: 0,
        }
    }
}

impl RuntimeSettings {
    /// 从初始 Config 创建运行时配置。
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            debug: cfg.debug.clone(),
            manager_key: cfg.manager_key.clone(),
            max_retries: cfg.max_retries,
            rate_limit_cooldown_secs: cfg.rate_limit_cooldown_secs,
            backoff_base_ms: cfg.backoff_base_ms,
            backoff_cap_secs: cfg.backoff_cap_secs,
            max_wait_secs: cfg.max_wait_secs,
        }
    }

    /// 获取日志级别。
    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.max(1),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
        }
    }

    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_secs > 0).then(|| Duration::from_secs(self.max_wait_secs))
    }
}

#[derive(Debug)]
pub struct RuntimeConfig {
    settings: ArcSwap<RuntimeSettings>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(RuntimeSettings::default())
    }
}

impl RuntimeConfig {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(RuntimeSettings::from_config(cfg))
    }

    /// 获取当前运行时配置快照。
    pub fn get(&self) -> Arc<RuntimeSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, new_settings: RuntimeSettings) {
        self.settings.store(Arc::new(new_settings));
    }
}

/// Manager 可编辑的设置（用于 JSON 序列化）。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerSettings {
    #[serde(default)]
    pub debug: String,
    #[serde(default)]
    pub manager_key: String,
    pub max_retries: usize,
    pub rate_limit_cooldown_secs: u64,
    pub backoff_cap_secs: u64,
}

impl ManagerSettings {
    /// 从运行时配置创建。
    pub fn from_runtime(rt: &RuntimeSettings) -> Self {
        Self {
            debug: rt.debug.clone(),
            manager_key: rt.manager_key.clone(),
            max_retries: rt.max_retries,
            rate_limit_cooldown_secs: rt.rate_limit_cooldown_secs,
            backoff_cap_secs: rt.backoff_cap_secs,
        }
    }

    /// 验证设置。
    pub fn validate(&self) -> Result<(), &'static str> {
        let debug = self.debug.trim().to_lowercase();
        if !debug.is_empty()
            && debug != "off"
            && debug != "low"
            && debug != "medium"
            && debug != "high"
        {
            return Err("日志级别必须是 off、low、medium 或 high");
        }
        if !(1..=20).contains(&self.max_retries) {
            return Err("最大尝试次数必须在 1 到 20 之间");
        }
        if !(1..=3600).contains(&self.rate_limit_cooldown_secs) {
            return Err("限流冷却时间必须在 1 到 3600 秒之间");
        }
        if !(1..=300).contains(&self.backoff_cap_secs) {
            return Err("退避上限必须在 1 到 300 秒之间");
        }
        Ok(())
    }

    /// 标准化 debug 值。
    pub fn normalized_debug(&self) -> String {
        LogLevel::parse(&self.debug).as_str().to_string()
    }

    /// 应用到运行时配置。
    pub fn apply_to_runtime(&self, current: &RuntimeSettings) -> RuntimeSettings {
        RuntimeSettings {
            debug: self.normalized_debug(),
            manager_key: self.manager_key.trim().to_string(),
            max_retries: self.max_retries,
            rate_limit_cooldown_secs: self.rate_limit_cooldown_secs,
            backoff_base_ms: current.backoff_base_ms,
            backoff_cap_secs: self.backoff_cap_secs,
            max_wait_secs: current.max_wait_secs,
        }
    }
}

/// 持久化设置到 .env 文件。
pub fn persist_to_dotenv(settings: &ManagerSettings) -> Result<(), String> {
    let max_retries = settings.max_retries.to_string();
    let cooldown = settings.rate_limit_cooldown_secs.to_string();
    let backoff_cap = settings.backoff_cap_secs.to_string();
    let updates = [
        ("DEBUG", settings.normalized_debug()),
        ("MANAGER_KEY", settings.manager_key.trim().to_string()),
        ("MAX_RETRIES", max_retries),
        ("RATE_LIMIT_COOLDOWN_SECS", cooldown),
        ("BACKOFF_CAP_SECS", backoff_cap),
    ];
    let updates: Vec<(&str, &str)> = updates.iter().map(|(k, v)| (*k, v.as_str())).collect();

    let dotenv_path =
        find_or_create_dotenv_path().map_err(|e| format!("无法获取 .env 路径: {e}"))?;

    update_dotenv_file(&dotenv_path, &updates).map_err(|e| format!("无法更新 .env 文件: {e}"))?;

    Ok(())
}

/// 查找或创建 .env 文件路径。
fn find_or_create_dotenv_path() -> Result<std::path::PathBuf, std::io::Error> {
    let cwd = std::env::current_dir()?;
    Ok(crate::config::find_dotenv_path().unwrap_or_else(|| cwd.join(".env")))
}

/// 更新 .env 文件中的键值对；已有键原地替换，其余追加到末尾。
fn update_dotenv_file(path: &Path, updates: &[(&str, &str)]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let existing = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();

    let mut updated_keys = std::collections::HashSet::new();
    for line in lines.iter_mut() {
        let Some((key, _)) = parse_dotenv_line(line) else {
            continue;
        };
        if let Some((uk, uv)) = updates.iter().find(|(uk, _)| key == *uk) {
            *line = format_env_line(uk, uv);
            updated_keys.insert(*uk);
        }
    }

    for (key, value) in updates {
        if !updated_keys.contains(*key) {
            lines.push(format_env_line(key, value));
        }
    }

    let mut file = std::fs::File::create(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// 格式化 .env 行，必要时添加引号。
fn format_env_line(key: &str, value: &str) -> String {
    if value.is_empty()
        || value.contains(' ')
        || value.contains('\t')
        || value.contains('"')
        || value.contains('\'')
        || value.contains('#')
    {
        format!("{key}=\"{value}\"")
    } else {
        format!("{key}={value}")
    }
}
