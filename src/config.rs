use crate::usage::UsageStoreKind;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8045;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub data_dir: String,
    pub debug: String,
    pub manager_key: String,

    pub upstream_base_url: String,
    pub upstream_provider: String,
    pub timeout_ms: u64,
    pub proxy: String,

    pub max_retries: usize,
    pub rate_limit_cooldown_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    pub max_wait_secs: u64,

    pub purge_interval_secs: u64,
    pub cost_cache_ttl_secs: u64,
    pub usage_store: UsageStoreKind,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "MANAGER_KEY")]
    manager_key: Option<String>,

    #[serde(alias = "UPSTREAM_BASE_URL")]
    upstream_base_url: Option<String>,
    #[serde(alias = "UPSTREAM_PROVIDER")]
    upstream_provider: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "MAX_RETRIES")]
    max_retries: Option<usize>,
    #[serde(alias = "RATE_LIMIT_COOLDOWN_SECS")]
    rate_limit_cooldown_secs: Option<u64>,
    #[serde(alias = "BACKOFF_BASE_MS")]
    backoff_base_ms: Option<u64>,
    #[serde(alias = "BACKOFF_CAP_SECS")]
    backoff_cap_secs: Option<u64>,
    #[serde(alias = "MAX_WAIT_SECS")]
    max_wait_secs: Option<u64>,

    #[serde(alias = "PURGE_INTERVAL_SECS")]
    purge_interval_secs: Option<u64>,
    #[serde(alias = "COST_CACHE_TTL_SECS")]
    cost_cache_ttl_secs: Option<u64>,
    #[serde(alias = "USAGE_STORE")]
    usage_store: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            manager_key: raw.manager_key.unwrap_or_default().trim().to_string(),
            upstream_base_url: raw
                .upstream_base_url
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string()),
            upstream_provider: raw
                .upstream_provider
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| crate::credential::types::DEFAULT_PROVIDER.to_string()),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            max_retries: raw.max_retries.unwrap_or(3).max(1),
            rate_limit_cooldown_secs: raw.rate_limit_cooldown_secs.unwrap_or(60),
            backoff_base_ms: raw.backoff_base_ms.unwrap_or(1000),
            backoff_cap_secs: raw.backoff_cap_secs.unwrap_or(10),
            max_wait_secs: raw.max_wait_secs.unwrap_or(0),
            purge_interval_secs: raw.purge_interval_secs.unwrap_or(300),
            cost_cache_ttl_secs: raw.cost_cache_ttl_secs.unwrap_or(30),
            usage_store: raw
                .usage_store
                .as_deref()
                .map(UsageStoreKind::parse)
                .unwrap_or_default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn cost_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cost_cache_ttl_secs)
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawEnv::default())
    }
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已在进程环境中设置的变量优先。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

pub(crate) fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

pub(crate) fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
