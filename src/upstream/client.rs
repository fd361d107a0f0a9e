use crate::config::Config;
use crate::credential::Credential;
use crate::executor::{ClassifyError, ErrorClass, classify_status};
use crate::logging;
use crate::runtime_config::RuntimeConfig;
use crate::usage::{Metered, Metering};
use axum::body::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("上游 API 错误 {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_delay: Duration,
        content_type: Option<String>,
        body: Bytes,
    },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
        }
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_delay, .. } if !retry_delay.is_zero() => Some(*retry_delay),
            _ => None,
        }
    }
}

impl ClassifyError for UpstreamError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::Http { status, .. } => classify_status(*status, self.retry_delay()),
            Self::Transport(e) if e.is_timeout() || e.is_connect() => ErrorClass::Transient,
            Self::Transport(_) => ErrorClass::Unknown,
        }
    }
}

/// 上游成功响应，原样返回给客户端。
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl Metered for UpstreamResponse {
    fn metering(&self) -> Metering {
        parse_usage(&self.body)
    }
}

/// 读取响应体中的 `usage` 字段（OpenAI 与 Anthropic 两种命名）。
fn parse_usage(body: &[u8]) -> Metering {
    #[derive(Debug, Default, serde::Deserialize)]
    struct Envelope {
        #[serde(default)]
        usage: Option<UsageBlock>,
    }

    #[derive(Debug, Default, serde::Deserialize)]
    struct UsageBlock {
        #[serde(default, alias = "input_tokens")]
        prompt_tokens: u64,
        #[serde(default, alias = "output_tokens")]
        completion_tokens: u64,
        #[serde(default)]
        cost: Option<f64>,
    }

    match sonic_rs::from_slice::<Envelope>(body) {
        Ok(Envelope { usage: Some(u) }) => Metering {
            tokens_in: u.prompt_tokens,
            tokens_out: u.completion_tokens,
            cost: u.cost,
        },
        _ => Metering::default(),
    }
}

/// OpenAI 兼容的上游透传客户端。
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    runtime: Arc<RuntimeConfig>,
}

impl UpstreamClient {
    pub fn new(cfg: &Config, runtime: Arc<RuntimeConfig>) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(cfg.timeout());
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.upstream_base_url.trim_end_matches('/').to_string(),
            runtime,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_headers(&self, secret: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {secret}"))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }

    /// 用指定 Key 转发一次 chat completions 请求；非 2xx 视为错误。
    pub async fn chat_completions(
        &self,
        credential: &Credential,
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!("{}{CHAT_COMPLETIONS_PATH}", self.base_url);
        let level = self.runtime.get().log_level();
        if level.backend_enabled() {
            logging::backend_request("POST", &url, &credential.label, &body);
        }

        let start = Instant::now();
        let resp = self
            .http
            .post(&url)
            .headers(self.build_headers(&credential.secret))
            .body(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers());
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await?;

        if level.backend_enabled() {
            logging::backend_response(status, start.elapsed(), &bytes);
        }

        if !(200..300).contains(&status) {
            return Err(extract_error_details(status, retry_after, content_type, bytes));
        }
        Ok(UpstreamResponse {
            status,
            content_type,
            body: bytes,
        })
    }
}

/// `Retry-After`（秒）或 `retry-after-ms`。
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
    {
        return Some(Duration::from_secs_f64(ms / 1000.0));
    }
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Duration::from_secs_f64)
}

fn extract_error_details(
    status: u16,
    retry_after: Option<Duration>,
    content_type: Option<String>,
    body: Bytes,
) -> UpstreamError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        details: Vec<ErrDetail>,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrDetail {
        #[serde(rename = "@type", default)]
        ty: String,
        #[serde(rename = "retryDelay", alias = "retry_delay", default)]
        retry_delay: String,
    }

    use sonic_rs::JsonValueTrait;

    let mut out_status = status;
    let mut message = String::from_utf8_lossy(&body).trim().to_string();
    if message.is_empty() {
        message = "Unknown error".to_string();
    }
    let mut retry_delay = retry_after.unwrap_or(Duration::ZERO);

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(&body) {
        let err = err_resp.error;
        if !err.message.is_empty() {
            message = err.message;
        }

        if let Some(code) = err.code {
            if let Some(s) = code.as_str() {
                match s.to_uppercase().as_str() {
                    "RESOURCE_EXHAUSTED" | "RATE_LIMIT_EXCEEDED" => out_status = 429,
                    "UNAUTHENTICATED" | "INVALID_API_KEY" => out_status = 401,
                    "PERMISSION_DENIED" => out_status = 403,
                    "INTERNAL" => out_status = 500,
                    _ => {}
                }
            } else if let Some(i) = code.as_i64()
                && let Ok(code) = u16::try_from(i)
                && (100..600).contains(&code)
            {
                out_status = code;
            }
        }

        if retry_delay.is_zero() {
            for d in err.details {
                if d.ty.contains("RetryInfo")
                    && let Some(delay) = parse_retry_delay_seconds(&d.retry_delay)
                {
                    retry_delay = delay;
                }
            }
        }
    }

    UpstreamError::Http {
        status: out_status,
        message,
        retry_delay,
        content_type,
        body,
    }
}

fn parse_retry_delay_seconds(s: &str) -> Option<Duration> {
    // 兼容形如 "2s" / "2.5s" / "0.123s"
    let s = s.trim().strip_suffix('s')?;
    let secs: f64 = s.trim().parse().ok()?;
    if !(secs.is_finite() && secs >= 0.0) {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}
