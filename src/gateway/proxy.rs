//! OpenAI 兼容的透传入口：请求体原样转发，由执行器负责选 Key 与轮换。

use crate::credential::RequestScope;
use crate::error::AppError;
use crate::executor::{ExecuteOptions, RequestExecutor};
use crate::logging;
use crate::runtime_config::RuntimeConfig;
use crate::upstream::UpstreamClient;
use crate::util::id;
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;

/// 调用方用户标识，决定可用的私有 Key 与月度费用归属。
pub const USER_HEADER: &str = "x-user-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct ProxyState {
    pub executor: Arc<RequestExecutor>,
    pub upstream: UpstreamClient,
    pub runtime: Arc<RuntimeConfig>,
    pub provider: String,
}

/// POST /v1/chat/completions
pub async fn handle_chat_completions(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let request_id = id::request_id();
    let log_level = state.runtime.get().log_level();
    if log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let mut resp = match forward(&state, &headers, body).await {
        Ok(resp) => resp,
        Err(e) => {
            if !matches!(e, AppError::Upstream { .. }) {
                tracing::warn!(request_id = %request_id, error = %e, "转发请求失败");
            }
            e.into_response()
        }
    };
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }

    if log_level.client_enabled() {
        logging::client_response(resp.status().as_u16(), start.elapsed(), &[]);
    }
    resp
}

async fn forward(state: &ProxyState, headers: &HeaderMap, body: Bytes) -> Result<Response, AppError> {
    let model = extract_model(&body)?;
    let opts = ExecuteOptions {
        scope: RequestScope::new(user_from_headers(headers), Some(state.provider.clone())),
        model,
        ..ExecuteOptions::default()
    };

    let upstream = &state.upstream;
    let resp = state
        .executor
        .execute(&opts, |credential| {
            let body = body.clone();
            async move { upstream.chat_completions(&credential, body).await }
        })
        .await?;

    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK);
    let content_type = resp
        .content_type
        .unwrap_or_else(|| "application/json".to_string());
    Ok((status, [(header::CONTENT_TYPE, content_type)], Body::from(resp.body)).into_response())
}

fn user_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// 只读取 `model` 字段用于用量记录；请求体本身不做改写。
fn extract_model(body: &[u8]) -> Result<Option<String>, AppError> {
    #[derive(Debug, serde::Deserialize)]
    struct ModelOnly {
        #[serde(default)]
        model: Option<String>,
    }

    let parsed: ModelOnly = sonic_rs::from_slice(body)
        .map_err(|_| AppError::bad_request("请求 JSON 解析失败，请检查请求体格式。"))?;
    Ok(parsed.model.filter(|m| !m.trim().is_empty()))
}
