//! Manager API：Key 状态查看与管理。
//!
//! - 统计快照 / 单 Key 详情
//! - 新增、删除、启用/禁用、从磁盘重新加载
//! - 运行时设置
//! - 月度费用查询

use axum::{
    Json,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::credential::CredentialDescriptor;
use crate::credential::store::Store;
use crate::error::AppError;
use crate::quota_pool::{KeyRegistry, ReloadSummary};
use crate::runtime_config::{self, ManagerSettings, RuntimeConfig};
use crate::usage::{KeyStats, MonthlyUsage, StatusReport, UsageReporter};

/// Manager 应用状态
pub struct ManagerState {
    pub registry: Arc<KeyRegistry>,
    pub store: Arc<Store>,
    pub usage: Arc<UsageReporter>,
    pub runtime: Arc<RuntimeConfig>,
}

// ============================================================================
// 认证中间件
// ============================================================================

/// `MANAGER_KEY` 为空时不做认证。
fn is_authorized(headers: &HeaderMap, manager_key: &str) -> bool {
    if manager_key.is_empty() {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == manager_key)
}

pub async fn manager_auth_middleware(
    State(state): State<Arc<ManagerState>>,
    request: Request,
    next: Next,
) -> Response {
    let manager_key = state.runtime.get().manager_key.clone();
    if is_authorized(request.headers(), &manager_key) {
        return next.run(request).await;
    }
    AppError::unauthorized("缺少或错误的 Manager Key").into_response()
}

// ============================================================================
// 状态查询
// ============================================================================

/// GET /manager/api/stats
pub async fn handle_stats(State(state): State<Arc<ManagerState>>) -> Json<StatusReport> {
    Json(state.usage.status().await)
}

/// GET /manager/api/keys/{id}
pub async fn handle_key(
    State(state): State<Arc<ManagerState>>,
    Path(id): Path<String>,
) -> Result<Json<KeyStats>, AppError> {
    state
        .usage
        .stats(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("未找到 Key: {id}")))
}

#[derive(Debug, Deserialize)]
pub struct CostQuery {
    user: String,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CostResponse {
    user: String,
    provider: String,
    #[serde(flatten)]
    usage: MonthlyUsage,
}

/// GET /manager/api/cost?user=&provider=
pub async fn handle_cost(
    State(state): State<Arc<ManagerState>>,
    Query(query): Query<CostQuery>,
) -> Json<CostResponse> {
    let provider = query
        .provider
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| crate::credential::types::DEFAULT_PROVIDER.to_string());
    let usage = state.usage.monthly_usage(&query.user, &provider).await;
    Json(CostResponse {
        user: query.user,
        provider,
        usage,
    })
}

// ============================================================================
// Key 操作
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IdBody {
    id: String,
}

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    id: String,
    /// 缺省时在启用/禁用之间切换。
    #[serde(default)]
    enable: Option<bool>,
}

/// POST /manager/api/toggle
pub async fn handle_toggle(
    State(state): State<Arc<ManagerState>>,
    Json(body): Json<ToggleBody>,
) -> Result<Json<KeyStats>, AppError> {
    let entry = state
        .registry
        .get(&body.id)
        .await
        .ok_or_else(|| AppError::not_found(format!("未找到 Key: {}", body.id)))?;
    let enable = body.enable.unwrap_or(!entry.is_enabled());

    state.store.set_enabled(&body.id, enable).await?;
    state.registry.set_enabled(&body.id, enable).await?;
    tracing::info!(key = %entry.credential().label, enable, "切换 Key 状态");

    stats_or_not_found(&state, &body.id).await
}

/// POST /manager/api/add
pub async fn handle_add(
    State(state): State<Arc<ManagerState>>,
    Json(desc): Json<CredentialDescriptor>,
) -> Result<Json<KeyStats>, AppError> {
    if desc.secret.trim().is_empty() {
        return Err(AppError::bad_request("secret 不能为空"));
    }

    let credential = state.store.add(desc).await?;
    let id = credential.id.clone();
    tracing::info!(key = %credential.label, "新增 Key");
    state.registry.upsert(credential).await;

    stats_or_not_found(&state, &id).await
}

/// POST /manager/api/delete
pub async fn handle_delete(
    State(state): State<Arc<ManagerState>>,
    Json(body): Json<IdBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let entry = state.registry.remove(&body.id).await?;
    if let Err(e) = state.store.remove(&body.id).await {
        tracing::warn!(key = %entry.credential().label, "从 credentials.json 删除失败: {e:#}");
    }
    tracing::info!(key = %entry.credential().label, "删除 Key");
    Ok(Json(serde_json::json!({ "success": true, "id": body.id })))
}

/// POST /manager/api/reload
pub async fn handle_reload(
    State(state): State<Arc<ManagerState>>,
) -> Result<Json<ReloadSummary>, AppError> {
    let credentials = state.store.load().await?;
    let summary = state.registry.reload(credentials).await;
    tracing::info!(
        added = summary.added,
        updated = summary.updated,
        removed = summary.removed,
        "重新加载 Key 列表"
    );
    Ok(Json(summary))
}

async fn stats_or_not_found(state: &ManagerState, id: &str) -> Result<Json<KeyStats>, AppError> {
    state
        .usage
        .stats(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("未找到 Key: {id}")))
}

// ============================================================================
// 设置处理器
// ============================================================================

/// GET /manager/api/settings
pub async fn handle_settings_get(State(state): State<Arc<ManagerState>>) -> Json<ManagerSettings> {
    Json(ManagerSettings::from_runtime(&state.runtime.get()))
}

/// 设置保存响应
#[derive(Serialize)]
struct SettingsResponse {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// POST /manager/api/settings
pub async fn handle_settings_post(
    State(state): State<Arc<ManagerState>>,
    Json(req): Json<ManagerSettings>,
) -> Response {
    if let Err(msg) = req.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SettingsResponse {
                success: false,
                error: Some(msg.to_string()),
            }),
        )
            .into_response();
    }

    // 持久化到 .env
    if let Err(e) = runtime_config::persist_to_dotenv(&req) {
        tracing::error!("保存设置失败: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SettingsResponse {
                success: false,
                error: Some(format!("保存设置失败: {e}")),
            }),
        )
            .into_response();
    }

    apply_settings(&state.runtime, &req);

    Json(SettingsResponse {
        success: true,
        error: None,
    })
    .into_response()
}

fn apply_settings(runtime: &RuntimeConfig, req: &ManagerSettings) {
    let current = runtime.get();
    let next = req.apply_to_runtime(&current);
    tracing::info!(
        debug = %next.debug,
        max_retries = next.max_retries,
        rate_limit_cooldown_secs = next.rate_limit_cooldown_secs,
        backoff_cap_secs = next.backoff_cap_secs,
        "设置已更新"
    );
    runtime.update(next);
}
