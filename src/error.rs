use crate::executor::RotationError;
use crate::quota_pool::RegistryError;
use crate::upstream::UpstreamError;
use axum::{
    Json,
    body::{Body, Bytes},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("没有可用的 Key")]
    NoAvailableKeys,

    #[error("所有 Key 均已尝试失败（共 {attempts} 次）")]
    Exhausted { attempts: usize },

    /// 上游返回的错误，状态码与响应体原样透传。
    #[error("上游错误 {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        content_type: Option<String>,
        body: Bytes,
    },

    #[error("后端请求失败: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NoAvailableKeys => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Exhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Backend(_) => StatusCode::BAD_GATEWAY,
            AppError::Io(_) | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UpstreamError> for AppError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Http {
                status,
                message,
                content_type,
                body,
                ..
            } => AppError::Upstream {
                status,
                message,
                content_type,
                body,
            },
            UpstreamError::Transport(e) => AppError::Backend(e.to_string()),
        }
    }
}

impl From<RotationError<UpstreamError>> for AppError {
    fn from(e: RotationError<UpstreamError>) -> Self {
        match e {
            RotationError::NoAvailableKeys => AppError::NoAvailableKeys,
            RotationError::AllKeysExhausted { attempts } => AppError::Exhausted { attempts },
            RotationError::Upstream(e) => e.into(),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        AppError::NotFound(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let AppError::Upstream {
            content_type, body, ..
        } = &self
            && !body.is_empty()
        {
            let content_type = content_type
                .clone()
                .unwrap_or_else(|| "application/json".to_string());
            return (status, [(header::CONTENT_TYPE, content_type)], Body::from(body.clone()))
                .into_response();
        }

        let ty = match &self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::NoAvailableKeys => "no_available_keys",
            AppError::Exhausted { .. } => "all_keys_exhausted",
            AppError::Upstream { .. } => "upstream",
            AppError::Backend(_) => "backend",
            AppError::Io(_) => "io",
            AppError::Anyhow(_) => "internal",
        };

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: Some(ty.to_string()),
            },
        };

        (status, Json(body)).into_response()
    }
}
