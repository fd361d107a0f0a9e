//! 上游错误分类。每个上游适配器为自己的错误类型实现 `ClassifyError`，
//! 执行器只根据分类结果决定轮换、退避或立即失败。

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 上游报告配额耗尽；`retry_after` 为上游给出的重置等待时间。
    RateLimited { retry_after: Option<Duration> },
    /// Key 无效或无权限，换下一个 Key。
    Auth,
    /// 超时、5xx 等暂时性错误，退避后用同一个 Key 重试。
    Transient,
    /// 其他错误，原样返回给调用方。
    Unknown,
}

impl ErrorClass {
    /// 是否需要换下一个 Key。
    pub fn rotates(self) -> bool {
        matches!(self, ErrorClass::RateLimited { .. } | ErrorClass::Auth)
    }
}

pub trait ClassifyError: std::error::Error {
    fn classify(&self) -> ErrorClass;
}

/// 按 HTTP 状态码分类：429 限流，401/403 认证，408/5xx 暂时性错误。
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited {
            retry_after: retry_after.filter(|d| !d.is_zero()),
        },
        401 | 403 => ErrorClass::Auth,
        408 | 500 | 502 | 503 | 504 => ErrorClass::Transient,
        _ => ErrorClass::Unknown,
    }
}
