//! 外部调用错误与稳定失败分类
//!
//! CallError 描述一次外部调用（Agent 运行时 / 语音服务 / 键值存储）的失败。
//! Display 只输出稳定的失败类别，原始错误文本仅通过 detail() 进入日志，不返回给最终调用方。

use std::fmt;

use thiserror::Error;

/// 面向调用方的稳定失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    RateLimited,
    Unavailable,
    Connectivity,
    Auth,
    Malformed,
    Unsupported,
    Rejected,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited => "rate-limited",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Connectivity => "connectivity",
            FailureKind::Auth => "auth",
            FailureKind::Malformed => "malformed",
            FailureKind::Unsupported => "unsupported",
            FailureKind::Rejected => "rejected",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次外部调用失败
#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("call timed out")]
    Timeout,

    #[error("remote returned status {code}")]
    Status { code: u16, detail: String },

    #[error("authentication rejected")]
    Auth(String),

    #[error("backing service unreachable")]
    Connectivity(String),

    #[error("malformed payload")]
    Malformed(String),

    #[error("unsupported operation")]
    Unsupported(String),

    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    /// 按 HTTP 状态码构造；401/403 归为认证失败
    pub fn status(code: u16, detail: impl Into<String>) -> Self {
        match code {
            401 | 403 => CallError::Auth(detail.into()),
            _ => CallError::Status {
                code,
                detail: detail.into(),
            },
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            CallError::Timeout => FailureKind::Timeout,
            CallError::Status { code: 408, .. } => FailureKind::Timeout,
            CallError::Status { code: 429, .. } => FailureKind::RateLimited,
            CallError::Status { code: 500..=599, .. } => FailureKind::Unavailable,
            CallError::Status { .. } => FailureKind::Rejected,
            CallError::Auth(_) => FailureKind::Auth,
            CallError::Connectivity(_) => FailureKind::Connectivity,
            CallError::Malformed(_) => FailureKind::Malformed,
            CallError::Unsupported(_) => FailureKind::Unsupported,
            CallError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// 原始错误细节（仅用于日志）
    pub fn detail(&self) -> Option<&str> {
        match self {
            CallError::Status { detail, .. }
            | CallError::Auth(detail)
            | CallError::Connectivity(detail)
            | CallError::Malformed(detail)
            | CallError::Unsupported(detail) => Some(detail.as_str()),
            CallError::Timeout | CallError::Cancelled => None,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CallError::Timeout
        } else if let Some(status) = err.status() {
            CallError::status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            CallError::Malformed(err.to_string())
        } else if err.is_builder() {
            CallError::Unsupported(err.to_string())
        } else {
            CallError::Connectivity(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Malformed(err.to_string())
    }
}
