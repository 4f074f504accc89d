//! HTTP API 请求/响应模型

use serde::{Deserialize, Serialize};

use crate::router::{EngineError, RoutedResult};
use crate::ReportError;

/// 通用响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

/// API 错误
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u32,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: u32, message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError { code, message }),
        }
    }
}

/// 变更通知请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRequest {
    /// 受影响的门店 ID
    pub keys: Vec<String>,
}

/// 变更通知响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationAccepted {
    pub accepted: usize,
}

/// 路由刷新/强制切换响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub engine: String,
    pub forced: bool,
}

/// 查询响应
pub type QueryResponse = ApiResponse<RoutedResult>;

/// 错误 → HTTP 状态码
pub fn status_code_of(error: &ReportError) -> u16 {
    match error {
        ReportError::Engine(e) if e.is_request_error() => 400,
        ReportError::Engine(EngineError::Cancelled) => 408,
        ReportError::EngineUnavailable { .. } => 503,
        ReportError::Sync(crate::sync::SyncError::QueueFull { .. }) => 503,
        ReportError::Sync(crate::sync::SyncError::ShutDown) => 503,
        ReportError::InconsistentAggregation { .. } => 409,
        _ => 500,
    }
}
