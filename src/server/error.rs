use std::fmt::Display;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::{error, warn};
use serde_json::json;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// API错误类型
///
/// 响应体统一为 `{"error": "..."}`
pub struct AppError {
    pub status: StatusCode,
    pub error: anyhow::Error,
}

impl AppError {
    /// 请求参数不合法
    pub fn bad_request(msg: impl Display) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: anyhow::anyhow!("{msg}") }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = format!("{:#}", self.error);
        if self.status.is_server_error() {
            error!("请求处理失败: {message}");
        } else {
            warn!("请求参数错误: {message}");
        }
        (self.status, Json(json!({ "error": message }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, error: err.into() }
    }
}
