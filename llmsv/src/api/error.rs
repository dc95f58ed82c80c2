//! APIエラーレスポンス型
//!
//! axum用の共通エラーハンドリング

use crate::common::error::SvError;
use axum::{
    body::Body,
    http::{header, HeaderValue, Response},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::{error, warn};

/// Axum用のエラーレスポンス型
#[derive(Debug)]
pub struct AppError(pub SvError);

impl From<SvError> for AppError {
    fn from(err: SvError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.0.status_code();
        // 詳細はサーバーログのみに出す（接続先やトランスポートエラーを返さない）
        if status.is_server_error() {
            error!(status = %status, error = %self.0, "Request failed");
        } else {
            warn!(status = %status, error = %self.0, "Request rejected");
        }

        match self.0 {
            // バックエンドのエラーはステータス・ボディをそのまま返す
            SvError::Upstream {
                status,
                content_type,
                body,
            } => {
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                if let Some(value) = content_type.and_then(|v| HeaderValue::from_str(&v).ok()) {
                    response.headers_mut().insert(header::CONTENT_TYPE, value);
                }
                response
            }
            SvError::ProcessFailure(ref diagnostics) => {
                let mut payload = json!(self.0.to_openai_error());
                payload["error"]["details"] = json!({
                    "exit_code": diagnostics.exit_code,
                    "reason": diagnostics.reason,
                    "log_tail": diagnostics.log_tail,
                });
                (status, Json(payload)).into_response()
            }
            ref err => (status, Json(err.to_openai_error())).into_response(),
        }
    }
}
