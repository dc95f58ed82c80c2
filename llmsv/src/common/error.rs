//! エラー型定義
//!
//! 統一エラー型（thiserror使用）
//!
//! 呼び出し側に公開する語彙は小さく安定させる:
//! `DuplicateIdentity` / `NotFound` / `NotReady` / `Upstream` / `Unavailable` /
//! `ProcessFailure` / `Internal`（＋入力検証エラー）。

use crate::types::{DeploymentStatus, ProcessDiagnostics};
use axum::body::Bytes;
use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Common layer error type
#[derive(Debug, Error)]
pub enum CommonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// supervisor / router error type
#[derive(Debug, Error)]
pub enum SvError {
    /// Common layer error
    #[error(transparent)]
    Common(#[from] CommonError),

    /// 同一identityが既に登録済み
    #[error("Model {0} already exists")]
    DuplicateIdentity(String),

    /// ポートが他のアクティブなデプロイメントで使用中
    #[error("Port {0} is already in use by another deployment")]
    PortInUse(u16),

    /// 登録されていない
    #[error("Model {0} not found")]
    NotFound(String),

    /// 登録済みだが推論を受け付けられない（呼び出し側で再試行する）
    #[error("Model {identity} is not ready (status: {status})")]
    NotReady {
        /// モデルID
        identity: String,
        /// 現在のステータス
        status: DeploymentStatus,
    },

    /// バックエンドが非2xxを返した（ステータス・ボディはそのまま返す）
    #[error("Model server returned {status}")]
    Upstream {
        /// バックエンドのステータスコード
        status: StatusCode,
        /// バックエンドのContent-Type
        content_type: Option<String>,
        /// バックエンドのレスポンスボディ
        body: Bytes,
    },

    /// バックエンドに接続できない / 通信が途中で切断された
    #[error("Model server unavailable: {0}")]
    Unavailable(String),

    /// バックエンドプロセスの起動失敗・異常終了
    #[error("Model server process failed (exit code {}): {}", format_exit_code(.0.exit_code), .0.reason)]
    ProcessFailure(ProcessDiagnostics),

    /// 外部量子化ツールの失敗
    #[error("Quantization failed: {0}")]
    Quantization(String),

    /// 想定外のエラー
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_exit_code(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl SvError {
    /// 外部クライアント向けのメッセージ
    ///
    /// 呼び出し側が指定したID（モデル名・ポート）は含めるが、
    /// 内部の接続先やトランスポートエラーの詳細は含めない。
    /// 詳細は `Display` 実装（サーバーログ）で確認する。
    pub fn client_message(&self) -> String {
        match self {
            Self::Common(CommonError::Validation(msg)) => msg.clone(),
            Self::Common(_) => "Request error".to_string(),
            Self::DuplicateIdentity(_)
            | Self::PortInUse(_)
            | Self::NotFound(_)
            | Self::NotReady { .. }
            | Self::ProcessFailure(_) => self.to_string(),
            Self::Upstream { status, .. } => format!("Model server returned {status}"),
            Self::Unavailable(_) => "Model server unavailable".to_string(),
            Self::Quantization(_) => "Quantization failed".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Returns the OpenAI-compatible error type string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Common(_) => "invalid_request_error",
            Self::DuplicateIdentity(_) | Self::PortInUse(_) => "invalid_request_error",
            Self::NotFound(_) => "not_found_error",
            Self::NotReady { .. } => "service_unavailable",
            Self::Upstream { .. } => "upstream_error",
            Self::Unavailable(_) => "service_unavailable",
            Self::ProcessFailure(_) | Self::Quantization(_) | Self::Internal(_) => "server_error",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Common(CommonError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Common(CommonError::Serialization(_)) => StatusCode::BAD_REQUEST,
            Self::Common(CommonError::Config(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DuplicateIdentity(_) | Self::PortInUse(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => *status,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProcessFailure(_) | Self::Quantization(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 呼び出し側が再試行すべきエラーか
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::Unavailable(_))
    }

    /// Converts this error to an OpenAI-compatible error response.
    pub fn to_openai_error(&self) -> OpenAIErrorResponse {
        OpenAIErrorResponse {
            error: OpenAIErrorDetail {
                message: self.client_message(),
                error_type: self.error_type().to_string(),
                code: Some(self.status_code().as_u16().to_string()),
            },
        }
    }
}

/// 検証エラーの短縮コンストラクタ
pub(crate) fn validation(msg: impl Into<String>) -> SvError {
    SvError::Common(CommonError::Validation(msg.into()))
}

/// OpenAI互換エラーレスポンス
///
/// # Example
///
/// ```json
/// {
///   "error": {
///     "message": "Model llama3 not found",
///     "type": "not_found_error",
///     "code": "404"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct OpenAIErrorResponse {
    /// The error details
    pub error: OpenAIErrorDetail,
}

/// OpenAIエラー詳細
#[derive(Debug, Clone, Serialize)]
pub struct OpenAIErrorDetail {
    /// Human-readable error message
    pub message: String,
    /// Error type (e.g., "invalid_request_error", "server_error")
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error code (optional, typically HTTP status as string)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Result type alias (Common)
pub type CommonResult<T> = Result<T, CommonError>;

/// Result type alias (supervisor / router)
pub type SvResult<T> = Result<T, SvError>;
