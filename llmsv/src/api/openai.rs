//! OpenAI互換API
//!
//! `model` フィールドで転送先を解決し、ペイロードをそのままバックエンドに中継する

use crate::api::error::AppError;
use crate::common::error::validation;
use crate::proxy::{InferenceEndpoint, ProxyRequest, ProxyResponse};
use crate::AppState;
use axum::{extract::State, http::HeaderMap, Json};
use serde_json::Value;

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<ProxyResponse, AppError> {
    forward(state, InferenceEndpoint::ChatCompletions, headers, payload).await
}

/// POST /v1/completions
pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<ProxyResponse, AppError> {
    forward(state, InferenceEndpoint::Completions, headers, payload).await
}

async fn forward(
    state: AppState,
    endpoint: InferenceEndpoint,
    headers: HeaderMap,
    payload: Value,
) -> Result<ProxyResponse, AppError> {
    let model = extract_model(&payload)?;
    let request = ProxyRequest::new(endpoint, payload).with_headers(&headers);
    Ok(state.service.route(&model, request).await?)
}

fn extract_model(payload: &Value) -> Result<String, AppError> {
    match payload.get("model").and_then(Value::as_str) {
        Some(model) if !model.trim().is_empty() => Ok(model.to_string()),
        _ => Err(AppError(validation("Model ID is required"))),
    }
}
