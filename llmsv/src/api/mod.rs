//! REST APIハンドラー
//!
//! OpenAI互換の推論プロキシとデプロイメント管理API

pub mod error;
pub mod models;
pub mod openai;

use crate::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// APIルーターを作成
pub fn create_app(state: AppState, enable_cors: bool) -> Router {
    let router = Router::new()
        .route("/", get(models::health))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/add", post(models::add_model))
        .route("/v1/models/:model_id", delete(models::remove_model))
        .route("/v1/models/:model_id/status", get(models::model_status))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route(
            "/v0/deployments",
            get(models::list_deployments).post(models::create_deployment),
        )
        .route(
            "/v0/deployments/*key",
            get(models::get_deployment).delete(models::delete_deployment),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}
