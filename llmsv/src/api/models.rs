//! デプロイメント管理API
//!
//! 登録・一覧・状態取得・削除のエンドポイント

use crate::api::error::AppError;
use crate::supervisor::LaunchMode;
use crate::types::{DeploymentRecord, DeploymentSpec, LaunchParams, QuantizationDescriptor};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

/// サーバー名
const SERVER_NAME: &str = "llmsv";

/// ヘルスチェックレスポンス
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// 常に "ok"
    pub status: String,
    /// サーバー名
    pub server: String,
    /// バージョン
    pub version: String,
    /// 登録済みモデル数
    pub models_loaded: usize,
}

/// モデル一覧の要約
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelSummary {
    /// モデルID
    pub id: String,
    /// 表示名
    pub name: String,
    /// ステータス
    pub status: String,
    /// 量子化メタデータ
    pub quantization: QuantizationDescriptor,
    /// 稼働時間（"1h 2m 3s"）
    pub uptime: String,
}

impl From<&DeploymentRecord> for ModelSummary {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            id: record.identity.clone(),
            name: record.display_name.clone(),
            status: record.status.to_string(),
            quantization: record.quantization.clone(),
            uptime: record.uptime_display(),
        }
    }
}

/// `GET /v1/models` のレスポンス
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelListResponse {
    /// モデル一覧
    pub models: Vec<ModelSummary>,
}

/// デバイス指定（数値でも文字列でも受け付ける）
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    /// "0,1" 形式
    Text(String),
    /// 単一GPU番号
    Index(u32),
}

impl DeviceId {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Index(index) => index.to_string(),
        }
    }
}

fn default_quant_method() -> String {
    "awq".to_string()
}

fn default_quant_bits() -> u8 {
    4
}

/// デプロイメント登録リクエスト
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    /// モデルID
    pub model_id: String,
    /// ポート（未指定なら自動割り当て）
    #[serde(default)]
    pub port: Option<u16>,
    /// デバイス割り当て
    #[serde(default, alias = "device")]
    pub gpu_id: Option<DeviceId>,
    /// 量子化するか
    #[serde(default)]
    pub quantize: bool,
    /// 量子化手法
    #[serde(default = "default_quant_method")]
    pub quant_method: String,
    /// 量子化ビット幅
    #[serde(default = "default_quant_bits")]
    pub quant_bits: u8,
    /// 最大コンテキスト長
    #[serde(default)]
    pub max_model_len: Option<u32>,
    /// GPUメモリ使用率
    #[serde(default, alias = "gpu_memory_utilization")]
    pub memory_util: Option<f32>,
    /// 最大バッチサイズ
    #[serde(default)]
    pub max_batch_size: Option<u32>,
    /// 量子化済みアーティファクト
    #[serde(default)]
    pub artifact: Option<String>,
    /// 初回判定まで待つか
    #[serde(default)]
    pub wait: bool,
}

impl DeployRequest {
    /// 登録用のSpecに変換（検証は登録時に行う）
    pub fn into_spec(self) -> DeploymentSpec {
        let defaults = LaunchParams::default();
        let quantization = if self.quantize {
            QuantizationDescriptor::requested(self.quant_method, self.quant_bits)
        } else {
            QuantizationDescriptor::disabled()
        };
        let mut spec = DeploymentSpec::new(self.model_id)
            .with_quantization(quantization)
            .with_launch(LaunchParams {
                max_model_len: self.max_model_len.unwrap_or(defaults.max_model_len),
                gpu_memory_utilization: self
                    .memory_util
                    .unwrap_or(defaults.gpu_memory_utilization),
                max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size),
            });
        if let Some(port) = self.port {
            spec = spec.with_port(port);
        }
        if let Some(device) = self.gpu_id {
            spec = spec.with_device(device.into_string());
        }
        spec.artifact = self.artifact;
        spec
    }
}

/// 状態詳細（レコード＋稼働時間）
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentView {
    /// レコード
    #[serde(flatten)]
    pub record: DeploymentRecord,
    /// 稼働時間（"1h 2m 3s"）
    pub uptime: String,
}

impl From<DeploymentRecord> for DeploymentView {
    fn from(record: DeploymentRecord) -> Self {
        let uptime = record.uptime_display();
        Self { record, uptime }
    }
}

/// `POST /v1/models/add` のレスポンス
#[derive(Debug, Serialize, Deserialize)]
pub struct AddModelResponse {
    /// 常に "started"
    pub status: String,
    /// メッセージ
    pub message: String,
    /// 登録されたデプロイメント
    pub model_info: DeploymentView,
}

/// 削除したモデルの要約
#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedModel {
    /// モデルID
    pub id: String,
    /// 表示名
    pub name: String,
    /// ポート
    pub port: u16,
}

/// `DELETE /v1/models/:model_id` のレスポンス
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveModelResponse {
    /// 常に "success"
    pub status: String,
    /// メッセージ
    pub message: String,
    /// 削除したモデル
    pub details: RemovedModel,
}

/// 状態詳細
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelStatusDetails {
    /// 表示名
    pub name: String,
    /// バックエンドのURL
    pub url: String,
    /// デバイス割り当て
    pub gpu_id: String,
    /// 量子化メタデータ
    pub quantization: QuantizationDescriptor,
    /// 稼働時間
    pub uptime: String,
}

/// `GET /v1/models/:model_id/status` のレスポンス
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelStatusResponse {
    /// モデルID
    pub model_id: String,
    /// ステータス
    pub status: String,
    /// 詳細
    pub details: ModelStatusDetails,
}

impl From<&DeploymentRecord> for ModelStatusResponse {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            model_id: record.identity.clone(),
            status: record.status.to_string(),
            details: ModelStatusDetails {
                name: record.display_name.clone(),
                url: record.endpoint_url.clone(),
                gpu_id: record.device.clone(),
                quantization: record.quantization.clone(),
                uptime: record.uptime_display(),
            },
        }
    }
}

async fn deploy(state: &AppState, request: DeployRequest) -> Result<DeploymentRecord, AppError> {
    let mode = if request.wait {
        LaunchMode::Wait
    } else {
        LaunchMode::Background
    };
    Ok(state.service.register(request.into_spec(), mode).await?)
}

/// GET / - サーバーのヘルスチェック
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        server: SERVER_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        models_loaded: state.service.registry().len().await,
    })
}

/// GET /v1/models - モデル一覧（要約）
pub async fn list_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    let models = state.service.list().await;
    Json(ModelListResponse {
        models: models.iter().map(ModelSummary::from).collect(),
    })
}

/// GET /v0/deployments - デプロイメント一覧
pub async fn list_deployments(State(state): State<AppState>) -> Json<Vec<DeploymentView>> {
    let records = state.service.list().await;
    Json(records.into_iter().map(DeploymentView::from).collect())
}

/// POST /v0/deployments - デプロイメント登録
pub async fn create_deployment(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> Result<(StatusCode, Json<DeploymentView>), AppError> {
    let record = deploy(&state, request).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// GET /v0/deployments/*key - 状態取得（identityまたは表示名）
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeploymentView>, AppError> {
    let record = state.service.lookup(key.trim_start_matches('/')).await?;
    Ok(Json(record.into()))
}

/// DELETE /v0/deployments/*key - デプロイメント削除
pub async fn delete_deployment(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeploymentView>, AppError> {
    let record = state.service.unregister(key.trim_start_matches('/')).await?;
    Ok(Json(record.into()))
}

/// POST /v1/models/add - モデル追加（`/v0/deployments` と同じ登録処理）
pub async fn add_model(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> Result<Json<AddModelResponse>, AppError> {
    let record = deploy(&state, request).await?;
    Ok(Json(AddModelResponse {
        status: "started".to_string(),
        message: format!("Model {} is being loaded", record.identity),
        model_info: record.into(),
    }))
}

/// DELETE /v1/models/:model_id - モデル削除
pub async fn remove_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<RemoveModelResponse>, AppError> {
    let record = state.service.unregister(&model_id).await?;
    Ok(Json(RemoveModelResponse {
        status: "success".to_string(),
        message: format!("Model {model_id} removed"),
        details: RemovedModel {
            id: record.identity,
            name: record.display_name,
            port: record.port,
        },
    }))
}

/// GET /v1/models/:model_id/status - モデルの状態
pub async fn model_status(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<ModelStatusResponse>, AppError> {
    let record = state.service.lookup(&model_id).await?;
    Ok(Json(ModelStatusResponse::from(&record)))
}
