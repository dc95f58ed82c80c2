//! デプロイメント型定義
//!
//! 登録されたモデル1件分の状態（ポート・デバイス・量子化情報・プロセス情報）を表す。

use crate::common::error::CommonError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// デプロイメントのライフサイクル状態
///
/// 許可される遷移:
///
/// ```text
/// loading  -> ready | starting | failed
/// starting -> ready | failed
/// ready    -> stopped
/// failed   -> stopped
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// 登録直後（プロセス起動・初回ヘルスチェック待ち）
    #[default]
    Loading,
    /// 初期待機時間内に準備完了しなかった（バックグラウンドで監視継続中）
    Starting,
    /// 推論リクエストを受け付け可能
    Ready,
    /// 起動失敗またはプロセス終了
    Failed,
    /// 明示的な停止により終了
    Stopped,
}

impl DeploymentStatus {
    /// 全ステータス（テスト・列挙用）
    pub const ALL: [DeploymentStatus; 5] = [
        Self::Loading,
        Self::Starting,
        Self::Ready,
        Self::Failed,
        Self::Stopped,
    ];

    /// DeploymentStatusを文字列に変換
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// `self -> next` の遷移が許可されているか
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Loading, Ready)
                | (Loading, Starting)
                | (Loading, Failed)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Ready, Stopped)
                | (Failed, Stopped)
        )
    }

    /// ポートを占有している状態か（loading / starting / ready）
    pub fn is_active(self) -> bool {
        matches!(self, Self::Loading | Self::Starting | Self::Ready)
    }

    /// 起動処理の結果が確定した状態か
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Stopped)
    }
}

impl FromStr for DeploymentStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loading" => Ok(Self::Loading),
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(CommonError::Validation(format!(
                "unknown deployment status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 量子化メタデータ
///
/// コア側では情報としてのみ扱う。実際の量子化は外部ツールが行う。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuantizationDescriptor {
    /// 量子化を行うか
    #[serde(default)]
    pub enabled: bool,
    /// 量子化手法（例: "awq", "gptq"）
    #[serde(default = "default_quant_method")]
    pub method: String,
    /// ビット幅
    #[serde(default)]
    pub bits: u8,
}

fn default_quant_method() -> String {
    "none".to_string()
}

impl Default for QuantizationDescriptor {
    fn default() -> Self {
        Self::disabled()
    }
}

impl QuantizationDescriptor {
    /// 量子化なし
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            method: default_quant_method(),
            bits: 0,
        }
    }

    /// 量子化を要求する
    pub fn requested(method: impl Into<String>, bits: u8) -> Self {
        Self {
            enabled: true,
            method: method.into(),
            bits,
        }
    }

    fn validate(&self) -> Result<(), CommonError> {
        if !self.enabled {
            return Ok(());
        }
        if self.method.trim().is_empty() || self.method == "none" {
            return Err(CommonError::Validation(
                "quantization method is required when quantization is enabled".to_string(),
            ));
        }
        if !(2..=8).contains(&self.bits) {
            return Err(CommonError::Validation(format!(
                "quantization bits must be between 2 and 8 (got {})",
                self.bits
            )));
        }
        Ok(())
    }
}

/// バックエンド起動パラメータ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchParams {
    /// 最大コンテキスト長
    #[serde(default = "default_max_model_len")]
    pub max_model_len: u32,
    /// GPUメモリ使用率（0 < x <= 1）
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f32,
    /// 最大バッチサイズ
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
}

fn default_max_model_len() -> u32 {
    8192
}

fn default_gpu_memory_utilization() -> f32 {
    0.9
}

fn default_max_batch_size() -> u32 {
    32
}

impl Default for LaunchParams {
    fn default() -> Self {
        Self {
            max_model_len: default_max_model_len(),
            gpu_memory_utilization: default_gpu_memory_utilization(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl LaunchParams {
    fn validate(&self) -> Result<(), CommonError> {
        if self.max_model_len == 0 {
            return Err(CommonError::Validation(
                "max_model_len must be greater than 0".to_string(),
            ));
        }
        let util = self.gpu_memory_utilization;
        if !(util > 0.0 && util <= 1.0) {
            return Err(CommonError::Validation(format!(
                "gpu_memory_utilization must be in (0, 1] (got {util})"
            )));
        }
        if self.max_batch_size == 0 {
            return Err(CommonError::Validation(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 登録リクエスト（検証済みスキーマ）
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentSpec {
    /// モデルID（一意キー）
    pub identity: String,
    /// 明示的なポート（未指定ならアロケーターが払い出す）
    pub port: Option<u16>,
    /// デバイス割り当て（例: "0", "0,1"）
    pub device: String,
    /// 量子化設定
    pub quantization: QuantizationDescriptor,
    /// 起動パラメータ
    pub launch: LaunchParams,
    /// 量子化済みアーティファクト（指定時は量子化をスキップ）
    pub artifact: Option<String>,
}

impl DeploymentSpec {
    /// デフォルト設定でSpecを作成
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            port: None,
            device: "0".to_string(),
            quantization: QuantizationDescriptor::disabled(),
            launch: LaunchParams::default(),
            artifact: None,
        }
    }

    /// ポートを指定
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// デバイスを指定
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// 量子化設定を指定
    pub fn with_quantization(mut self, quantization: QuantizationDescriptor) -> Self {
        self.quantization = quantization;
        self
    }

    /// 起動パラメータを指定
    pub fn with_launch(mut self, launch: LaunchParams) -> Self {
        self.launch = launch;
        self
    }

    /// 表示名（identityのベース名）
    pub fn display_name(&self) -> String {
        display_name_of(&self.identity)
    }

    /// 登録境界での一括検証
    pub fn validate(&self) -> Result<(), CommonError> {
        if self.identity.is_empty() || self.identity.trim() != self.identity {
            return Err(CommonError::Validation(
                "model_id must be non-empty and must not have surrounding whitespace".to_string(),
            ));
        }
        if self.display_name().is_empty() {
            return Err(CommonError::Validation(format!(
                "cannot derive a display name from model_id '{}'",
                self.identity
            )));
        }
        if self.port == Some(0) {
            return Err(CommonError::Validation(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        if self.device.is_empty()
            || !self
                .device
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ',')
        {
            return Err(CommonError::Validation(format!(
                "invalid device assignment: '{}'",
                self.device
            )));
        }
        self.quantization.validate()?;
        self.launch.validate()
    }
}

/// identityから表示名を導出する
///
/// - `"Qwen/Qwen2-7B"` → `"Qwen2-7B"`
/// - `"models/llama/"` → `"llama"`
pub fn display_name_of(identity: &str) -> String {
    identity
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// プロセス失敗時の診断情報
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProcessDiagnostics {
    /// 終了コード（シグナル終了・未終了の場合はNone）
    pub exit_code: Option<i32>,
    /// 失敗理由
    pub reason: String,
    /// ログ末尾
    pub log_tail: String,
}

/// デプロイメントレコード
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    /// モデルID（一意・不変）
    pub identity: String,
    /// 表示名（一意とは限らない）
    pub display_name: String,
    /// 割り当てポート（不変）
    pub port: u16,
    /// バックエンドのベースURL（不変）
    pub endpoint_url: String,
    /// デバイス割り当て
    pub device: String,
    /// 量子化メタデータ
    pub quantization: QuantizationDescriptor,
    /// 起動パラメータ
    pub launch: LaunchParams,
    /// バックエンドに渡すモデル参照（量子化済みパス or identity）
    pub model_ref: String,
    /// 現在のステータス
    pub status: DeploymentStatus,
    /// プロセスID（起動試行後のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// プロセス起動時刻
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// 登録時刻
    pub registered_at: DateTime<Utc>,
    /// 失敗時の診断情報
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<ProcessDiagnostics>,
}

impl DeploymentRecord {
    /// 検証済みSpecからloading状態のレコードを作成
    pub fn new(spec: &DeploymentSpec, port: u16, backend_host: &str, model_ref: String) -> Self {
        Self {
            identity: spec.identity.clone(),
            display_name: spec.display_name(),
            port,
            endpoint_url: format!("http://{}:{}", backend_host, port),
            device: spec.device.clone(),
            quantization: spec.quantization.clone(),
            launch: spec.launch.clone(),
            model_ref,
            status: DeploymentStatus::Loading,
            pid: None,
            started_at: None,
            registered_at: Utc::now(),
            diagnostics: None,
        }
    }

    /// 起動からの経過時間（未起動なら0）
    pub fn uptime(&self) -> Duration {
        self.started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
            .unwrap_or_default()
    }

    /// 稼働時間を "1h 2m 3s" 形式で返す
    pub fn uptime_display(&self) -> String {
        if self.started_at.is_none() {
            return "Not started".to_string();
        }
        let secs = self.uptime().as_secs();
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
