//! 量子化ツール呼び出し
//!
//! 量子化そのものは外部ツールが行う。ここでは出力先の決定・キャリブレーション
//! データの用意・ツールの起動と失敗時のエラー変換のみを扱う。

use crate::common::error::{SvError, SvResult};
use crate::config::QuantizerConfig;
use crate::supervisor::CommandSpec;
use crate::types::display_name_of;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{error, info};

/// キャリブレーションデータのファイル名
const CALIBRATION_FILE: &str = "samples.jsonl";

/// キャリブレーションデータが無い場合に用意するサンプル
const CALIBRATION_SAMPLES: &str = concat!(
    "{\"text\": \"This is a sample text for calibration.\"}\n",
    "{\"text\": \"Another example for model calibration.\"}\n",
);

/// 量子化ジョブ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizationJob {
    /// 量子化元のモデルID
    pub identity: String,
    /// 量子化手法
    pub method: String,
    /// ビット幅
    pub bits: u8,
    /// デバイス割り当て
    pub device: String,
}

/// 量子化ツールのtrait
#[async_trait]
pub trait Quantizer: Send + Sync {
    /// 量子化を実行し、成果物のパスを返す
    async fn quantize(&self, job: &QuantizationJob) -> SvResult<PathBuf>;
}

/// 外部コマンドによる量子化
#[derive(Debug, Clone)]
pub struct ExternalQuantizer {
    config: QuantizerConfig,
}

impl ExternalQuantizer {
    /// 設定を指定して作成
    pub fn new(config: QuantizerConfig) -> Self {
        Self { config }
    }

    /// 成果物の出力先（`{quantized_dir}/{name}-{method}-{bits}b`）
    pub fn output_dir(&self, job: &QuantizationJob) -> PathBuf {
        self.config.quantized_dir.join(format!(
            "{}-{}-{}b",
            display_name_of(&job.identity),
            job.method,
            job.bits
        ))
    }

    /// 量子化コマンド
    pub fn command(&self, job: &QuantizationJob) -> CommandSpec {
        CommandSpec::new(&self.config.program)
            .arg(&self.config.subcommand)
            .args([
                "--model".to_string(),
                job.identity.clone(),
                "--quant_bits".to_string(),
                job.bits.to_string(),
                "--quant_method".to_string(),
                job.method.clone(),
                "--dataset".to_string(),
                self.config.calibration_dir.display().to_string(),
                "--output_dir".to_string(),
                self.output_dir(job).display().to_string(),
            ])
            .env(&self.config.device_env, &job.device)
    }

    async fn ensure_calibration_data(&self) -> std::io::Result<()> {
        let path = self.config.calibration_dir.join(CALIBRATION_FILE);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        info!(path = %path.display(), "Creating calibration data");
        tokio::fs::create_dir_all(&self.config.calibration_dir).await?;
        tokio::fs::write(&path, CALIBRATION_SAMPLES).await
    }
}

fn io_failure(context: &str, path: &Path, e: std::io::Error) -> SvError {
    SvError::Quantization(format!("{context} {}: {e}", path.display()))
}

#[async_trait]
impl Quantizer for ExternalQuantizer {
    async fn quantize(&self, job: &QuantizationJob) -> SvResult<PathBuf> {
        let output_dir = self.output_dir(job);
        if tokio::fs::try_exists(&output_dir).await.unwrap_or(false) {
            info!(
                identity = %job.identity,
                output_dir = %output_dir.display(),
                "Model already quantized, skipping"
            );
            return Ok(output_dir);
        }

        self.ensure_calibration_data()
            .await
            .map_err(|e| io_failure("failed to prepare calibration data in", &self.config.calibration_dir, e))?;
        if let Some(parent) = output_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure("failed to create", parent, e))?;
        }

        let command = self.command(job);
        info!(identity = %job.identity, command = %command, "Quantizing model");
        let output = command
            .to_command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                SvError::Quantization(format!("failed to run {}: {e}", command.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(identity = %job.identity, status = %output.status, stderr = %stderr, "Quantization failed");
            return Err(SvError::Quantization(stderr));
        }

        info!(identity = %job.identity, output_dir = %output_dir.display(), "Quantization complete");
        Ok(output_dir)
    }
}
