//! デプロイメント記述子の永続化
//!
//! 登録に成功したデプロイメントを `{config_dir}/{表示名}.json` に保存し、
//! 次回起動時に読み込んで再登録する。

use crate::common::error::{CommonError, SvError, SvResult};
use crate::types::{DeploymentRecord, DeploymentSpec, LaunchParams, QuantizationDescriptor};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 保存されるデプロイメント記述子
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentDescriptor {
    /// モデルID
    pub model_id: String,
    /// バックエンドに渡したモデル参照（量子化済みパス等）
    pub deployed_model_id: String,
    /// 表示名
    pub display_name: String,
    /// ポート
    pub port: u16,
    /// デバイス割り当て（数値でも文字列でも読める）
    #[serde(alias = "device", deserialize_with = "device_from_any")]
    pub gpu_id: String,
    /// 量子化メタデータ
    #[serde(default)]
    pub quantization: QuantizationDescriptor,
    /// 起動パラメータ
    #[serde(default)]
    pub parameters: LaunchParams,
    /// 保存時のプロセスID（参考情報）
    #[serde(default)]
    pub pid: Option<u32>,
    /// 保存時刻
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

fn device_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Device {
        Text(String),
        Index(u64),
    }
    Ok(match Device::deserialize(deserializer)? {
        Device::Text(text) => text,
        Device::Index(index) => index.to_string(),
    })
}

/// RFC 3339、またはタイムゾーンなしのISO 8601（UTCとみなす）を受け付ける
fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    Ok(NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc()))
}

impl DeploymentDescriptor {
    /// 登録済みレコードから作成
    pub fn from_record(record: &DeploymentRecord) -> Self {
        Self {
            model_id: record.identity.clone(),
            deployed_model_id: record.model_ref.clone(),
            display_name: record.display_name.clone(),
            port: record.port,
            gpu_id: record.device.clone(),
            quantization: record.quantization.clone(),
            parameters: record.launch.clone(),
            pid: record.pid,
            created_at: Some(Utc::now()),
        }
    }

    /// 再登録用のSpecに変換する
    ///
    /// 量子化済みの成果物がある場合は、それを再利用して量子化をスキップする。
    pub fn to_spec(&self) -> DeploymentSpec {
        let mut spec = DeploymentSpec::new(&self.model_id)
            .with_port(self.port)
            .with_device(&self.gpu_id)
            .with_quantization(self.quantization.clone())
            .with_launch(self.parameters.clone());
        if self.deployed_model_id != self.model_id && !self.deployed_model_id.is_empty() {
            spec.artifact = Some(self.deployed_model_id.clone());
        }
        spec
    }
}

/// 読み込み結果（ファイルごと）
#[derive(Debug)]
pub struct LoadedDescriptor {
    /// ファイルパス
    pub path: PathBuf,
    /// 読み込み結果
    pub descriptor: SvResult<DeploymentDescriptor>,
}

fn io_error(context: &str, path: &Path, e: std::io::Error) -> SvError {
    SvError::Internal(format!("{context} {}: {e}", path.display()))
}

/// 記述子ストア
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    dir: PathBuf,
}

impl DescriptorStore {
    /// 保存先ディレクトリを指定して作成
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 保存先ディレクトリ
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 表示名に対応するファイルパス
    pub fn path_for(&self, display_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", display_name.replace('/', "_")))
    }

    /// 記述子を保存する
    pub async fn save(&self, descriptor: &DeploymentDescriptor) -> SvResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("failed to create", &self.dir, e))?;
        let path = self.path_for(&descriptor.display_name);
        let json = serde_json::to_vec_pretty(descriptor).map_err(CommonError::from)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| io_error("failed to write", &path, e))?;
        info!(path = %path.display(), model_id = %descriptor.model_id, "Saved deployment descriptor");
        Ok(path)
    }

    /// 記述子を削除する
    ///
    /// 同じ表示名で別のモデルの記述子が保存されている場合は削除しない。
    pub async fn remove(&self, identity: &str, display_name: &str) -> SvResult<bool> {
        let path = self.path_for(display_name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error("failed to read", &path, e)),
        };
        if let Ok(stored) = serde_json::from_slice::<DeploymentDescriptor>(&bytes) {
            if stored.model_id != identity {
                debug!(
                    path = %path.display(),
                    stored = %stored.model_id,
                    identity = %identity,
                    "Descriptor belongs to another model, keeping it"
                );
                return Ok(false);
            }
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error("failed to remove", &path, e))?;
        info!(path = %path.display(), "Removed deployment descriptor");
        Ok(true)
    }

    /// 保存済みの記述子をすべて読み込む（ファイル名順）
    ///
    /// ディレクトリがなければ空。壊れたファイルはエラーとして個別に返す。
    pub async fn load_all(&self) -> SvResult<Vec<LoadedDescriptor>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("failed to read", &self.dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("failed to read", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = Vec::with_capacity(paths.len());
        for path in paths {
            let descriptor = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<DeploymentDescriptor>(&bytes)
                    .map_err(|e| SvError::from(CommonError::from(e))),
                Err(e) => Err(io_error("failed to read", &path, e)),
            };
            if let Err(e) = &descriptor {
                warn!(path = %path.display(), error = %e, "Failed to load deployment descriptor");
            }
            loaded.push(LoadedDescriptor { path, descriptor });
        }
        Ok(loaded)
    }
}
