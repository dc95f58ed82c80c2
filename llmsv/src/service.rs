//! モデルサービス
//!
//! ポートアロケーター・レジストリ・スーパーバイザー・ルーター・量子化ツール・
//! 記述子ストアを束ね、呼び出し側に公開する操作
//! （register / unregister / lookup / list / route）を提供する。

use crate::common::error::{SvError, SvResult};
use crate::config::{AppConfig, BackendConfig};
use crate::events::DeploymentEventBus;
use crate::ports::PortAllocator;
use crate::proxy::{ProxyRequest, ProxyResponse, RequestRouter};
use crate::quantize::{ExternalQuantizer, QuantizationJob, Quantizer};
use crate::registry::ModelRegistry;
use crate::store::{DeploymentDescriptor, DescriptorStore};
use crate::supervisor::{CommandSpec, LaunchMode, Supervisor, TerminationOutcome};
use crate::types::{DeploymentRecord, DeploymentSpec, DeploymentStatus};
use reqwest::Client;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// 起動時の再登録結果
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// 再登録したモデルID
    pub restored: Vec<String>,
    /// 失敗した記述子（ファイルパスとエラー）
    pub failed: Vec<(PathBuf, SvError)>,
}

/// 登録処理中のidentity
///
/// ポート確保・量子化の前に取得し、登録処理の終了時に解放する。
#[derive(Default)]
struct PendingRegistrations {
    identities: Mutex<HashSet<String>>,
}

impl PendingRegistrations {
    fn begin(&self, identity: &str) -> Option<PendingGuard<'_>> {
        let mut identities = self
            .identities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        identities.insert(identity.to_string()).then(|| PendingGuard {
            pending: self,
            identity: identity.to_string(),
        })
    }
}

struct PendingGuard<'a> {
    pending: &'a PendingRegistrations,
    identity: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .identities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.identity);
    }
}

struct ServiceInner {
    pending: PendingRegistrations,
    allocator: PortAllocator,
    registry: ModelRegistry,
    supervisor: Supervisor,
    router: RequestRouter,
    quantizer: Arc<dyn Quantizer>,
    store: DescriptorStore,
    backend: BackendConfig,
    backend_host: String,
}

/// モデルサービス
#[derive(Clone)]
pub struct ModelService {
    inner: Arc<ServiceInner>,
}

impl ModelService {
    /// 設定から作成（量子化は外部ツールを使用）
    pub fn new(config: &AppConfig) -> SvResult<Self> {
        let quantizer = Arc::new(ExternalQuantizer::new(config.quantizer.clone()));
        Self::with_quantizer(config, quantizer)
    }

    /// 量子化ツールを指定して作成
    pub fn with_quantizer(config: &AppConfig, quantizer: Arc<dyn Quantizer>) -> SvResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| SvError::Internal(format!("failed to create HTTP client: {e}")))?;
        let registry = ModelRegistry::new(DeploymentEventBus::new());
        let supervisor = Supervisor::new(registry.clone(), client.clone(), config.supervisor.clone());
        let router = RequestRouter::new(registry.clone(), client, config.proxy);

        Ok(Self {
            inner: Arc::new(ServiceInner {
                pending: PendingRegistrations::default(),
                allocator: PortAllocator::new(config.starting_port),
                registry,
                supervisor,
                router,
                quantizer,
                store: DescriptorStore::new(&config.config_dir),
                backend: config.backend.clone(),
                backend_host: config.supervisor.backend_host.clone(),
            }),
        })
    }

    /// レジストリ
    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// スーパーバイザー
    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    /// ポートアロケーター
    pub fn allocator(&self) -> &PortAllocator {
        &self.inner.allocator
    }

    /// イベントバス
    pub fn events(&self) -> &DeploymentEventBus {
        self.inner.registry.events()
    }

    /// 記述子ストア
    pub fn store(&self) -> &DescriptorStore {
        &self.inner.store
    }

    /// デプロイメントを登録し、バックエンドを起動する
    ///
    /// `LaunchMode::Background` ではプロセス起動直後に `loading` のレコードを返す。
    /// `LaunchMode::Wait` では初回判定まで待ち、起動失敗は `ProcessFailure` になる。
    /// 同じidentityの登録が処理中または登録済みなら、ポートを確保する前に
    /// `DuplicateIdentity` を返す。
    pub async fn register(
        &self,
        spec: DeploymentSpec,
        mode: LaunchMode,
    ) -> SvResult<DeploymentRecord> {
        spec.validate()?;
        let inner = &self.inner;
        let Some(_pending) = inner.pending.begin(&spec.identity) else {
            return Err(SvError::DuplicateIdentity(spec.identity));
        };
        if inner.registry.contains(&spec.identity).await {
            return Err(SvError::DuplicateIdentity(spec.identity));
        }

        let port = match spec.port {
            Some(port) => inner.allocator.claim(port)?,
            None => inner.allocator.reserve()?,
        };

        let model_ref = match &spec.artifact {
            Some(artifact) => artifact.clone(),
            None if spec.quantization.enabled => {
                let job = QuantizationJob {
                    identity: spec.identity.clone(),
                    method: spec.quantization.method.clone(),
                    bits: spec.quantization.bits,
                    device: spec.device.clone(),
                };
                inner.quantizer.quantize(&job).await?.display().to_string()
            }
            None => spec.identity.clone(),
        };

        let record = DeploymentRecord::new(&spec, port, &inner.backend_host, model_ref);
        let record = inner.registry.register(record).await?;

        let command = CommandSpec::for_backend(&inner.backend, &record);
        inner.supervisor.launch(&record, command, mode).await?;

        let record = inner
            .registry
            .get(&record.identity)
            .await
            .ok_or_else(|| SvError::NotFound(record.identity.clone()))?;
        if let Err(e) = inner
            .store
            .save(&DeploymentDescriptor::from_record(&record))
            .await
        {
            warn!(identity = %record.identity, error = %e, "Failed to persist deployment descriptor");
        }
        Ok(record)
    }

    /// デプロイメントを削除する
    ///
    /// ルーティングを止めてからプロセスを停止し、レコードと記述子を削除する。
    /// 未登録のキーは `NotFound`（シグナル送信・状態変更なし）。
    pub async fn unregister(&self, key: &str) -> SvResult<DeploymentRecord> {
        let inner = &self.inner;
        let record = inner.registry.lookup(key).await?;
        let identity = record.identity.as_str();

        inner.registry.retire(identity).await?;
        match inner.supervisor.terminate(identity).await {
            Ok(TerminationOutcome::NoProcess) => {}
            Ok(outcome) => info!(identity = %identity, outcome = ?outcome, "Stopped backend"),
            Err(e) => error!(identity = %identity, error = %e, "Failed to stop backend cleanly"),
        }

        let removed = inner.registry.unregister(identity).await?;
        if let Err(e) = inner.store.remove(identity, &removed.display_name).await {
            warn!(identity = %identity, error = %e, "Failed to remove deployment descriptor");
        }
        Ok(removed)
    }

    /// identityまたは表示名でデプロイメントを検索
    pub async fn lookup(&self, key: &str) -> SvResult<DeploymentRecord> {
        self.inner.registry.lookup(key).await
    }

    /// 全デプロイメントのスナップショット
    pub async fn list(&self) -> Vec<DeploymentRecord> {
        self.inner.registry.list().await
    }

    /// `ready` のデプロイメント数
    pub async fn ready_count(&self) -> usize {
        self.inner
            .registry
            .count_by_status(DeploymentStatus::Ready)
            .await
    }

    /// 推論リクエストを転送する
    pub async fn route(&self, key: &str, request: ProxyRequest) -> SvResult<ProxyResponse> {
        self.inner.router.route(key, request).await
    }

    /// 保存済みの記述子から再登録する
    ///
    /// 個々の失敗はログに記録して続行する。
    pub async fn restore(&self) -> SvResult<RestoreReport> {
        let mut report = RestoreReport::default();
        for loaded in self.inner.store.load_all().await? {
            let descriptor = match loaded.descriptor {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    report.failed.push((loaded.path, e));
                    continue;
                }
            };
            match self.register(descriptor.to_spec(), LaunchMode::Background).await {
                Ok(record) => {
                    info!(identity = %record.identity, port = record.port, "Restored deployment");
                    report.restored.push(record.identity);
                }
                Err(e) => {
                    warn!(
                        path = %loaded.path.display(),
                        model_id = %descriptor.model_id,
                        error = %e,
                        "Failed to restore deployment"
                    );
                    report.failed.push((loaded.path, e));
                }
            }
        }
        Ok(report)
    }

    /// 全バックエンドを停止する（記述子は次回起動のために残す）
    pub async fn shutdown(&self) {
        for (identity, result) in self.inner.supervisor.shutdown_all().await {
            if let Err(e) = result {
                error!(identity = %identity, error = %e, "Failed to stop backend during shutdown");
            }
        }
    }
}
