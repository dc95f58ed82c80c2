//! テスト用のサービス構築

use llmsv::config::{AppConfig, BackendConfig, ReadinessPolicy, TerminationPolicy};
use llmsv::service::ModelService;
use llmsv::types::{DeploymentRecord, DeploymentStatus};
use std::path::Path;
use std::time::{Duration, Instant};

/// 短い間隔で起動監視する設定（ディレクトリはすべて `root` 配下）
pub fn fast_config(root: &Path, backend: BackendConfig) -> AppConfig {
    let mut config = AppConfig::default();
    config.config_dir = root.join("configs");
    config.backend = backend;
    config.supervisor.log_dir = root.join("logs");
    config.supervisor.readiness = ReadinessPolicy {
        initial_interval: Duration::from_millis(20),
        initial_attempts: 50,
        max_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(500),
        startup_deadline: Some(Duration::from_secs(20)),
    };
    config.supervisor.termination = TerminationPolicy {
        grace_attempts: 40,
        poll_interval: Duration::from_millis(50),
    };
    config.quantizer.quantized_dir = root.join("quantized");
    config.quantizer.calibration_dir = root.join("calibration");
    config
}

/// テスト用のサービスと一時ディレクトリ
pub struct TestService {
    pub service: ModelService,
    pub config: AppConfig,
    pub dir: tempfile::TempDir,
}

impl TestService {
    /// `backend` を起動するサービス
    pub fn new(backend: BackendConfig) -> Self {
        Self::with(backend, |_| {})
    }

    /// 設定を調整して作成
    pub fn with(backend: BackendConfig, adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path(), backend);
        adjust(&mut config);
        let service = ModelService::new(&config).unwrap();
        Self {
            service,
            config,
            dir,
        }
    }
}

/// レコードが `status` になるまで待つ
pub async fn wait_for_status(
    service: &ModelService,
    key: &str,
    status: DeploymentStatus,
) -> DeploymentRecord {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let record = service.lookup(key).await.unwrap();
        if record.status == status {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "{key} did not reach {status} (current: {})",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
