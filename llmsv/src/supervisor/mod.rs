//! プロセススーパーバイザー
//!
//! バックエンドプロセスの起動・起動監視・停止を担当する。
//! レコードのステータスを書き換えるのはこのモジュールのみ。

pub mod command;
pub mod logs;
pub mod readiness;
pub mod terminate;

pub use command::CommandSpec;
pub use terminate::TerminationOutcome;

use crate::common::error::{SvError, SvResult};
use crate::config::SupervisorConfig;
use crate::registry::ModelRegistry;
use crate::types::{DeploymentRecord, DeploymentStatus, ProcessDiagnostics};
use chrono::Utc;
use readiness::ReadinessWatch;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 起動モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// プロセス起動直後に戻る（起動監視はバックグラウンド）
    #[default]
    Background,
    /// 初回の判定（ready / starting / failed）まで待つ
    Wait,
}

/// 起動中・起動済みプロセスへのハンドル
#[derive(Debug, Clone)]
pub struct LaunchHandle {
    identity: String,
    pid: u32,
    status_rx: watch::Receiver<DeploymentStatus>,
}

impl LaunchHandle {
    /// モデルID
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// プロセスID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// 起動監視から見た現在のステータス
    pub fn status(&self) -> DeploymentStatus {
        *self.status_rx.borrow()
    }

    /// `loading` 以外になるまで待つ
    ///
    /// 起動監視がキャンセルされた場合はその時点のステータスを返す。
    pub async fn wait_initial(&mut self) -> DeploymentStatus {
        self.wait_until(|status| *status != DeploymentStatus::Loading)
            .await
    }

    /// `ready` / `failed` が確定するまで待つ
    ///
    /// 起動監視がキャンセルされた場合はその時点のステータスを返す。
    pub async fn wait_resolved(&mut self) -> DeploymentStatus {
        self.wait_until(|status| {
            matches!(status, DeploymentStatus::Ready | DeploymentStatus::Failed)
        })
        .await
    }

    async fn wait_until(&mut self, done: impl FnMut(&DeploymentStatus) -> bool) -> DeploymentStatus {
        let resolved = self.status_rx.wait_for(done).await.map(|status| *status);
        resolved.unwrap_or_else(|_| *self.status_rx.borrow())
    }
}

struct ManagedProcess {
    pid: u32,
    child: Arc<Mutex<Child>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    status_rx: watch::Receiver<DeploymentStatus>,
    log_path: PathBuf,
}

struct SupervisorInner {
    registry: ModelRegistry,
    client: Client,
    config: SupervisorConfig,
    processes: Mutex<HashMap<String, ManagedProcess>>,
}

/// プロセススーパーバイザー
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// 共有HTTPクライアントを指定して作成
    pub fn new(registry: ModelRegistry, client: Client, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                client,
                config,
                processes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 設定
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// 管理中のプロセスがあるか
    pub async fn is_managed(&self, identity: &str) -> bool {
        self.inner.processes.lock().await.contains_key(identity)
    }

    /// 管理中プロセスのログファイル
    pub async fn log_path(&self, identity: &str) -> Option<PathBuf> {
        self.inner
            .processes
            .lock()
            .await
            .get(identity)
            .map(|managed| managed.log_path.clone())
    }

    /// バックエンドプロセスを起動する
    ///
    /// レコードは登録済みかつ `loading` であること。起動に失敗した場合は
    /// レコードを `failed` にして `ProcessFailure` を返す。
    pub async fn launch(
        &self,
        record: &DeploymentRecord,
        command: CommandSpec,
        mode: LaunchMode,
    ) -> SvResult<LaunchHandle> {
        let identity = record.identity.as_str();
        let mut processes = self.inner.processes.lock().await;
        if processes.contains_key(identity) {
            return Err(SvError::Internal(format!(
                "{identity} already has a managed process"
            )));
        }

        let current = self
            .inner
            .registry
            .get(identity)
            .await
            .ok_or_else(|| SvError::NotFound(identity.to_string()))?;
        if current.status != DeploymentStatus::Loading {
            return Err(SvError::Internal(format!(
                "cannot launch {identity} in status {}",
                current.status
            )));
        }
        let lifetime = self
            .inner
            .registry
            .lifetime(identity)
            .await
            .ok_or_else(|| SvError::NotFound(identity.to_string()))?;

        let log_path = logs::log_path(&self.inner.config.log_dir, identity);
        let (stdout, stderr) = match logs::open_log_sink(&log_path) {
            Ok(sink) => sink,
            Err(e) => {
                return Err(self
                    .fail_launch(identity, format!("failed to open log file: {e}"))
                    .await)
            }
        };

        info!(identity = %identity, port = current.port, command = %command, "Launching backend process");
        let child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                return Err(self
                    .fail_launch(identity, format!("failed to spawn {}: {e}", command.program))
                    .await)
            }
        };
        let Some(pid) = child.id() else {
            let _ = child.wait().await;
            return Err(self
                .fail_launch(identity, "process exited immediately after spawn".to_string())
                .await);
        };

        if let Err(e) = self
            .inner
            .registry
            .attach_process(identity, pid, Utc::now())
            .await
        {
            // 起動中にレコードが削除された
            let _ = child.kill().await;
            return Err(e);
        }

        let child = Arc::new(Mutex::new(child));
        let cancel = lifetime.child_token();
        let (status_tx, status_rx) = watch::channel(DeploymentStatus::Loading);
        let watcher = ReadinessWatch {
            registry: self.inner.registry.clone(),
            client: self.inner.client.clone(),
            identity: identity.to_string(),
            endpoint_url: current.endpoint_url.clone(),
            policy: self.inner.config.readiness,
            child: child.clone(),
            log_path: log_path.clone(),
            log_tail_lines: self.inner.config.log_tail_lines,
            cancel: cancel.clone(),
            status_tx,
        };
        let task = tokio::spawn(watcher.run());

        processes.insert(
            identity.to_string(),
            ManagedProcess {
                pid,
                child,
                cancel,
                task: Some(task),
                status_rx: status_rx.clone(),
                log_path,
            },
        );
        drop(processes);

        let mut handle = LaunchHandle {
            identity: identity.to_string(),
            pid,
            status_rx,
        };
        if mode == LaunchMode::Wait && handle.wait_initial().await == DeploymentStatus::Failed {
            let diagnostics = self
                .inner
                .registry
                .get(identity)
                .await
                .and_then(|record| record.diagnostics)
                .unwrap_or_default();
            return Err(SvError::ProcessFailure(diagnostics));
        }

        Ok(handle)
    }

    async fn fail_launch(&self, identity: &str, reason: String) -> SvError {
        error!(identity = %identity, reason = %reason, "Failed to launch backend process");
        let diagnostics = ProcessDiagnostics {
            exit_code: None,
            reason,
            log_tail: String::new(),
        };
        if let Err(e) = self
            .inner
            .registry
            .transition(identity, DeploymentStatus::Failed, Some(diagnostics.clone()))
            .await
        {
            warn!(identity = %identity, error = %e, "Failed to record launch failure");
        }
        SvError::ProcessFailure(diagnostics)
    }

    /// 管理中プロセスのハンドルを取得
    pub async fn watch(&self, identity: &str) -> Option<LaunchHandle> {
        self.inner
            .processes
            .lock()
            .await
            .get(identity)
            .map(|managed| LaunchHandle {
                identity: identity.to_string(),
                pid: managed.pid,
                status_rx: managed.status_rx.clone(),
            })
    }

    /// プロセスを停止する
    ///
    /// 未登録のidentityは `NotFound`（シグナルは送らない）。管理中のプロセスが
    /// なければ `NoProcess` でステータスは変えない。プロセスを停止した場合、
    /// `ready` / `failed` のレコードは `stopped` になる。
    pub async fn terminate(&self, identity: &str) -> SvResult<TerminationOutcome> {
        if !self.inner.registry.contains(identity).await {
            return Err(SvError::NotFound(identity.to_string()));
        }

        let managed = self.inner.processes.lock().await.remove(identity);
        let outcome = match managed {
            None => TerminationOutcome::NoProcess,
            Some(mut managed) => {
                managed.cancel.cancel();
                if let Some(task) = managed.task.take() {
                    if let Err(e) = task.await {
                        warn!(identity = %identity, error = %e, "Readiness task ended abnormally");
                    }
                }
                let mut child = managed.child.lock().await;
                let stopped =
                    terminate::stop_child(&mut child, &self.inner.config.termination).await;
                stopped.map_err(|e| {
                    SvError::Internal(format!(
                        "failed to stop process {} for {identity}: {e}",
                        managed.pid
                    ))
                })?
            }
        };

        // プロセスを持たないレコードは loading / failed のまま
        if outcome == TerminationOutcome::NoProcess {
            info!(identity = %identity, "No managed process to terminate");
            return Ok(outcome);
        }
        if let Some(record) = self.inner.registry.get(identity).await {
            if matches!(
                record.status,
                DeploymentStatus::Ready | DeploymentStatus::Failed
            ) {
                self.inner
                    .registry
                    .transition(identity, DeploymentStatus::Stopped, None)
                    .await?;
            }
        }

        info!(identity = %identity, outcome = ?outcome, "Terminated backend process");
        Ok(outcome)
    }

    /// 管理中の全プロセスを並行して停止する
    pub async fn shutdown_all(&self) -> Vec<(String, SvResult<TerminationOutcome>)> {
        let identities: Vec<String> = self.inner.processes.lock().await.keys().cloned().collect();
        info!(count = identities.len(), "Shutting down all backend processes");

        let results = futures::future::join_all(
            identities
                .iter()
                .map(|identity| self.terminate(identity)),
        )
        .await;
        identities.into_iter().zip(results).collect()
    }
}
