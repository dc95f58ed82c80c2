//! 起動監視（readiness polling）
//!
//! 1サイクルごとに:
//! 1. プロセスが終了していれば `failed`（終了コード・ログ末尾を記録）
//! 2. `GET {endpoint_url}/v1/models` が2xxなら `ready`
//! 3. それ以外は次のサイクルへ
//!
//! 初期試行回数を超えると `starting` に移行して呼び出し元を解放し、
//! 以後は間隔を倍々に伸ばしながら監視を続ける。

use super::logs::read_log_tail;
use crate::config::ReadinessPolicy;
use crate::registry::ModelRegistry;
use crate::types::{DeploymentStatus, ProcessDiagnostics};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// バックエンドのモデル一覧エンドポイントに問い合わせる
///
/// 2xxが返れば準備完了とみなす。
pub async fn probe(client: &Client, endpoint_url: &str, timeout: Duration) -> bool {
    let url = format!("{}/v1/models", endpoint_url.trim_end_matches('/'));
    match client.get(&url).timeout(timeout).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(url = %url, error = %e, "Readiness probe failed");
            false
        }
    }
}

/// 起動監視タスクの入力
pub(crate) struct ReadinessWatch {
    pub registry: ModelRegistry,
    pub client: Client,
    pub identity: String,
    pub endpoint_url: String,
    pub policy: ReadinessPolicy,
    pub child: Arc<Mutex<Child>>,
    pub log_path: PathBuf,
    pub log_tail_lines: usize,
    pub cancel: CancellationToken,
    pub status_tx: watch::Sender<DeploymentStatus>,
}

impl ReadinessWatch {
    /// 監視ループ（キャンセルされるか、ready / failed になるまで）
    pub(crate) async fn run(self) {
        let started = Instant::now();
        let mut interval = self.policy.initial_interval;
        let mut attempts: u32 = 0;
        let mut current = DeploymentStatus::Loading;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let exited = self.child.lock().await.try_wait();
            match exited {
                Ok(Some(status)) => {
                    let diagnostics = ProcessDiagnostics {
                        exit_code: status.code(),
                        reason: format!("process exited before becoming ready ({status})"),
                        log_tail: read_log_tail(&self.log_path, self.log_tail_lines).await,
                    };
                    warn!(
                        identity = %self.identity,
                        exit_code = ?diagnostics.exit_code,
                        "Backend process exited before becoming ready"
                    );
                    self.resolve(DeploymentStatus::Failed, Some(diagnostics))
                        .await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to query backend process state");
                }
            }

            let ready = tokio::select! {
                _ = self.cancel.cancelled() => return,
                ready = probe(&self.client, &self.endpoint_url, self.policy.probe_timeout) => ready,
            };
            if ready {
                info!(
                    identity = %self.identity,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend is ready"
                );
                self.resolve(DeploymentStatus::Ready, None).await;
                return;
            }

            attempts = attempts.saturating_add(1);
            if current == DeploymentStatus::Loading && attempts >= self.policy.initial_attempts {
                info!(
                    identity = %self.identity,
                    attempts,
                    "Backend not ready within the initial window, continuing in background"
                );
                if !self.resolve(DeploymentStatus::Starting, None).await {
                    return;
                }
                current = DeploymentStatus::Starting;
            }

            if current == DeploymentStatus::Starting {
                if let Some(deadline) = self.policy.startup_deadline {
                    if started.elapsed() >= deadline {
                        self.give_up(deadline).await;
                        return;
                    }
                }
                interval = self.policy.backoff(interval);
            }
        }
    }

    /// 起動期限を過ぎたためプロセスを停止して `failed` にする
    async fn give_up(&self, deadline: Duration) {
        warn!(
            identity = %self.identity,
            deadline_secs = deadline.as_secs(),
            "Readiness deadline exceeded, killing backend process"
        );
        let exit_code = {
            let mut child = self.child.lock().await;
            if let Err(e) = child.kill().await {
                warn!(identity = %self.identity, error = %e, "Failed to kill backend process");
            }
            child.try_wait().ok().flatten().and_then(|s| s.code())
        };
        let diagnostics = ProcessDiagnostics {
            exit_code,
            reason: "readiness deadline exceeded".to_string(),
            log_tail: read_log_tail(&self.log_path, self.log_tail_lines).await,
        };
        self.resolve(DeploymentStatus::Failed, Some(diagnostics))
            .await;
    }

    /// レジストリに遷移を書き込み、ハンドルに通知する
    ///
    /// キャンセル済み、または遷移できなかった場合は `false`。
    async fn resolve(&self, next: DeploymentStatus, diagnostics: Option<ProcessDiagnostics>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self
            .registry
            .transition(&self.identity, next, diagnostics)
            .await
        {
            Ok(_) => {
                self.status_tx.send_replace(next);
                true
            }
            Err(e) => {
                debug!(identity = %self.identity, error = %e, "Skipped readiness transition");
                false
            }
        }
    }
}
