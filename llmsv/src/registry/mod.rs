//! モデルレジストリ
//!
//! デプロイメントレコードをメモリ内で管理する。
//!
//! - identity → レコードの一次マップ
//! - 表示名 → identity の二次インデックス（登録順、O(1)参照）
//!
//! レコードの状態を書き換えられるのはプロセススーパーバイザーのみ
//! （`attach_process` / `transition` はクレート内部API）。

use crate::common::error::{SvError, SvResult};
use crate::events::{DeploymentEvent, DeploymentEventBus};
use crate::types::{DeploymentRecord, DeploymentStatus, ProcessDiagnostics};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct RegistryEntry {
    record: DeploymentRecord,
    /// 削除時にキャンセルされる（ルーティング中のストリーム・起動監視を止める）
    lifetime: CancellationToken,
    /// 削除処理中（ルーターからは解決されない）
    retiring: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    records: HashMap<String, RegistryEntry>,
    /// 表示名 → identity（登録順）
    by_name: HashMap<String, Vec<String>>,
}

impl RegistryState {
    /// identity完全一致を優先し、次に表示名インデックスを引く
    fn find(&self, key: &str, include_retiring: bool) -> Option<&RegistryEntry> {
        let usable = |entry: &&RegistryEntry| include_retiring || !entry.retiring;

        if let Some(entry) = self.records.get(key).filter(usable) {
            return Some(entry);
        }
        self.by_name
            .get(key)?
            .iter()
            .filter_map(|identity| self.records.get(identity))
            .find(usable)
    }

    fn port_holder(&self, port: u16) -> Option<&DeploymentRecord> {
        self.records
            .values()
            .map(|entry| &entry.record)
            .find(|record| record.port == port && record.status.is_active())
    }

    fn unindex_name(&mut self, display_name: &str, identity: &str) {
        if let Some(identities) = self.by_name.get_mut(display_name) {
            identities.retain(|id| id != identity);
            if identities.is_empty() {
                self.by_name.remove(display_name);
            }
        }
    }
}

/// モデルレジストリ
///
/// 明示的に生成して各コンポーネントに渡す（プロセス全体のシングルトンは持たない）。
#[derive(Clone)]
pub struct ModelRegistry {
    state: Arc<RwLock<RegistryState>>,
    events: DeploymentEventBus,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(DeploymentEventBus::new())
    }
}

impl ModelRegistry {
    /// イベントバスを指定してレジストリを作成
    pub fn new(events: DeploymentEventBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            events,
        }
    }

    /// イベントバス
    pub fn events(&self) -> &DeploymentEventBus {
        &self.events
    }

    /// identityが登録済みか（削除処理中も含む）
    pub async fn contains(&self, identity: &str) -> bool {
        self.state.read().await.records.contains_key(identity)
    }

    /// レコードを登録
    ///
    /// 重複identity・アクティブなレコードが使用中のポートは1回の書き込みロック内で拒否する。
    pub async fn register(&self, record: DeploymentRecord) -> SvResult<DeploymentRecord> {
        let mut state = self.state.write().await;

        if state.records.contains_key(&record.identity) {
            return Err(SvError::DuplicateIdentity(record.identity));
        }
        if let Some(holder) = state.port_holder(record.port) {
            warn!(
                identity = %record.identity,
                port = record.port,
                holder = %holder.identity,
                "Port already held by an active deployment"
            );
            return Err(SvError::PortInUse(record.port));
        }

        state
            .by_name
            .entry(record.display_name.clone())
            .or_default()
            .push(record.identity.clone());
        state.records.insert(
            record.identity.clone(),
            RegistryEntry {
                record: record.clone(),
                lifetime: CancellationToken::new(),
                retiring: false,
            },
        );
        drop(state);

        info!(
            identity = %record.identity,
            display_name = %record.display_name,
            port = record.port,
            "Registered deployment"
        );
        self.events.publish(DeploymentEvent::Registered {
            identity: record.identity.clone(),
            port: record.port,
            status: record.status,
        });

        Ok(record)
    }

    /// identityまたは表示名でレコードを検索
    ///
    /// 同じ表示名のレコードが複数ある場合は最も早く登録されたものを返す。
    pub async fn lookup(&self, key: &str) -> SvResult<DeploymentRecord> {
        self.state
            .read()
            .await
            .find(key, true)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| SvError::NotFound(key.to_string()))
    }

    /// identity完全一致でレコードを取得
    pub async fn get(&self, identity: &str) -> Option<DeploymentRecord> {
        self.state
            .read()
            .await
            .records
            .get(identity)
            .map(|entry| entry.record.clone())
    }

    /// 全レコードのスナップショット（登録順）
    pub async fn list(&self) -> Vec<DeploymentRecord> {
        let mut records: Vec<DeploymentRecord> = self
            .state
            .read()
            .await
            .records
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        records
    }

    /// 登録数
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    /// 登録が空か
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    /// 指定ステータスのレコード数
    pub async fn count_by_status(&self, status: DeploymentStatus) -> usize {
        self.state
            .read()
            .await
            .records
            .values()
            .filter(|entry| entry.record.status == status)
            .count()
    }

    /// 削除の第一段階
    ///
    /// ルーターからの解決を止め、ライフタイムトークンをキャンセルする
    /// （進行中のストリームと起動監視が終了する）。
    pub async fn retire(&self, identity: &str) -> SvResult<DeploymentRecord> {
        let mut state = self.state.write().await;
        let entry = state
            .records
            .get_mut(identity)
            .filter(|entry| !entry.retiring)
            .ok_or_else(|| SvError::NotFound(identity.to_string()))?;

        entry.retiring = true;
        entry.lifetime.cancel();
        debug!(identity = %identity, "Retiring deployment");
        Ok(entry.record.clone())
    }

    /// レコードを削除
    pub async fn unregister(&self, identity: &str) -> SvResult<DeploymentRecord> {
        let mut state = self.state.write().await;
        let entry = state
            .records
            .remove(identity)
            .ok_or_else(|| SvError::NotFound(identity.to_string()))?;
        state.unindex_name(&entry.record.display_name, identity);
        drop(state);

        entry.lifetime.cancel();
        info!(identity = %identity, port = entry.record.port, "Unregistered deployment");
        self.events.publish(DeploymentEvent::Removed {
            identity: identity.to_string(),
        });

        Ok(entry.record)
    }

    /// ルーター用の解決（削除処理中のレコードは対象外）
    pub(crate) async fn resolve(
        &self,
        key: &str,
    ) -> SvResult<(DeploymentRecord, CancellationToken)> {
        self.state
            .read()
            .await
            .find(key, false)
            .map(|entry| (entry.record.clone(), entry.lifetime.clone()))
            .ok_or_else(|| SvError::NotFound(key.to_string()))
    }

    /// レコードのライフタイムトークン
    pub(crate) async fn lifetime(&self, identity: &str) -> Option<CancellationToken> {
        self.state
            .read()
            .await
            .records
            .get(identity)
            .map(|entry| entry.lifetime.clone())
    }

    /// 起動したプロセスの情報を記録
    pub(crate) async fn attach_process(
        &self,
        identity: &str,
        pid: u32,
        started_at: DateTime<Utc>,
    ) -> SvResult<()> {
        let mut state = self.state.write().await;
        let entry = state
            .records
            .get_mut(identity)
            .ok_or_else(|| SvError::NotFound(identity.to_string()))?;
        entry.record.pid = Some(pid);
        entry.record.started_at = Some(started_at);
        Ok(())
    }

    /// ステータスを遷移させ、遷移前のステータスを返す
    ///
    /// 許可されていない遷移は `Internal` エラー（レコードは変更しない）。
    pub(crate) async fn transition(
        &self,
        identity: &str,
        next: DeploymentStatus,
        diagnostics: Option<ProcessDiagnostics>,
    ) -> SvResult<DeploymentStatus> {
        let mut state = self.state.write().await;
        let entry = state
            .records
            .get_mut(identity)
            .ok_or_else(|| SvError::NotFound(identity.to_string()))?;

        let previous = entry.record.status;
        if !previous.can_transition_to(next) {
            return Err(SvError::Internal(format!(
                "illegal status transition for {identity}: {previous} -> {next}"
            )));
        }
        entry.record.status = next;
        if diagnostics.is_some() {
            entry.record.diagnostics = diagnostics;
        }
        drop(state);

        info!(
            identity = %identity,
            old_status = %previous,
            new_status = %next,
            "Deployment status changed"
        );
        self.events.publish(DeploymentEvent::StatusChanged {
            identity: identity.to_string(),
            old_status: previous,
            new_status: next,
        });

        Ok(previous)
    }
}
