//! デプロイメントイベントバス
//!
//! 登録・状態遷移・削除のイベントを購読者にブロードキャストするための基盤。
//! 監視用途のほか、状態遷移トレースのテストでも使用する。

use crate::types::DeploymentStatus;
use serde::Serialize;
use tokio::sync::broadcast;

/// イベントバスのチャネル容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// デプロイメントイベント
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum DeploymentEvent {
    /// モデル登録イベント
    Registered {
        /// モデルID
        identity: String,
        /// 割り当てポート
        port: u16,
        /// 登録時ステータス
        status: DeploymentStatus,
    },
    /// ステータス変化イベント
    StatusChanged {
        /// モデルID
        identity: String,
        /// 旧ステータス
        old_status: DeploymentStatus,
        /// 新ステータス
        new_status: DeploymentStatus,
    },
    /// モデル削除イベント
    Removed {
        /// モデルID
        identity: String,
    },
}

impl DeploymentEvent {
    /// イベント対象のモデルID
    pub fn identity(&self) -> &str {
        match self {
            Self::Registered { identity, .. }
            | Self::StatusChanged { identity, .. }
            | Self::Removed { identity } => identity,
        }
    }
}

/// デプロイメントイベントバス
#[derive(Clone)]
pub struct DeploymentEventBus {
    sender: broadcast::Sender<DeploymentEvent>,
}

impl Default for DeploymentEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentEventBus {
    /// 新しいイベントバスを作成
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// イベントバスを購読
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.sender.subscribe()
    }

    /// イベントを発行
    ///
    /// 購読者がいない場合でもエラーにはならない
    pub fn publish(&self, event: DeploymentEvent) {
        // 購読者がいない場合は送信に失敗するが、無視する
        let _ = self.sender.send(event);
    }

    /// 現在の購読者数を取得
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
