//! LLM model supervisor
//!
//! モデルサーバープロセスを起動・監視し、OpenAI互換リクエストを振り分けるサーバー

#![warn(missing_docs)]

/// 共通エラー型
pub mod common;

/// 型定義（デプロイメントSpec・レコード・ステータス）
pub mod types;

/// 環境変数による設定
pub mod config;

/// ロギング初期化ユーティリティ
pub mod logging;

/// バックエンドポートの払い出し
pub mod ports;

/// デプロイメントレジストリ
pub mod registry;

/// デプロイメントイベントバス
pub mod events;

/// バックエンドプロセスの起動・監視・停止
pub mod supervisor;

/// 推論リクエストの転送
pub mod proxy;

/// 外部量子化ツール
pub mod quantize;

/// デプロイメント記述子の永続化
pub mod store;

/// モデルサービス（各コンポーネントの統合）
pub mod service;

/// REST APIハンドラー
pub mod api;

/// Shutdown controller
pub mod shutdown;

/// axumサーバー
pub mod server;

/// CLIインターフェース
pub mod cli;

/// アプリケーション状態
#[derive(Clone)]
pub struct AppState {
    /// モデルサービス
    pub service: service::ModelService,
    /// Cooperative shutdown controller
    pub shutdown: shutdown::ShutdownController,
}

impl AppState {
    /// サービスから作成
    pub fn new(service: service::ModelService) -> Self {
        Self {
            service,
            shutdown: shutdown::ShutdownController::default(),
        }
    }
}
