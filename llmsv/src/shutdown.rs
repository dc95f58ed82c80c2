//! 協調的シャットダウン
//!
//! OSシグナルに加えて、プロセス内からサーバー停止を要求するために使う。

use tokio_util::sync::CancellationToken;

/// シャットダウン要求の共有ハンドル
#[derive(Clone, Debug, Default)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    /// 停止が要求済みか
    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 停止を要求し、待機中のタスクをすべて起こす
    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    /// 停止が要求されるまで待つ（要求済みなら即座に戻る）
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}
