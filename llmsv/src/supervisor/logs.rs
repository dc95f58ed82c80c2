//! バックエンドのログ出力先
//!
//! 各バックエンドのstdout/stderrは `{log_dir}/{identity の '/' を '_' に置換}.log` に書き出す。

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// identityに対応するログファイルのパス
pub fn log_path(log_dir: &Path, identity: &str) -> PathBuf {
    log_dir.join(format!("{}.log", identity.replace('/', "_")))
}

/// ログファイルを作成（起動ごとに切り詰める）し、stdout/stderr用のハンドルを返す
pub(crate) fn open_log_sink(path: &Path) -> io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = File::create(path)?;
    let stderr = stdout.try_clone()?;
    Ok((Stdio::from(stdout), Stdio::from(stderr)))
}

/// ログ末尾 `lines` 行を返す（読めない場合は空文字列）
pub async fn read_log_tail(path: &Path, lines: usize) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => tail_lines(&String::from_utf8_lossy(&bytes), lines),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Failed to read backend log");
            String::new()
        }
    }
}

fn tail_lines(content: &str, lines: usize) -> String {
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
