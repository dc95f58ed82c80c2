//! ロギング初期化
//!
//! 標準出力と日次ローテーションのファイル（`{log_dir}/server.*.log`）の両方に出力する。

use crate::config::get_env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn";

/// フィルタ文字列を決定する（`LLMSV_LOG_LEVEL` → `RUST_LOG` → デフォルト）
pub fn filter_directive() -> String {
    get_env("LLMSV_LOG_LEVEL")
        .or_else(|| get_env("RUST_LOG"))
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// tracing subscriberを初期化する
///
/// 既にsubscriberが設定されている場合は何もしない（`Ok(None)`）。
/// 返されたガードはプロセス終了までdropしないこと（ファイル出力がフラッシュされなくなる）。
pub fn init(log_dir: &Path) -> anyhow::Result<Option<WorkerGuard>> {
    if tracing::dispatcher::has_been_set() {
        return Ok(None);
    }

    std::fs::create_dir_all(log_dir)?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("server")
        .filename_suffix("log")
        .build(log_dir)?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_new(filter_directive())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).compact();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(Some(guard))
}
