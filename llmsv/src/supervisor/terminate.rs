//! プロセス停止
//!
//! SIGTERMを送り、猶予期間内に終了しなければSIGKILLで強制終了する。

use crate::config::TerminationPolicy;
use serde::Serialize;
use std::io;
use tokio::process::Child;
use tracing::{debug, warn};

/// 停止処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// 管理中のプロセスがなかった
    NoProcess,
    /// 停止前に既に終了していた
    AlreadyExited,
    /// SIGTERMで終了した
    Graceful,
    /// 猶予期間を超えたためSIGKILLした
    Forced,
}

/// 指定されたPIDのプロセスにSIGTERMを送信します (Unix版)
///
/// 送信した場合は `Ok(true)` を返す。
#[cfg(unix)]
fn send_terminate(pid: u32) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        // 既に終了している（回収待ち）
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(io::Error::other(e.to_string())),
    }
}

/// 穏当な停止シグナルがないプラットフォームでは即座に強制終了へ進む
#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> io::Result<bool> {
    Ok(false)
}

/// 子プロセスを停止する
pub(crate) async fn stop_child(
    child: &mut Child,
    policy: &TerminationPolicy,
) -> io::Result<TerminationOutcome> {
    if child.try_wait()?.is_some() {
        return Ok(TerminationOutcome::AlreadyExited);
    }
    let Some(pid) = child.id() else {
        return Ok(TerminationOutcome::AlreadyExited);
    };

    if send_terminate(pid)? {
        debug!(pid, "Sent SIGTERM to backend process");
        for _ in 0..policy.grace_attempts {
            tokio::time::sleep(policy.poll_interval).await;
            if child.try_wait()?.is_some() {
                return Ok(TerminationOutcome::Graceful);
            }
        }
        warn!(
            pid,
            grace_secs = policy.grace_period().as_secs_f64(),
            "Backend process did not exit after SIGTERM, sending SIGKILL"
        );
    }

    child.kill().await?;
    Ok(TerminationOutcome::Forced)
}
