//! serve サブコマンド
//!
//! スーパーバイザーサーバーを起動します。

use clap::Args;

/// serve サブコマンドの引数
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Listen port
    #[arg(short, long, default_value = "8888", env = "LLMSV_PORT")]
    pub port: u16,

    /// Bind address
    #[arg(short = 'H', long, default_value = "0.0.0.0", env = "LLMSV_HOST")]
    pub host: String,

    /// Do not relaunch deployments saved by a previous run
    #[arg(long, default_value_t = false)]
    pub no_restore: bool,
}
