//! CLI module for llmsv
//!
//! モデルスーパーバイザーのコマンドラインインターフェース

pub mod serve;

use clap::{Parser, Subcommand};

/// llmsv - Supervises model-serving backends and routes OpenAI-compatible requests to them
#[derive(Parser, Debug)]
#[command(name = "llmsv")]
#[command(version, about, long_about = None)]
#[command(after_help = r#"ENVIRONMENT VARIABLES:
    LLMSV_HOST                    Bind address (default: 0.0.0.0)
    LLMSV_PORT                    Listen port (default: 8888)
    LLMSV_LOG_LEVEL               Log level (default: info)
    LLMSV_LOG_DIR                 Server and backend log directory (default: logs)
    LLMSV_CONFIG_DIR              Deployment descriptor directory (default: config/model_configs)
    LLMSV_STARTING_PORT           First backend port (default: 8000)
    LLMSV_BACKEND_PROGRAM         Backend launcher program (default: swift)
    LLMSV_INFER_BACKEND           Inference backend (default: vllm)
    LLMSV_BACKEND_HOST            Host used to reach backends (default: 127.0.0.1)
    LLMSV_QUANTIZED_DIR           Quantized model output (default: models/quantized)
    LLMSV_CALIBRATION_DIR         Calibration data (default: data/calibration)
    LLMSV_READY_INTERVAL_MS       Readiness poll interval (default: 1000)
    LLMSV_READY_ATTEMPTS          Polls before a backend is reported as starting (default: 30)
    LLMSV_READY_MAX_INTERVAL_SECS Maximum readiness backoff (default: 10)
    LLMSV_STARTUP_DEADLINE_SECS   Startup deadline, 0 disables (default: 1800)
    LLMSV_STOP_GRACE_SECS         Grace period before SIGKILL (default: 10)
    LLMSV_PROXY_TIMEOUT_SECS      Buffered proxy timeout (default: 90)
    LLMSV_STREAM_TIMEOUT_SECS     Streaming proxy timeout (default: 600)
    LLMSV_ENABLE_CORS             Enable permissive CORS (default: true)
"#)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the supervisor server
    Serve(serve::ServeArgs),
}
