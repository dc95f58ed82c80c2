//! Configuration management via environment variables
//!
//! Provides helper functions for reading `LLMSV_*` environment variables and
//! the typed configuration structs built from them.

use crate::common::error::CommonError;
use crate::ports::DEFAULT_STARTING_PORT;
use std::path::PathBuf;
use std::time::Duration;

/// Get an environment variable, treating empty values as unset
pub fn get_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Get an environment variable with a default value
pub fn get_env_or(name: &str, default: &str) -> String {
    get_env(name).unwrap_or_else(|| default.to_string())
}

/// Get an environment variable, parsing to a specific type
///
/// Returns `default` if the variable is unset or cannot be parsed.
pub fn get_env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match get_env(name) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    "Environment variable '{}' has invalid value '{}', using default",
                    name,
                    raw
                );
                default
            }
        },
        None => default,
    }
}

/// Get a boolean flag (`true/1/yes/on` enable it)
pub fn get_env_flag(name: &str, default: bool) -> bool {
    get_env(name)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Readiness polling policy
///
/// After `initial_attempts` unresolved cycles the deployment moves to
/// `starting`, and polling continues with a doubling interval capped at
/// `max_interval` until the backend becomes ready, exits, or
/// `startup_deadline` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// 初期ポーリング間隔
    pub initial_interval: Duration,
    /// 初期待機の試行回数
    pub initial_attempts: u32,
    /// バックオフ後の最大間隔
    pub max_interval: Duration,
    /// 1回のプローブのタイムアウト
    pub probe_timeout: Duration,
    /// 起動の最終期限（Noneなら無期限）
    pub startup_deadline: Option<Duration>,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            initial_attempts: 30,
            max_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            startup_deadline: Some(Duration::from_secs(30 * 60)),
        }
    }
}

impl ReadinessPolicy {
    /// Load readiness policy from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let deadline_secs = get_env_parse("LLMSV_STARTUP_DEADLINE_SECS", 1800u64);
        Self {
            initial_interval: Duration::from_millis(get_env_parse(
                "LLMSV_READY_INTERVAL_MS",
                1000u64,
            )),
            initial_attempts: get_env_parse("LLMSV_READY_ATTEMPTS", defaults.initial_attempts),
            max_interval: Duration::from_secs(get_env_parse(
                "LLMSV_READY_MAX_INTERVAL_SECS",
                10u64,
            )),
            probe_timeout: defaults.probe_timeout,
            startup_deadline: (deadline_secs > 0).then(|| Duration::from_secs(deadline_secs)),
        }
    }

    /// `starting` 移行後の次の待機間隔
    pub fn backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }
}

/// Process termination policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// SIGTERM後の生存確認回数（超えたらSIGKILL）
    pub grace_attempts: u32,
    /// 生存確認の間隔
    pub poll_interval: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace_attempts: 10,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl TerminationPolicy {
    /// Load termination policy from environment variables.
    pub fn from_env() -> Self {
        Self {
            grace_attempts: get_env_parse("LLMSV_STOP_GRACE_SECS", 10u32),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// SIGKILLまでの猶予時間
    pub fn grace_period(&self) -> Duration {
        self.poll_interval.saturating_mul(self.grace_attempts)
    }
}

/// Process supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// バックエンドのログ出力先
    pub log_dir: PathBuf,
    /// プローブ・プロキシの接続先ホスト
    pub backend_host: String,
    /// 起動監視ポリシー
    pub readiness: ReadinessPolicy,
    /// 停止ポリシー
    pub termination: TerminationPolicy,
    /// 診断情報に含めるログ末尾の行数
    pub log_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            backend_host: "127.0.0.1".to_string(),
            readiness: ReadinessPolicy::default(),
            termination: TerminationPolicy::default(),
            log_tail_lines: 50,
        }
    }
}

impl SupervisorConfig {
    /// Load supervisor configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            log_dir: PathBuf::from(get_env_or("LLMSV_LOG_DIR", "logs")),
            backend_host: get_env_or("LLMSV_BACKEND_HOST", "127.0.0.1"),
            readiness: ReadinessPolicy::from_env(),
            termination: TerminationPolicy::from_env(),
            log_tail_lines: 50,
        }
    }
}

/// Request proxy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfig {
    /// 非ストリーミングリクエストのタイムアウト
    pub buffered_timeout: Duration,
    /// ストリーミングリクエストのタイムアウト
    pub streaming_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            buffered_timeout: Duration::from_secs(90),
            streaming_timeout: Duration::from_secs(600),
        }
    }
}

impl ProxyConfig {
    /// Load proxy configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            buffered_timeout: Duration::from_secs(get_env_parse("LLMSV_PROXY_TIMEOUT_SECS", 90u64)),
            streaming_timeout: Duration::from_secs(get_env_parse(
                "LLMSV_STREAM_TIMEOUT_SECS",
                600u64,
            )),
        }
    }
}

/// Backend launch configuration (external model-serving binary)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// 実行ファイル
    pub program: String,
    /// サブコマンド
    pub subcommand: Vec<String>,
    /// 推論バックエンド
    pub infer_backend: String,
    /// バックエンドがlistenするホスト
    pub bind_host: String,
    /// デバイス割り当てを渡す環境変数名
    pub device_env: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "swift".to_string(),
            subcommand: vec!["deploy".to_string()],
            infer_backend: "vllm".to_string(),
            bind_host: "0.0.0.0".to_string(),
            device_env: "CUDA_VISIBLE_DEVICES".to_string(),
        }
    }
}

impl BackendConfig {
    /// Load backend configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            program: get_env_or("LLMSV_BACKEND_PROGRAM", "swift"),
            infer_backend: get_env_or("LLMSV_INFER_BACKEND", "vllm"),
            ..Self::default()
        }
    }
}

/// Quantization tool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizerConfig {
    /// 実行ファイル
    pub program: String,
    /// サブコマンド
    pub subcommand: String,
    /// 量子化済みモデルの出力先
    pub quantized_dir: PathBuf,
    /// キャリブレーションデータ
    pub calibration_dir: PathBuf,
    /// デバイス割り当てを渡す環境変数名
    pub device_env: String,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            program: "swift".to_string(),
            subcommand: "export".to_string(),
            quantized_dir: PathBuf::from("models/quantized"),
            calibration_dir: PathBuf::from("data/calibration"),
            device_env: "CUDA_VISIBLE_DEVICES".to_string(),
        }
    }
}

impl QuantizerConfig {
    /// Load quantizer configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            program: get_env_or("LLMSV_BACKEND_PROGRAM", "swift"),
            quantized_dir: PathBuf::from(get_env_or("LLMSV_QUANTIZED_DIR", "models/quantized")),
            calibration_dir: PathBuf::from(get_env_or(
                "LLMSV_CALIBRATION_DIR",
                "data/calibration",
            )),
            ..Self::default()
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// HTTPサーバーのバインドホスト
    pub host: String,
    /// HTTPサーバーのポート
    pub port: u16,
    /// バックエンドポートの払い出し開始番号
    pub starting_port: u16,
    /// デプロイメント記述子の保存先
    pub config_dir: PathBuf,
    /// CORSを有効にするか
    pub enable_cors: bool,
    /// バックエンド起動設定
    pub backend: BackendConfig,
    /// スーパーバイザー設定
    pub supervisor: SupervisorConfig,
    /// プロキシ設定
    pub proxy: ProxyConfig,
    /// 量子化ツール設定
    pub quantizer: QuantizerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            starting_port: DEFAULT_STARTING_PORT,
            config_dir: PathBuf::from("config/model_configs"),
            enable_cors: true,
            backend: BackendConfig::default(),
            supervisor: SupervisorConfig::default(),
            proxy: ProxyConfig::default(),
            quantizer: QuantizerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load application configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: get_env_or("LLMSV_HOST", "0.0.0.0"),
            port: get_env_parse("LLMSV_PORT", 8888u16),
            starting_port: get_env_parse("LLMSV_STARTING_PORT", DEFAULT_STARTING_PORT),
            config_dir: PathBuf::from(get_env_or("LLMSV_CONFIG_DIR", "config/model_configs")),
            enable_cors: get_env_flag("LLMSV_ENABLE_CORS", true),
            backend: BackendConfig::from_env(),
            supervisor: SupervisorConfig::from_env(),
            proxy: ProxyConfig::from_env(),
            quantizer: QuantizerConfig::from_env(),
        }
    }

    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<(), CommonError> {
        let readiness = &self.supervisor.readiness;
        let checks = [
            (self.starting_port == 0, "starting port must be non-zero"),
            (
                readiness.initial_interval.is_zero(),
                "readiness interval must be non-zero",
            ),
            (
                readiness.initial_attempts == 0,
                "readiness attempts must be non-zero",
            ),
            (
                readiness.max_interval < readiness.initial_interval,
                "readiness max interval must not be shorter than the initial interval",
            ),
            (
                readiness.probe_timeout.is_zero(),
                "readiness probe timeout must be non-zero",
            ),
            (
                self.supervisor.termination.grace_attempts == 0,
                "stop grace period must be non-zero",
            ),
            (
                self.proxy.buffered_timeout.is_zero(),
                "proxy timeout must be non-zero",
            ),
            (
                self.proxy.streaming_timeout.is_zero(),
                "stream timeout must be non-zero",
            ),
            (
                self.backend.program.trim().is_empty(),
                "backend program must be set",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(CommonError::Config(message.to_string())),
            None => Ok(()),
        }
    }
}
