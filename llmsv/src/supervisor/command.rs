//! バックエンド起動コマンド
//!
//! 外部のモデルサーバーバイナリに渡すコマンドライン・環境変数を組み立てる。

use crate::config::BackendConfig;
use crate::types::DeploymentRecord;
use std::fmt;
use tokio::process::Command;

/// 起動コマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// 実行ファイル
    pub program: String,
    /// 引数
    pub args: Vec<String>,
    /// 追加の環境変数
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// 実行ファイルを指定して作成
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// 引数を追加
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// 引数をまとめて追加
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// 環境変数を追加
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// デプロイメント用のバックエンド起動コマンド
    ///
    /// ```text
    /// {program} {subcommand...} --model {model_ref} --infer_backend {backend}
    ///   --port {port} --host {bind_host} --max_model_len {n}
    ///   --gpu_memory_utilization {f} --max_batch_size {n}
    /// ```
    pub fn for_backend(backend: &BackendConfig, record: &DeploymentRecord) -> Self {
        let launch = &record.launch;
        Self::new(&backend.program)
            .args(backend.subcommand.iter().cloned())
            .args([
                "--model".to_string(),
                record.model_ref.clone(),
                "--infer_backend".to_string(),
                backend.infer_backend.clone(),
                "--port".to_string(),
                record.port.to_string(),
                "--host".to_string(),
                backend.bind_host.clone(),
                "--max_model_len".to_string(),
                launch.max_model_len.to_string(),
                "--gpu_memory_utilization".to_string(),
                launch.gpu_memory_utilization.to_string(),
                "--max_batch_size".to_string(),
                launch.max_batch_size.to_string(),
            ])
            .env(&backend.device_env, &record.device)
    }

    /// 環境変数の値を取得
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={value} ")?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
