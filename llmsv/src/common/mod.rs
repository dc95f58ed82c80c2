//! 共通定義
//!
//! エラー型などレイヤー横断で使う定義をまとめる

/// エラー型定義
pub mod error;

pub use error::{CommonError, CommonResult, SvError, SvResult};
