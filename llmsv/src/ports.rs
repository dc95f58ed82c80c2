//! ポートアロケーター
//!
//! 起動ポートから単調増加でポートを払い出す。一度払い出した（または明示的に
//! 要求された）ポートは、所有していたデプロイメントが削除された後も
//! プロセスの生存期間中は二度と払い出さない。

use crate::common::error::{validation, SvError, SvResult};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// デフォルトの起動ポート
pub const DEFAULT_STARTING_PORT: u16 = 8000;

#[derive(Debug)]
struct AllocatorState {
    /// 次に試すポート（u16::MAXを超えたら枯渇）
    next: u32,
    /// 払い出し済み・明示要求済みのポート
    issued: HashSet<u16>,
}

/// ポートアロケーター
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    state: Mutex<AllocatorState>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_STARTING_PORT)
    }
}

impl PortAllocator {
    /// 起動ポートを指定して作成
    pub fn new(base: u16) -> Self {
        Self {
            base,
            state: Mutex::new(AllocatorState {
                next: u32::from(base.max(1)),
                issued: HashSet::new(),
            }),
        }
    }

    /// 起動ポート
    pub fn base(&self) -> u16 {
        self.base
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        // 臨界区間内でパニックしないため、poisonは無視して状態をそのまま使う
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 未使用のポートを払い出す
    pub fn reserve(&self) -> SvResult<u16> {
        let mut state = self.lock();
        while state.next <= u32::from(u16::MAX) {
            let candidate = state.next as u16;
            state.next += 1;
            if state.issued.insert(candidate) {
                debug!(port = candidate, "Reserved port");
                return Ok(candidate);
            }
        }
        Err(SvError::Internal("port range exhausted".to_string()))
    }

    /// 明示的に要求されたポートを記録する
    ///
    /// 以後 `reserve()` はこのポートを払い出さない。アクティブなレコード間での
    /// 重複はレジストリ側で検出する。
    pub fn claim(&self, port: u16) -> SvResult<u16> {
        if port == 0 {
            return Err(validation("port must be between 1 and 65535"));
        }
        let mut state = self.lock();
        if state.issued.insert(port) {
            debug!(port, "Claimed explicit port");
        }
        Ok(port)
    }

    /// 払い出し済みか
    pub fn is_issued(&self, port: u16) -> bool {
        self.lock().issued.contains(&port)
    }
}
