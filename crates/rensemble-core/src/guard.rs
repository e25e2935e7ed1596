//! 協調的キャンセルの境界
//!
//! ライブラリ側は処理の区切りで `check()` を呼ぶだけで、締め切りやメモリ上限の
//! 実際の判定は呼び出し側（サンドボックス）が実装する。

use crate::error::Result;

pub trait ResourceGuard: Send + Sync {
    /// 続行してよければ `Ok(())`。締め切り超過なら `DeadlineExceeded`、
    /// メモリ上限超過なら `MemoryLimitExceeded` を返す
    fn check(&self) -> Result<()>;
}

/// 制限なし（テスト・単発実行用）
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl ResourceGuard for Unbounded {
    fn check(&self) -> Result<()> {
        Ok(())
    }
}
