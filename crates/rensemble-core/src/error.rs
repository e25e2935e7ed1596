//! エラー型
//!
//! アンサンブル構築で発生するエラーを分類する。
//! 個々の予測ファイルの読み込み失敗のような「ソフト」な失敗はここには現れず、
//! 呼び出し側でログに残して該当モデルを除外する。

use std::path::PathBuf;

/// Ensemble building errors
#[derive(thiserror::Error, Debug)]
pub enum EnsembleError {
    /// 呼び出し引数の誤り（ensemble_size < 1、空の予測列など）
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 設定値の誤り（起動時のみ発生させる）
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// 命名規則に合わない予測ファイル名
    #[error("Could not interpret prediction file name: {}", .0.display())]
    InvalidFileName(PathBuf),

    /// .npy のフォーマット不正
    #[error("Malformed npy data in {path}: {reason}")]
    Npy { path: String, reason: String },

    /// File I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// チェックポイントの (de)serialize 失敗
    #[error(transparent)]
    Checkpoint(#[from] serde_json::Error),

    /// 退化した入力（全損失が NaN など）
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// メモリ上限超過（サンドボックスが Backoff に変換する）
    #[error("Memory limit exceeded: {used_mb} MB used, limit {limit_mb} MB")]
    MemoryLimitExceeded { used_mb: u64, limit_mb: u64 },

    /// 反復の締め切り超過、または協調的キャンセル
    #[error("Iteration deadline exceeded")]
    DeadlineExceeded,

    /// 反復スレッドの panic など
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EnsembleError {
    pub(crate) fn npy(path: impl Into<String>, reason: impl Into<String>) -> Self {
        EnsembleError::Npy {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// サンドボックスが区別する資源系エラーかどうか
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            EnsembleError::MemoryLimitExceeded { .. } | EnsembleError::DeadlineExceeded
        )
    }
}

/// Result type for ensemble operations
pub type Result<T> = std::result::Result<T, EnsembleError>;
