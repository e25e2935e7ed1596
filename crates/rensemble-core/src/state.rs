//! 反復をまたいで保持する構築状態

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::PredictionCache;
use crate::loss::Direction;
use crate::selection::EnsembleFitResult;
use crate::selector::NBest;

/// アンサンブル性能の履歴1件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "crate::float_serde")]
    pub train_loss: f64,
    #[serde(with = "crate::float_serde::option", default)]
    pub valid_loss: Option<f64>,
    #[serde(with = "crate::float_serde::option", default)]
    pub test_loss: Option<f64>,
}

/// 永続化される構築状態のすべて
///
/// プロセス内で1つだけ存在し、起動時にチェックポイントから復元して
/// 反復ごとに書き戻す。
#[derive(Debug, Clone)]
pub struct BuilderState {
    pub cache: PredictionCache,
    /// 現在の nbest（メモリ不足で縮むことがある）
    pub ensemble_nbest: NBest,
    /// 1反復で読む予測ファイル数の上限。`None` は無制限
    pub read_at_most: Option<usize>,
    pub max_resident_models: Option<usize>,
    pub validation_performance_so_far: f64,
    pub history: Vec<HistoryEntry>,
    pub last_fit: Option<EnsembleFitResult>,
    /// 完了した反復数
    pub iteration: u64,
}

impl BuilderState {
    pub fn new(ensemble_nbest: NBest, read_at_most: Option<usize>, direction: Direction) -> Self {
        Self {
            cache: PredictionCache::new(),
            ensemble_nbest,
            read_at_most,
            max_resident_models: None,
            validation_performance_so_far: direction.worst_value(),
            history: Vec::new(),
            last_fit: None,
            iteration: 0,
        }
    }

    /// 最良の学習損失を更新する
    pub fn record_performance(&mut self, loss: f64, direction: Direction) {
        if direction.is_better(loss, self.validation_performance_so_far) {
            self.validation_performance_so_far = loss;
        }
    }

    /// 配列キャッシュと前回の fit を捨てる（損失表は残す）
    pub fn drop_arrays(&mut self) {
        self.cache.evict_all();
        self.last_fit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_performance_is_direction_aware() {
        let mut s = BuilderState::new(NBest::Count(5), Some(5), Direction::Minimize);
        assert!(s.validation_performance_so_far.is_infinite());
        s.record_performance(2.0, Direction::Minimize);
        s.record_performance(3.0, Direction::Minimize);
        assert_eq!(s.validation_performance_so_far, 2.0);

        let mut m = BuilderState::new(NBest::Count(5), None, Direction::Maximize);
        m.record_performance(0.3, Direction::Maximize);
        m.record_performance(0.1, Direction::Maximize);
        assert_eq!(m.validation_performance_so_far, 0.3);
    }

    #[test]
    fn test_history_entry_serde() {
        let e = HistoryEntry {
            timestamp: Utc::now(),
            train_loss: 1.5,
            valid_loss: None,
            test_loss: Some(f64::INFINITY),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
