//! 損失関数
//!
//! アンサンブル選択・候補順位付けに使う損失は外部から差し込む。
//! `Fn(ArrayView, ArrayView) -> f64` を満たすクロージャはそのまま `Loss` になる。

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::array::ArrayView;

/// 最適化の向き
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Minimize,
    Maximize,
}

impl Direction {
    /// 昇順ソートで「良い順」になる順位キー。非有限値は常に最後
    #[inline]
    pub fn rank_key(self, loss: f64) -> f64 {
        if !loss.is_finite() {
            return f64::INFINITY;
        }
        match self {
            Direction::Minimize => loss,
            Direction::Maximize => -loss,
        }
    }

    /// `a` が `b` より厳密に良いか
    #[inline]
    pub fn is_better(self, a: f64, b: f64) -> bool {
        self.rank_key(a) < self.rank_key(b)
    }

    /// 順位キーで比較する（NaN を含んでも全順序）
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        self.rank_key(a).total_cmp(&self.rank_key(b))
    }

    /// 悪い側の無限大（未計算・読み込み失敗の損失値）
    pub fn worst_value(self) -> f64 {
        match self {
            Direction::Minimize => f64::INFINITY,
            Direction::Maximize => f64::NEG_INFINITY,
        }
    }
}

/// 予測と正解から損失を計算する
pub trait Loss: Send + Sync {
    fn loss(&self, y_true: ArrayView<'_>, y_pred: ArrayView<'_>) -> f64;

    fn name(&self) -> &str {
        "custom"
    }

    fn direction(&self) -> Direction {
        Direction::Minimize
    }
}

impl<F> Loss for F
where
    F: Fn(ArrayView<'_>, ArrayView<'_>) -> f64 + Send + Sync,
{
    fn loss(&self, y_true: ArrayView<'_>, y_pred: ArrayView<'_>) -> f64 {
        self(y_true, y_pred)
    }
}

/// 平均二乗誤差。`squared = false` で RMSE
#[derive(Debug, Clone, Copy)]
pub struct MeanSquaredError {
    pub squared: bool,
}

impl MeanSquaredError {
    pub fn rmse() -> Self {
        Self { squared: false }
    }
}

impl Loss for MeanSquaredError {
    fn loss(&self, y_true: ArrayView<'_>, y_pred: ArrayView<'_>) -> f64 {
        if y_true.len() != y_pred.len() || y_true.is_empty() {
            return f64::NAN;
        }
        let sum: f64 = y_true
            .data
            .iter()
            .zip(y_pred.data)
            .map(|(t, p)| {
                let d = t - p;
                d * d
            })
            .sum();
        let mse = sum / y_true.len() as f64;
        if self.squared { mse } else { mse.sqrt() }
    }

    fn name(&self) -> &str {
        if self.squared { "mse" } else { "rmse" }
    }
}

/// 平均絶対誤差
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl Loss for MeanAbsoluteError {
    fn loss(&self, y_true: ArrayView<'_>, y_pred: ArrayView<'_>) -> f64 {
        if y_true.len() != y_pred.len() || y_true.is_empty() {
            return f64::NAN;
        }
        let sum: f64 = y_true.data.iter().zip(y_pred.data).map(|(t, p)| (t - p).abs()).sum();
        sum / y_true.len() as f64
    }

    fn name(&self) -> &str {
        "mae"
    }
}

/// 名前から組み込み損失を作る（CLI 用）
pub fn builtin_loss(name: &str) -> Option<Box<dyn Loss>> {
    match name.to_ascii_lowercase().as_str() {
        "rmse" => Some(Box::new(MeanSquaredError { squared: false })),
        "mse" => Some(Box::new(MeanSquaredError { squared: true })),
        "mae" => Some(Box::new(MeanAbsoluteError)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(data: &[f64]) -> ArrayView<'_> {
        ArrayView::new(&[], data)
    }

    #[test]
    fn test_rmse_and_mse() {
        let t = [1.0, 2.0, 3.0, 4.0];
        let p = [1.0, 2.0, 3.0, 8.0];
        assert_eq!(MeanSquaredError { squared: true }.loss(view(&t), view(&p)), 4.0);
        assert_eq!(MeanSquaredError::rmse().loss(view(&t), view(&p)), 2.0);
        assert_eq!(MeanAbsoluteError.loss(view(&t), view(&p)), 1.0);
    }

    #[test]
    fn test_length_mismatch_is_nan() {
        assert!(MeanSquaredError::rmse().loss(view(&[1.0]), view(&[1.0, 2.0])).is_nan());
    }

    #[test]
    fn test_closure_is_loss() {
        let max_err = |t: ArrayView<'_>, p: ArrayView<'_>| {
            t.data.iter().zip(p.data).map(|(a, b)| (a - b).abs()).fold(0.0, f64::max)
        };
        assert_eq!(max_err.loss(view(&[0.0, 0.0]), view(&[1.0, -3.0])), 3.0);
        assert_eq!(max_err.direction(), Direction::Minimize);
    }

    #[test]
    fn test_direction_ranking() {
        assert!(Direction::Minimize.is_better(1.0, 2.0));
        assert!(Direction::Maximize.is_better(2.0, 1.0));
        // 非有限値はどちらの向きでも最悪
        assert!(Direction::Maximize.is_better(-5.0, f64::INFINITY));
        assert!(Direction::Minimize.is_better(5.0, f64::NAN));
        assert_eq!(Direction::Minimize.compare(f64::NAN, f64::INFINITY), Ordering::Equal);
    }

    #[test]
    fn test_builtin_lookup() {
        assert_eq!(builtin_loss("RMSE").unwrap().name(), "rmse");
        assert_eq!(builtin_loss("mae").unwrap().name(), "mae");
        assert!(builtin_loss("logloss").is_none());
    }
}
