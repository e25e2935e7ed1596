//! Caruana の貪欲前向きアンサンブル選択
//!
//! 候補の予測を1つずつ加えたときの平均予測の損失を全候補について計算し、
//! 最良のものを採用する操作を `size` 回繰り返す。同じモデルを何度選んでもよい。
//!
//! メモリ使用量は候補数に依存しない: 選択済みの予測の和と、評価用の
//! 作業バッファを1本ずつ持つだけ。

use std::fmt::Write as _;

use log::{debug, info};
use rand::Rng;
use rand::prelude::IndexedRandom;
use rand_xoshiro::Xoshiro256PlusPlus;
use rand_xoshiro::rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::array::{ArrayView, PredictionArray};
use crate::error::{EnsembleError, Result};
use crate::guard::{ResourceGuard, Unbounded};
use crate::key::ModelKey;
use crate::loss::{Direction, Loss};

/// 貪欲選択の1ステップ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub key: ModelKey,
    #[serde(with = "crate::float_serde")]
    pub loss: f64,
}

/// 学習済みアンサンブル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleFitResult {
    pub size: usize,
    /// 選択順（長さ `size`、重複あり）
    pub member_order: Vec<ModelKey>,
    /// 入力順の重み。非負で合計1
    pub weights: Vec<(ModelKey, f64)>,
    pub trajectory: Vec<TrajectoryStep>,
    /// 入力（キー・予測・正解・size）の SHA-256
    pub last_input_hash: String,
    pub direction: Direction,
}

/// `fit_incremental` の結果
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    /// 入力が前回と同一なので再計算しなかった
    Unchanged,
    Fitted(EnsembleFitResult),
}

/// アンサンブル選択の設定
pub struct EnsembleSelection<'a> {
    pub size: usize,
    pub loss: &'a dyn Loss,
    pub direction: Direction,
    /// 同点時の乱択に使う乱数の種。fit ごとに作り直す
    pub random_state: u64,
    /// 各ラウンドの先頭で確認する
    pub guard: &'a dyn ResourceGuard,
}

impl<'a> EnsembleSelection<'a> {
    pub fn new(size: usize, loss: &'a dyn Loss) -> Self {
        Self {
            size,
            loss,
            direction: loss.direction(),
            random_state: 1,
            guard: &Unbounded,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_random_state(mut self, random_state: u64) -> Self {
        self.random_state = random_state;
        self
    }

    pub fn with_guard(mut self, guard: &'a dyn ResourceGuard) -> Self {
        self.guard = guard;
        self
    }

    /// 入力の指紋（16進 SHA-256）
    pub fn fingerprint(
        &self,
        keys: &[ModelKey],
        predictions: &[&PredictionArray],
        labels: &PredictionArray,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.size as u64).to_le_bytes());
        hasher.update(self.loss.name().as_bytes());
        for key in keys {
            hasher.update(key.seed.to_le_bytes());
            hasher.update(key.run_id.to_le_bytes());
            hasher.update(key.stage.to_bits().to_le_bytes());
        }
        for array in predictions.iter().copied().chain(std::iter::once(labels)) {
            hasher.update((array.shape().len() as u64).to_le_bytes());
            for &d in array.shape() {
                hasher.update((d as u64).to_le_bytes());
            }
            for v in array.data() {
                hasher.update(v.to_bits().to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// 前回と入力が同じなら計算を省略する
    pub fn fit_incremental(
        &self,
        previous: Option<&EnsembleFitResult>,
        keys: &[ModelKey],
        predictions: &[&PredictionArray],
        labels: &PredictionArray,
    ) -> Result<FitOutcome> {
        let hash = self.fingerprint(keys, predictions, labels);
        if previous.is_some_and(|p| p.last_input_hash == hash) {
            debug!("Ensemble inputs unchanged ({}); skipping fit", &hash[..12]);
            return Ok(FitOutcome::Unchanged);
        }
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.random_state);
        let mut result = self.fit_with_rng(keys, predictions, labels, &mut rng)?;
        result.last_input_hash = hash;
        Ok(FitOutcome::Fitted(result))
    }

    pub fn fit(
        &self,
        keys: &[ModelKey],
        predictions: &[&PredictionArray],
        labels: &PredictionArray,
    ) -> Result<EnsembleFitResult> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.random_state);
        let mut result = self.fit_with_rng(keys, predictions, labels, &mut rng)?;
        result.last_input_hash = self.fingerprint(keys, predictions, labels);
        Ok(result)
    }

    /// 本体。`last_input_hash` は空のまま返す
    pub fn fit_with_rng<R: Rng + ?Sized>(
        &self,
        keys: &[ModelKey],
        predictions: &[&PredictionArray],
        labels: &PredictionArray,
        rng: &mut R,
    ) -> Result<EnsembleFitResult> {
        if self.size < 1 {
            return Err(EnsembleError::InvalidArgument(format!(
                "ensemble size must be at least 1 (got {})",
                self.size
            )));
        }
        if predictions.is_empty() {
            return Err(EnsembleError::InvalidArgument(
                "cannot build an ensemble from an empty set of predictions".to_string(),
            ));
        }
        if keys.len() != predictions.len() {
            return Err(EnsembleError::InvalidArgument(format!(
                "{} keys given for {} predictions",
                keys.len(),
                predictions.len()
            )));
        }
        for (key, pred) in keys.iter().zip(predictions) {
            if pred.shape() != labels.shape() {
                return Err(EnsembleError::InvalidArgument(format!(
                    "predictions of model {key} have shape {:?}, labels have {:?}",
                    pred.shape(),
                    labels.shape()
                )));
            }
        }

        let n = labels.len();
        let shape = labels.shape();
        let mut running_sum = vec![0.0f64; n];
        let mut scratch = vec![0.0f64; n];
        let mut losses = vec![0.0f64; predictions.len()];
        let mut order: Vec<usize> = Vec::with_capacity(self.size);
        let mut trajectory: Vec<f64> = Vec::with_capacity(self.size);

        for round in 0..self.size {
            self.guard.check()?;
            let scale = 1.0 / (round + 1) as f64;
            for (j, pred) in predictions.iter().enumerate() {
                for ((out, sum), p) in scratch.iter_mut().zip(&running_sum).zip(pred.data()) {
                    *out = (sum + p) * scale;
                }
                losses[j] = self.loss.loss(labels.view(), ArrayView::new(shape, &scratch));
            }

            let best_rank = losses
                .iter()
                .filter(|l| !l.is_nan())
                .map(|&l| self.direction.rank_key(l))
                .fold(f64::INFINITY, f64::min);
            let ties: Vec<usize> = (0..losses.len())
                .filter(|&j| !losses[j].is_nan() && self.direction.rank_key(losses[j]) == best_rank)
                .collect();
            let Some(&best) = ties.choose(rng) else {
                return Err(EnsembleError::Numerical(format!(
                    "all {} candidate losses are NaN in round {round}",
                    losses.len()
                )));
            };

            for (sum, p) in running_sum.iter_mut().zip(predictions[best].data()) {
                *sum += p;
            }
            order.push(best);
            trajectory.push(losses[best]);

            // 候補が1つなら残りの手番も同じモデルで、損失も変わらない
            if predictions.len() == 1 {
                order.resize(self.size, best);
                trajectory.resize(self.size, losses[best]);
                break;
            }
        }

        let weights = compute_weights(keys, &order, self.size);
        Ok(EnsembleFitResult {
            size: self.size,
            member_order: order.iter().map(|&i| keys[i]).collect(),
            weights,
            trajectory: order
                .iter()
                .zip(&trajectory)
                .map(|(&i, &loss)| TrajectoryStep { key: keys[i], loss })
                .collect(),
            last_input_hash: String::new(),
            direction: self.direction,
        })
    }
}

fn compute_weights(keys: &[ModelKey], order: &[usize], size: usize) -> Vec<(ModelKey, f64)> {
    let mut counts = vec![0usize; keys.len()];
    for &i in order {
        counts[i] += 1;
    }
    let mut weights: Vec<(ModelKey, f64)> = keys
        .iter()
        .zip(&counts)
        .map(|(k, &c)| (*k, c as f64 / size as f64))
        .collect();
    let total: f64 = weights.iter().map(|w| w.1).sum();
    if total != 1.0 && total > 0.0 {
        for w in weights.iter_mut() {
            w.1 /= total;
        }
    }
    weights
}

impl EnsembleFitResult {
    /// 最終ステップの損失（学習損失）
    pub fn train_loss(&self) -> f64 {
        self.trajectory.last().map(|s| s.loss).unwrap_or(f64::NAN)
    }

    pub fn weight(&self, key: &ModelKey) -> f64 {
        self.weights.iter().find(|(k, _)| k == key).map(|w| w.1).unwrap_or(0.0)
    }

    /// 重みが正のモデル（入力順）
    pub fn selected_keys(&self) -> Vec<ModelKey> {
        self.weights.iter().filter(|(_, w)| *w > 0.0).map(|(k, _)| *k).collect()
    }

    /// `(重み, キー)` を重みの大きい順に
    pub fn models_with_weights(&self) -> Vec<(f64, ModelKey)> {
        let mut out: Vec<(f64, ModelKey)> = self.weights.iter().map(|(k, w)| (*w, *k)).collect();
        out.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        out
    }

    /// 重み付き平均予測
    ///
    /// `predictions` は全候補分（`weights` と1対1）か、重みが正のモデルの分だけ
    /// （`selected_keys()` の順）のどちらか。
    pub fn predict(&self, predictions: &[&PredictionArray]) -> Result<PredictionArray> {
        let nonzero: Vec<f64> = self.weights.iter().map(|w| w.1).filter(|w| *w > 0.0).collect();
        let paired: Vec<(&PredictionArray, f64)> = if predictions.len() == self.weights.len() {
            predictions.iter().copied().zip(self.weights.iter().map(|w| w.1)).collect()
        } else if predictions.len() == nonzero.len() {
            predictions.iter().copied().zip(nonzero).collect()
        } else {
            return Err(EnsembleError::InvalidArgument(format!(
                "the dimensions of ensemble predictions ({}) and ensemble weights ({}, {} nonzero) do not agree",
                predictions.len(),
                self.weights.len(),
                self.selected_keys().len()
            )));
        };
        let Some(first) = paired.first().map(|p| p.0) else {
            return Err(EnsembleError::InvalidArgument("no predictions to combine".to_string()));
        };
        let mut out = PredictionArray::filled(first.shape().to_vec(), 0.0);
        for (pred, weight) in paired {
            if pred.shape() != first.shape() {
                return Err(EnsembleError::InvalidArgument(format!(
                    "prediction shapes differ: {:?} vs {:?}",
                    pred.shape(),
                    first.shape()
                )));
            }
            // 重み0のモデルは足し込まない
            if weight == 0.0 {
                continue;
            }
            for (o, p) in out.data_mut().iter_mut().zip(pred.data()) {
                *o += p * weight;
            }
        }
        Ok(out)
    }

    /// ログ出力用の要約
    pub fn describe(&self) -> String {
        let mut s = String::new();
        let traj: Vec<String> = self.trajectory.iter().map(|t| format!("{} {:.6}", t.key, t.loss)).collect();
        let members: Vec<String> = self.member_order.iter().map(|k| k.to_string()).collect();
        let weights: Vec<String> = self.weights.iter().map(|(_, w)| format!("{w:.4}")).collect();
        let ids: Vec<String> = self.selected_keys().iter().map(|k| k.to_string()).collect();
        let _ = writeln!(s, "Ensemble Selection:");
        let _ = writeln!(s, "\tTrajectory: {}", traj.join(", "));
        let _ = writeln!(s, "\tMembers: {}", members.join(", "));
        let _ = writeln!(s, "\tWeights: {}", weights.join(", "));
        let _ = write!(s, "\tIdentifiers: {}", ids.join(" "));
        s
    }

    pub fn log_summary(&self) {
        info!("{}", self.describe());
    }
}
