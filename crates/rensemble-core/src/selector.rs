//! 候補選択とメモリからの退避
//!
//! 損失順に並べたモデルから、ベースライン（dummy）より良いものを残し、
//! nbest・ディスク予算・性能幅の3つの方針で候補数を絞り込む。
//! 候補外の配列はメモリから外し、候補の配列は読み込む。

use std::collections::BTreeSet;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{LoadedState, PredictionCache};
use crate::error::{EnsembleError, Result};
use crate::guard::ResourceGuard;
use crate::key::{ModelKey, Split};
use crate::loss::Direction;
use crate::store::PredictionStore;

/// 候補に残すモデル数の方針
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NBest {
    /// 上位 n 個。`Count(0)` は候補を作らない（後片付けのみ）
    Count(u32),
    /// 上位の割合 `(0, 1]`。最低1個
    Fraction(f64),
}

impl NBest {
    /// `available` 個のうち残す数。`available` が0なら0
    pub fn keep(self, available: usize) -> usize {
        if available == 0 {
            return 0;
        }
        match self {
            NBest::Count(n) => (n as usize).min(available),
            NBest::Fraction(f) => {
                let n = (available as f64 * f).floor() as usize;
                n.min(available).max(1)
            }
        }
    }

    /// 半分にする（整数は切り捨て、ただし1未満にはしない）
    pub fn halve(self) -> Self {
        match self {
            NBest::Count(n) => NBest::Count((n / 2).max(1)),
            NBest::Fraction(f) => NBest::Fraction(f / 2.0),
        }
    }

    /// これ以上縮められないか
    pub fn is_minimal(self) -> bool {
        matches!(self, NBest::Count(n) if n <= 1)
    }

    /// 後片付けモード（候補なし）か
    pub fn is_disabled(self) -> bool {
        matches!(self, NBest::Count(0))
    }

    pub fn validate(self) -> Result<Self> {
        match self {
            NBest::Count(0) => Err(EnsembleError::InvalidConfiguration(
                "ensemble_nbest must be at least 1".to_string(),
            )),
            NBest::Fraction(f) if !(f > 0.0 && f <= 1.0) => Err(
                EnsembleError::InvalidConfiguration(format!(
                    "fractional ensemble_nbest must be in (0, 1] (got {f})"
                )),
            ),
            ok => Ok(ok),
        }
    }
}

/// ディスク上に残すモデルの予算
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum DiskBudget {
    /// 最大モデル数
    Count(u32),
    /// 合計サイズ上限（MB）
    Megabytes(f64),
    #[default]
    Unbounded,
}

impl DiskBudget {
    pub fn validate(self) -> Result<Self> {
        match self {
            DiskBudget::Count(0) => Err(EnsembleError::InvalidConfiguration(
                "max_models_on_disc must be at least 1".to_string(),
            )),
            DiskBudget::Megabytes(mb) if !(mb > 0.0 && mb.is_finite()) => Err(
                EnsembleError::InvalidConfiguration(format!(
                    "max_models_on_disc in megabytes must be positive (got {mb})"
                )),
            ),
            ok => Ok(ok),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    pub nbest: NBest,
    pub disk_budget: DiskBudget,
    /// `[0, 1)`。0 で無効
    pub performance_range_threshold: f64,
    /// ベースラインモデルの run_id
    pub dummy_run_id: u64,
    pub direction: Direction,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            nbest: NBest::Count(50),
            disk_budget: DiskBudget::Count(100),
            performance_range_threshold: 0.0,
            dummy_run_id: 1,
            direction: Direction::Minimize,
        }
    }
}

/// 今回の反復の候補
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateSet {
    /// 損失の良い順
    pub keys: Vec<ModelKey>,
    /// これまでに候補になったことのあるキー（今回分を含む）
    pub historical: BTreeSet<ModelKey>,
    /// ディスク予算から決まる常駐モデル数の上限。`None` なら削除は行わない
    pub max_resident_models: Option<usize>,
    /// ベースラインモデル（見つかった場合）
    pub dummy: Option<ModelKey>,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Ranked {
    key: ModelKey,
    loss: f64,
}

/// 候補を選び、候補外の配列をメモリから外し、候補の配列を読み込む
pub fn select_candidates(
    cache: &mut PredictionCache,
    store: &PredictionStore,
    config: &SelectorConfig,
    guard: &dyn ResourceGuard,
) -> Result<CandidateSet> {
    let direction = config.direction;
    let mut sorted: Vec<Ranked> = cache
        .records()
        .iter()
        .map(|(key, r)| Ranked {
            key: *key,
            loss: r.loss,
        })
        .collect();
    sorted.sort_by(|a, b| {
        direction
            .compare(a.loss, b.loss)
            .then(a.key.run_id.cmp(&b.key.run_id))
            .then(a.key.cmp(&b.key))
    });
    let num_keys = sorted.len();

    // ベースライン: run_id が一致するもののうち最良
    let dummies: Vec<Ranked> =
        sorted.iter().copied().filter(|r| r.key.run_id == config.dummy_run_id).collect();
    let dummy = dummies.first().copied();

    let mut survivors: Vec<Ranked> = match dummy {
        Some(d) => {
            debug!("Use {} as dummy loss (model {})", d.loss, d.key);
            sorted
                .iter()
                .copied()
                .filter(|r| direction.is_better(r.loss, d.loss))
                .filter(|r| r.key.run_id != config.dummy_run_id)
                .collect()
        }
        None => {
            warn!(
                "No baseline model with run_id {} found; ranking without a baseline",
                config.dummy_run_id
            );
            sorted.iter().copied().filter(|r| r.loss.is_finite()).collect()
        }
    };
    if survivors.is_empty() {
        if let Some(d) = dummy {
            if num_keys > dummies.len() {
                warn!(
                    "No models better than random - using dummy loss! \
                     Number of models besides the dummy model: {}, number of dummy models: {}",
                    num_keys - dummies.len(),
                    dummies.len()
                );
            }
            survivors.push(d);
        }
    }

    let mut keep_n = config.nbest.keep(survivors.len());
    debug!(
        "Library pruning: using {keep_n} out of {} models ({:?})",
        survivors.len(),
        config.nbest
    );

    let max_resident_models = resident_limit(cache, config, &sorted);
    if let Some(limit) = max_resident_models {
        if keep_n > limit {
            debug!("Restricting the number of models to {limit} instead of {keep_n} due to the disk budget");
            keep_n = limit;
        }
    }

    if config.performance_range_threshold > 0.0 && keep_n > 0 {
        if let (Some(d), Some(best)) = (dummy, survivors.first()) {
            keep_n = performance_range_cut(
                &survivors,
                keep_n,
                direction.rank_key(best.loss),
                direction.rank_key(d.loss),
                config.performance_range_threshold,
                direction,
            );
        }
    }

    // 候補外は配列を捨てる（損失は残す）
    let keep_n = keep_n.min(survivors.len());
    let chosen: BTreeSet<ModelKey> = survivors[..keep_n].iter().map(|r| r.key).collect();
    for r in &sorted {
        if chosen.contains(&r.key) {
            continue;
        }
        let resident = cache.record(&r.key).is_some_and(|rec| rec.loaded_state == LoadedState::Resident);
        if resident || cache.arrays().contains_key(&r.key) {
            if resident {
                debug!("Dropping model {} with loss {}", r.key, r.loss);
            }
            cache.evict(&r.key);
        }
    }

    let mut keys = Vec::with_capacity(keep_n);
    for r in &survivors[..keep_n] {
        guard.check()?;
        let Some(state) = cache.record(&r.key).map(|rec| rec.loaded_state) else {
            continue;
        };
        match state {
            LoadedState::Deleted => continue,
            LoadedState::Resident if cache.array(&r.key, Split::Ensemble).is_some() => {}
            _ => {
                if let Err(e) = cache.load_ensemble(store, &r.key) {
                    if e.is_resource() {
                        return Err(e);
                    }
                    warn!("Could not load predictions of model {}: {e}", r.key);
                    cache.invalidate(&r.key);
                    continue;
                }
            }
        }
        keys.push(r.key);
    }

    cache.remember_candidates(&keys);
    if !keys.is_empty() {
        info!("Selected {} candidate model(s), best loss {}", keys.len(), survivors[0].loss);
    }
    Ok(CandidateSet {
        keys,
        historical: cache.historical_candidates().clone(),
        max_resident_models,
        dummy: dummy.map(|d| d.key),
    })
}

/// ディスク予算から常駐モデル数の上限を求める
///
/// コストは候補と同じ順位（`sorted`）で累積する。コスト不明のモデルは0とみなす。
fn resident_limit(cache: &PredictionCache, config: &SelectorConfig, sorted: &[Ranked]) -> Option<usize> {
    match config.disk_budget {
        DiskBudget::Unbounded => None,
        DiskBudget::Count(n) => Some(n as usize),
        DiskBudget::Megabytes(budget) => {
            let costs: Vec<Option<f64>> = sorted
                .iter()
                .map(|r| cache.record(&r.key).and_then(|rec| rec.disk_cost_mb))
                .collect();
            let known: Vec<f64> = costs.iter().flatten().copied().collect();
            if known.is_empty() {
                return None;
            }
            let max_cost = known.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let total: f64 = known.iter().sum();
            // 次に評価するモデル1つ分（最大サイズ）を見込んでおく
            if total + max_cost <= budget {
                return None;
            }
            let mut cum = max_cost;
            let mut first_over = costs.len();
            for (i, cost) in costs.iter().enumerate() {
                cum += cost.unwrap_or(0.0);
                if cum > budget {
                    first_over = i;
                    break;
                }
            }
            let limit = first_over.max(1);
            warn!(
                "Limiting num of models via max_models_on_disc={budget} MB as accumulated={} worst={max_cost} num_models={limit}",
                total + max_cost
            );
            Some(limit)
        }
    }
}

/// ベースラインと最良の差の `threshold` 割より悪いモデルを切り捨てる
fn performance_range_cut(
    survivors: &[Ranked],
    keep_n: usize,
    best_rank: f64,
    dummy_rank: f64,
    threshold: f64,
    direction: Direction,
) -> usize {
    if !best_rank.is_finite() || !dummy_rank.is_finite() {
        return keep_n;
    }
    let worst = dummy_rank - (dummy_rank - best_rank) * threshold;
    if direction.rank_key(survivors[keep_n - 1].loss) <= worst {
        return keep_n;
    }
    for (i, r) in survivors[..keep_n].iter().enumerate() {
        if direction.rank_key(r.loss) >= worst {
            let reduced = i.max(1);
            debug!("Dynamic performance range: further reduce from {keep_n} to {reduced} models");
            return reduced;
        }
    }
    keep_n
}
