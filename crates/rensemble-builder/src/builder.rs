//! 1反復分のアンサンブル構築
//!
//! 1. 予測キャッシュの更新
//! 2. 候補選択
//! 3. 候補の valid/test 予測の読み込み
//! 4. アンサンブル選択（入力が同じなら省略）
//! 5. アンサンブルの保存、不要になったモデルの削除
//! 6. 予測の出力と履歴の追記
//! 7. チェックポイントの保存

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, error, info, warn};
use rensemble_core::io::write_atomic;
use rensemble_core::loss::builtin_loss;
use rensemble_core::npy::write_npy;
use rensemble_core::{
    BuilderState, CandidateSet, Checkpoint, EnsembleError, EnsembleFitResult, EnsembleSelection,
    FitOutcome, HistoryEntry, LoadedState, Loss, ModelKey, NBest, PredictionArray, PredictionStore,
    ResourceGuard, Result, Split, select_candidates,
};

use crate::config::BuilderConfig;

pub const ENSEMBLES_DIR: &str = "ensembles";
pub const PREDICTIONS_DIR: &str = "ensemble_predictions";

/// 1反復の結果
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// 正解ラベルか予測ファイルがまだ無い
    NoData,
    /// 候補なし（後片付けのみ行った）
    CleanupOnly { deleted: usize },
    /// 入力が前回と同じだったので何も更新していない
    Unchanged { deleted: usize },
    /// fit が数値エラーで失敗した。アンサンブルは更新していない
    NumericalFailure { reason: String },
    Built(IterationSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationSummary {
    pub iteration: u64,
    pub candidates: usize,
    pub train_loss: f64,
    pub valid_loss: Option<f64>,
    pub test_loss: Option<f64>,
    pub emitted: Vec<Split>,
    pub deleted: usize,
}

/// 構築状態と入出力先を持ち、反復を1回ずつ実行する
pub struct EnsembleBuilder {
    config: BuilderConfig,
    store: PredictionStore,
    checkpoint: Checkpoint,
    loss: Box<dyn Loss>,
    state: BuilderState,
}

impl EnsembleBuilder {
    /// `root` 以下の予測を使う。チェックポイントがあれば復元する
    pub fn open(root: &Path, config: BuilderConfig) -> Result<Self> {
        config.validate()?;
        let loss = builtin_loss(&config.loss).ok_or_else(|| {
            EnsembleError::InvalidConfiguration(format!("unknown loss '{}'", config.loss))
        })?;
        Ok(Self::with_loss(root, config, loss))
    }

    /// 任意の損失関数で作る
    pub fn with_loss(root: &Path, config: BuilderConfig, loss: Box<dyn Loss>) -> Self {
        let store = PredictionStore::new(root).with_precision(config.precision);
        let checkpoint = Checkpoint::in_root(root);
        let fresh = BuilderState::new(config.ensemble_nbest, config.read_at_most, config.direction);
        let state = checkpoint.load(fresh);
        Self {
            config,
            store,
            checkpoint,
            loss,
            state,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    pub fn store(&self) -> &PredictionStore {
        &self.store
    }

    pub fn ensembles_dir(&self) -> PathBuf {
        self.store.root().join(ENSEMBLES_DIR)
    }

    pub fn predictions_dir(&self) -> PathBuf {
        self.store.root().join(PREDICTIONS_DIR)
    }

    /// 1反復を実行する
    ///
    /// 資源系エラー（締め切り・メモリ）と設定系エラーはそのまま返す。
    /// 数値エラーは捕まえて `NumericalFailure` にする。
    pub fn run_iteration(&mut self, guard: &dyn ResourceGuard) -> Result<IterationOutcome> {
        guard.check()?;
        let seed = self.config.seed;
        let has_data = self.state.cache.refresh(
            &self.store,
            seed,
            self.state.read_at_most,
            self.loss.as_ref(),
            guard,
        )?;
        if !has_data {
            return Ok(IterationOutcome::NoData);
        }

        guard.check()?;
        let selector = self.config.selector_config(self.state.ensemble_nbest);
        let candidates = select_candidates(&mut self.state.cache, &self.store, &selector, guard)?;
        self.state.max_resident_models = candidates.max_resident_models;
        if candidates.is_empty() {
            let deleted = self.delete_excess_models(&candidates);
            self.persist()?;
            return Ok(IterationOutcome::CleanupOnly { deleted });
        }

        let keys = candidates.keys.clone();
        let n_valid = self.state.cache.load_split_arrays(&self.store, &keys, Split::Valid, guard)?;
        let n_test = self.state.cache.load_split_arrays(&self.store, &keys, Split::Test, guard)?;
        debug!("Read valid predictions of {n_valid}/{} and test of {n_test}/{} candidates", keys.len(), keys.len());

        guard.check()?;
        let Some(y_true) = self.store.load_targets(Split::Ensemble)? else {
            return Ok(IterationOutcome::NoData);
        };
        let fit = {
            let predictions = self.state.cache.split_arrays(&keys, Split::Ensemble).ok_or_else(|| {
                EnsembleError::Internal("a selected candidate has no resident predictions".to_string())
            })?;
            EnsembleSelection::new(self.config.ensemble_size, self.loss.as_ref())
                .with_direction(self.config.direction)
                .with_random_state(self.config.random_state)
                .with_guard(guard)
                .fit_incremental(self.state.last_fit.as_ref(), &keys, &predictions, &y_true)
        };

        let result = match fit {
            Ok(FitOutcome::Fitted(result)) => result,
            Ok(FitOutcome::Unchanged) => {
                let deleted = self.delete_excess_models(&candidates);
                self.persist()?;
                return Ok(IterationOutcome::Unchanged { deleted });
            }
            Err(EnsembleError::Numerical(reason)) => {
                error!("Caught error while fitting the ensemble: {reason}");
                self.persist()?;
                return Ok(IterationOutcome::NumericalFailure { reason });
            }
            Err(e) => return Err(e),
        };

        result.log_summary();
        let train_loss = result.train_loss();
        self.state.record_performance(train_loss, self.config.direction);
        let iteration = self.state.iteration;
        self.save_ensemble(&result, iteration)?;

        // アンサンブルを保存してから削除する
        let deleted = self.delete_excess_models(&candidates);

        guard.check()?;
        let (emitted, valid_loss, test_loss) = self.emit_predictions(&result, &keys, iteration)?;

        self.state.history.push(HistoryEntry {
            timestamp: Utc::now(),
            train_loss,
            valid_loss,
            test_loss,
        });
        self.state.last_fit = Some(result);
        self.state.iteration += 1;
        self.persist()?;

        info!(
            "Iteration {iteration}: {} candidates, train loss {train_loss:.6}, best so far {:.6}",
            keys.len(),
            self.state.validation_performance_so_far
        );
        Ok(IterationOutcome::Built(IterationSummary {
            iteration,
            candidates: keys.len(),
            train_loss,
            valid_loss,
            test_loss,
            emitted,
            deleted,
        }))
    }

    fn save_ensemble(&self, result: &EnsembleFitResult, iteration: u64) -> Result<()> {
        let path = self
            .ensembles_dir()
            .join(format!("{}.{:010}.ensemble.json", self.config.seed, iteration));
        let body = serde_json::to_vec_pretty(result)?;
        write_atomic(&path, |w| w.write_all(&body))?;
        debug!("Saved ensemble to {}", path.display());
        Ok(())
    }

    /// 分割ごとのアンサンブル予測を書き出す
    ///
    /// valid/test は全候補の配列が揃っているときだけ出力する。
    fn emit_predictions(
        &self,
        result: &EnsembleFitResult,
        keys: &[ModelKey],
        iteration: u64,
    ) -> Result<(Vec<Split>, Option<f64>, Option<f64>)> {
        let mut emitted = Vec::new();
        let mut valid_loss = None;
        let mut test_loss = None;
        for split in Split::ALL {
            let Some(arrays) = self.state.cache.split_arrays(keys, split) else {
                info!("Skipping {split} predictions: not every candidate has them this iteration");
                continue;
            };
            let prediction = match result.predict(&arrays) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Could not combine {split} predictions: {e}");
                    continue;
                }
            };
            let path = self.predictions_dir().join(format!(
                "predictions_{split}_{}_{:05}.npy",
                self.config.seed, iteration
            ));
            write_npy(&path, &prediction)?;
            emitted.push(split);

            if split != Split::Ensemble {
                let loss = self.split_loss(split, &prediction);
                match split {
                    Split::Valid => valid_loss = loss,
                    Split::Test => test_loss = loss,
                    Split::Ensemble => {}
                }
            }
        }
        Ok((emitted, valid_loss, test_loss))
    }

    /// 正解ラベルがあればその分割の損失を計算する
    fn split_loss(&self, split: Split, prediction: &PredictionArray) -> Option<f64> {
        let targets = match self.store.load_targets(split) {
            Ok(t) => t?,
            Err(e) => {
                warn!("Could not read {split} targets: {e}");
                return None;
            }
        };
        if targets.shape() != prediction.shape() {
            warn!(
                "{split} targets have shape {:?} but predictions have {:?}",
                targets.shape(),
                prediction.shape()
            );
            return None;
        }
        Some(self.loss.loss(targets.view(), prediction.view()))
    }

    /// ディスク予算が効いているとき、候補になったことのないモデルを削除する
    ///
    /// ベースライン・今回の候補・過去の候補・まだ損失を計算していないモデルは残す。
    fn delete_excess_models(&mut self, candidates: &CandidateSet) -> usize {
        if candidates.max_resident_models.is_none() {
            return 0;
        }
        let doomed: Vec<ModelKey> = self
            .state
            .cache
            .records()
            .iter()
            .filter(|(key, record)| {
                key.seed == self.config.seed
                    && key.run_id != self.config.dummy_run_id
                    && record.loaded_state != LoadedState::Deleted
                    && record.mtime_ensemble > 0.0
                    && !candidates.keys.contains(*key)
                    && !candidates.historical.contains(*key)
            })
            .map(|(key, _)| *key)
            .collect();

        let mut deleted = 0;
        for key in doomed {
            match self.store.delete_run(&key) {
                Ok(()) => {
                    info!("Deleted files of non-candidate model {key}");
                    self.state.cache.mark_deleted(&key);
                    deleted += 1;
                }
                Err(e) => error!("Failed to delete files of non-candidate model {key}: {e}"),
            }
        }
        deleted
    }

    fn persist(&self) -> Result<()> {
        self.checkpoint.save(&self.state)
    }

    /// メモリ不足からの回復
    ///
    /// 配列のチェックポイントとメモリ上の配列を捨て、1反復で読むファイル数、
    /// それでも足りなければ nbest を縮める。どちらも最小なら後片付けだけ続ける。
    pub fn apply_memory_backoff(&mut self) {
        if let Err(e) = self.checkpoint.delete_arrays() {
            warn!("Could not delete the array checkpoint: {e}");
        }
        self.state.drop_arrays();

        let nbest = self.state.ensemble_nbest;
        if self.state.read_at_most == Some(1) && nbest.is_minimal() {
            error!(
                "Memory exception with ensemble_nbest={nbest:?} and read_at_most=1; \
                 no ensemble will be built from now on, only cleanup continues. \
                 Consider increasing memory_limit_mb"
            );
            self.state.ensemble_nbest = NBest::Count(0);
        } else if self.state.read_at_most != Some(1) {
            warn!("Memory exception: reducing read_at_most to 1");
            self.state.read_at_most = Some(1);
        } else {
            let halved = nbest.halve();
            warn!("Memory exception: reducing ensemble_nbest from {nbest:?} to {halved:?}");
            self.state.ensemble_nbest = halved;
        }
    }
}
