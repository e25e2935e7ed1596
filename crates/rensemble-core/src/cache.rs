//! 予測キャッシュ
//!
//! 発見済みモデルごとの損失・更新時刻・ディスク使用量と、メモリ上に保持している
//! 予測配列を管理する。配列は候補として選ばれたモデルの分だけ読み込む。
//!
//! 不変条件:
//! - `Resident` のモデルは必ず ensemble 配列を保持している
//! - `Deleted` のモデルは `loss = +inf` で、配列を保持しない

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::array::PredictionArray;
use crate::error::Result;
use crate::guard::ResourceGuard;
use crate::key::{ModelKey, Split};
use crate::loss::Loss;
use crate::npy::read_npy;
use crate::store::{PredictionStore, mtime_secs};

/// 配列の読み込み状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadedState {
    NotLoaded,
    Resident,
    Evicted,
    Deleted,
}

/// 1モデル分のメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// 検証損失。未計算・読み込み失敗なら `+inf`
    #[serde(with = "crate::float_serde")]
    pub loss: f64,
    pub mtime_ensemble: f64,
    pub mtime_valid: f64,
    pub mtime_test: f64,
    pub disk_cost_mb: Option<f64>,
    pub loaded_state: LoadedState,
}

impl Default for PredictionRecord {
    fn default() -> Self {
        Self {
            loss: f64::INFINITY,
            mtime_ensemble: 0.0,
            mtime_valid: 0.0,
            mtime_test: 0.0,
            disk_cost_mb: None,
            loaded_state: LoadedState::NotLoaded,
        }
    }
}

impl PredictionRecord {
    fn mtime(&self, split: Split) -> f64 {
        match split {
            Split::Ensemble => self.mtime_ensemble,
            Split::Valid => self.mtime_valid,
            Split::Test => self.mtime_test,
        }
    }

    fn set_mtime(&mut self, split: Split, mtime: f64) {
        match split {
            Split::Ensemble => self.mtime_ensemble = mtime,
            Split::Valid => self.mtime_valid = mtime,
            Split::Test => self.mtime_test = mtime,
        }
    }
}

/// メモリ上の予測配列
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedArrays {
    pub ensemble: Option<PredictionArray>,
    pub valid: Option<PredictionArray>,
    pub test: Option<PredictionArray>,
}

impl CachedArrays {
    pub fn get(&self, split: Split) -> Option<&PredictionArray> {
        match split {
            Split::Ensemble => self.ensemble.as_ref(),
            Split::Valid => self.valid.as_ref(),
            Split::Test => self.test.as_ref(),
        }
    }

    fn slot(&mut self, split: Split) -> &mut Option<PredictionArray> {
        match split {
            Split::Ensemble => &mut self.ensemble,
            Split::Valid => &mut self.valid,
            Split::Test => &mut self.test,
        }
    }

    fn is_empty(&self) -> bool {
        self.ensemble.is_none() && self.valid.is_none() && self.test.is_none()
    }
}

/// 1ファイル分の読み込み依頼
struct PendingRead {
    key: ModelKey,
    path: PathBuf,
    mtime: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PredictionCache {
    records: BTreeMap<ModelKey, PredictionRecord>,
    arrays: HashMap<ModelKey, CachedArrays>,
    /// これまでに一度でも候補になったキー（ディスク削除の対象外）
    historical_candidates: BTreeSet<ModelKey>,
}

impl PredictionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// チェックポイントから復元する。不変条件に反する組み合わせは修復する
    pub fn from_parts(
        records: BTreeMap<ModelKey, PredictionRecord>,
        arrays: HashMap<ModelKey, CachedArrays>,
        historical_candidates: BTreeSet<ModelKey>,
    ) -> Self {
        let mut cache = Self {
            records,
            arrays,
            historical_candidates,
        };
        cache.arrays.retain(|k, a| cache.records.contains_key(k) && !a.is_empty());
        for (key, record) in cache.records.iter_mut() {
            let has_ensemble = cache.arrays.get(key).is_some_and(|a| a.ensemble.is_some());
            match record.loaded_state {
                LoadedState::Resident if !has_ensemble => {
                    debug!("Model {key} lost its cached array; marking evicted");
                    record.loaded_state = LoadedState::Evicted;
                }
                LoadedState::Deleted => {
                    record.loss = f64::INFINITY;
                    cache.arrays.remove(key);
                }
                _ => {}
            }
        }
        cache
    }

    pub fn records(&self) -> &BTreeMap<ModelKey, PredictionRecord> {
        &self.records
    }

    pub fn record(&self, key: &ModelKey) -> Option<&PredictionRecord> {
        self.records.get(key)
    }

    pub fn arrays(&self) -> &HashMap<ModelKey, CachedArrays> {
        &self.arrays
    }

    pub fn array(&self, key: &ModelKey, split: Split) -> Option<&PredictionArray> {
        self.arrays.get(key).and_then(|a| a.get(split))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn historical_candidates(&self) -> &BTreeSet<ModelKey> {
        &self.historical_candidates
    }

    pub fn remember_candidates<'a>(&mut self, keys: impl IntoIterator<Item = &'a ModelKey>) {
        self.historical_candidates.extend(keys.into_iter().copied());
    }

    /// ディスク上の予測ファイルを走査し、新規・更新されたファイルの損失を計算する
    ///
    /// - 正解ラベルが無い、または予測ファイルが1つも無ければ `Ok(false)`
    /// - 更新時刻の古い順に処理し、成功した読み込みが `read_at_most` に達したら打ち切る
    /// - 個々のファイルの読み込み失敗は `loss = +inf` にして次回再試行する
    pub fn refresh(
        &mut self,
        store: &PredictionStore,
        seed: u64,
        read_at_most: Option<usize>,
        loss_fn: &dyn Loss,
        guard: &dyn ResourceGuard,
    ) -> Result<bool> {
        let Some(y_true) = store.load_targets(Split::Ensemble)? else {
            debug!("No ground truth found in {}", store.root().display());
            return Ok(false);
        };
        let files = store.ensemble_files(seed)?;
        if files.is_empty() {
            debug!("No prediction files found for seed {seed}");
            return Ok(false);
        }

        let mut pending = Vec::new();
        for (key, path) in files {
            let mtime = match mtime_secs(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Could not stat {}: {e}", path.display());
                    continue;
                }
            };
            let record = self.records.entry(key).or_default();
            if record.mtime_ensemble == mtime && record.loaded_state != LoadedState::Deleted {
                continue;
            }
            pending.push(PendingRead { key, path, mtime });
        }
        pending.sort_by(|a, b| a.mtime.total_cmp(&b.mtime).then(a.key.cmp(&b.key)));

        let limit = read_at_most.unwrap_or(usize::MAX);
        let batch = rayon::current_num_threads().max(1);
        let precision = store.precision();
        let mut n_read = 0usize;
        let mut queue = pending.as_slice();
        while n_read < limit && !queue.is_empty() {
            guard.check()?;
            let take = batch.min(limit - n_read).min(queue.len());
            let (chunk, rest) = queue.split_at(take);
            queue = rest;

            let results: Vec<std::result::Result<f64, String>> = chunk
                .par_iter()
                .map(|job| {
                    let pred = read_npy(&job.path, precision).map_err(|e| e.to_string())?;
                    if pred.shape() != y_true.shape() {
                        return Err(format!(
                            "shape {:?} does not match ground truth {:?}",
                            pred.shape(),
                            y_true.shape()
                        ));
                    }
                    Ok(loss_fn.loss(y_true.view(), pred.view()))
                })
                .collect();

            for (job, result) in chunk.iter().zip(results) {
                match result {
                    Ok(value) => {
                        let value = if value.is_nan() {
                            warn!("Loss of model {} is NaN; ranking it last", job.key);
                            f64::INFINITY
                        } else {
                            value
                        };
                        let disk_cost = store.disk_cost_mb(&job.key);
                        let had_arrays = self.arrays.remove(&job.key).is_some();
                        let record = self.records.entry(job.key).or_default();
                        record.loss = value;
                        record.mtime_ensemble = job.mtime;
                        record.disk_cost_mb = disk_cost;
                        record.loaded_state = match record.loaded_state {
                            LoadedState::Deleted => LoadedState::NotLoaded,
                            _ if had_arrays => LoadedState::Evicted,
                            LoadedState::Resident => LoadedState::Evicted,
                            other => other,
                        };
                        debug!("Model {} loss {value}", job.key);
                        n_read += 1;
                    }
                    Err(reason) => {
                        warn!("Error loading {}: {reason}", job.path.display());
                        if let Some(record) = self.records.get_mut(&job.key) {
                            record.loss = f64::INFINITY;
                        }
                    }
                }
            }
        }
        if n_read > 0 {
            info!("Read {n_read} new prediction file(s) ({} model(s) known)", self.records.len());
        }
        Ok(true)
    }

    /// ensemble 配列を読み込んで `Resident` にする
    pub fn load_ensemble(&mut self, store: &PredictionStore, key: &ModelKey) -> Result<()> {
        let array = store.read_prediction(key, Split::Ensemble)?;
        self.arrays.entry(*key).or_default().ensemble = Some(array);
        if let Some(record) = self.records.get_mut(key) {
            record.loaded_state = LoadedState::Resident;
        }
        Ok(())
    }

    /// 配列をメモリから外す（損失は残す）
    pub fn evict(&mut self, key: &ModelKey) {
        self.arrays.remove(key);
        if let Some(record) = self.records.get_mut(key) {
            if record.loaded_state == LoadedState::Resident {
                record.loaded_state = LoadedState::Evicted;
            }
        }
    }

    pub fn evict_all(&mut self) {
        let keys: Vec<ModelKey> = self.records.keys().copied().collect();
        for key in &keys {
            self.evict(key);
        }
        self.arrays.clear();
    }

    /// 損失を `+inf` にする（ensemble 配列の読み込み失敗時）
    pub fn invalidate(&mut self, key: &ModelKey) {
        self.arrays.remove(key);
        if let Some(record) = self.records.get_mut(key) {
            record.loss = f64::INFINITY;
            if record.loaded_state == LoadedState::Resident {
                record.loaded_state = LoadedState::Evicted;
            }
        }
    }

    /// ディスク上の成果物が削除されたことを記録する
    pub fn mark_deleted(&mut self, key: &ModelKey) {
        self.arrays.remove(key);
        if let Some(record) = self.records.get_mut(key) {
            record.loss = f64::INFINITY;
            record.disk_cost_mb = None;
            record.loaded_state = LoadedState::Deleted;
        }
    }

    /// 候補モデルの valid/test 配列を読み込む
    ///
    /// 更新時刻が変わっていなければ保持済みの配列を使う。読めなかったモデルは
    /// 配列なしのまま。読み込めた数を返す。
    pub fn load_split_arrays(
        &mut self,
        store: &PredictionStore,
        keys: &[ModelKey],
        split: Split,
        guard: &dyn ResourceGuard,
    ) -> Result<usize> {
        let mut loaded = 0;
        for key in keys {
            guard.check()?;
            let Some(record) = self.records.get_mut(key) else {
                continue;
            };
            let entry = self.arrays.entry(*key).or_default();
            let Some(path) = store.prediction_path(key, split) else {
                *entry.slot(split) = None;
                record.set_mtime(split, 0.0);
                continue;
            };
            let mtime = match mtime_secs(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Could not stat {}: {e}", path.display());
                    *entry.slot(split) = None;
                    continue;
                }
            };
            if record.mtime(split) == mtime && entry.get(split).is_some() {
                loaded += 1;
                continue;
            }
            match read_npy(&path, store.precision()) {
                Ok(array) => {
                    *entry.slot(split) = Some(array);
                    record.set_mtime(split, mtime);
                    loaded += 1;
                }
                Err(e) => {
                    warn!("Error loading {split} predictions of model {key}: {e}");
                    *entry.slot(split) = None;
                }
            }
        }
        self.arrays.retain(|_, a| !a.is_empty());
        Ok(loaded)
    }

    /// 全キーの配列が揃っていればその順で返す
    pub fn split_arrays(&self, keys: &[ModelKey], split: Split) -> Option<Vec<&PredictionArray>> {
        keys.iter().map(|k| self.array(k, split)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::Unbounded;
    use crate::loss::MeanSquaredError;
    use crate::npy::write_npy;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: PredictionStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = PredictionStore::new(dir.path());
            Self { _dir: dir, store }
        }

        fn targets(&self, values: Vec<f64>) {
            let path = self.store.root().join("true_targets_ensemble.npy");
            write_npy(&path, &PredictionArray::from_vec(values)).unwrap();
        }

        /// 予測を書き、更新時刻を `age_secs` 秒前にずらす
        fn model(&self, run_id: u64, split: Split, values: Vec<f64>, age_secs: u64) -> ModelKey {
            let k = ModelKey::new(1, run_id, 0.0).unwrap();
            let path = self.store.run_dir(&k).join(self.store.naming().file_name(&k, split));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            write_npy(&path, &PredictionArray::from_vec(values)).unwrap();
            let f = fs::File::options().write(true).open(&path).unwrap();
            f.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
            k
        }
    }

    fn rmse() -> MeanSquaredError {
        MeanSquaredError::rmse()
    }

    #[test]
    fn test_refresh_cold_start() {
        let fx = Fixture::new();
        let mut cache = PredictionCache::new();
        // 正解ラベルなし
        assert!(!cache.refresh(&fx.store, 1, None, &rmse(), &Unbounded).unwrap());
        // 正解ラベルはあるが予測なし
        fx.targets(vec![1.0, 1.0]);
        assert!(!cache.refresh(&fx.store, 1, None, &rmse(), &Unbounded).unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_refresh_computes_losses() {
        let fx = Fixture::new();
        fx.targets(vec![1.0, 1.0]);
        let a = fx.model(1, Split::Ensemble, vec![1.0, 1.0], 30);
        let b = fx.model(2, Split::Ensemble, vec![3.0, 3.0], 20);
        let mut cache = PredictionCache::new();
        assert!(cache.refresh(&fx.store, 1, None, &rmse(), &Unbounded).unwrap());
        assert_eq!(cache.record(&a).unwrap().loss, 0.0);
        assert_eq!(cache.record(&b).unwrap().loss, 2.0);
        assert_eq!(cache.record(&b).unwrap().loaded_state, LoadedState::NotLoaded);
        assert!(cache.record(&b).unwrap().disk_cost_mb.is_some());
    }

    #[test]
    fn test_refresh_respects_read_limit_oldest_first() {
        let fx = Fixture::new();
        fx.targets(vec![0.0]);
        let newest = fx.model(1, Split::Ensemble, vec![1.0], 10);
        let oldest = fx.model(2, Split::Ensemble, vec![2.0], 300);
        let middle = fx.model(3, Split::Ensemble, vec![3.0], 100);
        let mut cache = PredictionCache::new();

        cache.refresh(&fx.store, 1, Some(1), &rmse(), &Unbounded).unwrap();
        assert_eq!(cache.record(&oldest).unwrap().loss, 2.0);
        assert!(cache.record(&middle).unwrap().loss.is_infinite());
        assert!(cache.record(&newest).unwrap().loss.is_infinite());

        cache.refresh(&fx.store, 1, Some(1), &rmse(), &Unbounded).unwrap();
        assert_eq!(cache.record(&middle).unwrap().loss, 3.0);
        cache.refresh(&fx.store, 1, Some(1), &rmse(), &Unbounded).unwrap();
        assert_eq!(cache.record(&newest).unwrap().loss, 1.0);
    }

    #[test]
    fn test_corrupt_file_is_soft_failure() {
        let fx = Fixture::new();
        fx.targets(vec![0.0]);
        let good = fx.model(1, Split::Ensemble, vec![1.0], 50);
        let bad = ModelKey::new(1, 2, 0.0).unwrap();
        let path = fx.store.run_dir(&bad).join(fx.store.naming().file_name(&bad, Split::Ensemble));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"garbage").unwrap();

        let mut cache = PredictionCache::new();
        assert!(cache.refresh(&fx.store, 1, None, &rmse(), &Unbounded).unwrap());
        assert_eq!(cache.record(&good).unwrap().loss, 1.0);
        assert!(cache.record(&bad).unwrap().loss.is_infinite());
        // 失敗したファイルは読み込み数に数えず、次回も再試行される
        assert_eq!(cache.record(&bad).unwrap().mtime_ensemble, 0.0);
    }

    #[test]
    fn test_changed_file_drops_resident_array() {
        let fx = Fixture::new();
        fx.targets(vec![0.0]);
        let k = fx.model(1, Split::Ensemble, vec![1.0], 100);
        let mut cache = PredictionCache::new();
        cache.refresh(&fx.store, 1, None, &rmse(), &Unbounded).unwrap();
        cache.load_ensemble(&fx.store, &k).unwrap();
        assert_eq!(cache.record(&k).unwrap().loaded_state, LoadedState::Resident);

        fx.model(1, Split::Ensemble, vec![4.0], 5);
        cache.refresh(&fx.store, 1, None, &rmse(), &Unbounded).unwrap();
        assert_eq!(cache.record(&k).unwrap().loss, 4.0);
        assert_eq!(cache.record(&k).unwrap().loaded_state, LoadedState::Evicted);
        assert!(cache.array(&k, Split::Ensemble).is_none());
    }

    #[test]
    fn test_eviction_keeps_loss() {
        let fx = Fixture::new();
        fx.targets(vec![0.0]);
        let k = fx.model(1, Split::Ensemble, vec![2.0], 100);
        let mut cache = PredictionCache::new();
        cache.refresh(&fx.store, 1, None, &rmse(), &Unbounded).unwrap();
        cache.load_ensemble(&fx.store, &k).unwrap();
        cache.evict(&k);
        assert_eq!(cache.record(&k).unwrap().loaded_state, LoadedState::Evicted);
        assert_eq!(cache.record(&k).unwrap().loss, 2.0);
        cache.load_ensemble(&fx.store, &k).unwrap();
        assert_eq!(cache.array(&k, Split::Ensemble).unwrap().data(), &[2.0]);
    }

    #[test]
    fn test_split_arrays_require_all_keys() {
        let fx = Fixture::new();
        fx.targets(vec![0.0]);
        let a = fx.model(1, Split::Ensemble, vec![1.0], 100);
        let b = fx.model(2, Split::Ensemble, vec![2.0], 100);
        fx.model(1, Split::Valid, vec![1.5], 100);
        let mut cache = PredictionCache::new();
        cache.refresh(&fx.store, 1, None, &rmse(), &Unbounded).unwrap();

        let keys = [a, b];
        assert_eq!(cache.load_split_arrays(&fx.store, &keys, Split::Valid, &Unbounded).unwrap(), 1);
        assert!(cache.split_arrays(&keys, Split::Valid).is_none());
        assert_eq!(cache.split_arrays(&keys[..1], Split::Valid).unwrap()[0].data(), &[1.5]);

        fx.model(2, Split::Valid, vec![2.5], 100);
        assert_eq!(cache.load_split_arrays(&fx.store, &keys, Split::Valid, &Unbounded).unwrap(), 2);
        assert_eq!(cache.split_arrays(&keys, Split::Valid).unwrap().len(), 2);
    }

    #[test]
    fn test_from_parts_repairs_invariants() {
        let k = ModelKey::new(1, 2, 0.0).unwrap();
        let d = ModelKey::new(1, 3, 0.0).unwrap();
        let mut records = BTreeMap::new();
        records.insert(
            k,
            PredictionRecord {
                loss: 1.0,
                loaded_state: LoadedState::Resident,
                ..Default::default()
            },
        );
        records.insert(
            d,
            PredictionRecord {
                loss: 0.5,
                loaded_state: LoadedState::Deleted,
                ..Default::default()
            },
        );
        let cache = PredictionCache::from_parts(records, HashMap::new(), BTreeSet::new());
        assert_eq!(cache.record(&k).unwrap().loaded_state, LoadedState::Evicted);
        assert!(cache.record(&d).unwrap().loss.is_infinite());
    }
}
