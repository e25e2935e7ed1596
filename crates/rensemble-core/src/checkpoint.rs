//! チェックポイント（2つの blob）
//!
//! - `ensemble_read_losses.json`: 損失表・候補履歴・縮退状態・性能履歴
//! - `ensemble_read_preds.json.gz`: メモリ上の予測配列と前回 fit
//!
//! どちらも一時ファイルに書いてから rename する。起動時にどちらかが無ければ
//! その部分だけコールドスタートとして扱う。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{CachedArrays, PredictionCache, PredictionRecord};
use crate::error::Result;
use crate::io::{open_reader, write_atomic};
use crate::key::ModelKey;
use crate::selection::EnsembleFitResult;
use crate::selector::NBest;
use crate::state::{BuilderState, HistoryEntry};

pub const CHECKPOINT_DIR: &str = ".ensemble_builder";
pub const LOSSES_FILE: &str = "ensemble_read_losses.json";
pub const ARRAYS_FILE: &str = "ensemble_read_preds.json.gz";

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct LossTable {
    version: u32,
    records: Vec<(ModelKey, PredictionRecord)>,
    historical_candidates: Vec<ModelKey>,
    ensemble_nbest: NBest,
    read_at_most: Option<usize>,
    max_resident_models: Option<usize>,
    #[serde(with = "crate::float_serde")]
    validation_performance_so_far: f64,
    history: Vec<HistoryEntry>,
    iteration: u64,
}

#[derive(Serialize, Deserialize)]
struct ArrayTable {
    version: u32,
    arrays: Vec<(ModelKey, StoredArrays)>,
    last_fit: Option<EnsembleFitResult>,
}

/// 配列は `.npy` バイト列の16進文字列で保存する（NaN/inf を失わない）
#[derive(Serialize, Deserialize)]
struct StoredArrays {
    #[serde(with = "npy_hex", default)]
    ensemble: Option<crate::array::PredictionArray>,
    #[serde(with = "npy_hex", default)]
    valid: Option<crate::array::PredictionArray>,
    #[serde(with = "npy_hex", default)]
    test: Option<crate::array::PredictionArray>,
}

mod npy_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::array::PredictionArray;
    use crate::npy::{decode_npy, encode_npy};

    pub fn serialize<S: Serializer>(
        value: &Option<PredictionArray>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(a) => serializer.serialize_some(&hex::encode(encode_npy(a))),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<PredictionArray>, D::Error> {
        let Some(text) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        decode_npy(&bytes, "checkpoint").map(Some).map_err(serde::de::Error::custom)
    }
}

/// チェックポイントの置き場
#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
}

impl Checkpoint {
    /// `root/.ensemble_builder` を使う
    pub fn in_root(root: &Path) -> Self {
        Self {
            dir: root.join(CHECKPOINT_DIR),
        }
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn losses_path(&self) -> PathBuf {
        self.dir.join(LOSSES_FILE)
    }

    pub fn arrays_path(&self) -> PathBuf {
        self.dir.join(ARRAYS_FILE)
    }

    /// 両方の blob を書く
    pub fn save(&self, state: &BuilderState) -> Result<()> {
        let arrays = ArrayTable {
            version: FORMAT_VERSION,
            arrays: state
                .cache
                .arrays()
                .iter()
                .map(|(k, a)| {
                    (
                        *k,
                        StoredArrays {
                            ensemble: a.ensemble.clone(),
                            valid: a.valid.clone(),
                            test: a.test.clone(),
                        },
                    )
                })
                .collect(),
            last_fit: state.last_fit.clone(),
        };
        let body = serde_json::to_vec(&arrays)?;
        write_atomic(self.arrays_path(), |w| w.write_all(&body))?;

        let table = LossTable {
            version: FORMAT_VERSION,
            records: state.cache.records().iter().map(|(k, r)| (*k, r.clone())).collect(),
            historical_candidates: state.cache.historical_candidates().iter().copied().collect(),
            ensemble_nbest: state.ensemble_nbest,
            read_at_most: state.read_at_most,
            max_resident_models: state.max_resident_models,
            validation_performance_so_far: state.validation_performance_so_far,
            history: state.history.clone(),
            iteration: state.iteration,
        };
        let body = serde_json::to_vec_pretty(&table)?;
        write_atomic(self.losses_path(), |w| w.write_all(&body))?;
        debug!("Saved checkpoint ({} models) to {}", state.cache.len(), self.dir.display());
        Ok(())
    }

    /// 状態を復元する。blob が無い・壊れている部分は `fresh` の値を使う
    pub fn load(&self, fresh: BuilderState) -> BuilderState {
        let mut state = fresh;
        let table: Option<LossTable> = read_blob(&self.losses_path());
        let arrays: Option<ArrayTable> = read_blob(&self.arrays_path());
        if table.is_none() && arrays.is_none() {
            debug!("No checkpoint in {}; cold start", self.dir.display());
            return state;
        }

        let mut records = BTreeMap::new();
        let mut historical = BTreeSet::new();
        if let Some(t) = table {
            records = t.records.into_iter().collect();
            historical = t.historical_candidates.into_iter().collect();
            state.ensemble_nbest = t.ensemble_nbest;
            state.read_at_most = t.read_at_most;
            state.max_resident_models = t.max_resident_models;
            state.validation_performance_so_far = t.validation_performance_so_far;
            state.history = t.history;
            state.iteration = t.iteration;
        }
        let mut cached = HashMap::new();
        if let Some(a) = arrays {
            for (k, s) in a.arrays {
                cached.insert(
                    k,
                    CachedArrays {
                        ensemble: s.ensemble,
                        valid: s.valid,
                        test: s.test,
                    },
                );
            }
            state.last_fit = a.last_fit;
        }
        state.cache = PredictionCache::from_parts(records, cached, historical);
        info!(
            "Restored checkpoint: {} models, {} resident arrays, iteration {}",
            state.cache.len(),
            state.cache.arrays().len(),
            state.iteration
        );
        state
    }

    /// 配列 blob を消す（メモリ不足からの回復時）
    pub fn delete_arrays(&self) -> Result<()> {
        match std::fs::remove_file(self.arrays_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_blob<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    if !path.is_file() {
        return None;
    }
    let parsed = open_reader(path)
        .map_err(|e| e.to_string())
        .and_then(|r| serde_json::from_reader::<_, T>(r).map_err(|e| e.to_string()));
    match parsed {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Ignoring unreadable checkpoint {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::PredictionArray;
    use crate::cache::LoadedState;
    use crate::loss::Direction;
    use chrono::Utc;
    use tempfile::TempDir;

    fn key(run_id: u64) -> ModelKey {
        ModelKey::new(1, run_id, 0.0).unwrap()
    }

    fn sample_state() -> BuilderState {
        let mut records = BTreeMap::new();
        records.insert(
            key(2),
            PredictionRecord {
                loss: 0.5,
                mtime_ensemble: 10.0,
                loaded_state: LoadedState::Resident,
                disk_cost_mb: Some(1.25),
                ..Default::default()
            },
        );
        records.insert(key(3), PredictionRecord::default());
        let mut arrays = HashMap::new();
        arrays.insert(
            key(2),
            CachedArrays {
                ensemble: Some(PredictionArray::from_vec(vec![1.0, f64::NAN])),
                valid: None,
                test: Some(PredictionArray::from_vec(vec![2.0])),
            },
        );
        let historical = [key(2)].into_iter().collect();
        let mut state = BuilderState::new(NBest::Fraction(0.5), Some(3), Direction::Minimize);
        state.cache = PredictionCache::from_parts(records, arrays, historical);
        state.iteration = 4;
        state.history.push(HistoryEntry {
            timestamp: Utc::now(),
            train_loss: 0.4,
            valid_loss: Some(0.45),
            test_loss: None,
        });
        state
    }

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cp = Checkpoint::in_root(dir.path());
        let state = sample_state();
        cp.save(&state).unwrap();

        let fresh = BuilderState::new(NBest::Count(50), Some(5), Direction::Minimize);
        let back = cp.load(fresh);
        assert_eq!(back.cache.records(), state.cache.records());
        assert_eq!(back.cache.historical_candidates(), state.cache.historical_candidates());
        assert_eq!(back.ensemble_nbest, NBest::Fraction(0.5));
        assert_eq!(back.read_at_most, Some(3));
        assert_eq!(back.iteration, 4);
        assert_eq!(back.history, state.history);
        assert!(back.validation_performance_so_far.is_infinite());
        let ens = back.cache.array(&key(2), crate::key::Split::Ensemble).unwrap();
        assert_eq!(ens.data()[0], 1.0);
        assert!(ens.data()[1].is_nan());
    }

    #[test]
    fn test_missing_blobs_are_cold_start() {
        let dir = TempDir::new().unwrap();
        let cp = Checkpoint::in_root(dir.path());
        let fresh = BuilderState::new(NBest::Count(7), None, Direction::Minimize);
        let back = cp.load(fresh);
        assert!(back.cache.is_empty());
        assert_eq!(back.ensemble_nbest, NBest::Count(7));
    }

    #[test]
    fn test_missing_array_blob_marks_evicted() {
        let dir = TempDir::new().unwrap();
        let cp = Checkpoint::in_root(dir.path());
        cp.save(&sample_state()).unwrap();
        cp.delete_arrays().unwrap();
        cp.delete_arrays().unwrap();

        let back = cp.load(BuilderState::new(NBest::Count(50), None, Direction::Minimize));
        assert_eq!(back.cache.record(&key(2)).unwrap().loaded_state, LoadedState::Evicted);
        assert_eq!(back.cache.record(&key(2)).unwrap().loss, 0.5);
        assert!(back.cache.arrays().is_empty());
    }

    #[test]
    fn test_corrupt_blob_is_ignored() {
        let dir = TempDir::new().unwrap();
        let cp = Checkpoint::in_root(dir.path());
        std::fs::create_dir_all(dir.path().join(CHECKPOINT_DIR)).unwrap();
        std::fs::write(cp.losses_path(), b"{ not json").unwrap();
        let back = cp.load(BuilderState::new(NBest::Count(2), None, Direction::Minimize));
        assert!(back.cache.is_empty());
    }
}
