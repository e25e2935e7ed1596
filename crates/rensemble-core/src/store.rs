//! 予測ファイル置き場（ファイルシステム側のビュー）
//!
//! ```text
//! {root}/true_targets_{split}.npy
//! {root}/runs/{run_dir}/{file_name}.npy[.gz]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use log::{debug, warn};

use crate::array::{PredictionArray, Precision};
use crate::error::{EnsembleError, Result};
use crate::key::{DefaultNaming, ModelKey, NamingConvention, Split};
use crate::npy::read_npy;

pub const RUNS_DIR: &str = "runs";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct PredictionStore {
    root: PathBuf,
    runs_dir: PathBuf,
    naming: Arc<dyn NamingConvention>,
    precision: Precision,
}

impl std::fmt::Debug for PredictionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionStore")
            .field("root", &self.root)
            .field("precision", &self.precision)
            .finish()
    }
}

impl PredictionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runs_dir = root.join(RUNS_DIR);
        Self {
            root,
            runs_dir,
            naming: Arc::new(DefaultNaming),
            precision: Precision::default(),
        }
    }

    pub fn with_naming(mut self, naming: Arc<dyn NamingConvention>) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn naming(&self) -> &dyn NamingConvention {
        self.naming.as_ref()
    }

    pub fn run_dir(&self, key: &ModelKey) -> PathBuf {
        self.runs_dir.join(self.naming.run_dir_name(key))
    }

    /// 非圧縮 → `.gz` の順で存在するファイルを返す
    pub fn prediction_path(&self, key: &ModelKey, split: Split) -> Option<PathBuf> {
        let plain = self.run_dir(key).join(self.naming.file_name(key, split));
        existing_variant(plain)
    }

    pub fn targets_path(&self, split: Split) -> Option<PathBuf> {
        existing_variant(self.root.join(format!("true_targets_{split}.npy")))
    }

    /// 正解ラベルを読む。ファイルが無ければ `None`
    pub fn load_targets(&self, split: Split) -> Result<Option<PredictionArray>> {
        match self.targets_path(split) {
            Some(path) => read_npy(&path, Precision::Double).map(Some),
            None => Ok(None),
        }
    }

    /// `seed` の ensemble 分割の予測ファイルをすべて列挙する
    ///
    /// 探索パターンに一致したのに命名規則で解釈できないファイルは `InvalidFileName`。
    pub fn ensemble_files(&self, seed: u64) -> Result<Vec<(ModelKey, PathBuf)>> {
        if !self.runs_dir.is_dir() {
            return Ok(Vec::new());
        }
        let base = self.runs_dir.to_str().ok_or_else(|| {
            EnsembleError::InvalidArgument(format!(
                "runs directory is not valid UTF-8: {}",
                self.runs_dir.display()
            ))
        })?;
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(base),
            self.naming.discovery_pattern(seed)
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| EnsembleError::InvalidArgument(format!("bad discovery pattern: {e}")))?;

        let mut found: Vec<(ModelKey, PathBuf)> = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!("Skipping unreadable path during discovery: {e}");
                    continue;
                }
            };
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            match self.naming.parse(name) {
                Some((key, Split::Ensemble)) if key.seed == seed => found.push((key, path)),
                _ => return Err(EnsembleError::InvalidFileName(path)),
            }
        }
        // 同じキーの .npy と .npy.gz が両方ある場合は非圧縮を優先
        found.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        found.dedup_by(|later, earlier| later.0 == earlier.0);
        Ok(found)
    }

    /// 予測を読み、設定精度で丸める
    pub fn read_prediction(&self, key: &ModelKey, split: Split) -> Result<PredictionArray> {
        let path = self.prediction_path(key, split).ok_or_else(|| {
            EnsembleError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no {split} predictions for model {key}"),
            ))
        })?;
        read_npy(&path, self.precision)
    }

    /// run ディレクトリの総サイズ（MB, 小数2桁）。測れなければ `None`
    pub fn disk_cost_mb(&self, key: &ModelKey) -> Option<f64> {
        let dir = self.run_dir(key);
        match dir_size(&dir) {
            Ok(bytes) => Some((bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0),
            Err(e) => {
                debug!("Could not measure disk cost of {}: {e}", dir.display());
                None
            }
        }
    }

    /// モデルの成果物を削除する
    ///
    /// 先に `*.old` へ rename してから消すので、途中で失敗しても
    /// 探索パターンに半端なディレクトリが残らない。
    pub fn delete_run(&self, key: &ModelKey) -> Result<()> {
        let dir = self.run_dir(key);
        let mut old = dir.clone().into_os_string();
        old.push(".old");
        let old = PathBuf::from(old);
        fs::rename(&dir, &old)?;
        fs::remove_dir_all(&old)?;
        Ok(())
    }
}

fn existing_variant(plain: PathBuf) -> Option<PathBuf> {
    if plain.is_file() {
        return Some(plain);
    }
    let mut gz = plain.into_os_string();
    gz.push(".gz");
    let gz = PathBuf::from(gz);
    gz.is_file().then_some(gz)
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

/// 更新時刻（UNIX 秒）
pub fn mtime_secs(path: &Path) -> Result<f64> {
    let modified = fs::metadata(path)?.modified()?;
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(secs)
}
