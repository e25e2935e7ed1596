//! モデル識別子と予測ファイルの命名規則
//!
//! - `ModelKey`: `(seed, run_id, stage)` の三つ組。全テーブルの主キー
//! - `Split`: 予測ファイルの分割（ensemble / valid / test）
//! - `NamingConvention`: ディレクトリ名・ファイル名との相互変換
//!
//! 既定の命名は `runs/{seed}_{run_id}_{stage}/predictions_{split}_{seed}_{run_id}_{stage}.npy`。

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};

/// 予測ファイルの分割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Ensemble,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Ensemble, Split::Valid, Split::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Split::Ensemble => "ensemble",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }

    fn from_tag(tag: &str) -> Option<Split> {
        match tag {
            "ensemble" => Some(Split::Ensemble),
            "valid" => Some(Split::Valid),
            "test" => Some(Split::Test),
            _ => None,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 1つの学習済みモデルの出力セットを識別するキー
///
/// `stage` は学習予算（budget）。`-0.0` は `0.0` に正規化して保持するので、
/// `Eq`/`Hash` はビット表現で比較してよい。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelKey {
    pub seed: u64,
    pub run_id: u64,
    pub stage: f64,
}

impl ModelKey {
    /// キーを作成する。
    ///
    /// ファイル名へ往復変換できない stage（負値・非有限・指数表記になる値）は拒否する。
    pub fn new(seed: u64, run_id: u64, stage: f64) -> Result<Self> {
        if !stage.is_finite() || stage < 0.0 {
            return Err(EnsembleError::InvalidArgument(format!(
                "stage must be a finite non-negative number: {stage}"
            )));
        }
        let stage = if stage == 0.0 { 0.0 } else { stage };
        if format_stage(stage).contains('e') {
            return Err(EnsembleError::InvalidArgument(format!(
                "stage {stage:?} cannot be encoded without an exponent"
            )));
        }
        Ok(Self {
            seed,
            run_id,
            stage,
        })
    }

    fn stage_bits(&self) -> u64 {
        self.stage.to_bits()
    }
}

impl PartialEq for ModelKey {
    fn eq(&self, other: &Self) -> bool {
        self.seed == other.seed
            && self.run_id == other.run_id
            && self.stage_bits() == other.stage_bits()
    }
}

impl Eq for ModelKey {}

impl Hash for ModelKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.seed.hash(state);
        self.run_id.hash(state);
        self.stage_bits().hash(state);
    }
}

impl PartialOrd for ModelKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModelKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seed
            .cmp(&other.seed)
            .then(self.run_id.cmp(&other.run_id))
            .then(self.stage.total_cmp(&other.stage))
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.seed, self.run_id, format_stage(self.stage))
    }
}

/// stage を最短の往復可能な10進表記にする（常に `.` を含む）
pub fn format_stage(stage: f64) -> String {
    format!("{stage:?}")
}

/// ディレクトリ名・ファイル名と `ModelKey` の相互変換
///
/// 実装は往復可能でなければならない: `parse(file_name(k, s)) == Some((k, s))`。
pub trait NamingConvention: Send + Sync {
    /// 1モデル分の成果物を置くディレクトリ名（runs ディレクトリからの相対）
    fn run_dir_name(&self, key: &ModelKey) -> String;

    /// 予測ファイル名（圧縮拡張子なし）
    fn file_name(&self, key: &ModelKey, split: Split) -> String;

    /// ensemble 分割の予測ファイルを探す glob パターン（runs ディレクトリからの相対）
    fn discovery_pattern(&self, seed: u64) -> String;

    /// ファイル名を解釈する。規則に合わなければ `None`
    fn parse(&self, file_name: &str) -> Option<(ModelKey, Split)>;
}

static DEFAULT_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^predictions_(ensemble|valid|test)_([0-9]+)_([0-9]+)_([0-9]+\.[0-9]+)\.npy(\.gz)?$")
        .expect("static regex")
});

/// 既定の命名規則
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNaming;

impl NamingConvention for DefaultNaming {
    fn run_dir_name(&self, key: &ModelKey) -> String {
        format!("{}_{}_{}", key.seed, key.run_id, format_stage(key.stage))
    }

    fn file_name(&self, key: &ModelKey, split: Split) -> String {
        format!(
            "predictions_{}_{}_{}_{}.npy",
            split.as_str(),
            key.seed,
            key.run_id,
            format_stage(key.stage)
        )
    }

    fn discovery_pattern(&self, seed: u64) -> String {
        format!("{seed}_*_*/predictions_ensemble_{seed}_*_*.npy*")
    }

    fn parse(&self, file_name: &str) -> Option<(ModelKey, Split)> {
        let caps = DEFAULT_FILE_RE.captures(file_name)?;
        let split = Split::from_tag(caps.get(1)?.as_str())?;
        let seed = caps.get(2)?.as_str().parse::<u64>().ok()?;
        let run_id = caps.get(3)?.as_str().parse::<u64>().ok()?;
        let stage = caps.get(4)?.as_str().parse::<f64>().ok()?;
        let key = ModelKey::new(seed, run_id, stage).ok()?;
        Some((key, split))
    }
}
