//! 構築設定（TOML）
//!
//! ```toml
//! seed = 1
//! ensemble_size = 50
//! ensemble_nbest = 0.3        # 整数なら個数、小数なら割合
//! max_models_on_disc = 500.0  # 整数なら個数、小数なら MB、"none" で無制限
//! read_at_most = 5            # 0 で無制限
//! precision = 32
//! memory_limit_mb = 3072      # 0 で無制限
//! ```
//!
//! 数値か割合かの解釈は読み込み時に一度だけ行い、以降は型付きの enum で扱う。

use std::path::{Path, PathBuf};

use rensemble_core::loss::builtin_loss;
use rensemble_core::{Direction, DiskBudget, EnsembleError, NBest, Precision, SelectorConfig};
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] EnsembleError),
}

/// TOML 上の「整数・小数・文字列」のどれか
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawNumeric {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    seed: u64,
    ensemble_size: i64,
    ensemble_nbest: RawNumeric,
    max_models_on_disc: RawNumeric,
    performance_range_threshold: f64,
    read_at_most: u64,
    precision: u32,
    memory_limit_mb: u64,
    max_iterations: Option<u64>,
    time_budget_secs: f64,
    time_buffer_secs: f64,
    random_state: u64,
    dummy_run_id: u64,
    direction: Direction,
    loss: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            ensemble_size: 50,
            ensemble_nbest: RawNumeric::Int(50),
            max_models_on_disc: RawNumeric::Int(100),
            performance_range_threshold: 0.0,
            read_at_most: 5,
            precision: 32,
            memory_limit_mb: 3072,
            max_iterations: None,
            time_budget_secs: 3600.0,
            time_buffer_secs: 5.0,
            random_state: 1,
            dummy_run_id: 1,
            direction: Direction::Minimize,
            loss: "rmse".to_string(),
        }
    }
}

/// 解決済みの設定
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawConfig")]
pub struct BuilderConfig {
    pub seed: u64,
    pub ensemble_size: usize,
    pub ensemble_nbest: NBest,
    pub max_models_on_disc: DiskBudget,
    pub performance_range_threshold: f64,
    /// `None` は無制限
    pub read_at_most: Option<usize>,
    pub precision: Precision,
    /// `None` は無制限
    pub memory_limit_mb: Option<u64>,
    pub max_iterations: Option<u64>,
    pub time_budget_secs: f64,
    /// サンドボックスの締め切りを残り時間からこれだけ手前にする
    pub time_buffer_secs: f64,
    pub random_state: u64,
    pub dummy_run_id: u64,
    pub direction: Direction,
    pub loss: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        // 既定値は検証済み
        Self {
            seed: 1,
            ensemble_size: 50,
            ensemble_nbest: NBest::Count(50),
            max_models_on_disc: DiskBudget::Count(100),
            performance_range_threshold: 0.0,
            read_at_most: Some(5),
            precision: Precision::Single,
            memory_limit_mb: Some(3072),
            max_iterations: None,
            time_budget_secs: 3600.0,
            time_buffer_secs: 5.0,
            random_state: 1,
            dummy_run_id: 1,
            direction: Direction::Minimize,
            loss: "rmse".to_string(),
        }
    }
}

fn invalid(msg: String) -> EnsembleError {
    EnsembleError::InvalidConfiguration(msg)
}

fn resolve_nbest(raw: &RawNumeric) -> Result<NBest, EnsembleError> {
    match raw {
        RawNumeric::Int(n) if *n >= 0 => {
            let n = u32::try_from(*n).map_err(|_| invalid(format!("ensemble_nbest too large: {n}")))?;
            Ok(NBest::Count(n))
        }
        RawNumeric::Int(n) => Err(invalid(format!("ensemble_nbest must be positive (got {n})"))),
        RawNumeric::Float(f) => Ok(NBest::Fraction(*f)),
        RawNumeric::Text(s) => Err(invalid(format!("ensemble_nbest must be a number (got '{s}')"))),
    }
}

fn resolve_disk_budget(raw: &RawNumeric) -> Result<DiskBudget, EnsembleError> {
    match raw {
        RawNumeric::Int(n) if *n >= 0 => {
            let n = u32::try_from(*n)
                .map_err(|_| invalid(format!("max_models_on_disc too large: {n}")))?;
            Ok(DiskBudget::Count(n))
        }
        RawNumeric::Int(n) => Err(invalid(format!("max_models_on_disc must be positive (got {n})"))),
        RawNumeric::Float(mb) => Ok(DiskBudget::Megabytes(*mb)),
        RawNumeric::Text(s) if s.eq_ignore_ascii_case("none") || s.eq_ignore_ascii_case("unbounded") => {
            Ok(DiskBudget::Unbounded)
        }
        RawNumeric::Text(s) => Err(invalid(format!(
            "max_models_on_disc must be a number or \"none\" (got '{s}')"
        ))),
    }
}

impl TryFrom<RawConfig> for BuilderConfig {
    type Error = EnsembleError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let ensemble_size = usize::try_from(raw.ensemble_size)
            .map_err(|_| invalid(format!("ensemble_size must be at least 1 (got {})", raw.ensemble_size)))?;
        let config = BuilderConfig {
            seed: raw.seed,
            ensemble_size,
            ensemble_nbest: resolve_nbest(&raw.ensemble_nbest)?,
            max_models_on_disc: resolve_disk_budget(&raw.max_models_on_disc)?,
            performance_range_threshold: raw.performance_range_threshold,
            read_at_most: (raw.read_at_most > 0).then_some(raw.read_at_most as usize),
            precision: Precision::from_bits(raw.precision)?,
            memory_limit_mb: (raw.memory_limit_mb > 0).then_some(raw.memory_limit_mb),
            max_iterations: raw.max_iterations,
            time_budget_secs: raw.time_budget_secs,
            time_buffer_secs: raw.time_buffer_secs,
            random_state: raw.random_state,
            dummy_run_id: raw.dummy_run_id,
            direction: raw.direction,
            loss: raw.loss,
        };
        config.validate()?;
        Ok(config)
    }
}

impl BuilderConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 起動時の検証。違反は `InvalidConfiguration`
    pub fn validate(&self) -> Result<(), EnsembleError> {
        if self.ensemble_size < 1 {
            return Err(invalid(format!(
                "ensemble_size must be at least 1 (got {})",
                self.ensemble_size
            )));
        }
        self.ensemble_nbest.validate()?;
        self.max_models_on_disc.validate()?;
        let t = self.performance_range_threshold;
        if !(0.0..1.0).contains(&t) {
            return Err(invalid(format!(
                "performance_range_threshold must be in [0, 1) (got {t})"
            )));
        }
        if !(self.time_budget_secs.is_finite() && self.time_budget_secs > 0.0) {
            return Err(invalid(format!(
                "time_budget_secs must be positive (got {})",
                self.time_budget_secs
            )));
        }
        if !(self.time_buffer_secs.is_finite() && self.time_buffer_secs >= 0.0) {
            return Err(invalid(format!(
                "time_buffer_secs must not be negative (got {})",
                self.time_buffer_secs
            )));
        }
        if builtin_loss(&self.loss).is_none() {
            return Err(invalid(format!("unknown loss '{}' (expected rmse, mse or mae)", self.loss)));
        }
        Ok(())
    }

    /// 現在の nbest で候補選択の設定を作る
    pub fn selector_config(&self, nbest: NBest) -> SelectorConfig {
        SelectorConfig {
            nbest,
            disk_budget: self.max_models_on_disc,
            performance_range_threshold: self.performance_range_threshold,
            dummy_run_id: self.dummy_run_id,
            direction: self.direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = BuilderConfig::from_toml_str("").unwrap();
        assert_eq!(c, BuilderConfig::default());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_numeric_or_fraction_resolution() {
        let c = BuilderConfig::from_toml_str(
            "ensemble_nbest = 0.25\nmax_models_on_disc = 512.0\nread_at_most = 0\nmemory_limit_mb = 0\n",
        )
        .unwrap();
        assert_eq!(c.ensemble_nbest, NBest::Fraction(0.25));
        assert_eq!(c.max_models_on_disc, DiskBudget::Megabytes(512.0));
        assert_eq!(c.read_at_most, None);
        assert_eq!(c.memory_limit_mb, None);

        let c = BuilderConfig::from_toml_str("ensemble_nbest = 3\nmax_models_on_disc = \"none\"\n").unwrap();
        assert_eq!(c.ensemble_nbest, NBest::Count(3));
        assert_eq!(c.max_models_on_disc, DiskBudget::Unbounded);
    }

    #[test]
    fn test_rejects_invalid_values() {
        for text in [
            "ensemble_size = 0",
            "ensemble_nbest = 0",
            "ensemble_nbest = 1.5",
            "max_models_on_disc = 0",
            "max_models_on_disc = -2.0",
            "max_models_on_disc = \"lots\"",
            "performance_range_threshold = 1.0",
            "precision = 8",
            "loss = \"hinge\"",
            "time_budget_secs = 0.0",
        ] {
            assert!(BuilderConfig::from_toml_str(text).is_err(), "{text}");
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = BuilderConfig::from_toml_str("ensemble_szie = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_direction_and_precision() {
        let c = BuilderConfig::from_toml_str("direction = \"maximize\"\nprecision = 16\nloss = \"mae\"").unwrap();
        assert_eq!(c.direction, Direction::Maximize);
        assert_eq!(c.precision, Precision::Half);
        assert_eq!(c.selector_config(NBest::Count(4)).direction, Direction::Maximize);
    }
}
