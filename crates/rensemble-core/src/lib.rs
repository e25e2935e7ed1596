//! 予測ファイルからの逐次アンサンブル構築
//!
//! - [`cache`]: ディスク上の予測ファイルの発見と損失の記録
//! - [`selector`]: 候補選択とメモリからの退避
//! - [`selection`]: Caruana の貪欲アンサンブル選択
//! - [`checkpoint`]: 反復をまたぐ状態の永続化

pub mod array;
pub mod cache;
pub mod checkpoint;
pub mod error;
pub(crate) mod float_serde;
pub mod guard;
pub mod io;
pub mod key;
pub mod loss;
pub mod npy;
pub mod selection;
pub mod selector;
pub mod state;
pub mod store;

pub use array::{ArrayView, Precision, PredictionArray};
pub use cache::{CachedArrays, LoadedState, PredictionCache, PredictionRecord};
pub use checkpoint::Checkpoint;
pub use error::{EnsembleError, Result};
pub use guard::{ResourceGuard, Unbounded};
pub use key::{DefaultNaming, ModelKey, NamingConvention, Split};
pub use loss::{Direction, Loss, MeanAbsoluteError, MeanSquaredError};
pub use selection::{EnsembleFitResult, EnsembleSelection, FitOutcome, TrajectoryStep};
pub use selector::{CandidateSet, DiskBudget, NBest, SelectorConfig, select_candidates};
pub use state::{BuilderState, HistoryEntry};
pub use store::PredictionStore;
