//! 予測ファイルを監視しながらアンサンブルを逐次構築するビルダー
//!
//! - [`config`]: TOML 設定
//! - [`builder`]: 1反復分の処理
//! - [`sandbox`]: 時間・メモリ制限つき実行
//! - [`scheduler`]: 反復の状態機械

pub mod builder;
pub mod config;
pub mod sandbox;
pub mod scheduler;

pub use builder::{EnsembleBuilder, IterationOutcome, IterationSummary};
pub use config::{BuilderConfig, ConfigError};
pub use sandbox::{IterationContext, MemoryProbe, SandboxOutcome, SysinfoProbe, ThreadSandbox};
pub use scheduler::{Event, IterationReport, Scheduler, SchedulerState, SharedScheduler, StopReason};
