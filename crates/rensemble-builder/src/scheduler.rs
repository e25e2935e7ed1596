//! 反復のスケジューリング
//!
//! 外部からの `Event` を受けて Idle → Running → Idle と遷移する状態機械。
//! メモリ不足は Backoff を経由して読み込み量を減らしてから Idle に戻る。

use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rensemble_core::{EnsembleError, Result};

use crate::builder::{EnsembleBuilder, IterationOutcome};
use crate::sandbox::{SandboxOutcome, ThreadSandbox};

/// これより短い時間しか残っていなければ反復を始めない
const MIN_WALL_TIME: Duration = Duration::from_secs(1);

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next trigger
    Idle,
    /// An iteration is in flight
    Running,
    /// Recovering from a memory-limit violation
    Backoff,
    /// Budget exhausted or shut down; all further events are ignored
    Terminated,
}

impl SchedulerState {
    /// Check if a new iteration may start
    pub fn can_start(&self) -> bool {
        matches!(self, SchedulerState::Idle)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SchedulerState::Terminated)
    }
}

/// スケジューラへの入力
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// 学習ジョブが1つ終わった。`time_left` は呼び出し側が把握している残り時間
    RunFinished { time_left: Option<Duration> },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    TimeBudget,
    MaxIterations,
    NoTimeLeft,
    Shutdown,
}

/// 1イベントの処理結果
#[derive(Debug, Clone, PartialEq)]
pub enum IterationReport {
    Completed(IterationOutcome),
    TimedOut,
    BackedOff,
    /// 反復中のエラー（ログ済み、次のトリガで再試行）
    Failed(String),
    Terminated(StopReason),
    /// すでに終了している
    Ignored,
}

pub struct Scheduler {
    builder: EnsembleBuilder,
    sandbox: ThreadSandbox,
    state: SchedulerState,
    started: Instant,
    iterations: u64,
}

impl Scheduler {
    pub fn new(builder: EnsembleBuilder, sandbox: ThreadSandbox) -> Self {
        Self {
            builder,
            sandbox,
            state: SchedulerState::Idle,
            started: Instant::now(),
            iterations: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn builder(&self) -> &EnsembleBuilder {
        &self.builder
    }

    /// このプロセスで試みた反復数
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// イベントを1つ処理する
    ///
    /// 設定系のエラー（不正な引数・ファイル名）だけを `Err` で返す。
    /// それ以外の失敗はログに残して Idle に戻る。
    pub fn handle(&mut self, event: Event) -> Result<IterationReport> {
        if self.state.is_terminated() {
            return Ok(IterationReport::Ignored);
        }
        let time_left = match event {
            Event::Shutdown => return Ok(self.terminate(StopReason::Shutdown)),
            Event::RunFinished { time_left } => time_left,
        };
        if !self.state.can_start() {
            debug!("Ignoring trigger in state {:?}", self.state);
            return Ok(IterationReport::Ignored);
        }

        let config = self.builder.config();
        let budget = Duration::from_secs_f64(config.time_budget_secs);
        let buffer = Duration::from_secs_f64(config.time_buffer_secs);
        let max_iterations = config.max_iterations;
        let elapsed = self.started.elapsed();
        if elapsed >= budget {
            return Ok(self.terminate(StopReason::TimeBudget));
        }
        if max_iterations.is_some_and(|max| self.iterations >= max) {
            return Ok(self.terminate(StopReason::MaxIterations));
        }
        let remaining = budget - elapsed;
        let remaining = time_left.map_or(remaining, |t| t.min(remaining));
        let wall_time = remaining.saturating_sub(buffer);
        if wall_time < MIN_WALL_TIME {
            return Ok(self.terminate(StopReason::NoTimeLeft));
        }

        self.state = SchedulerState::Running;
        self.iterations += 1;
        debug!("Starting iteration {} with wall time {:.1}s", self.iterations, wall_time.as_secs_f64());
        let builder = &mut self.builder;
        let outcome = self.sandbox.run(wall_time, |ctx| builder.run_iteration(ctx));

        let report = match outcome {
            SandboxOutcome::Finished(Ok(outcome)) => IterationReport::Completed(outcome),
            SandboxOutcome::TimedOut => {
                warn!("Ensemble building timed out after {:.1}s", wall_time.as_secs_f64());
                IterationReport::TimedOut
            }
            SandboxOutcome::MemoryExceeded => {
                self.state = SchedulerState::Backoff;
                self.builder.apply_memory_backoff();
                IterationReport::BackedOff
            }
            SandboxOutcome::Finished(Err(e)) if is_configuration_error(&e) => {
                self.state = SchedulerState::Idle;
                return Err(e);
            }
            SandboxOutcome::Finished(Err(e)) => {
                error!("Ensemble building failed: {e}");
                IterationReport::Failed(e.to_string())
            }
        };
        self.state = SchedulerState::Idle;
        Ok(report)
    }

    fn terminate(&mut self, reason: StopReason) -> IterationReport {
        info!("Stopping ensemble building: {reason:?}");
        self.state = SchedulerState::Terminated;
        IterationReport::Terminated(reason)
    }
}

fn is_configuration_error(e: &EnsembleError) -> bool {
    matches!(
        e,
        EnsembleError::InvalidArgument(_)
            | EnsembleError::InvalidConfiguration(_)
            | EnsembleError::InvalidFileName(_)
    )
}

/// 複数の呼び出し元から共有するスケジューラ
///
/// 反復中に来たトリガは待たずに捨てる。
#[derive(Clone)]
pub struct SharedScheduler(Arc<Mutex<Scheduler>>);

impl SharedScheduler {
    pub fn new(scheduler: Scheduler) -> Self {
        Self(Arc::new(Mutex::new(scheduler)))
    }

    /// 反復中なら `None`
    pub fn trigger(&self, event: Event) -> Option<Result<IterationReport>> {
        let mut guard = match self.0.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("Iteration already in flight; trigger ignored");
                return None;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        Some(guard.handle(event))
    }

    pub fn state(&self) -> SchedulerState {
        match self.0.lock() {
            Ok(guard) => guard.state(),
            Err(poisoned) => poisoned.into_inner().state(),
        }
    }
}
