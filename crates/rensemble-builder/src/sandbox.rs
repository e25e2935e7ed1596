//! 反復本体を時間・メモリ制限つきで実行するサンドボックス
//!
//! 本体は名前付きのスコープ付きスレッドで動かし、呼び出し側は `recv_timeout` で
//! 結果を待ちながら締め切りとメモリ使用量を監視する。どちらかを超えたら
//! キャンセルフラグを立て、本体が `ResourceGuard::check()` で止まるのを待つ。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rensemble_core::{EnsembleError, ResourceGuard, Result};
use sysinfo::{Pid, ProcessesToUpdate, System};

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// プロセスの常駐メモリ量を測る
pub trait MemoryProbe: Send + Sync {
    /// MB 単位。測れなければ `None`
    fn resident_mb(&self) -> Option<u64>;
}

/// sysinfo で自プロセスの RSS を読む
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("Could not determine own pid; memory limit will not be enforced");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_mb(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory() / (1024 * 1024))
    }
}

/// 1反復分の資源制限
pub struct IterationContext {
    deadline: Instant,
    memory_limit_mb: Option<u64>,
    probe: Arc<dyn MemoryProbe>,
    cancelled: AtomicBool,
}

impl IterationContext {
    pub fn new(wall_time: Duration, memory_limit_mb: Option<u64>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            deadline: Instant::now() + wall_time,
            memory_limit_mb,
            probe,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn memory_violation(&self) -> Option<EnsembleError> {
        let limit = self.memory_limit_mb?;
        let used = self.probe.resident_mb()?;
        (used > limit).then_some(EnsembleError::MemoryLimitExceeded {
            used_mb: used,
            limit_mb: limit,
        })
    }
}

impl ResourceGuard for IterationContext {
    fn check(&self) -> Result<()> {
        if self.is_cancelled() || Instant::now() >= self.deadline {
            return Err(EnsembleError::DeadlineExceeded);
        }
        match self.memory_violation() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// サンドボックスの結果。スケジューラはこの3種類だけを区別する
#[derive(Debug)]
pub enum SandboxOutcome<T> {
    Finished(Result<T>),
    TimedOut,
    MemoryExceeded,
}

/// スレッドで反復本体を動かすサンドボックス
pub struct ThreadSandbox {
    probe: Arc<dyn MemoryProbe>,
    memory_limit_mb: Option<u64>,
}

impl ThreadSandbox {
    pub fn new(memory_limit_mb: Option<u64>) -> Self {
        Self::with_probe(memory_limit_mb, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(memory_limit_mb: Option<u64>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            memory_limit_mb,
        }
    }

    /// `body` を `wall_time` 以内で実行する
    pub fn run<T, F>(&self, wall_time: Duration, body: F) -> SandboxOutcome<T>
    where
        T: Send,
        F: FnOnce(&IterationContext) -> Result<T> + Send,
    {
        let ctx = IterationContext::new(wall_time, self.memory_limit_mb, Arc::clone(&self.probe));
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            let ctx_ref = &ctx;
            let spawned = thread::Builder::new()
                .name("ensemble-iteration".to_string())
                .spawn_scoped(scope, move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| body(ctx_ref)));
                    let _ = tx.send(result);
                });
            if let Err(e) = spawned {
                return SandboxOutcome::Finished(Err(EnsembleError::Internal(format!(
                    "failed to spawn iteration thread: {e}"
                ))));
            }

            // 監視ループ。ここで立てた理由を優先して結果を解釈する
            let mut tripped: Option<SandboxOutcome<T>> = None;
            let received = loop {
                match rx.recv_timeout(WATCH_INTERVAL) {
                    Ok(result) => break Some(result),
                    Err(RecvTimeoutError::Disconnected) => break None,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                if tripped.is_some() {
                    continue;
                }
                if Instant::now() >= ctx.deadline() {
                    warn!("Iteration exceeded its wall time of {:.1}s; cancelling", wall_time.as_secs_f64());
                    tripped = Some(SandboxOutcome::TimedOut);
                    ctx.cancel();
                } else if let Some(e) = ctx.memory_violation() {
                    warn!("{e}; cancelling iteration");
                    tripped = Some(SandboxOutcome::MemoryExceeded);
                    ctx.cancel();
                }
            };

            // 止める前に本体が完了していたら、その結果（保存済み）を優先する
            if let (Some(outcome), Some(Ok(Ok(_)))) = (&tripped, &received) {
                let reason = if matches!(outcome, SandboxOutcome::MemoryExceeded) { "memory limit" } else { "timeout" };
                warn!("Iteration finished successfully after the {reason} was flagged; keeping its result");
            } else if let Some(outcome) = tripped {
                return outcome;
            }
            match received {
                Some(Ok(Ok(value))) => SandboxOutcome::Finished(Ok(value)),
                Some(Ok(Err(EnsembleError::MemoryLimitExceeded { used_mb, limit_mb }))) => {
                    debug!("Iteration stopped at {used_mb} MB (limit {limit_mb} MB)");
                    SandboxOutcome::MemoryExceeded
                }
                Some(Ok(Err(EnsembleError::DeadlineExceeded))) => SandboxOutcome::TimedOut,
                Some(Ok(Err(e))) => SandboxOutcome::Finished(Err(e)),
                Some(Err(panic)) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    SandboxOutcome::Finished(Err(EnsembleError::Internal(format!(
                        "iteration panicked: {msg}"
                    ))))
                }
                None => SandboxOutcome::Finished(Err(EnsembleError::Internal(
                    "iteration thread exited without a result".to_string(),
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// 任意の値を返すプローブ
    struct FixedProbe(AtomicU64);

    impl MemoryProbe for FixedProbe {
        fn resident_mb(&self) -> Option<u64> {
            Some(self.0.load(Ordering::Relaxed))
        }
    }

    fn sandbox(limit: Option<u64>, used: u64) -> ThreadSandbox {
        ThreadSandbox::with_probe(limit, Arc::new(FixedProbe(AtomicU64::new(used))))
    }

    #[test]
    fn test_finished() {
        let out = sandbox(Some(100), 10).run(Duration::from_secs(5), |ctx| {
            ctx.check()?;
            Ok(42)
        });
        assert!(matches!(out, SandboxOutcome::Finished(Ok(42))));
    }

    #[test]
    fn test_error_is_passed_through() {
        let out: SandboxOutcome<()> = sandbox(None, 0)
            .run(Duration::from_secs(5), |_| Err(EnsembleError::Numerical("nan".to_string())));
        assert!(matches!(out, SandboxOutcome::Finished(Err(EnsembleError::Numerical(_)))));
    }

    #[test]
    fn test_timeout_cancels_cooperative_body() {
        let out: SandboxOutcome<()> = sandbox(None, 0).run(Duration::from_millis(150), |ctx| loop {
            ctx.check()?;
            thread::sleep(Duration::from_millis(10));
        });
        assert!(matches!(out, SandboxOutcome::TimedOut));
    }

    #[test]
    fn test_completed_body_wins_over_late_trip() {
        // キャンセルを見ずに締め切り後まで走り切る本体
        let out = sandbox(None, 0).run(Duration::from_millis(50), |_| {
            thread::sleep(Duration::from_millis(300));
            Ok(7)
        });
        assert!(matches!(out, SandboxOutcome::Finished(Ok(7))));
    }

    #[test]
    fn test_memory_limit_reported() {
        let out: SandboxOutcome<()> = sandbox(Some(100), 500).run(Duration::from_secs(5), |ctx| {
            ctx.check()?;
            Ok(())
        });
        assert!(matches!(out, SandboxOutcome::MemoryExceeded));
    }

    #[test]
    fn test_panic_is_internal_error() {
        let out: SandboxOutcome<()> = sandbox(None, 0).run(Duration::from_secs(5), |_| panic!("boom"));
        match out {
            SandboxOutcome::Finished(Err(EnsembleError::Internal(msg))) => assert!(msg.contains("boom")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_sysinfo_probe_reads_something() {
        let probe = SysinfoProbe::new();
        // CI 環境によっては測れないこともあるので値の存在だけ緩く確認
        if let Some(mb) = probe.resident_mb() {
            assert!(mb < 1 << 30);
        }
    }
}
