//! アンサンブルビルダー
//!
//! `--root` 以下の予測ファイルを一定間隔で確認し、時間予算が尽きるか
//! 反復数の上限に達するまでアンサンブルを更新し続ける。

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use rensemble_builder::{
    BuilderConfig, EnsembleBuilder, Event, IterationOutcome, IterationReport, Scheduler, ThreadSandbox,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "予測ファイルからアンサンブルを逐次構築する")]
struct Cli {
    /// 予測ファイルと正解ラベルを置くディレクトリ
    #[arg(long)]
    root: PathBuf,

    /// 設定ファイル（TOML）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 対象とする seed
    #[arg(long)]
    seed: Option<u64>,

    /// アンサンブルのメンバー数
    #[arg(long)]
    ensemble_size: Option<usize>,

    /// 全体の時間予算（秒）
    #[arg(long)]
    time_budget_secs: Option<f64>,

    /// 反復数の上限
    #[arg(long)]
    max_iterations: Option<u64>,

    /// メモリ上限（MB、0 で無制限）
    #[arg(long)]
    memory_limit_mb: Option<u64>,

    /// 損失関数（rmse, mse, mae）
    #[arg(long)]
    loss: Option<String>,

    /// 反復の間隔（ミリ秒）
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
}

fn load_config(cli: &Cli) -> Result<BuilderConfig> {
    let mut config = match &cli.config {
        Some(path) => BuilderConfig::from_file(path)?,
        None => BuilderConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(size) = cli.ensemble_size {
        config.ensemble_size = size;
    }
    if let Some(secs) = cli.time_budget_secs {
        config.time_budget_secs = secs;
    }
    if let Some(max) = cli.max_iterations {
        config.max_iterations = Some(max);
    }
    if let Some(mb) = cli.memory_limit_mb {
        config.memory_limit_mb = (mb > 0).then_some(mb);
    }
    if let Some(loss) = &cli.loss {
        config.loss = loss.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    if !cli.root.is_dir() {
        bail!("root directory not found: {}", cli.root.display());
    }
    let config = load_config(&cli)?;
    info!(
        "Building ensembles in {} (seed={}, size={}, budget={}s)",
        cli.root.display(),
        config.seed,
        config.ensemble_size,
        config.time_budget_secs
    );

    let sandbox = ThreadSandbox::new(config.memory_limit_mb);
    let builder = EnsembleBuilder::open(&cli.root, config).context("failed to open ensemble builder")?;
    let mut scheduler = Scheduler::new(builder, sandbox);
    let poll = Duration::from_millis(cli.poll_interval_ms);

    let mut built = 0u64;
    loop {
        let report = scheduler
            .handle(Event::RunFinished { time_left: None })
            .context("ensemble building aborted")?;
        match report {
            IterationReport::Terminated(reason) => {
                info!("Finished after {} iteration(s): {reason:?}", scheduler.iterations());
                break;
            }
            IterationReport::Completed(IterationOutcome::Built(_)) => built += 1,
            _ => {}
        }
        thread::sleep(poll);
    }

    let state = scheduler.builder().state();
    info!(
        "Built {built} ensemble(s) this run, {} in total; best train loss {}",
        state.iteration, state.validation_performance_so_far
    );
    Ok(())
}
