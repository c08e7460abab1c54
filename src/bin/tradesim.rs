use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use tradesim::{
    SimulationDriver, SimulationParams, Strategy, TradesimError, TradesimResult,
    assets::{Asset, AssetRepository, Sid},
    calendar::TradingCalendar,
    data::{
        AdjustmentRepository, Bar, BarStore, BundleData, BundleRegistry, CleanCriteria, Frequency,
    },
    error::ConfigurationError,
    finance::ExecutionStyle,
    metrics::packet::PerfPacket,
    sim::Context,
};

#[derive(Parser)]
#[command(
    name = "tradesim",
    about = "Deterministic backtesting simulation core",
    version
)]
struct Cli {
    /// Root directory for ingested bundles.
    #[arg(long, default_value = "~/.tradesim/bundles", global = true)]
    root: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a synthetic demo bundle over a date range.
    Ingest {
        #[arg(long)]
        bundle: String,
        #[arg(long, default_value = "2023-01-01")]
        start: NaiveDate,
        #[arg(long, default_value = "2023-12-31")]
        end: NaiveDate,
        /// Stored bar frequency, e.g. `1day` or `1m`.
        #[arg(long, default_value = "1day")]
        frequency: String,
    },
    /// List ingested bundles and their versions.
    Bundles,
    /// Remove bundle versions.
    Clean {
        #[arg(long)]
        bundle: String,
        #[arg(long, conflicts_with_all = ["after", "keep_last"])]
        before: Option<NaiveDate>,
        #[arg(long, conflicts_with = "keep_last")]
        after: Option<NaiveDate>,
        #[arg(long)]
        keep_last: Option<usize>,
    },
    /// Run a strategy over an ingested bundle.
    Run {
        /// Strategy file; this build resolves the file stem against the
        /// built-in strategy registry (`buy_and_hold`, `noop`).
        #[arg(long)]
        algofile: PathBuf,
        #[arg(long)]
        bundle: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value_t = 100_000.0)]
        capital_base: f64,
    },
}

// ================================================================================================
// Built-in Strategies
// ================================================================================================

/// Buys the first listed asset with roughly the whole portfolio on the first
/// bar, then holds.
#[derive(Debug, Default)]
struct BuyAndHold {
    invested: bool,
}

impl Strategy for BuyAndHold {
    fn handle_data(
        &mut self,
        ctx: &mut Context<'_>,
        data: &tradesim::data::BarData<'_>,
    ) -> TradesimResult<()> {
        if self.invested {
            return Ok(());
        }
        let Some(sid) = first_tradable_sid(ctx, data) else {
            return Ok(());
        };
        ctx.order_target_percent(sid, 0.95, ExecutionStyle::Market)?;
        ctx.record("invested", 1.0);
        self.invested = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Noop;

impl Strategy for Noop {
    fn handle_data(
        &mut self,
        _ctx: &mut Context<'_>,
        _data: &tradesim::data::BarData<'_>,
    ) -> TradesimResult<()> {
        Ok(())
    }
}

fn first_tradable_sid(ctx: &Context<'_>, data: &tradesim::data::BarData<'_>) -> Option<Sid> {
    (1..=16)
        .map(Sid)
        .find(|&sid| ctx.sid(sid.0).is_ok() && data.can_trade(sid))
}

fn resolve_strategy(algofile: &PathBuf) -> Result<Box<dyn Strategy>, String> {
    let stem = algofile
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    match stem {
        "buy_and_hold" => Ok(Box::new(BuyAndHold::default())),
        "noop" => Ok(Box::new(Noop)),
        other => Err(format!(
            "unknown strategy '{other}'; this build embeds no script runtime \
             (available: buy_and_hold, noop)"
        )),
    }
}

// ================================================================================================
// Synthetic Ingestion
// ================================================================================================

/// A deterministic price path: a slow trend plus two superimposed waves.
/// Good enough to exercise every simulation path without external data.
fn synthetic_close(sid: u64, step: usize) -> f64 {
    let base = 50.0 + 25.0 * sid as f64;
    let t = step as f64;
    base * (1.0 + 0.0004 * t + 0.02 * (t / 17.0).sin() + 0.01 * (t / 5.0).cos())
}

fn build_synthetic_bundle(
    name: &str,
    version: &str,
    start: NaiveDate,
    end: NaiveDate,
    frequency: Frequency,
) -> TradesimResult<BundleData> {
    let calendar = TradingCalendar::from_name("XNYS", start, end)?;
    let first = calendar.first_session()?;
    let last = calendar.last_session()?;

    let mut assets = AssetRepository::new();
    let mut bars = BarStore::new(frequency);
    for sid in 1..=3u64 {
        assets.insert(Asset::equity(
            Sid(sid),
            format!("SYN{sid}"),
            "XNYS",
            calendar.session_midnight(first),
            calendar.session_midnight(last) + chrono::Duration::days(365),
        ))?;

        let mut step = 0usize;
        for &session in calendar.sessions() {
            let timestamps = if frequency.is_daily() {
                vec![calendar.session_close(session)?]
            } else {
                calendar.session_minutes(session)?
            };
            for dt in timestamps {
                let close = synthetic_close(sid, step);
                let open = synthetic_close(sid, step.saturating_sub(1));
                bars.push_bar(
                    Sid(sid),
                    Bar {
                        dt,
                        open,
                        high: open.max(close) * 1.001,
                        low: open.min(close) * 0.999,
                        close,
                        volume: 1_000_000.0,
                    },
                )?;
                step += 1;
            }
        }
    }

    Ok(BundleData::new(
        name,
        version,
        calendar,
        bars,
        assets,
        AdjustmentRepository::new(),
    ))
}

// ================================================================================================
// Command Handlers
// ================================================================================================

fn registry(root: &str) -> BundleRegistry {
    let expanded = if let Some(rest) = root.strip_prefix("~/") {
        std::env::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(root))
    } else {
        PathBuf::from(root)
    };
    BundleRegistry::new(expanded)
}

async fn cmd_ingest(
    root: &str,
    bundle: String,
    start: NaiveDate,
    end: NaiveDate,
    frequency: String,
) -> TradesimResult<()> {
    let frequency = Frequency::parse(&frequency)?;
    let now = chrono::Utc::now();
    let version = now.format("%Y%m%dT%H%M%S").to_string();
    let data = build_synthetic_bundle(&bundle, &version, start, end, frequency)?;
    registry(root).write_bundle(&data, now).await?;
    println!("ingested bundle '{bundle}' version {version}");
    Ok(())
}

async fn cmd_bundles(root: &str) -> TradesimResult<()> {
    let registry = registry(root);
    let names = registry.bundles().await?;
    if names.is_empty() {
        println!("no bundles ingested under {}", registry.root().display());
        return Ok(());
    }
    for name in names {
        let versions = registry.versions(&name).await?;
        println!("{name}: {}", versions.join(", "));
    }
    Ok(())
}

async fn cmd_clean(
    root: &str,
    bundle: String,
    before: Option<NaiveDate>,
    after: Option<NaiveDate>,
    keep_last: Option<usize>,
) -> TradesimResult<()> {
    let criteria = match (before, after, keep_last) {
        (Some(date), None, None) => CleanCriteria::Before(date),
        (None, Some(date), None) => CleanCriteria::After(date),
        (None, None, Some(n)) => CleanCriteria::KeepLast(n),
        _ => {
            return Err(ConfigurationError::InvalidArguments(
                "clean requires exactly one of --before, --after, --keep-last".to_string(),
            )
            .into());
        }
    };
    let removed = registry(root).clean(&bundle, criteria).await?;
    println!("removed {} version(s) of '{bundle}'", removed.len());
    Ok(())
}

async fn cmd_run(
    root: &str,
    algofile: PathBuf,
    bundle: String,
    start: NaiveDate,
    end: NaiveDate,
    capital_base: f64,
) -> TradesimResult<()> {
    let strategy = resolve_strategy(&algofile)
        .map_err(|message| TradesimError::Configuration(ConfigurationError::UnknownStrategy(message)))?;
    let data = Arc::new(registry(root).load_bundle(&bundle, None).await?);
    let params = SimulationParams::new(start, end, capital_base)?
        .with_bar_frequency(data.frequency())
        .with_emission_rate(Frequency::DAILY);

    let mut driver = SimulationDriver::new(strategy, Arc::clone(&data), params)?;
    let bar = ProgressBar::new(driver.sessions().len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar.set_message("simulating...");

    let mut daily = Vec::new();
    let mut risk = None;
    let mut fatal = None;
    for item in driver.by_ref() {
        match item {
            Ok(PerfPacket::Daily(packet)) => {
                daily.push(packet);
                bar.inc(1);
            }
            Ok(PerfPacket::Minute(_)) => {}
            Ok(PerfPacket::Risk(report)) => risk = Some(report),
            Err(err) => fatal = Some(err),
        }
    }
    bar.finish_with_message("done");

    let frame = tradesim::report::daily_perf_frame(&daily)?;
    println!("{frame}");
    if let Some(report) = risk {
        println!(
            "period {}..{}: return {:.4}, sharpe {:.3}, max drawdown {:.4}",
            report.start_session,
            report.end_session,
            report.cumulative.algorithm_period_return,
            report.cumulative.sharpe,
            report.cumulative.max_drawdown,
        );
    }
    if let Some(err) = fatal {
        return Err(err);
    }
    Ok(())
}

// ================================================================================================
// Entry Point
// ================================================================================================

fn exit_code_for(err: &TradesimError) -> ExitCode {
    match err {
        TradesimError::Io(_) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Ingest {
            bundle,
            start,
            end,
            frequency,
        } => cmd_ingest(&cli.root, bundle, start, end, frequency).await,
        Command::Bundles => cmd_bundles(&cli.root).await,
        Command::Clean {
            bundle,
            before,
            after,
            keep_last,
        } => cmd_clean(&cli.root, bundle, before, after, keep_last).await,
        Command::Run {
            algofile,
            bundle,
            start,
            end,
            capital_base,
        } => cmd_run(&cli.root, algofile, bundle, start, end, capital_base).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}
