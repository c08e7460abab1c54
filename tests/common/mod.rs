#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tradesim::{
    SimulationDriver, SimulationParams, Strategy, TradesimResult,
    assets::{Asset, AssetRepository, Sid},
    calendar::TradingCalendar,
    data::{
        AdjustmentRepository, Bar, BarData, BarStore, BundleData, Frequency,
    },
    finance::{NoSlippage, PerShare},
    metrics::packet::{DailyPerf, PerfPacket, RiskReport},
    sim::Context,
};

pub const CAPITAL: f64 = 100_000.0;

pub fn jan(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, day).unwrap()
}

pub fn xnys_january() -> TradingCalendar {
    TradingCalendar::from_name("XNYS", jan(1), jan(31)).unwrap()
}

// ================================================================================================
// Bundle Fixtures
// ================================================================================================

/// One synthetic equity for a daily-bar fixture bundle.
pub struct EquityFixture {
    pub sid: u64,
    pub symbol: &'static str,
    /// Per-session closes; volume is constant and deep.
    pub closes: Vec<(NaiveDate, f64)>,
    pub auto_close: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl EquityFixture {
    pub fn new(sid: u64, symbol: &'static str, closes: Vec<(NaiveDate, f64)>) -> Self {
        Self {
            sid,
            symbol,
            closes,
            auto_close: None,
            end_date: None,
        }
    }
}

pub fn daily_bundle(
    equities: Vec<EquityFixture>,
    adjustments: AdjustmentRepository,
) -> Arc<BundleData> {
    let calendar = xnys_january();
    let mut assets = AssetRepository::new();
    let mut bars = BarStore::new(Frequency::DAILY);

    for fixture in &equities {
        let start = calendar.session_midnight(jan(1));
        let end = fixture
            .end_date
            .map(|d| calendar.session_midnight(d) + chrono::Duration::hours(23))
            .unwrap_or_else(|| calendar.session_midnight(jan(31)) + chrono::Duration::days(365));
        let mut asset = Asset::equity(Sid(fixture.sid), fixture.symbol, "XNYS", start, end);
        if let Some(acd) = fixture.auto_close {
            asset = asset.with_auto_close_date(calendar.session_midnight(acd));
        }
        assets.insert(asset).unwrap();

        for &(session, close) in &fixture.closes {
            let dt = calendar.session_close(session).unwrap();
            bars.push_bar(
                Sid(fixture.sid),
                Bar {
                    dt,
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1_000_000.0,
                },
            )
            .unwrap();
        }
    }

    Arc::new(BundleData::new(
        "fixture",
        "v1",
        calendar,
        bars,
        assets,
        adjustments,
    ))
}

/// A minute-bar bundle with explicit bars for one asset.
pub fn minute_bundle(sid: u64, bars_spec: Vec<(DateTime<Utc>, f64, f64)>) -> Arc<BundleData> {
    let calendar = xnys_january();
    let mut assets = AssetRepository::new();
    assets
        .insert(Asset::equity(
            Sid(sid),
            "MIN",
            "XNYS",
            calendar.session_midnight(jan(1)),
            calendar.session_midnight(jan(31)) + chrono::Duration::days(365),
        ))
        .unwrap();

    let mut bars = BarStore::new(Frequency::MINUTE);
    for (dt, close, volume) in bars_spec {
        bars.push_bar(
            Sid(sid),
            Bar {
                dt,
                open: close,
                high: close,
                low: close,
                close,
                volume,
            },
        )
        .unwrap();
    }

    Arc::new(BundleData::new(
        "fixture-minute",
        "v1",
        calendar,
        bars,
        assets,
        AdjustmentRepository::new(),
    ))
}

// ================================================================================================
// Scripted Strategy
// ================================================================================================

type InitFn = Box<dyn FnMut(&mut Context<'_>) -> TradesimResult<()>>;
type BarFn = Box<dyn FnMut(&mut Context<'_>, &BarData<'_>, usize) -> TradesimResult<()>>;

/// Closure-driven strategy for scenario tests. The bar callback receives a
/// running bar index so scripts can act on "the first bar" etc.
pub struct ScriptedStrategy {
    on_init: Option<InitFn>,
    on_bar: BarFn,
    bars_seen: usize,
}

impl ScriptedStrategy {
    pub fn new(on_bar: BarFn) -> Self {
        Self {
            on_init: None,
            on_bar,
            bars_seen: 0,
        }
    }

    pub fn with_init(mut self, on_init: InitFn) -> Self {
        self.on_init = Some(on_init);
        self
    }

    /// A strategy with frictionless execution (no slippage, no commission)
    /// that runs `on_bar` once per bar.
    pub fn frictionless(on_bar: BarFn) -> Self {
        Self::new(on_bar).with_init(Box::new(|ctx| {
            ctx.set_slippage(Some(Box::new(NoSlippage)), None)?;
            ctx.set_commission(
                Some(Box::new(PerShare {
                    cost_per_share: 0.0,
                    min_trade_cost: 0.0,
                })),
                None,
            )?;
            Ok(())
        }))
    }
}

impl Strategy for ScriptedStrategy {
    fn initialize(&mut self, ctx: &mut Context<'_>) -> TradesimResult<()> {
        match &mut self.on_init {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }

    fn handle_data(&mut self, ctx: &mut Context<'_>, data: &BarData<'_>) -> TradesimResult<()> {
        let ix = self.bars_seen;
        self.bars_seen += 1;
        (self.on_bar)(ctx, data, ix)
    }
}

/// A strategy that never trades.
#[derive(Debug)]
pub struct Idle;

impl Strategy for Idle {
    fn handle_data(&mut self, _ctx: &mut Context<'_>, _data: &BarData<'_>) -> TradesimResult<()> {
        Ok(())
    }
}

// ================================================================================================
// Runner
// ================================================================================================

/// Drive a full simulation and collect every emitted packet.
pub fn run_packets<S: Strategy>(
    strategy: S,
    bundle: Arc<BundleData>,
    params: SimulationParams,
) -> anyhow::Result<Vec<PerfPacket>> {
    let driver = SimulationDriver::new(strategy, bundle, params)?;
    let mut packets = Vec::new();
    for item in driver {
        packets.push(item?);
    }
    Ok(packets)
}

pub fn daily_packets(packets: &[PerfPacket]) -> Vec<&DailyPerf> {
    packets
        .iter()
        .filter_map(|p| match p {
            PerfPacket::Daily(daily) => Some(daily),
            _ => None,
        })
        .collect()
}

pub fn risk_report(packets: &[PerfPacket]) -> &RiskReport {
    packets
        .iter()
        .find_map(|p| match p {
            PerfPacket::Risk(report) => Some(report),
            _ => None,
        })
        .expect("every run emits a risk report")
}
