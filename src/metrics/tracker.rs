use chrono::{DateTime, Utc};

use crate::{
    assets::Asset,
    calendar::Session,
    data::{BundleData, Split},
    error::TradesimResult,
    finance::{
        ledger::Ledger,
        order::{Order, Transaction},
    },
    metrics::{
        benchmark::BenchmarkSource,
        packet::{CumulativeRiskMetrics, DailyPerf, MinutePerf, PositionSnapshot, RiskReport},
        risk,
    },
};

// ================================================================================================
// Metric Trait
// ================================================================================================

/// A metric object with lifecycle hooks. Each hook may read the ledger and
/// write its fields of the typed packet being assembled.
pub trait Metric: std::fmt::Debug + Send {
    fn start_of_simulation(
        &mut self,
        _ledger: &mut Ledger,
        _sessions: &[Session],
        _benchmark: &BenchmarkSource,
    ) {
    }

    fn start_of_session(&mut self, _ledger: &mut Ledger, _session: Session) {}

    fn end_of_bar(
        &mut self,
        _packet: &mut MinutePerf,
        _ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
    }

    fn end_of_session(
        &mut self,
        _packet: &mut DailyPerf,
        _ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
    }

    fn end_of_simulation(
        &mut self,
        _report: &mut RiskReport,
        _ledger: &mut Ledger,
        _sessions: &[Session],
        _benchmark: &BenchmarkSource,
    ) {
    }
}

/// The standard metric set covering every field of the performance packets.
pub fn standard_metrics() -> Vec<Box<dyn Metric>> {
    vec![
        Box::new(SessionBookkeeping::default()),
        Box::new(Returns),
        Box::new(PositionJournal),
        Box::new(TransactionJournal),
        Box::new(OrderJournal),
        Box::new(NumTradingDays::default()),
        Box::new(CumulativeRisk),
    ]
}

// ================================================================================================
// Standard Metrics
// ================================================================================================

/// Start-of-session snapshots and the end-of-session ledger fields: cash,
/// value, exposure, leverage, counts and the session's pnl/cash flow deltas.
#[derive(Debug, Default)]
struct SessionBookkeeping {
    starting_cash: f64,
    starting_value: f64,
    starting_exposure: f64,
    pnl_at_start: f64,
    cash_flow_at_start: f64,
}

impl Metric for SessionBookkeeping {
    fn start_of_session(&mut self, ledger: &mut Ledger, _session: Session) {
        let portfolio = ledger.portfolio();
        self.starting_cash = portfolio.cash;
        self.starting_value = portfolio.portfolio_value;
        self.starting_exposure = portfolio.positions_exposure;
        self.pnl_at_start = portfolio.pnl;
        self.cash_flow_at_start = portfolio.cash_flow;
    }

    fn end_of_bar(
        &mut self,
        packet: &mut MinutePerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        let pnl_at_start = self.pnl_at_start;
        let portfolio = ledger.portfolio();
        packet.portfolio_value = portfolio.portfolio_value;
        packet.pnl = portfolio.pnl - pnl_at_start;
    }

    fn end_of_session(
        &mut self,
        packet: &mut DailyPerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        let stats = ledger.position_stats();
        let (portfolio_value, gross_leverage, net_leverage) = ledger.calculate_period_stats();
        let portfolio = ledger.portfolio();

        packet.portfolio_value = portfolio_value;
        packet.pnl = portfolio.pnl - self.pnl_at_start;
        packet.cash_flow = portfolio.cash_flow - self.cash_flow_at_start;
        packet.starting_cash = self.starting_cash;
        packet.starting_value = self.starting_value;
        packet.starting_exposure = self.starting_exposure;
        packet.ending_cash = portfolio.cash;
        packet.ending_value = portfolio.portfolio_value;
        packet.ending_exposure = portfolio.positions_exposure;
        packet.longs_count = stats.longs_count;
        packet.shorts_count = stats.shorts_count;
        packet.long_value = stats.long_value;
        packet.short_value = stats.short_value;
        packet.gross_leverage = gross_leverage;
        packet.net_leverage = net_leverage;
    }
}

/// The day's returns so far.
#[derive(Debug)]
struct Returns;

impl Metric for Returns {
    fn end_of_bar(
        &mut self,
        packet: &mut MinutePerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.returns = ledger.todays_returns();
    }

    fn end_of_session(
        &mut self,
        packet: &mut DailyPerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.returns = ledger.todays_returns();
    }
}

#[derive(Debug)]
struct PositionJournal;

impl PositionJournal {
    fn snapshots(ledger: &Ledger) -> Vec<PositionSnapshot> {
        ledger
            .position_tracker()
            .positions()
            .values()
            .map(PositionSnapshot::from)
            .collect()
    }
}

impl Metric for PositionJournal {
    fn end_of_bar(
        &mut self,
        packet: &mut MinutePerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.positions = Self::snapshots(ledger);
    }

    fn end_of_session(
        &mut self,
        packet: &mut DailyPerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.positions = Self::snapshots(ledger);
    }
}

#[derive(Debug)]
struct TransactionJournal;

impl Metric for TransactionJournal {
    fn end_of_bar(
        &mut self,
        packet: &mut MinutePerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.transactions = ledger.transactions(Some(packet.period_close));
    }

    fn end_of_session(
        &mut self,
        packet: &mut DailyPerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.transactions = ledger.transactions(None);
    }
}

#[derive(Debug)]
struct OrderJournal;

impl Metric for OrderJournal {
    fn end_of_bar(
        &mut self,
        packet: &mut MinutePerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.orders = ledger
            .orders()
            .iter()
            .filter(|o| o.dt == packet.period_close)
            .cloned()
            .collect();
    }

    fn end_of_session(
        &mut self,
        packet: &mut DailyPerf,
        ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.orders = ledger.orders().to_vec();
    }
}

/// Report the number of trading days.
#[derive(Debug, Default)]
struct NumTradingDays {
    num_trading_days: usize,
}

impl Metric for NumTradingDays {
    fn start_of_simulation(
        &mut self,
        _ledger: &mut Ledger,
        _sessions: &[Session],
        _benchmark: &BenchmarkSource,
    ) {
        self.num_trading_days = 0;
    }

    fn start_of_session(&mut self, _ledger: &mut Ledger, _session: Session) {
        self.num_trading_days += 1;
    }

    fn end_of_bar(
        &mut self,
        packet: &mut MinutePerf,
        _ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.cumulative_risk_metrics.trading_days = self.num_trading_days;
    }

    fn end_of_session(
        &mut self,
        packet: &mut DailyPerf,
        _ledger: &mut Ledger,
        _session_ix: usize,
        _benchmark: &BenchmarkSource,
    ) {
        packet.cumulative_risk_metrics.trading_days = self.num_trading_days;
    }

    fn end_of_simulation(
        &mut self,
        report: &mut RiskReport,
        _ledger: &mut Ledger,
        _sessions: &[Session],
        _benchmark: &BenchmarkSource,
    ) {
        report.cumulative.trading_days = self.num_trading_days;
    }
}

/// Alpha, beta, Sharpe, Sortino, drawdown and volatilities computed
/// cumulatively from the daily returns array.
#[derive(Debug)]
struct CumulativeRisk;

impl CumulativeRisk {
    fn compute(
        ledger: &mut Ledger,
        benchmark: &BenchmarkSource,
        through_session: usize,
        into: &mut CumulativeRiskMetrics,
    ) {
        let algo: Vec<f64> = ledger
            .daily_returns()
            .iter()
            .take(through_session + 1)
            .copied()
            .collect();
        let bench = benchmark.daily_returns_through(through_session);

        into.algorithm_period_return = risk::cumulative_return(&algo);
        into.benchmark_period_return = risk::cumulative_return(bench);
        into.excess_return = into.algorithm_period_return - into.benchmark_period_return;
        into.algo_volatility = risk::annual_volatility(&algo);
        into.benchmark_volatility = risk::annual_volatility(bench);
        into.sharpe = risk::sharpe_ratio(&algo);
        into.sortino = risk::sortino_ratio(&algo);
        into.max_drawdown = risk::max_drawdown(&algo);
        let (alpha, beta) = risk::alpha_beta(&algo, bench);
        into.alpha = alpha;
        into.beta = beta;
    }
}

impl Metric for CumulativeRisk {
    fn end_of_bar(
        &mut self,
        packet: &mut MinutePerf,
        ledger: &mut Ledger,
        session_ix: usize,
        benchmark: &BenchmarkSource,
    ) {
        let trading_days = packet.cumulative_risk_metrics.trading_days;
        Self::compute(
            ledger,
            benchmark,
            session_ix,
            &mut packet.cumulative_risk_metrics,
        );
        packet.cumulative_risk_metrics.trading_days = trading_days;
    }

    fn end_of_session(
        &mut self,
        packet: &mut DailyPerf,
        ledger: &mut Ledger,
        session_ix: usize,
        benchmark: &BenchmarkSource,
    ) {
        let trading_days = packet.cumulative_risk_metrics.trading_days;
        Self::compute(
            ledger,
            benchmark,
            session_ix,
            &mut packet.cumulative_risk_metrics,
        );
        packet.cumulative_risk_metrics.trading_days = trading_days;
    }

    fn end_of_simulation(
        &mut self,
        report: &mut RiskReport,
        ledger: &mut Ledger,
        sessions: &[Session],
        benchmark: &BenchmarkSource,
    ) {
        let trading_days = report.cumulative.trading_days;
        if !sessions.is_empty() {
            Self::compute(ledger, benchmark, sessions.len() - 1, &mut report.cumulative);
        }
        report.cumulative.trading_days = trading_days;
    }
}

// ================================================================================================
// Metrics Tracker
// ================================================================================================

/// Owns the ledger and the metric set; assembles and emits the performance
/// packets at every emission boundary.
#[derive(Debug)]
pub struct MetricsTracker {
    ledger: Ledger,
    metrics: Vec<Box<dyn Metric>>,
    benchmark: BenchmarkSource,
    sessions: Vec<Session>,
}

impl MetricsTracker {
    pub fn new(
        ledger: Ledger,
        metrics: Vec<Box<dyn Metric>>,
        benchmark: BenchmarkSource,
        sessions: Vec<Session>,
    ) -> Self {
        Self {
            ledger,
            metrics,
            benchmark,
            sessions,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn benchmark(&self) -> &BenchmarkSource {
        &self.benchmark
    }

    pub fn start_of_simulation(&mut self) {
        for metric in &mut self.metrics {
            metric.start_of_simulation(&mut self.ledger, &self.sessions, &self.benchmark);
        }
    }

    /// Session rollover: ledger journal reset, dividend accrual and payout,
    /// then the metric hooks (whose snapshots therefore include dividend
    /// cash).
    pub fn handle_market_open(&mut self, session: Session, bundle: &BundleData) -> TradesimResult<()> {
        self.ledger.start_of_session();
        self.ledger.process_dividends(session, bundle)?;
        for metric in &mut self.metrics {
            metric.start_of_session(&mut self.ledger, session);
        }
        Ok(())
    }

    /// Assemble the per-emission-period packet.
    pub fn handle_minute_close(
        &mut self,
        dt: DateTime<Utc>,
        period_open: DateTime<Utc>,
        session_ix: usize,
    ) -> MinutePerf {
        self.ledger.end_of_bar(session_ix);
        let mut packet = MinutePerf::new(period_open, dt);
        for metric in &mut self.metrics {
            metric.end_of_bar(&mut packet, &mut self.ledger, session_ix, &self.benchmark);
        }
        packet
    }

    /// Assemble the session packet.
    pub fn handle_market_close(
        &mut self,
        dt: DateTime<Utc>,
        period_open: DateTime<Utc>,
        session_ix: usize,
    ) -> DailyPerf {
        self.ledger.end_of_session(session_ix);
        let mut packet = DailyPerf::new(period_open, dt);
        for metric in &mut self.metrics {
            metric.end_of_session(&mut packet, &mut self.ledger, session_ix, &self.benchmark);
        }
        packet
    }

    /// Assemble the final risk report. Valid mid-run too: a cancelled
    /// simulation reports everything up to the last finished session.
    pub fn handle_simulation_end(&mut self) -> RiskReport {
        let start_session = self.sessions.first().copied().unwrap_or(chrono::NaiveDate::MIN);
        let end_session = self.sessions.last().copied().unwrap_or(chrono::NaiveDate::MIN);
        let mut report = RiskReport {
            start_session,
            end_session,
            cumulative: CumulativeRiskMetrics::default(),
        };
        for metric in &mut self.metrics {
            metric.end_of_simulation(
                &mut report,
                &mut self.ledger,
                &self.sessions,
                &self.benchmark,
            );
        }
        report
    }

    // --------------------------------------------------------------------------------------------
    // Ledger passthroughs
    // --------------------------------------------------------------------------------------------

    pub fn process_transaction(&mut self, asset: &Asset, txn: &Transaction) {
        self.ledger.process_transaction(asset, txn);
    }

    pub fn process_order(&mut self, order: Order) {
        self.ledger.process_order(order);
    }

    pub fn process_commission(&mut self, sid: crate::assets::Sid, cost: f64) {
        self.ledger.process_commission(sid, cost);
    }

    pub fn process_splits(&mut self, splits: &[Split]) {
        self.ledger.process_splits(splits);
    }

    pub fn process_close_position(&mut self, asset: &Asset, dt: DateTime<Utc>) {
        self.ledger.close_position(asset, dt);
    }

    pub fn capital_change(&mut self, amount: f64) {
        self.ledger.capital_change(amount);
    }

    pub fn sync_last_sale_prices(&mut self, dt: DateTime<Utc>, bundle: &BundleData) {
        self.ledger.sync_last_sale_prices(dt, bundle);
    }
}
