use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use polars::prelude::DataFrame;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    assets::Sid,
    calendar::Session,
    data::{BarData, BundleData},
    error::{ConfigurationError, DataError, StrategyError, TradesimError, TradesimResult},
    finance::{
        blotter::Blotter,
        controls::ControlSet,
        ledger::{CapitalChange, Ledger},
        order::OrderId,
    },
    metrics::{
        BenchmarkSource, MetricsTracker, standard_metrics,
        packet::{DailyPerf, MinutePerf, PerfPacket, RiskReport},
    },
    report,
    sim::{
        clock::{ClockEvent, ClockEventKind, SimulationClock},
        context::{Context, Phase},
        params::{BenchmarkSpec, SimulationParams},
        schedule::Schedule,
        strategy::Strategy,
    },
};

/// One recorded, non-fatal failure: a rejected order, a strategy callback
/// error under `stop_on_error = false`, or the error that aborted the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    pub sid: Option<Sid>,
    pub order_id: Option<OrderId>,
}

/// What a finished (or aborted) run hands back to the host.
#[derive(Debug)]
pub struct SimulationResult {
    /// One row per session; see [`crate::report::PerfCol`].
    pub perf: DataFrame,
    pub risk_report: RiskReport,
    /// Empty on a clean run.
    pub errors: Vec<StrategyErrorRecord>,
}

/// Builds a strategy-visible [`Context`] from disjoint driver fields so the
/// strategy itself stays borrowable next to it.
macro_rules! build_context {
    ($self:ident, $phase:expr, $dt:expr, $bundle:expr) => {
        Context::new(
            $phase,
            $dt,
            $bundle,
            $self.params.bar_frequency,
            &mut $self.blotter,
            $self.tracker.ledger_mut(),
            &mut $self.controls,
            &mut $self.recorded_vars,
            None,
            None,
            &mut $self.errors,
            &mut $self.user_state,
        )
    };
}

// ================================================================================================
// Simulation Driver
// ================================================================================================

/// Binds the clock, the strategy callbacks, the blotter and the metrics
/// tracker into one sequential simulation.
///
/// The driver is a finite iterator of performance packets: minute packets at
/// sub-session emission boundaries, a session packet at every SessionEnd and
/// one final risk report. Dropping the iterator cancels the run; the
/// cancellation token does the same cooperatively between ticks.
#[derive(Debug)]
pub struct SimulationDriver<S: Strategy> {
    strategy: S,
    params: SimulationParams,
    bundle: Arc<BundleData>,
    sessions: Vec<Session>,
    clock: SimulationClock,
    blotter: Blotter,
    tracker: MetricsTracker,
    controls: ControlSet,
    schedule: Schedule,
    recorded_vars: BTreeMap<String, f64>,
    user_state: BTreeMap<String, serde_json::Value>,
    errors: Vec<StrategyErrorRecord>,
    cancellation: CancellationToken,
    finished: bool,
    risk_emitted: bool,
    capital_changes_processed_through: Option<DateTime<Utc>>,
    current_session_open: DateTime<Utc>,
    period_open: DateTime<Utc>,
    last_dt: DateTime<Utc>,
}

impl<S: Strategy> SimulationDriver<S> {
    /// Construct the driver: runs the strategy's `initialize` and validates
    /// the benchmark, so configuration problems surface before the clock
    /// starts.
    pub fn new(
        mut strategy: S,
        bundle: Arc<BundleData>,
        params: SimulationParams,
    ) -> TradesimResult<Self> {
        let calendar = bundle.calendar();
        let sessions = calendar.sessions_in_range(params.start_session, params.end_session);
        if sessions.is_empty() {
            return Err(ConfigurationError::EmptySessionRange.into());
        }
        if params.bar_frequency < bundle.frequency() {
            return Err(DataError::UnsupportedFrequency {
                stored_seconds: bundle.frequency().seconds(),
                requested_seconds: params.bar_frequency.seconds(),
            }
            .into());
        }
        let clock = SimulationClock::new(
            calendar,
            &sessions,
            params.bar_frequency,
            params.emission_rate,
            params.before_trading_start_offset,
        )?;

        let start_midnight = calendar.session_midnight(sessions[0]);
        let mut ledger = Ledger::new(sessions.len(), params.capital_base, Some(start_midnight));
        let mut blotter = Blotter::new();
        let mut controls = ControlSet::new();
        let mut schedule = Schedule::default();
        let mut recorded_vars = BTreeMap::new();
        let mut user_state = BTreeMap::new();
        let mut errors = Vec::new();
        let mut benchmark_spec = params.benchmark.clone();

        {
            let mut ctx = Context::new(
                Phase::Initialize,
                start_midnight,
                &bundle,
                params.bar_frequency,
                &mut blotter,
                &mut ledger,
                &mut controls,
                &mut recorded_vars,
                Some(&mut schedule),
                Some(&mut benchmark_spec),
                &mut errors,
                &mut user_state,
            );
            strategy.initialize(&mut ctx).map_err(|e| {
                TradesimError::Strategy(StrategyError {
                    callback: "initialize",
                    dt: start_midnight,
                    message: e.to_string(),
                })
            })?;
        }

        let benchmark = match &benchmark_spec {
            None => BenchmarkSource::zero(calendar, &sessions)?,
            Some(BenchmarkSpec::Asset(sid)) => {
                BenchmarkSource::from_asset(*sid, &bundle, &sessions, params.emission_rate)?
            }
            Some(BenchmarkSpec::Returns(series)) => BenchmarkSource::from_returns(
                series,
                calendar,
                &sessions,
                params.emission_rate,
            )?,
        };

        let mut tracker =
            MetricsTracker::new(ledger, standard_metrics(), benchmark, sessions.clone());
        tracker.start_of_simulation();

        Ok(Self {
            strategy,
            params,
            bundle,
            sessions,
            clock,
            blotter,
            tracker,
            controls,
            schedule,
            recorded_vars,
            user_state,
            errors,
            cancellation: CancellationToken::new(),
            finished: false,
            risk_emitted: false,
            capital_changes_processed_through: None,
            current_session_open: start_midnight,
            period_open: start_midnight,
            last_dt: start_midnight,
        })
    }

    /// Use a host-supplied cancellation token; when triggered the driver
    /// finishes the current tick, emits the partial risk report and stops.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Drive the whole simulation and assemble the final result. Fatal
    /// errors abort the loop but still produce a risk report populated up to
    /// the last completed session.
    #[tracing::instrument(skip(self), fields(sessions = self.sessions.len()))]
    pub fn run(mut self) -> TradesimResult<SimulationResult> {
        let mut daily_packets: Vec<DailyPerf> = Vec::new();
        let mut risk_report = None;
        let mut aborted = false;

        while let Some(item) = self.next() {
            match item {
                Ok(PerfPacket::Daily(packet)) => daily_packets.push(packet),
                Ok(PerfPacket::Minute(_)) => {}
                Ok(PerfPacket::Risk(report)) => risk_report = Some(report),
                Err(err) => {
                    tracing::error!(error = %err, "simulation aborted");
                    self.errors.push(StrategyErrorRecord {
                        timestamp: self.last_dt,
                        kind: error_kind(&err).to_string(),
                        message: err.to_string(),
                        sid: None,
                        order_id: None,
                    });
                    aborted = true;
                }
            }
        }

        let risk_report =
            risk_report.unwrap_or_else(|| self.tracker.handle_simulation_end());
        let perf = report::daily_perf_frame(&daily_packets)?;

        if !aborted
            && let Err(err) = self.strategy.analyze(&perf)
        {
            self.errors.push(StrategyErrorRecord {
                timestamp: self.last_dt,
                kind: "analyze".to_string(),
                message: err.to_string(),
                sid: None,
                order_id: None,
            });
        }

        Ok(SimulationResult {
            perf,
            risk_report,
            errors: std::mem::take(&mut self.errors),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Event handlers
    // --------------------------------------------------------------------------------------------

    fn on_session_start(&mut self, ev: ClockEvent) -> TradesimResult<()> {
        let bundle = Arc::clone(&self.bundle);
        let calendar = bundle.calendar();
        self.current_session_open = calendar.session_open(ev.session)?;
        self.period_open = self.current_session_open;

        // Interday capital changes take effect at midnight, before any
        // session processing.
        self.process_capital_changes(ev.dt);

        self.controls.start_of_session();
        self.schedule.start_of_session();
        self.tracker.handle_market_open(ev.session, &bundle)?;

        // Splits for anything we hold or have resting orders in.
        let mut sids: BTreeSet<Sid> = self
            .tracker
            .ledger()
            .position_tracker()
            .held_sids()
            .collect();
        sids.extend(self.blotter.open_order_sids());
        if !sids.is_empty() {
            let splits = bundle.splits(&sids, ev.session);
            if !splits.is_empty() {
                self.blotter.process_splits(&splits);
                self.tracker.process_splits(&splits);
            }
        }
        Ok(())
    }

    fn on_before_trading_start(&mut self, ev: ClockEvent) -> TradesimResult<()> {
        let bundle = Arc::clone(&self.bundle);
        let data = BarData::new(&bundle, ev.dt, self.params.bar_frequency);
        let mut ctx = build_context!(self, Phase::BeforeTradingStart, ev.dt, &bundle);
        let result = self.strategy.before_trading_start(&mut ctx, &data);
        drop(ctx);
        self.settle_strategy_result("before_trading_start", ev.dt, result)
    }

    fn on_bar(&mut self, ev: ClockEvent) -> TradesimResult<()> {
        let bundle = Arc::clone(&self.bundle);

        if self.params.bar_frequency.is_intraday() {
            self.process_capital_changes(ev.dt);
        }

        self.blotter.set_date(ev.dt);
        self.tracker.sync_last_sale_prices(ev.dt, &bundle);

        // Match orders placed on earlier bars against this bar.
        let data = BarData::new(&bundle, ev.dt, self.params.bar_frequency);
        let (transactions, commissions, closed) = self
            .blotter
            .get_transactions(&data, bundle.asset_repository())?;
        self.blotter.prune_orders(&closed);

        for txn in &transactions {
            let asset = bundle.asset_repository().retrieve(txn.sid)?.clone();
            self.tracker.process_transaction(&asset, txn);
            if let Some(order_id) = txn.order_id
                && let Some(order) = self.blotter.get_order(order_id)
            {
                let order = order.clone();
                self.tracker.process_order(order);
            }
        }
        for commission in &commissions {
            self.tracker.process_commission(commission.sid, commission.cost);
        }

        // User code sees the bar only after the exchange has.
        let mut ctx = build_context!(self, Phase::Bar, ev.dt, &bundle);
        let result = self.strategy.handle_data(&mut ctx, &data);
        drop(ctx);
        self.settle_strategy_result("handle_data", ev.dt, result)?;

        // Scheduled functions run after handle_data, in registration order.
        if !self.schedule.is_empty() {
            let mut schedule = std::mem::take(&mut self.schedule);
            let calendar = bundle.calendar();
            let close = calendar.session_close(ev.session)?;
            let mut ctx = build_context!(self, Phase::Bar, ev.dt, &bundle);
            let result = schedule.run_due(
                &mut ctx,
                &data,
                calendar,
                ev.session,
                ev.session_ix,
                self.current_session_open,
                close,
                self.params.bar_frequency,
            );
            drop(ctx);
            self.schedule = schedule;
            self.settle_strategy_result("scheduled_function", ev.dt, result)?;
        }

        // Record any orders placed (or transitioned) during this bar.
        for order in self.blotter.drain_new_orders() {
            self.tracker.process_order(order);
        }
        Ok(())
    }

    fn on_emission_rate_end(&mut self, ev: ClockEvent) -> MinutePerf {
        let mut packet = self
            .tracker
            .handle_minute_close(ev.dt, self.period_open, ev.session_ix);
        packet.recorded_vars = self.recorded_vars.clone();
        self.period_open = ev.dt;
        packet
    }

    fn on_session_end(&mut self, ev: ClockEvent) -> TradesimResult<DailyPerf> {
        let bundle = Arc::clone(&self.bundle);

        // Auto-close expired assets before the cancel policy runs, so the
        // policy never observes their fabricated liquidations.
        let held: Vec<Sid> = self
            .tracker
            .ledger()
            .position_tracker()
            .held_sids()
            .collect();
        for sid in held {
            let asset = bundle.asset_repository().retrieve(sid)?.clone();
            if past_auto_close(&asset, ev.session) {
                self.tracker.process_close_position(&asset, ev.dt);
                self.blotter.cancel_all_orders_for_asset(sid, ev.dt, false);
            }
        }
        let resting: Vec<Sid> = self.blotter.open_order_sids().collect();
        for sid in resting {
            let asset = bundle.asset_repository().retrieve(sid)?.clone();
            if past_auto_close(&asset, ev.session) {
                self.blotter.cancel_all_orders_for_asset(sid, ev.dt, false);
            }
        }

        self.blotter.execute_cancel_policy(ClockEventKind::SessionEnd, ev.dt);

        // Sweep cancellations into the order journal before the packet is
        // assembled.
        for order in self.blotter.drain_new_orders() {
            self.tracker.process_order(order);
        }

        let account = self.tracker.ledger_mut().account().clone();
        self.controls.validate_account(&account, ev.dt, ev.session_ix)?;

        let mut packet =
            self.tracker
                .handle_market_close(ev.dt, self.current_session_open, ev.session_ix);
        packet.recorded_vars = self.recorded_vars.clone();
        Ok(packet)
    }

    // --------------------------------------------------------------------------------------------
    // Helpers
    // --------------------------------------------------------------------------------------------

    /// Apply every capital change with a timestamp in the yet-unprocessed
    /// window ending at `up_to` (inclusive).
    fn process_capital_changes(&mut self, up_to: DateTime<Utc>) {
        let after = self.capital_changes_processed_through;
        let changes: Vec<(DateTime<Utc>, CapitalChange)> = self
            .params
            .capital_changes
            .range(..=up_to)
            .filter(|(dt, _)| after.is_none_or(|a| **dt > a))
            .map(|(dt, change)| (*dt, *change))
            .collect();

        for (dt, change) in changes {
            let amount = match change {
                CapitalChange::Delta(delta) => delta,
                CapitalChange::Target(target) => {
                    target - self.tracker.ledger_mut().portfolio().portfolio_value
                }
            };
            tracing::info!(%dt, amount, "applying capital change");
            self.tracker.capital_change(amount);
        }
        self.capital_changes_processed_through = Some(up_to);
    }

    /// Apply the `stop_on_error` policy to a strategy callback result.
    fn settle_strategy_result(
        &mut self,
        callback: &'static str,
        dt: DateTime<Utc>,
        result: TradesimResult<()>,
    ) -> TradesimResult<()> {
        let Err(err) = result else {
            return Ok(());
        };
        if self.params.stop_on_error {
            return Err(TradesimError::Strategy(StrategyError {
                callback,
                dt,
                message: err.to_string(),
            }));
        }
        tracing::warn!(callback, %dt, error = %err, "strategy error recorded; continuing");
        self.errors.push(StrategyErrorRecord {
            timestamp: dt,
            kind: "strategy".to_string(),
            message: format!("{callback}: {err}"),
            sid: None,
            order_id: None,
        });
        Ok(())
    }

    fn emit_risk_report(&mut self) -> PerfPacket {
        self.risk_emitted = true;
        PerfPacket::Risk(self.tracker.handle_simulation_end())
    }
}

fn past_auto_close(asset: &crate::assets::Asset, session: Session) -> bool {
    asset
        .auto_close_date
        .is_some_and(|acd| acd.date_naive() <= session)
}

fn error_kind(err: &TradesimError) -> &'static str {
    match err {
        TradesimError::Configuration(_) => "configuration",
        TradesimError::Data(_) => "data",
        TradesimError::Order(_) => "order_validation",
        TradesimError::Strategy(_) => "strategy",
        TradesimError::Ledger(_) => "fatal",
        TradesimError::Io(_) => "io",
    }
}

impl<S: Strategy> Iterator for SimulationDriver<S> {
    type Item = TradesimResult<PerfPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            if self.risk_emitted {
                return None;
            }
            return Some(Ok(self.emit_risk_report()));
        }

        loop {
            if self.cancellation.is_cancelled() {
                tracing::info!("cancellation requested; tearing down");
                self.finished = true;
                return Some(Ok(self.emit_risk_report()));
            }
            let Some(ev) = self.clock.next() else {
                self.finished = true;
                return Some(Ok(self.emit_risk_report()));
            };
            self.last_dt = ev.dt;

            let outcome = match ev.kind {
                ClockEventKind::SessionStart => self.on_session_start(ev).map(|_| None),
                ClockEventKind::BeforeTradingStart => {
                    self.on_before_trading_start(ev).map(|_| None)
                }
                ClockEventKind::Bar => self.on_bar(ev).map(|_| None),
                ClockEventKind::EmissionRateEnd => {
                    Ok(Some(PerfPacket::Minute(self.on_emission_rate_end(ev))))
                }
                ClockEventKind::SessionEnd => {
                    self.on_session_end(ev).map(|p| Some(PerfPacket::Daily(p)))
                }
            };

            match outcome {
                Ok(Some(packet)) => return Some(Ok(packet)),
                Ok(None) => continue,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
