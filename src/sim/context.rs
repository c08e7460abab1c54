use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::{
    assets::{Asset, Sid},
    data::{BarData, BarField, BundleData, Frequency},
    error::{OrderError, TradesimError, TradesimResult},
    finance::{
        blotter::{Blotter, CancelPolicy},
        commission::CommissionModel,
        controls::{AccountControl, ControlSet, ErrorPolicy, OrderValidationCtx, TradingControl},
        ledger::{Account, Ledger, Portfolio},
        order::{ExecutionStyle, Order, OrderId},
        slippage::SlippageModel,
    },
    sim::{
        driver::StrategyErrorRecord,
        params::BenchmarkSpec,
        schedule::{EventRule, Schedule},
    },
};

/// Which callback the context is currently serving. Some APIs are phase
/// gated: ordering is unavailable before the first bar, configuration is
/// frozen after `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialize,
    BeforeTradingStart,
    Bar,
}

type ScheduledFn = Box<dyn FnMut(&mut Context<'_>, &BarData<'_>) -> TradesimResult<()> + Send>;

/// The strategy's typed API surface, rebuilt for every callback invocation.
///
/// Strategy-local values live in [`Context::state`], a string-keyed map that
/// persists across callbacks and is visible to scheduled functions.
pub struct Context<'a> {
    phase: Phase,
    dt: DateTime<Utc>,
    bundle: &'a BundleData,
    bar_frequency: Frequency,
    blotter: &'a mut Blotter,
    ledger: &'a mut Ledger,
    controls: &'a mut ControlSet,
    recorded_vars: &'a mut BTreeMap<String, f64>,
    schedule: Option<&'a mut Schedule>,
    benchmark_spec: Option<&'a mut Option<BenchmarkSpec>>,
    errors: &'a mut Vec<StrategyErrorRecord>,
    pub state: &'a mut BTreeMap<String, serde_json::Value>,
}

impl<'a> Context<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        phase: Phase,
        dt: DateTime<Utc>,
        bundle: &'a BundleData,
        bar_frequency: Frequency,
        blotter: &'a mut Blotter,
        ledger: &'a mut Ledger,
        controls: &'a mut ControlSet,
        recorded_vars: &'a mut BTreeMap<String, f64>,
        schedule: Option<&'a mut Schedule>,
        benchmark_spec: Option<&'a mut Option<BenchmarkSpec>>,
        errors: &'a mut Vec<StrategyErrorRecord>,
        state: &'a mut BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            phase,
            dt,
            bundle,
            bar_frequency,
            blotter,
            ledger,
            controls,
            recorded_vars,
            schedule,
            benchmark_spec,
            errors,
            state,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Introspection
    // --------------------------------------------------------------------------------------------

    pub fn get_datetime(&self) -> DateTime<Utc> {
        self.dt
    }

    pub fn portfolio(&mut self) -> &Portfolio {
        self.ledger.portfolio()
    }

    pub fn account(&mut self) -> &Account {
        self.ledger.account()
    }

    /// Look up an asset by ticker. Recycled tickers resolve to the latest
    /// listing.
    pub fn symbol(&self, ticker: &str) -> TradesimResult<Asset> {
        self.bundle
            .asset_repository()
            .lookup_symbol(ticker)
            .cloned()
    }

    pub fn sid(&self, sid: u64) -> TradesimResult<Asset> {
        self.bundle.asset_repository().retrieve(Sid(sid)).cloned()
    }

    pub fn position_amount(&self, sid: Sid) -> i64 {
        self.ledger.position_tracker().position_amount(sid)
    }

    // --------------------------------------------------------------------------------------------
    // Ordering
    // --------------------------------------------------------------------------------------------

    /// Place an order for a signed number of shares. Returns `None` when the
    /// order was rejected by validation (the rejection is recorded) or the
    /// amount rounded to zero.
    pub fn order(
        &mut self,
        sid: Sid,
        amount: i64,
        style: ExecutionStyle,
    ) -> TradesimResult<Option<OrderId>> {
        match self.try_order(sid, amount, style) {
            Ok(id) => Ok(id),
            Err(TradesimError::Order(
                err @ (OrderError::OrderInBeforeTradingStart | OrderError::OrderDuringInitialize),
            )) => Err(err.into()),
            Err(TradesimError::Order(err)) => {
                tracing::warn!(%sid, amount, error = %err, "order rejected");
                self.errors.push(StrategyErrorRecord {
                    timestamp: self.dt,
                    kind: "order_validation".to_string(),
                    message: err.to_string(),
                    sid: Some(sid),
                    order_id: None,
                });
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    fn try_order(
        &mut self,
        sid: Sid,
        amount: i64,
        style: ExecutionStyle,
    ) -> TradesimResult<Option<OrderId>> {
        match self.phase {
            Phase::Initialize => return Err(OrderError::OrderDuringInitialize.into()),
            Phase::BeforeTradingStart => {
                return Err(OrderError::OrderInBeforeTradingStart.into());
            }
            Phase::Bar => {}
        }
        if amount == 0 {
            return Ok(None);
        }

        let asset = self.bundle.asset_repository().retrieve(sid)?.clone();
        if !asset.is_tradable_at(self.dt) {
            return Err(OrderError::CannotOrderDelistedAsset {
                sid: sid.0,
                dt: self.dt,
            }
            .into());
        }

        let ctx = OrderValidationCtx {
            asset: &asset,
            amount,
            position_amount: self.ledger.position_tracker().position_amount(sid),
            current_price: self.current_price(sid),
            dt: self.dt,
            todays_order_count: self.controls.todays_order_count(),
        };
        self.controls.validate_order(&ctx)?;

        let id = self.blotter.order(sid, amount, style, self.dt)?;
        if id.is_some() {
            self.controls.record_order();
        }
        Ok(id)
    }

    /// Order a fixed notional value worth of shares.
    pub fn order_value(
        &mut self,
        sid: Sid,
        value: f64,
        style: ExecutionStyle,
    ) -> TradesimResult<Option<OrderId>> {
        match self.value_to_shares(sid, value) {
            Ok(amount) => self.order(sid, amount, style),
            Err(err) => self.recover_sizing_error(sid, err),
        }
    }

    /// Sizing failures are order rejections: recorded, order not placed.
    /// Phase misuse still surfaces as an error.
    fn recover_sizing_error(
        &mut self,
        sid: Sid,
        err: TradesimError,
    ) -> TradesimResult<Option<OrderId>> {
        match err {
            TradesimError::Order(
                err @ (OrderError::OrderInBeforeTradingStart | OrderError::OrderDuringInitialize),
            ) => Err(err.into()),
            TradesimError::Order(err) => {
                tracing::warn!(%sid, error = %err, "order sizing rejected");
                self.errors.push(StrategyErrorRecord {
                    timestamp: self.dt,
                    kind: "order_validation".to_string(),
                    message: err.to_string(),
                    sid: Some(sid),
                    order_id: None,
                });
                Ok(None)
            }
            other => Err(other),
        }
    }

    /// Order a fraction of current portfolio value.
    pub fn order_percent(
        &mut self,
        sid: Sid,
        percent: f64,
        style: ExecutionStyle,
    ) -> TradesimResult<Option<OrderId>> {
        let value = self.portfolio().portfolio_value * percent;
        self.order_value(sid, value, style)
    }

    /// Order towards a target share count.
    pub fn order_target(
        &mut self,
        sid: Sid,
        target: i64,
        style: ExecutionStyle,
    ) -> TradesimResult<Option<OrderId>> {
        let current = self.position_amount(sid);
        self.order(sid, target - current, style)
    }

    /// Order towards a target notional value.
    pub fn order_target_value(
        &mut self,
        sid: Sid,
        target_value: f64,
        style: ExecutionStyle,
    ) -> TradesimResult<Option<OrderId>> {
        match self.value_to_shares(sid, target_value) {
            Ok(target) => self.order_target(sid, target, style),
            Err(err) => self.recover_sizing_error(sid, err),
        }
    }

    /// Order towards a target fraction of portfolio value.
    pub fn order_target_percent(
        &mut self,
        sid: Sid,
        target_percent: f64,
        style: ExecutionStyle,
    ) -> TradesimResult<Option<OrderId>> {
        let target_value = self.portfolio().portfolio_value * target_percent;
        self.order_target_value(sid, target_value, style)
    }

    /// Place a market order per entry; one rejection does not stop the rest.
    pub fn batch_market_order(
        &mut self,
        share_counts: &[(Sid, i64)],
    ) -> TradesimResult<Vec<Option<OrderId>>> {
        share_counts
            .iter()
            .map(|&(sid, amount)| self.order(sid, amount, ExecutionStyle::Market))
            .collect()
    }

    pub fn get_open_orders(&self, sid: Option<Sid>) -> BTreeMap<Sid, Vec<Order>> {
        match sid {
            Some(sid) => {
                let orders = self.blotter.open_orders_for(sid);
                if orders.is_empty() {
                    BTreeMap::new()
                } else {
                    BTreeMap::from([(sid, orders)])
                }
            }
            None => self.blotter.all_open_orders(),
        }
    }

    pub fn get_order(&self, id: OrderId) -> Option<Order> {
        self.blotter.get_order(id).cloned()
    }

    pub fn cancel_order(&mut self, id: OrderId) {
        self.blotter.cancel(id, self.dt, None);
    }

    // --------------------------------------------------------------------------------------------
    // Recording & scheduling
    // --------------------------------------------------------------------------------------------

    /// Record a named value for the current emission period; the latest
    /// write wins within a period.
    pub fn record(&mut self, name: impl Into<String>, value: f64) {
        self.recorded_vars.insert(name.into(), value);
    }

    /// Register a scheduled function. Only available during `initialize`.
    pub fn schedule_function(
        &mut self,
        rule: EventRule,
        callback: ScheduledFn,
    ) -> TradesimResult<()> {
        match (&mut self.schedule, self.phase) {
            (Some(schedule), Phase::Initialize) => {
                schedule.add(rule, callback);
                Ok(())
            }
            _ => Err(OrderError::UnsupportedOrderParameters(
                "schedule_function is only available during initialize".to_string(),
            )
            .into()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Configuration (initialize only)
    // --------------------------------------------------------------------------------------------

    fn require_initialize(&self, what: &str) -> TradesimResult<()> {
        if self.phase == Phase::Initialize {
            Ok(())
        } else {
            Err(OrderError::UnsupportedOrderParameters(format!(
                "{what} can only be configured during initialize"
            ))
            .into())
        }
    }

    pub fn set_slippage(
        &mut self,
        us_equities: Option<Box<dyn SlippageModel>>,
        us_futures: Option<Box<dyn SlippageModel>>,
    ) -> TradesimResult<()> {
        self.require_initialize("slippage")?;
        if let Some(model) = us_equities {
            self.blotter.set_equity_slippage(model);
        }
        if let Some(model) = us_futures {
            self.blotter.set_future_slippage(model);
        }
        Ok(())
    }

    pub fn set_commission(
        &mut self,
        us_equities: Option<Box<dyn CommissionModel>>,
        us_futures: Option<Box<dyn CommissionModel>>,
    ) -> TradesimResult<()> {
        self.require_initialize("commission")?;
        if let Some(model) = us_equities {
            self.blotter.set_equity_commission(model);
        }
        if let Some(model) = us_futures {
            self.blotter.set_future_commission(model);
        }
        Ok(())
    }

    pub fn set_cancel_policy(&mut self, policy: CancelPolicy) -> TradesimResult<()> {
        self.require_initialize("the cancel policy")?;
        self.blotter.set_cancel_policy(policy);
        Ok(())
    }

    pub fn set_benchmark(&mut self, sid: Sid) -> TradesimResult<()> {
        self.require_initialize("the benchmark")?;
        match &mut self.benchmark_spec {
            Some(spec) => {
                **spec = Some(BenchmarkSpec::Asset(sid));
                Ok(())
            }
            None => Err(OrderError::UnsupportedOrderParameters(
                "the benchmark can only be configured during initialize".to_string(),
            )
            .into()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Controls
    // --------------------------------------------------------------------------------------------

    pub fn set_max_order_size(
        &mut self,
        sid: Option<Sid>,
        max_shares: Option<i64>,
        max_notional: Option<f64>,
        on_error: ErrorPolicy,
    ) {
        self.controls.register_trading_control(TradingControl::MaxOrderSize {
            sid,
            max_shares,
            max_notional,
            on_error,
        });
    }

    pub fn set_max_position_size(
        &mut self,
        sid: Option<Sid>,
        max_shares: Option<i64>,
        max_notional: Option<f64>,
        on_error: ErrorPolicy,
    ) {
        self.controls
            .register_trading_control(TradingControl::MaxPositionSize {
                sid,
                max_shares,
                max_notional,
                on_error,
            });
    }

    pub fn set_max_order_count(&mut self, max: usize, on_error: ErrorPolicy) {
        self.controls
            .register_trading_control(TradingControl::MaxOrderCount { max, on_error });
    }

    pub fn set_long_only(&mut self, on_error: ErrorPolicy) {
        self.controls
            .register_trading_control(TradingControl::LongOnly { on_error });
    }

    pub fn set_asset_restrictions(
        &mut self,
        sids: impl IntoIterator<Item = Sid>,
        on_error: ErrorPolicy,
    ) {
        self.controls
            .register_trading_control(TradingControl::RestrictedList {
                sids: sids.into_iter().collect(),
                on_error,
            });
    }

    pub fn set_max_leverage(&mut self, max: f64, on_error: ErrorPolicy) {
        self.controls
            .register_account_control(AccountControl::MaxLeverage { max, on_error });
    }

    pub fn set_min_leverage(
        &mut self,
        min: f64,
        grace_period_sessions: usize,
        on_error: ErrorPolicy,
    ) {
        self.controls
            .register_account_control(AccountControl::MinLeverage {
                min,
                grace_period_sessions,
                on_error,
            });
    }

    // --------------------------------------------------------------------------------------------
    // Helpers
    // --------------------------------------------------------------------------------------------

    fn current_price(&self, sid: Sid) -> f64 {
        self.bundle
            .spot_value(sid, BarField::Close, self.dt, self.bar_frequency)
            .unwrap_or(f64::NAN)
    }

    /// Convert a notional value to a share count at the current price,
    /// truncating towards zero. Futures divide by the contract multiplier.
    fn value_to_shares(&mut self, sid: Sid, value: f64) -> TradesimResult<i64> {
        if self.phase != Phase::Bar {
            // Value-based sizing needs market data, which only bars have.
            return match self.phase {
                Phase::Initialize => Err(OrderError::OrderDuringInitialize.into()),
                _ => Err(OrderError::OrderInBeforeTradingStart.into()),
            };
        }
        let asset = self.bundle.asset_repository().retrieve(sid)?;
        let price = self.current_price(sid);
        if !price.is_finite() || price <= 0.0 {
            return Err(OrderError::UnsupportedOrderParameters(format!(
                "no usable price for sid {sid} to size a {value} order"
            ))
            .into());
        }
        let unit_value = price * asset.price_multiplier;
        Ok((value / unit_value).trunc() as i64)
    }
}
