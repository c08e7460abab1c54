use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::{
    assets::{Asset, Sid},
    error::{OrderError, TradesimResult},
    finance::ledger::Account,
};

/// What to do when a control is violated: reject the order (`Fail`) or
/// record the violation and let the order through (`Log`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Fail,
    Log,
}

/// Everything a pre-order control needs to judge an order.
#[derive(Debug, Clone, Copy)]
pub struct OrderValidationCtx<'a> {
    pub asset: &'a Asset,
    pub amount: i64,
    pub position_amount: i64,
    pub current_price: f64,
    pub dt: DateTime<Utc>,
    pub todays_order_count: usize,
}

// ================================================================================================
// Trading Controls
// ================================================================================================

/// A fail-safe restraint checked once for every order before it reaches the
/// blotter.
#[derive(Debug, Clone)]
pub enum TradingControl {
    /// Bound the size of a single order, in shares and/or notional dollars.
    /// With `sid` set, only orders for that asset are constrained.
    MaxOrderSize {
        sid: Option<Sid>,
        max_shares: Option<i64>,
        max_notional: Option<f64>,
        on_error: ErrorPolicy,
    },
    /// Bound the position an order would result in.
    MaxPositionSize {
        sid: Option<Sid>,
        max_shares: Option<i64>,
        max_notional: Option<f64>,
        on_error: ErrorPolicy,
    },
    /// Bound the number of orders placed in one session.
    MaxOrderCount { max: usize, on_error: ErrorPolicy },
    /// Forbid orders that would leave a net short position.
    LongOnly { on_error: ErrorPolicy },
    /// Forbid orders in specific assets.
    RestrictedList {
        sids: BTreeSet<Sid>,
        on_error: ErrorPolicy,
    },
}

impl TradingControl {
    fn on_error(&self) -> ErrorPolicy {
        match self {
            TradingControl::MaxOrderSize { on_error, .. }
            | TradingControl::MaxPositionSize { on_error, .. }
            | TradingControl::MaxOrderCount { on_error, .. }
            | TradingControl::LongOnly { on_error }
            | TradingControl::RestrictedList { on_error, .. } => *on_error,
        }
    }

    /// `Some(description)` when the order violates this control.
    fn violation(&self, ctx: &OrderValidationCtx<'_>) -> Option<String> {
        match self {
            TradingControl::MaxOrderSize {
                sid,
                max_shares,
                max_notional,
                ..
            } => {
                if sid.is_some_and(|s| s != ctx.asset.sid) {
                    return None;
                }
                check_size_bounds(ctx.amount, ctx.current_price, *max_shares, *max_notional)
                    .map(|detail| format!("MaxOrderSize({detail})"))
            }
            TradingControl::MaxPositionSize {
                sid,
                max_shares,
                max_notional,
                ..
            } => {
                if sid.is_some_and(|s| s != ctx.asset.sid) {
                    return None;
                }
                let resulting = ctx.position_amount + ctx.amount;
                check_size_bounds(resulting, ctx.current_price, *max_shares, *max_notional)
                    .map(|detail| format!("MaxPositionSize({detail})"))
            }
            TradingControl::MaxOrderCount { max, .. } => {
                (ctx.todays_order_count >= *max).then(|| format!("MaxOrderCount(max: {max})"))
            }
            TradingControl::LongOnly { .. } => (ctx.position_amount + ctx.amount < 0)
                .then(|| "LongOnly".to_string()),
            TradingControl::RestrictedList { sids, .. } => sids
                .contains(&ctx.asset.sid)
                .then(|| format!("RestrictedList(sid: {})", ctx.asset.sid)),
        }
    }
}

fn check_size_bounds(
    shares: i64,
    price: f64,
    max_shares: Option<i64>,
    max_notional: Option<f64>,
) -> Option<String> {
    if let Some(max) = max_shares
        && shares.abs() > max
    {
        return Some(format!("max_shares: {max}"));
    }
    if let Some(max) = max_notional {
        let notional = shares.abs() as f64 * price;
        // A NaN price cannot prove a violation.
        if notional > max {
            return Some(format!("max_notional: {max}"));
        }
    }
    None
}

// ================================================================================================
// Account Controls
// ================================================================================================

/// Account-level restraints validated at every session end.
#[derive(Debug, Clone)]
pub enum AccountControl {
    MaxLeverage { max: f64, on_error: ErrorPolicy },
    /// Require at least `min` leverage once `grace_period_sessions` have
    /// elapsed, giving the strategy time to deploy capital.
    MinLeverage {
        min: f64,
        grace_period_sessions: usize,
        on_error: ErrorPolicy,
    },
}

impl AccountControl {
    fn on_error(&self) -> ErrorPolicy {
        match self {
            AccountControl::MaxLeverage { on_error, .. }
            | AccountControl::MinLeverage { on_error, .. } => *on_error,
        }
    }

    fn violation(&self, account: &Account, session_ix: usize) -> Option<String> {
        match self {
            AccountControl::MaxLeverage { max, .. } => (account.leverage > *max)
                .then(|| format!("MaxLeverage(max: {max}, leverage: {})", account.leverage)),
            AccountControl::MinLeverage {
                min,
                grace_period_sessions,
                ..
            } => (session_ix + 1 > *grace_period_sessions && account.leverage < *min)
                .then(|| format!("MinLeverage(min: {min}, leverage: {})", account.leverage)),
        }
    }
}

// ================================================================================================
// Control Set
// ================================================================================================

/// The registered controls plus the per-session order counter.
#[derive(Debug, Default)]
pub struct ControlSet {
    trading_controls: Vec<TradingControl>,
    account_controls: Vec<AccountControl>,
    todays_order_count: usize,
}

impl ControlSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_trading_control(&mut self, control: TradingControl) {
        self.trading_controls.push(control);
    }

    pub fn register_account_control(&mut self, control: AccountControl) {
        self.account_controls.push(control);
    }

    pub fn start_of_session(&mut self) {
        self.todays_order_count = 0;
    }

    pub fn todays_order_count(&self) -> usize {
        self.todays_order_count
    }

    /// Count an order that passed validation and entered the blotter.
    pub fn record_order(&mut self) {
        self.todays_order_count += 1;
    }

    /// Run every trading control against a prospective order. Called exactly
    /// once per order attempt.
    pub fn validate_order(&self, ctx: &OrderValidationCtx<'_>) -> TradesimResult<()> {
        for control in &self.trading_controls {
            if let Some(constraint) = control.violation(ctx) {
                match control.on_error() {
                    ErrorPolicy::Fail => {
                        return Err(OrderError::TradingControlViolation {
                            sid: ctx.asset.sid.0,
                            amount: ctx.amount,
                            dt: ctx.dt,
                            constraint,
                        }
                        .into());
                    }
                    ErrorPolicy::Log => {
                        tracing::error!(
                            sid = %ctx.asset.sid,
                            amount = ctx.amount,
                            dt = %ctx.dt,
                            constraint,
                            "order violates trading constraint"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Run every account control against the end-of-session account state.
    pub fn validate_account(
        &self,
        account: &Account,
        dt: DateTime<Utc>,
        session_ix: usize,
    ) -> TradesimResult<()> {
        for control in &self.account_controls {
            if let Some(constraint) = control.violation(account, session_ix) {
                match control.on_error() {
                    ErrorPolicy::Fail => {
                        return Err(OrderError::AccountControlViolation { dt, constraint }.into());
                    }
                    ErrorPolicy::Log => {
                        tracing::error!(dt = %dt, constraint, "account control violated");
                    }
                }
            }
        }
        Ok(())
    }
}
