use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    assets::{Asset, Sid},
    data::BundleData,
    error::TradesimResult,
    finance::{
        order::{Order, OrderId, Transaction},
        position::{PositionStats, PositionTracker},
    },
};

// ================================================================================================
// Portfolio & Account
// ================================================================================================

/// The strategy-visible aggregate of cash and positions.
///
/// Recomputed lazily: cash flows and last-sale syncs mark it dirty, the next
/// read folds everything in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub starting_cash: f64,
    pub cash: f64,
    pub cash_flow: f64,
    pub portfolio_value: f64,
    pub positions_value: f64,
    pub positions_exposure: f64,
    pub pnl: f64,
    pub returns: f64,
    pub start_date: Option<DateTime<Utc>>,
}

impl Portfolio {
    fn new(capital_base: f64, start_date: Option<DateTime<Utc>>) -> Self {
        Self {
            starting_cash: capital_base,
            cash: capital_base,
            cash_flow: 0.0,
            portfolio_value: capital_base,
            positions_value: 0.0,
            positions_exposure: 0.0,
            pnl: 0.0,
            returns: 0.0,
            start_date,
        }
    }
}

/// Brokerage-style account projection derived from the portfolio. External
/// systems may override individual fields; overrides win over computed
/// defaults and are reapplied on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub settled_cash: f64,
    pub buying_power: f64,
    pub equity_with_loan: f64,
    pub available_funds: f64,
    pub total_positions_value: f64,
    pub total_positions_exposure: f64,
    pub net_liquidation: f64,
    pub cushion: f64,
    pub leverage: f64,
    pub gross_leverage: f64,
    pub net_leverage: f64,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            settled_cash: 0.0,
            buying_power: f64::INFINITY,
            equity_with_loan: 0.0,
            available_funds: 0.0,
            total_positions_value: 0.0,
            total_positions_exposure: 0.0,
            net_liquidation: 0.0,
            cushion: 0.0,
            leverage: 0.0,
            gross_leverage: 0.0,
            net_leverage: 0.0,
        }
    }
}

/// Account fields an external system may pin to a fixed value.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum AccountField {
    SettledCash,
    BuyingPower,
    EquityWithLoan,
    AvailableFunds,
    NetLiquidation,
    Cushion,
    Leverage,
    GrossLeverage,
    NetLeverage,
}

/// An exogenous capital injection or withdrawal, keyed by timestamp in the
/// driver. Capital changes must never distort returns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CapitalChange {
    /// Adjust portfolio value to the given target.
    Target(f64),
    /// Adjust portfolio value by the given delta.
    Delta(f64),
}

// ================================================================================================
// Ledger
// ================================================================================================

/// Tracks all transactions and orders as well as the current state of the
/// portfolio and positions.
///
/// `daily_returns` has one slot per session, NaN until the session finishes;
/// in minute emission mode the current slot holds the partial day's return.
#[derive(Debug, Clone)]
pub struct Ledger {
    portfolio: Portfolio,
    dirty_portfolio: bool,
    dirty_account: bool,
    account: Account,
    account_overrides: BTreeMap<AccountField, f64>,
    position_tracker: PositionTracker,
    daily_returns: Array1<f64>,
    previous_total_returns: f64,
    /// Per-asset mark-to-market anchor for positions with payouts on price
    /// differences (futures).
    payout_last_sale_prices: BTreeMap<Sid, f64>,
    processed_transactions: BTreeMap<DateTime<Utc>, Vec<Transaction>>,
    /// Session order journal in last-modification order.
    session_orders: Vec<Order>,
}

impl Ledger {
    pub fn new(session_count: usize, capital_base: f64, start_date: Option<DateTime<Utc>>) -> Self {
        Self {
            portfolio: Portfolio::new(capital_base, start_date),
            dirty_portfolio: false,
            dirty_account: true,
            account: Account::default(),
            account_overrides: BTreeMap::new(),
            position_tracker: PositionTracker::new(),
            daily_returns: Array1::from_elem(session_count, f64::NAN),
            previous_total_returns: 0.0,
            payout_last_sale_prices: BTreeMap::new(),
            processed_transactions: BTreeMap::new(),
            session_orders: Vec::new(),
        }
    }

    pub fn position_tracker(&self) -> &PositionTracker {
        &self.position_tracker
    }

    pub fn position_tracker_mut(&mut self) -> &mut PositionTracker {
        &mut self.position_tracker
    }

    pub fn daily_returns(&self) -> &Array1<f64> {
        &self.daily_returns
    }

    /// The current day's returns, computed in returns space so the value
    /// stays correct across capital changes.
    pub fn todays_returns(&mut self) -> f64 {
        (self.portfolio().returns + 1.0) / (self.previous_total_returns + 1.0) - 1.0
    }

    // --------------------------------------------------------------------------------------------
    // Session lifecycle
    // --------------------------------------------------------------------------------------------

    pub fn start_of_session(&mut self) {
        self.processed_transactions.clear();
        self.session_orders.clear();

        // Snapshot yesterday's total returns so todays_returns measures
        // change since the previous close. Done here rather than at session
        // end so metrics still see the finished day's value in their own
        // end-of-session hooks.
        self.previous_total_returns = self.portfolio().returns;
    }

    pub fn end_of_bar(&mut self, session_ix: usize) {
        let returns = self.todays_returns();
        self.daily_returns[session_ix] = returns;
    }

    pub fn end_of_session(&mut self, session_ix: usize) {
        let returns = self.todays_returns();
        self.daily_returns[session_ix] = returns;
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    pub fn sync_last_sale_prices(&mut self, dt: DateTime<Utc>, bundle: &BundleData) {
        self.position_tracker.sync_last_sale_prices(dt, bundle);
        self.mark_dirty();
    }

    fn cash_flow(&mut self, amount: f64) {
        self.mark_dirty();
        self.portfolio.cash_flow += amount;
        self.portfolio.cash += amount;
    }

    fn calculate_payout(multiplier: f64, amount: i64, old_price: f64, price: f64) -> f64 {
        (price - old_price) * multiplier * amount as f64
    }

    /// Apply a fill, moving cash and updating positions.
    ///
    /// Cash-settled assets (futures) book the mark-to-market difference
    /// against the payout anchor instead of the full notional; the anchor is
    /// dropped when the position lands at zero and re-anchored at the fill
    /// price otherwise, including fills that flip the position's sign.
    #[tracing::instrument(skip(self, asset, txn), fields(sid = %txn.sid, amount = txn.amount, price = txn.price))]
    pub fn process_transaction(&mut self, asset: &Asset, txn: &Transaction) {
        if asset.kind.is_cash_settled() {
            match self.payout_last_sale_prices.get(&asset.sid).copied() {
                None => {
                    self.payout_last_sale_prices.insert(asset.sid, txn.price);
                }
                Some(old_price) => {
                    let amount = self.position_tracker.position_amount(asset.sid);
                    let payout = Self::calculate_payout(
                        asset.price_multiplier,
                        amount,
                        old_price,
                        txn.price,
                    );
                    self.cash_flow(payout);

                    if amount + txn.amount == 0 {
                        self.payout_last_sale_prices.remove(&asset.sid);
                    } else {
                        self.payout_last_sale_prices.insert(asset.sid, txn.price);
                    }
                }
            }
        } else {
            self.cash_flow(-(txn.price * txn.amount as f64));
        }

        self.position_tracker.execute_transaction(asset, txn);
        self.processed_transactions
            .entry(txn.dt)
            .or_default()
            .push(txn.clone());
    }

    pub fn process_splits(&mut self, splits: &[crate::data::Split]) {
        let leftover_cash = self.position_tracker.handle_splits(splits);
        if leftover_cash > 0.0 {
            self.cash_flow(leftover_cash);
        }
    }

    /// Record an order in the session journal, keeping last-modification
    /// order and a single entry per order id.
    pub fn process_order(&mut self, order: Order) {
        self.session_orders.retain(|o| o.id != order.id);
        self.session_orders.push(order);
    }

    pub fn process_commission(&mut self, sid: Sid, cost: f64) {
        self.position_tracker.handle_commission(sid, cost);
        self.cash_flow(-cost);
    }

    /// Flatten a position on its auto-close date.
    pub fn close_position(&mut self, asset: &Asset, dt: DateTime<Utc>) {
        if let Some(txn) = self
            .position_tracker
            .maybe_create_close_position_transaction(asset.sid, dt)
        {
            tracing::info!(sid = %asset.sid, amount = txn.amount, "auto-closing expired position");
            self.process_transaction(asset, &txn);
        }
    }

    /// Earn dividends going ex on `session` and pay out anything due.
    pub fn process_dividends(
        &mut self,
        session: NaiveDate,
        bundle: &BundleData,
    ) -> TradesimResult<()> {
        let held: std::collections::BTreeSet<Sid> =
            self.position_tracker.held_sids().collect();
        if !held.is_empty() {
            let cash_dividends = bundle.dividends_with_ex_date(&held, session);
            let stock_dividends = bundle.stock_dividends_with_ex_date(&held, session);
            self.position_tracker
                .earn_dividends(&cash_dividends, &stock_dividends);
        }

        let cash = self
            .position_tracker
            .pay_dividends(session, bundle.asset_repository())?;
        if cash != 0.0 {
            self.cash_flow(cash);
        }
        Ok(())
    }

    /// Adjust cash and portfolio value without touching cash flow, so the
    /// injection does not register as performance.
    pub fn capital_change(&mut self, amount: f64) {
        self.update_portfolio();
        self.portfolio.portfolio_value += amount;
        self.portfolio.cash += amount;
    }

    // --------------------------------------------------------------------------------------------
    // Journals
    // --------------------------------------------------------------------------------------------

    /// Transactions of the current session, optionally restricted to one bar.
    pub fn transactions(&self, dt: Option<DateTime<Utc>>) -> Vec<Transaction> {
        match dt {
            None => self
                .processed_transactions
                .values()
                .flatten()
                .cloned()
                .collect(),
            Some(dt) => self
                .processed_transactions
                .get(&dt)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Orders touched in the current session, in last-modification order.
    pub fn orders(&self) -> &[Order] {
        &self.session_orders
    }

    pub fn order_by_id(&self, id: OrderId) -> Option<&Order> {
        self.session_orders.iter().find(|o| o.id == id)
    }

    // --------------------------------------------------------------------------------------------
    // Projections
    // --------------------------------------------------------------------------------------------

    fn mark_dirty(&mut self) {
        self.dirty_portfolio = true;
        self.dirty_account = true;
    }

    /// Accrue futures mark-to-market against the payout anchors, re-anchoring
    /// each at the position's latest sale price.
    fn accrue_payouts(&mut self) {
        let mut total = 0.0;
        for (sid, old_price) in self.payout_last_sale_prices.iter_mut() {
            let Some(position) = self.position_tracker.position(*sid) else {
                continue;
            };
            let price = position.last_sale_price;
            total += Self::calculate_payout(
                position.asset.price_multiplier,
                position.amount,
                *old_price,
                price,
            );
            *old_price = price;
        }
        if total != 0.0 {
            self.portfolio.cash_flow += total;
            self.portfolio.cash += total;
        }
    }

    /// Force a computation of the current portfolio state.
    pub fn update_portfolio(&mut self) {
        if !self.dirty_portfolio {
            return;
        }

        let stats = self.position_tracker.stats();
        self.portfolio.positions_value = stats.net_value;
        self.portfolio.positions_exposure = stats.net_exposure;
        self.accrue_payouts();

        let start_value = self.portfolio.portfolio_value;
        let end_value = self.portfolio.cash + stats.net_value;
        self.portfolio.portfolio_value = end_value;

        let pnl = end_value - start_value;
        let period_returns = if start_value != 0.0 {
            pnl / start_value
        } else {
            0.0
        };
        self.portfolio.pnl += pnl;
        self.portfolio.returns = (1.0 + self.portfolio.returns) * (1.0 + period_returns) - 1.0;

        self.dirty_portfolio = false;
    }

    pub fn portfolio(&mut self) -> &Portfolio {
        self.update_portfolio();
        &self.portfolio
    }

    pub fn position_stats(&self) -> PositionStats {
        self.position_tracker.stats()
    }

    /// `(portfolio_value, gross_leverage, net_leverage)` for this period.
    pub fn calculate_period_stats(&mut self) -> (f64, f64, f64) {
        let stats = self.position_tracker.stats();
        let portfolio_value = self.portfolio().portfolio_value;
        if portfolio_value == 0.0 {
            (portfolio_value, f64::INFINITY, f64::INFINITY)
        } else {
            (
                portfolio_value,
                stats.gross_exposure / portfolio_value,
                stats.net_exposure / portfolio_value,
            )
        }
    }

    pub fn override_account_field(&mut self, field: AccountField, value: f64) {
        self.account_overrides.insert(field, value);
        self.dirty_account = true;
    }

    pub fn account(&mut self) -> &Account {
        if self.dirty_account {
            self.update_portfolio();
            let stats = self.position_tracker.stats();
            let portfolio = &self.portfolio;

            let account = &mut self.account;
            account.settled_cash = portfolio.cash;
            account.buying_power = f64::INFINITY;
            account.equity_with_loan = portfolio.portfolio_value;
            account.available_funds = portfolio.cash;
            account.total_positions_value = portfolio.portfolio_value - portfolio.cash;
            account.total_positions_exposure = portfolio.positions_exposure;
            account.cushion = if portfolio.portfolio_value != 0.0 {
                portfolio.cash / portfolio.portfolio_value
            } else {
                f64::NAN
            };
            account.net_liquidation = portfolio.portfolio_value;
            account.gross_leverage = if portfolio.portfolio_value != 0.0 {
                stats.gross_exposure / portfolio.portfolio_value
            } else {
                f64::INFINITY
            };
            account.net_leverage = if portfolio.portfolio_value != 0.0 {
                stats.net_exposure / portfolio.portfolio_value
            } else {
                f64::INFINITY
            };
            account.leverage = account.gross_leverage;

            for (field, value) in &self.account_overrides {
                let value = *value;
                match field {
                    AccountField::SettledCash => account.settled_cash = value,
                    AccountField::BuyingPower => account.buying_power = value,
                    AccountField::EquityWithLoan => account.equity_with_loan = value,
                    AccountField::AvailableFunds => account.available_funds = value,
                    AccountField::NetLiquidation => account.net_liquidation = value,
                    AccountField::Cushion => account.cushion = value,
                    AccountField::Leverage => account.leverage = value,
                    AccountField::GrossLeverage => account.gross_leverage = value,
                    AccountField::NetLeverage => account.net_leverage = value,
                }
            }

            self.dirty_account = false;
        }
        &self.account
    }
}
