use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    assets::{Asset, AssetRepository, Sid},
    data::{BarField, BundleData, Dividend, Split, StockDividend},
    error::TradesimResult,
    finance::order::Transaction,
};

// ================================================================================================
// Position
// ================================================================================================

/// Current holdings in one asset.
///
/// `cost_basis` is the per-share weighted-average absolute cost. Same-side
/// additions re-average it; opposite-side reductions leave it untouched
/// (realized PnL lands in cash), and a fill that crosses through zero flips
/// the basis to that fill's price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub asset: Asset,
    pub amount: i64,
    pub cost_basis: f64,
    pub last_sale_price: f64,
    pub last_sale_date: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(asset: Asset) -> Self {
        Self {
            asset,
            amount: 0,
            cost_basis: 0.0,
            last_sale_price: 0.0,
            last_sale_date: None,
        }
    }

    pub fn sid(&self) -> Sid {
        self.asset.sid
    }

    fn update(&mut self, txn: &Transaction) {
        let total_shares = self.amount + txn.amount;

        if total_shares == 0 {
            self.cost_basis = 0.0;
        } else if self.amount.signum() != txn.amount.signum() && txn.amount.signum() != 0 {
            // Opposite-side fill.
            if txn.amount.abs() > self.amount.abs() {
                // Crossed through zero: the excess opens a fresh position
                // whose basis is this fill's price.
                self.cost_basis = txn.price;
            }
            // A pure reduction keeps the old basis.
        } else {
            let prev_cost = self.cost_basis * self.amount as f64;
            let txn_cost = txn.price * txn.amount as f64;
            self.cost_basis = (prev_cost + txn_cost) / total_shares as f64;
        }

        self.amount = total_shares;
        self.last_sale_price = txn.price;
        self.last_sale_date = Some(txn.dt);
    }

    /// Apply a split with share ratio `ratio` (2.0 for a 2-for-1 split).
    /// Returns the cash value of the fractional share remainder.
    fn handle_split(&mut self, ratio: f64) -> f64 {
        let raw_share_count = self.amount as f64 * ratio;
        let full_share_count = raw_share_count.floor();
        let fractional_share_count = raw_share_count - full_share_count;

        let new_price = self.last_sale_price / ratio;
        let new_cost_basis = round_to_cents(self.cost_basis / ratio);

        self.amount = full_share_count as i64;
        self.cost_basis = new_cost_basis;
        self.last_sale_price = new_price;

        fractional_share_count * new_price
    }

    /// Fold a commission into the cost basis so unrealized PnL reflects it.
    fn adjust_commission_cost_basis(&mut self, cost: f64) {
        if self.amount == 0 || cost == 0.0 {
            return;
        }
        let prev_cost = self.cost_basis * self.amount as f64;
        let cost_to_use = if self.asset.kind.is_cash_settled() {
            cost / self.asset.price_multiplier
        } else {
            cost
        };
        self.cost_basis = (prev_cost + cost_to_use) / self.amount as f64;
    }

    /// Notional exposure: signed market value scaled by the contract
    /// multiplier.
    pub fn exposure(&self) -> f64 {
        self.amount as f64 * self.last_sale_price * self.asset.price_multiplier
    }

    /// Market value. Futures are cash-settled, so they contribute exposure
    /// but no value.
    pub fn market_value(&self) -> f64 {
        if self.asset.kind.is_cash_settled() {
            0.0
        } else {
            self.amount as f64 * self.last_sale_price
        }
    }
}

fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ================================================================================================
// Position Stats
// ================================================================================================

/// One-pass aggregate over all open positions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionStats {
    pub gross_value: f64,
    pub net_value: f64,
    pub long_value: f64,
    pub short_value: f64,
    pub gross_exposure: f64,
    pub net_exposure: f64,
    pub long_exposure: f64,
    pub short_exposure: f64,
    pub longs_count: usize,
    pub shorts_count: usize,
}

// ================================================================================================
// Position Tracker
// ================================================================================================

/// A scheduled cash payout from a dividend earned on its ex-date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct CashPayment {
    sid: Sid,
    cash: f64,
}

/// A scheduled share payout from a stock dividend earned on its ex-date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct SharePayment {
    payment_sid: Sid,
    shares: i64,
}

/// Maintains the set of open positions and everything that mutates them:
/// fills, splits, dividends and auto-close liquidations.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    positions: BTreeMap<Sid, Position>,
    unpaid_dividends: BTreeMap<NaiveDate, Vec<CashPayment>>,
    unpaid_stock_dividends: BTreeMap<NaiveDate, Vec<SharePayment>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positions(&self) -> &BTreeMap<Sid, Position> {
        &self.positions
    }

    pub fn position(&self, sid: Sid) -> Option<&Position> {
        self.positions.get(&sid)
    }

    pub fn position_amount(&self, sid: Sid) -> i64 {
        self.positions.get(&sid).map(|p| p.amount).unwrap_or(0)
    }

    pub fn held_sids(&self) -> impl Iterator<Item = Sid> + '_ {
        self.positions.keys().copied()
    }

    /// Apply a fill. Zero-amount positions are dropped.
    pub fn execute_transaction(&mut self, asset: &Asset, txn: &Transaction) {
        let position = self
            .positions
            .entry(asset.sid)
            .or_insert_with(|| Position::new(asset.clone()));
        position.update(txn);
        if position.amount == 0 {
            self.positions.remove(&asset.sid);
        }
    }

    /// Refresh `last_sale_price` of every held position from the bundle's
    /// close at `dt`. Assets without a quote keep their prior value.
    pub fn sync_last_sale_prices(&mut self, dt: DateTime<Utc>, bundle: &BundleData) {
        let frequency = bundle.frequency();
        for position in self.positions.values_mut() {
            if let Ok(price) = bundle.spot_value(position.sid(), BarField::Close, dt, frequency)
                && !price.is_nan()
            {
                position.last_sale_price = price;
                position.last_sale_date = Some(dt);
            }
        }
    }

    /// Apply splits to any affected position. Returns the cash equivalent of
    /// all fractional-share remainders.
    pub fn handle_splits(&mut self, splits: &[Split]) -> f64 {
        let mut leftover_cash = 0.0;
        for split in splits {
            if let Some(position) = self.positions.get_mut(&split.sid) {
                tracing::debug!(sid = %split.sid, ratio = split.ratio, "applying split");
                leftover_cash += position.handle_split(split.ratio);
                if position.amount == 0 {
                    self.positions.remove(&split.sid);
                }
            }
        }
        leftover_cash
    }

    pub fn handle_commission(&mut self, sid: Sid, cost: f64) {
        if let Some(position) = self.positions.get_mut(&sid) {
            position.adjust_commission_cost_basis(cost);
        }
    }

    /// Record dividends going ex today. Earning a dividend only schedules
    /// the payout for its pay-date; cash moves in [`Self::pay_dividends`].
    pub fn earn_dividends(&mut self, cash_dividends: &[Dividend], stock_dividends: &[StockDividend]) {
        for dividend in cash_dividends {
            let amount = self.position_amount(dividend.sid);
            if amount == 0 {
                continue;
            }
            let cash = amount as f64 * dividend.amount;
            tracing::debug!(
                sid = %dividend.sid,
                cash,
                pay_date = %dividend.pay_date,
                "dividend earned"
            );
            self.unpaid_dividends
                .entry(dividend.pay_date)
                .or_default()
                .push(CashPayment {
                    sid: dividend.sid,
                    cash,
                });
        }

        for dividend in stock_dividends {
            let amount = self.position_amount(dividend.sid);
            if amount == 0 {
                continue;
            }
            let shares = (dividend.ratio * amount as f64).floor() as i64;
            if shares == 0 {
                continue;
            }
            self.unpaid_stock_dividends
                .entry(dividend.pay_date)
                .or_default()
                .push(SharePayment {
                    payment_sid: dividend.payment_sid,
                    shares,
                });
        }
    }

    /// Cash due on `date`; also materializes stock dividends as positions.
    pub fn pay_dividends(
        &mut self,
        date: NaiveDate,
        assets: &AssetRepository,
    ) -> TradesimResult<f64> {
        let cash = self
            .unpaid_dividends
            .remove(&date)
            .map(|payments| payments.iter().map(|p| p.cash).sum())
            .unwrap_or(0.0);

        if let Some(payments) = self.unpaid_stock_dividends.remove(&date) {
            for payment in payments {
                let asset = assets.retrieve(payment.payment_sid)?.clone();
                let position = self
                    .positions
                    .entry(payment.payment_sid)
                    .or_insert_with(|| Position::new(asset));
                position.amount += payment.shares;
            }
        }
        Ok(cash)
    }

    /// Fabricate a transaction flattening the position at its last known
    /// price, used when the asset hits its auto-close date.
    pub fn maybe_create_close_position_transaction(
        &self,
        sid: Sid,
        dt: DateTime<Utc>,
    ) -> Option<Transaction> {
        let position = self.positions.get(&sid)?;
        if position.amount == 0 {
            return None;
        }
        Some(Transaction {
            order_id: None,
            sid,
            amount: -position.amount,
            price: position.last_sale_price,
            dt,
            commission: None,
        })
    }

    /// Gross/net exposure and value in one pass over the positions.
    pub fn stats(&self) -> PositionStats {
        let mut stats = PositionStats::default();
        for position in self.positions.values() {
            let value = position.market_value();
            let exposure = position.exposure();

            if position.amount > 0 {
                stats.longs_count += 1;
                stats.long_value += value;
                stats.long_exposure += exposure;
            } else if position.amount < 0 {
                stats.shorts_count += 1;
                stats.short_value += value;
                stats.short_exposure += exposure;
            }

            stats.gross_value += value.abs();
            stats.net_value += value;
            stats.gross_exposure += exposure.abs();
            stats.net_exposure += exposure;
        }
        stats
    }
}
