use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use smallvec::SmallVec;

use crate::{
    assets::{AssetRepository, Sid},
    data::{BarData, Split},
    error::{OrderError, TradesimResult},
    finance::{
        commission::{CommissionModel, PerShare},
        order::{ExecutionStyle, Order, OrderId, OrderStatus, Transaction},
        slippage::{SlippageModel, VolumeShareSlippage},
    },
    sim::clock::ClockEventKind,
};

// ================================================================================================
// Cancel Policy
// ================================================================================================

/// What happens to still-open orders when the session ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CancelPolicy {
    /// Cancel all open orders at SessionEnd.
    EodCancel { warn_on_cancel: bool },
    /// Leave open orders alive across sessions.
    NeverCancel,
}

impl CancelPolicy {
    fn should_cancel(&self, event: ClockEventKind) -> bool {
        match self {
            CancelPolicy::EodCancel { .. } => event == ClockEventKind::SessionEnd,
            CancelPolicy::NeverCancel => false,
        }
    }

    fn warn_on_cancel(&self) -> bool {
        matches!(
            self,
            CancelPolicy::EodCancel {
                warn_on_cancel: true
            }
        )
    }
}

/// A commission accrued by one fill, routed to the ledger alongside its
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommissionEvent {
    pub sid: Sid,
    pub order_id: OrderId,
    pub cost: f64,
}

// ================================================================================================
// Blotter
// ================================================================================================

/// The simulated exchange: keeps every order ever placed, matches the open
/// ones against incoming bars through the slippage model, and accrues
/// commissions into orders.
///
/// Open orders per asset are matched in insertion order and each open order
/// gets at most one slippage call per bar. Orders placed during a bar are not
/// visible to the matcher until the next bar.
#[derive(Debug)]
pub struct Blotter {
    orders: BTreeMap<OrderId, Order>,
    open_orders: BTreeMap<Sid, SmallVec<[OrderId; 4]>>,
    new_orders: Vec<OrderId>,
    cancel_policy: CancelPolicy,
    equity_slippage: Box<dyn SlippageModel>,
    future_slippage: Box<dyn SlippageModel>,
    equity_commission: Box<dyn CommissionModel>,
    future_commission: Box<dyn CommissionModel>,
    current_dt: Option<DateTime<Utc>>,
    /// Sequential id source; deterministic ids keep identical runs
    /// byte-identical.
    next_order_ordinal: u128,
}

impl Default for Blotter {
    fn default() -> Self {
        Self {
            orders: BTreeMap::new(),
            open_orders: BTreeMap::new(),
            new_orders: Vec::new(),
            cancel_policy: CancelPolicy::EodCancel {
                warn_on_cancel: true,
            },
            equity_slippage: Box::new(VolumeShareSlippage::default()),
            future_slippage: Box::new(VolumeShareSlippage::default()),
            equity_commission: Box::new(PerShare::default()),
            future_commission: Box::new(PerShare::default()),
            current_dt: None,
            next_order_ordinal: 1,
        }
    }
}

impl Blotter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_date(&mut self, dt: DateTime<Utc>) {
        self.current_dt = Some(dt);
    }

    /// The bar timestamp most recently announced by the driver.
    pub fn current_dt(&self) -> Option<DateTime<Utc>> {
        self.current_dt
    }

    pub fn set_cancel_policy(&mut self, policy: CancelPolicy) {
        self.cancel_policy = policy;
    }

    pub fn set_equity_slippage(&mut self, model: Box<dyn SlippageModel>) {
        self.equity_slippage = model;
    }

    pub fn set_future_slippage(&mut self, model: Box<dyn SlippageModel>) {
        self.future_slippage = model;
    }

    pub fn set_equity_commission(&mut self, model: Box<dyn CommissionModel>) {
        self.equity_commission = model;
    }

    pub fn set_future_commission(&mut self, model: Box<dyn CommissionModel>) {
        self.future_commission = model;
    }

    // --------------------------------------------------------------------------------------------
    // Order intake
    // --------------------------------------------------------------------------------------------

    /// Place an order. Zero-amount orders are a no-op.
    pub fn order(
        &mut self,
        sid: Sid,
        amount: i64,
        style: ExecutionStyle,
        dt: DateTime<Utc>,
    ) -> TradesimResult<Option<OrderId>> {
        if amount == 0 {
            return Ok(None);
        }
        style.validate()?;

        let id = OrderId(uuid::Uuid::from_u128(self.next_order_ordinal));
        self.next_order_ordinal += 1;
        let order = Order::new(id, sid, amount, style, dt);
        tracing::debug!(%id, %sid, amount, "order placed");

        self.open_orders.entry(sid).or_default().push(id);
        self.new_orders.push(id);
        self.orders.insert(id, order);
        Ok(Some(id))
    }

    pub fn get_order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    /// Open orders for one asset, in insertion order.
    pub fn open_orders_for(&self, sid: Sid) -> Vec<Order> {
        self.open_orders
            .get(&sid)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.orders.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All open orders grouped by asset.
    pub fn all_open_orders(&self) -> BTreeMap<Sid, Vec<Order>> {
        self.open_orders
            .keys()
            .map(|&sid| (sid, self.open_orders_for(sid)))
            .collect()
    }

    pub fn open_order_sids(&self) -> impl Iterator<Item = Sid> + '_ {
        self.open_orders.keys().copied()
    }

    pub fn has_open_orders(&self) -> bool {
        self.open_orders.values().any(|ids| !ids.is_empty())
    }

    /// Orders created or transitioned since the last drain.
    pub fn drain_new_orders(&mut self) -> Vec<Order> {
        let ids = std::mem::take(&mut self.new_orders);
        ids.iter()
            .filter_map(|id| self.orders.get(id))
            .cloned()
            .collect()
    }

    // --------------------------------------------------------------------------------------------
    // Matching
    // --------------------------------------------------------------------------------------------

    /// Match all open orders against the current bar data.
    ///
    /// Returns the produced transactions, the commission events they accrued,
    /// and the ids of orders that reached a terminal state and should be
    /// pruned.
    #[tracing::instrument(skip(self, bar_data, assets), fields(dt = %bar_data.current_dt()))]
    pub fn get_transactions(
        &mut self,
        bar_data: &BarData<'_>,
        assets: &AssetRepository,
    ) -> TradesimResult<(Vec<Transaction>, Vec<CommissionEvent>, Vec<OrderId>)> {
        let dt = bar_data.current_dt();
        let mut transactions = Vec::new();
        let mut commissions = Vec::new();
        let mut closed = Vec::new();

        let book: Vec<(Sid, SmallVec<[OrderId; 4]>)> = self
            .open_orders
            .iter()
            .map(|(&sid, ids)| (sid, ids.clone()))
            .collect();

        for (sid, order_ids) in book {
            let Some(bar) = bar_data.current_bar(sid) else {
                continue;
            };
            // A stale bar means the asset did not trade this bar: nothing to
            // match against.
            if bar.dt != dt {
                continue;
            }
            let kind = assets.retrieve(sid)?.kind;
            let slippage: &dyn SlippageModel = if kind.is_cash_settled() {
                self.future_slippage.as_ref()
            } else {
                self.equity_slippage.as_ref()
            };
            let commission_model: &dyn CommissionModel = if kind.is_cash_settled() {
                self.future_commission.as_ref()
            } else {
                self.equity_commission.as_ref()
            };
            let mut volume_consumed = 0.0;

            for id in order_ids {
                let order = self
                    .orders
                    .get_mut(&id)
                    .ok_or_else(|| OrderError::UnknownOrderId(id.to_string()))?;
                if order.status != OrderStatus::Open {
                    continue;
                }

                order.check_triggers(bar.close);
                if !order.triggered() {
                    continue;
                }

                let Some(fill) = slippage.process_order(&bar, order, volume_consumed) else {
                    continue;
                };
                if fill.amount == 0 {
                    continue;
                }
                // Defensive clamp of the model contract.
                let amount = if fill.amount.abs() > order.remaining().abs() {
                    order.remaining()
                } else {
                    fill.amount
                };

                let mut txn = Transaction {
                    order_id: Some(id),
                    sid,
                    amount,
                    price: fill.price,
                    dt,
                    commission: None,
                };
                let cost = commission_model.calculate(order, &txn);
                txn.commission = Some(cost);

                order.fill(amount, cost, dt)?;
                volume_consumed += amount.abs() as f64;

                tracing::debug!(
                    order = %id,
                    %sid,
                    amount,
                    price = fill.price,
                    cost,
                    "order matched"
                );

                if cost != 0.0 {
                    commissions.push(CommissionEvent {
                        sid,
                        order_id: id,
                        cost,
                    });
                }
                if order.status == OrderStatus::Filled {
                    closed.push(id);
                }
                transactions.push(txn);
            }
        }

        Ok((transactions, commissions, closed))
    }

    /// Remove closed orders from the open-order books. They remain in the
    /// full order map.
    pub fn prune_orders(&mut self, closed: &[OrderId]) {
        for id in closed {
            if let Some(order) = self.orders.get(id)
                && let Some(ids) = self.open_orders.get_mut(&order.sid)
            {
                ids.retain(|open_id| open_id != id);
                if ids.is_empty() {
                    self.open_orders.remove(&order.sid);
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Cancellation & status overrides
    // --------------------------------------------------------------------------------------------

    /// Cancel one order. Idempotent on terminal orders.
    pub fn cancel(&mut self, id: OrderId, dt: DateTime<Utc>, reason: Option<String>) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }
        order.cancel(dt, reason);
        let sid = order.sid;
        if let Some(ids) = self.open_orders.get_mut(&sid) {
            ids.retain(|open_id| *open_id != id);
            if ids.is_empty() {
                self.open_orders.remove(&sid);
            }
        }
        self.new_orders.push(id);
    }

    pub fn cancel_all_orders_for_asset(&mut self, sid: Sid, dt: DateTime<Utc>, warn: bool) {
        let Some(ids) = self.open_orders.remove(&sid) else {
            return;
        };
        for id in ids {
            if let Some(order) = self.orders.get_mut(&id) {
                if warn {
                    tracing::warn!(order = %id, %sid, "cancelling open order");
                }
                order.cancel(dt, None);
                self.new_orders.push(id);
            }
        }
    }

    /// Broker-style rejection of a live order.
    pub fn reject(&mut self, id: OrderId, dt: DateTime<Utc>, reason: impl Into<String>) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }
        order.reject(dt, reason);
        let sid = order.sid;
        if let Some(ids) = self.open_orders.get_mut(&sid) {
            ids.retain(|open_id| *open_id != id);
            if ids.is_empty() {
                self.open_orders.remove(&sid);
            }
        }
        self.new_orders.push(id);
    }

    /// Broker-style hold: the order stays in the open book but is skipped by
    /// the matcher until released.
    pub fn hold(&mut self, id: OrderId, dt: DateTime<Utc>, reason: impl Into<String>) {
        if let Some(order) = self.orders.get_mut(&id)
            && !order.status.is_terminal()
        {
            order.hold(dt, reason);
            self.new_orders.push(id);
        }
    }

    pub fn release(&mut self, id: OrderId, dt: DateTime<Utc>) {
        if let Some(order) = self.orders.get_mut(&id)
            && order.status == OrderStatus::Held
        {
            order.release(dt);
            self.new_orders.push(id);
        }
    }

    /// Adjust open-order share counts and stop/limit prices for splits.
    pub fn process_splits(&mut self, splits: &[Split]) {
        for split in splits {
            let Some(ids) = self.open_orders.get(&split.sid) else {
                continue;
            };
            for id in ids.clone() {
                if let Some(order) = self.orders.get_mut(&id) {
                    order.handle_split(split.ratio);
                }
            }
        }
    }

    /// Apply the configured cancel policy for a clock event.
    pub fn execute_cancel_policy(&mut self, event: ClockEventKind, dt: DateTime<Utc>) {
        if !self.cancel_policy.should_cancel(event) {
            return;
        }
        let warn = self.cancel_policy.warn_on_cancel();
        let sids: Vec<Sid> = self.open_orders.keys().copied().collect();
        for sid in sids {
            self.cancel_all_orders_for_asset(sid, dt, warn);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::{
        assets::Asset,
        calendar::TradingCalendar,
        data::{AdjustmentRepository, Bar, BarStore, BundleData, Frequency},
        finance::slippage::NoSlippage,
    };

    use super::*;

    fn ts(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, d, h, m, 0).unwrap()
    }

    fn bundle_with_closes(closes: &[(u32, f64, f64)]) -> BundleData {
        let calendar = TradingCalendar::from_name(
            "XNYS",
            chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
        )
        .unwrap();
        let mut assets = AssetRepository::new();
        assets
            .insert(Asset::equity(
                Sid(1),
                "ACME",
                "XNYS",
                ts(1, 0, 0),
                Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            ))
            .unwrap();
        let mut bars = BarStore::new(Frequency::DAILY);
        for &(day, close, volume) in closes {
            bars.push_bar(
                Sid(1),
                Bar {
                    dt: ts(day, 21, 0),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume,
                },
            )
            .unwrap();
        }
        BundleData::new(
            "t",
            "v1",
            calendar,
            bars,
            assets,
            AdjustmentRepository::new(),
        )
    }

    fn no_slippage_blotter() -> Blotter {
        let mut blotter = Blotter::new();
        blotter.set_equity_slippage(Box::new(NoSlippage));
        blotter.set_equity_commission(Box::new(PerShare {
            cost_per_share: 0.01,
            min_trade_cost: 1.0,
        }));
        blotter
    }

    #[test]
    fn market_order_fills_at_close_with_commission() {
        let bundle = bundle_with_closes(&[(3, 100.0, 1000.0)]);
        let mut blotter = no_slippage_blotter();

        blotter
            .order(Sid(1), 10, ExecutionStyle::Market, ts(3, 14, 31))
            .unwrap()
            .unwrap();

        let data = BarData::new(&bundle, ts(3, 21, 0), Frequency::DAILY);
        let (txns, commissions, closed) = blotter
            .get_transactions(&data, bundle.asset_repository())
            .unwrap();

        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].amount, 10);
        assert_eq!(txns[0].price, 100.0);
        assert_eq!(commissions.len(), 1);
        assert_eq!(commissions[0].cost, 1.0);
        assert_eq!(closed.len(), 1);

        blotter.prune_orders(&closed);
        assert!(!blotter.has_open_orders());
        let order = blotter.get_order(txns[0].order_id.unwrap()).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.commission, 1.0);
    }

    #[test]
    fn limit_buy_waits_for_price() {
        let bundle = bundle_with_closes(&[(3, 100.0, 1000.0)]);
        let mut blotter = no_slippage_blotter();
        blotter
            .order(
                Sid(1),
                10,
                ExecutionStyle::Limit { limit_price: 1.0 },
                ts(3, 14, 31),
            )
            .unwrap();

        let data = BarData::new(&bundle, ts(3, 21, 0), Frequency::DAILY);
        let (txns, _, closed) = blotter
            .get_transactions(&data, bundle.asset_repository())
            .unwrap();
        assert!(txns.is_empty());
        assert!(closed.is_empty());
        assert!(blotter.has_open_orders());
    }

    #[test]
    fn eod_cancel_empties_the_book() {
        let mut blotter = no_slippage_blotter();
        let id = blotter
            .order(
                Sid(1),
                10,
                ExecutionStyle::Limit { limit_price: 1.0 },
                ts(3, 14, 31),
            )
            .unwrap()
            .unwrap();

        blotter.execute_cancel_policy(ClockEventKind::SessionEnd, ts(3, 21, 0));
        assert!(!blotter.has_open_orders());
        let order = blotter.get_order(id).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled, 0);

        // Cancelling again is a no-op.
        blotter.cancel(id, ts(3, 21, 0), None);
        assert_eq!(blotter.get_order(id).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn never_cancel_keeps_orders_across_sessions() {
        let mut blotter = no_slippage_blotter();
        blotter.set_cancel_policy(CancelPolicy::NeverCancel);
        blotter
            .order(
                Sid(1),
                10,
                ExecutionStyle::Limit { limit_price: 1.0 },
                ts(3, 14, 31),
            )
            .unwrap();
        blotter.execute_cancel_policy(ClockEventKind::SessionEnd, ts(3, 21, 0));
        assert!(blotter.has_open_orders());
    }

    #[test]
    fn held_orders_are_skipped_by_the_matcher() {
        let bundle = bundle_with_closes(&[(3, 100.0, 1000.0)]);
        let mut blotter = no_slippage_blotter();
        let id = blotter
            .order(Sid(1), 10, ExecutionStyle::Market, ts(3, 14, 31))
            .unwrap()
            .unwrap();
        blotter.hold(id, ts(3, 14, 32), "margin review");

        let data = BarData::new(&bundle, ts(3, 21, 0), Frequency::DAILY);
        let (txns, _, _) = blotter
            .get_transactions(&data, bundle.asset_repository())
            .unwrap();
        assert!(txns.is_empty());

        blotter.release(id, ts(3, 21, 0));
        let (txns, _, _) = blotter
            .get_transactions(&data, bundle.asset_repository())
            .unwrap();
        assert_eq!(txns.len(), 1);
    }

    #[test]
    fn new_orders_drain_once() {
        let mut blotter = no_slippage_blotter();
        blotter
            .order(Sid(1), 10, ExecutionStyle::Market, ts(3, 14, 31))
            .unwrap();
        assert_eq!(blotter.drain_new_orders().len(), 1);
        assert!(blotter.drain_new_orders().is_empty());
    }

    #[test]
    fn split_rescales_open_orders() {
        let mut blotter = no_slippage_blotter();
        let id = blotter
            .order(
                Sid(1),
                10,
                ExecutionStyle::Limit { limit_price: 100.0 },
                ts(3, 14, 31),
            )
            .unwrap()
            .unwrap();
        blotter.process_splits(&[Split {
            sid: Sid(1),
            ratio: 2.0,
            effective_date: chrono::NaiveDate::from_ymd_opt(2023, 1, 4).unwrap(),
        }]);
        let order = blotter.get_order(id).unwrap();
        assert_eq!(order.amount, 20);
        assert_eq!(order.style.limit_price(), Some(50.0));
    }

    #[test]
    fn missing_bar_leaves_orders_open() {
        // Only a Jan 3rd bar exists; matching on Jan 4th has no fresh bar.
        let bundle = bundle_with_closes(&[(3, 100.0, 1000.0)]);
        let mut blotter = no_slippage_blotter();
        blotter
            .order(Sid(1), 10, ExecutionStyle::Market, ts(3, 21, 0))
            .unwrap();

        let data = BarData::new(&bundle, ts(4, 21, 0), Frequency::DAILY);
        let (txns, _, _) = blotter
            .get_transactions(&data, bundle.asset_repository())
            .unwrap();
        assert!(txns.is_empty());
        assert!(blotter.has_open_orders());
    }
}
