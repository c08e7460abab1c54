use crate::finance::order::{Order, Transaction};

/// Computes the incremental commission owed for one fill of an order.
///
/// The order carries its cumulative commission, so models can implement
/// order-level minimums: the returned value is only the new cost of this
/// transaction.
pub trait CommissionModel: std::fmt::Debug + Send + Sync {
    fn calculate(&self, order: &Order, txn: &Transaction) -> f64;
}

impl CommissionModel for Box<dyn CommissionModel> {
    fn calculate(&self, order: &Order, txn: &Transaction) -> f64 {
        (**self).calculate(order, txn)
    }
}

// ================================================================================================
// Per Share
// ================================================================================================

/// A fixed cost per share traded, with an order-level minimum applied on the
/// first fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerShare {
    pub cost_per_share: f64,
    pub min_trade_cost: f64,
}

impl Default for PerShare {
    fn default() -> Self {
        Self {
            cost_per_share: 0.001,
            min_trade_cost: 0.0,
        }
    }
}

impl CommissionModel for PerShare {
    fn calculate(&self, order: &Order, txn: &Transaction) -> f64 {
        let cost_for_fill = txn.amount.abs() as f64 * self.cost_per_share;
        let total_cost = order.commission + cost_for_fill;
        // The cumulative commission is floored at the minimum; earlier fills
        // already paid `order.commission` of it.
        total_cost.max(self.min_trade_cost) - order.commission
    }
}

// ================================================================================================
// Per Trade
// ================================================================================================

/// A flat cost per order, charged in full on the first fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerTrade {
    pub cost: f64,
}

impl Default for PerTrade {
    fn default() -> Self {
        Self { cost: 0.0 }
    }
}

impl CommissionModel for PerTrade {
    fn calculate(&self, order: &Order, _txn: &Transaction) -> f64 {
        if order.commission == 0.0 { self.cost } else { 0.0 }
    }
}

// ================================================================================================
// Per Dollar
// ================================================================================================

/// A cost proportional to the traded notional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerDollar {
    pub cost_per_dollar: f64,
}

impl Default for PerDollar {
    fn default() -> Self {
        Self {
            cost_per_dollar: 0.0015,
        }
    }
}

impl CommissionModel for PerDollar {
    fn calculate(&self, _order: &Order, txn: &Transaction) -> f64 {
        txn.amount.abs() as f64 * txn.price * self.cost_per_dollar
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::{
        assets::Sid,
        finance::order::{ExecutionStyle, Order},
    };

    use super::*;

    fn order_with_commission(commission: f64) -> Order {
        let mut order = Order::new(
            crate::finance::order::OrderId::fresh(),
            Sid(1),
            100,
            ExecutionStyle::Market,
            Utc.with_ymd_and_hms(2023, 1, 3, 14, 30, 0).unwrap(),
        );
        order.commission = commission;
        order
    }

    fn txn(amount: i64, price: f64) -> Transaction {
        Transaction {
            order_id: None,
            sid: Sid(1),
            amount,
            price,
            dt: Utc.with_ymd_and_hms(2023, 1, 3, 14, 31, 0).unwrap(),
            commission: None,
        }
    }

    #[test]
    fn per_share_floors_first_fill_at_minimum() {
        let model = PerShare {
            cost_per_share: 0.01,
            min_trade_cost: 1.0,
        };
        // 10 shares at a cent each would be 0.10; the minimum lifts it to 1.
        let cost = model.calculate(&order_with_commission(0.0), &txn(10, 100.0));
        assert_eq!(cost, 1.0);
    }

    #[test]
    fn per_share_minimum_is_not_charged_twice() {
        let model = PerShare {
            cost_per_share: 0.01,
            min_trade_cost: 1.0,
        };
        // The order already paid the 1.00 minimum; a further 50-share fill
        // owes only the excess over it.
        let cost = model.calculate(&order_with_commission(1.0), &txn(50, 100.0));
        // total = 1.0 + 0.5 = 1.5, floored at 1.0, minus already-paid 1.0.
        assert!((cost - 0.5).abs() < 1e-12);
    }

    #[test]
    fn per_trade_charges_only_once() {
        let model = PerTrade { cost: 5.0 };
        assert_eq!(model.calculate(&order_with_commission(0.0), &txn(10, 1.0)), 5.0);
        assert_eq!(model.calculate(&order_with_commission(5.0), &txn(10, 1.0)), 0.0);
    }

    #[test]
    fn per_dollar_scales_with_notional() {
        let model = PerDollar {
            cost_per_dollar: 0.0015,
        };
        let cost = model.calculate(&order_with_commission(0.0), &txn(-10, 100.0));
        assert!((cost - 1.5).abs() < 1e-12);
    }
}
