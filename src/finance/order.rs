use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::{
    assets::Sid,
    error::{OrderError, TradesimResult},
};

// ================================================================================================
// Identifiers & Styles
// ================================================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an order is to be executed. Limit and stop prices must be strictly
/// positive; violations are rejected before the order reaches the blotter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExecutionStyle {
    Market,
    Limit { limit_price: f64 },
    Stop { stop_price: f64 },
    StopLimit { limit_price: f64, stop_price: f64 },
}

impl ExecutionStyle {
    pub fn limit_price(&self) -> Option<f64> {
        match self {
            ExecutionStyle::Limit { limit_price }
            | ExecutionStyle::StopLimit { limit_price, .. } => Some(*limit_price),
            _ => None,
        }
    }

    pub fn stop_price(&self) -> Option<f64> {
        match self {
            ExecutionStyle::Stop { stop_price } | ExecutionStyle::StopLimit { stop_price, .. } => {
                Some(*stop_price)
            }
            _ => None,
        }
    }

    pub fn validate(&self) -> TradesimResult<()> {
        let bad = |name: &str, value: f64| {
            Err(OrderError::UnsupportedOrderParameters(format!(
                "{name} price must be strictly positive, got {value}"
            ))
            .into())
        };
        if let Some(limit) = self.limit_price()
            && !(limit > 0.0 && limit.is_finite())
        {
            return bad("limit", limit);
        }
        if let Some(stop) = self.stop_price()
            && !(stop > 0.0 && stop.is_finite())
        {
            return bad("stop", stop);
        }
        Ok(())
    }

    /// Split adjustment: prices divide by the share ratio, rounded to cents.
    fn handle_split(&mut self, ratio: f64) {
        let adjust = |price: &mut f64| *price = (*price / ratio * 100.0).round() / 100.0;
        match self {
            ExecutionStyle::Market => {}
            ExecutionStyle::Limit { limit_price } => adjust(limit_price),
            ExecutionStyle::Stop { stop_price } => adjust(stop_price),
            ExecutionStyle::StopLimit {
                limit_price,
                stop_price,
            } => {
                adjust(limit_price);
                adjust(stop_price);
            }
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Held,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

// ================================================================================================
// Order
// ================================================================================================

/// A single order through its whole lifecycle. Created by a strategy call
/// during a bar, matched on subsequent bars, and swept by the cancellation
/// policy at session end if still open.
///
/// Invariants: `|filled| <= |amount|`; `sign(filled) == sign(amount)` once
/// any fill has occurred; terminal statuses are absorbing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub sid: Sid,
    /// Signed share count; positive buys, negative sells.
    pub amount: i64,
    pub created_dt: DateTime<Utc>,
    /// Last-modified timestamp.
    pub dt: DateTime<Utc>,
    pub style: ExecutionStyle,
    pub filled: i64,
    pub commission: f64,
    pub status: OrderStatus,
    pub reason: Option<String>,
    stop_reached: bool,
    limit_reached: bool,
}

impl Order {
    pub fn new(id: OrderId, sid: Sid, amount: i64, style: ExecutionStyle, dt: DateTime<Utc>) -> Self {
        Self {
            id,
            sid,
            amount,
            created_dt: dt,
            dt,
            style,
            filled: 0,
            commission: 0.0,
            status: OrderStatus::Open,
            reason: None,
            stop_reached: false,
            limit_reached: false,
        }
    }

    pub fn is_buy(&self) -> bool {
        self.amount > 0
    }

    /// Shares still to fill, signed like `amount`.
    pub fn remaining(&self) -> i64 {
        self.amount - self.filled
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::Held)
    }

    /// Update stop/limit trigger state against a traded price. Once a stop
    /// is reached it stays reached; the order then behaves as a market
    /// (Stop) or limit (StopLimit) order.
    pub fn check_triggers(&mut self, price: f64) {
        if price.is_nan() {
            return;
        }
        if let Some(stop) = self.style.stop_price()
            && !self.stop_reached
        {
            let crossed = if self.is_buy() {
                price >= stop
            } else {
                price <= stop
            };
            if crossed {
                self.stop_reached = true;
            }
        }
        if let Some(limit) = self.style.limit_price() {
            self.limit_reached = if self.is_buy() {
                price <= limit
            } else {
                price >= limit
            };
        }
    }

    /// Whether the order is currently eligible for matching.
    pub fn triggered(&self) -> bool {
        match self.style {
            ExecutionStyle::Market => true,
            ExecutionStyle::Limit { .. } => self.limit_reached,
            ExecutionStyle::Stop { .. } => self.stop_reached,
            ExecutionStyle::StopLimit { .. } => self.stop_reached && self.limit_reached,
        }
    }

    /// Record a fill of `amount` shares, accruing `commission_delta`.
    pub fn fill(
        &mut self,
        amount: i64,
        commission_delta: f64,
        dt: DateTime<Utc>,
    ) -> TradesimResult<()> {
        let new_filled = self.filled + amount;
        if new_filled.abs() > self.amount.abs() {
            return Err(crate::error::LedgerError::Overfill {
                order_id: self.id.to_string(),
                filled: new_filled,
                amount: self.amount,
            }
            .into());
        }
        if amount.signum() != self.amount.signum() {
            return Err(crate::error::LedgerError::SignMismatch {
                order_id: self.id.to_string(),
            }
            .into());
        }
        self.filled = new_filled;
        self.commission += commission_delta;
        self.dt = dt;
        if self.remaining() == 0 {
            self.status = OrderStatus::Filled;
        }
        Ok(())
    }

    pub fn cancel(&mut self, dt: DateTime<Utc>, reason: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = OrderStatus::Cancelled;
        self.reason = reason;
        self.dt = dt;
    }

    pub fn reject(&mut self, dt: DateTime<Utc>, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = OrderStatus::Rejected;
        self.reason = Some(reason.into());
        self.dt = dt;
    }

    /// Broker-style hold: the order stays alive but is skipped by the
    /// matcher until released back to Open.
    pub fn hold(&mut self, dt: DateTime<Utc>, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = OrderStatus::Held;
        self.reason = Some(reason.into());
        self.dt = dt;
    }

    pub fn release(&mut self, dt: DateTime<Utc>) {
        if self.status == OrderStatus::Held {
            self.status = OrderStatus::Open;
            self.reason = None;
            self.dt = dt;
        }
    }

    /// Scale share counts by the split ratio and divide stop/limit prices,
    /// rounding prices to cents.
    pub fn handle_split(&mut self, ratio: f64) {
        self.amount = (self.amount as f64 * ratio).floor() as i64;
        self.filled = (self.filled as f64 * ratio).floor() as i64;
        self.style.handle_split(ratio);
    }
}

// ================================================================================================
// Transaction
// ================================================================================================

/// One fill against an order. `sign(amount) == sign(order.amount)`; each
/// transaction decrements the order's remaining amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub order_id: Option<OrderId>,
    pub sid: Sid,
    pub amount: i64,
    pub price: f64,
    pub dt: DateTime<Utc>,
    pub commission: Option<f64>,
}
