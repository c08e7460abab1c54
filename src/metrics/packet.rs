use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    assets::Sid,
    calendar::Session,
    finance::{
        order::{Order, Transaction},
        position::Position,
    },
};

/// A snapshot of one position as reported in performance packets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub sid: Sid,
    pub symbol: String,
    pub amount: i64,
    pub cost_basis: f64,
    pub last_sale_price: f64,
    pub last_sale_date: Option<DateTime<Utc>>,
}

impl From<&Position> for PositionSnapshot {
    fn from(position: &Position) -> Self {
        Self {
            sid: position.sid(),
            symbol: position.asset.symbol.clone(),
            amount: position.amount,
            cost_basis: position.cost_basis,
            last_sale_price: position.last_sale_price,
            last_sale_date: position.last_sale_date,
        }
    }
}

/// Benchmark-relative statistics computed cumulatively from the daily
/// returns array. Values are NaN until enough history exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CumulativeRiskMetrics {
    pub algorithm_period_return: f64,
    pub benchmark_period_return: f64,
    pub algo_volatility: f64,
    pub benchmark_volatility: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub alpha: f64,
    pub beta: f64,
    pub max_drawdown: f64,
    pub excess_return: f64,
    pub trading_days: usize,
}

impl Default for CumulativeRiskMetrics {
    fn default() -> Self {
        Self {
            algorithm_period_return: 0.0,
            benchmark_period_return: 0.0,
            algo_volatility: f64::NAN,
            benchmark_volatility: f64::NAN,
            sharpe: f64::NAN,
            sortino: f64::NAN,
            alpha: f64::NAN,
            beta: f64::NAN,
            max_drawdown: 0.0,
            excess_return: 0.0,
            trading_days: 0,
        }
    }
}

/// Per-emission-period packet in minute emission mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinutePerf {
    pub period_open: DateTime<Utc>,
    pub period_close: DateTime<Utc>,
    pub pnl: f64,
    pub returns: f64,
    pub portfolio_value: f64,
    pub positions: Vec<PositionSnapshot>,
    pub transactions: Vec<Transaction>,
    pub orders: Vec<Order>,
    pub recorded_vars: BTreeMap<String, f64>,
    pub cumulative_risk_metrics: CumulativeRiskMetrics,
}

impl MinutePerf {
    pub fn new(period_open: DateTime<Utc>, period_close: DateTime<Utc>) -> Self {
        Self {
            period_open,
            period_close,
            pnl: 0.0,
            returns: 0.0,
            portfolio_value: 0.0,
            positions: Vec::new(),
            transactions: Vec::new(),
            orders: Vec::new(),
            recorded_vars: BTreeMap::new(),
            cumulative_risk_metrics: CumulativeRiskMetrics::default(),
        }
    }
}

/// Per-session packet emitted at SessionEnd.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPerf {
    pub period_open: DateTime<Utc>,
    pub period_close: DateTime<Utc>,
    pub pnl: f64,
    pub returns: f64,
    pub portfolio_value: f64,
    pub longs_count: usize,
    pub shorts_count: usize,
    pub long_value: f64,
    pub short_value: f64,
    pub starting_exposure: f64,
    pub ending_exposure: f64,
    pub starting_value: f64,
    pub ending_value: f64,
    pub starting_cash: f64,
    pub ending_cash: f64,
    pub gross_leverage: f64,
    pub net_leverage: f64,
    pub cash_flow: f64,
    pub positions: Vec<PositionSnapshot>,
    pub transactions: Vec<Transaction>,
    pub orders: Vec<Order>,
    pub recorded_vars: BTreeMap<String, f64>,
    pub cumulative_risk_metrics: CumulativeRiskMetrics,
}

impl DailyPerf {
    pub fn new(period_open: DateTime<Utc>, period_close: DateTime<Utc>) -> Self {
        Self {
            period_open,
            period_close,
            pnl: 0.0,
            returns: 0.0,
            portfolio_value: 0.0,
            longs_count: 0,
            shorts_count: 0,
            long_value: 0.0,
            short_value: 0.0,
            starting_exposure: 0.0,
            ending_exposure: 0.0,
            starting_value: 0.0,
            ending_value: 0.0,
            starting_cash: 0.0,
            ending_cash: 0.0,
            gross_leverage: 0.0,
            net_leverage: 0.0,
            cash_flow: 0.0,
            positions: Vec::new(),
            transactions: Vec::new(),
            orders: Vec::new(),
            recorded_vars: BTreeMap::new(),
            cumulative_risk_metrics: CumulativeRiskMetrics::default(),
        }
    }
}

/// The end-of-run report covering the whole simulated period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskReport {
    pub start_session: Session,
    pub end_session: Session,
    pub cumulative: CumulativeRiskMetrics,
}

/// Everything a simulation yields while running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PerfPacket {
    Minute(MinutePerf),
    Daily(DailyPerf),
    Risk(RiskReport),
}
