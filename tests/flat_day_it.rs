//! A single session in minute mode: one market buy on the first bar, filled
//! frictionlessly on the second, commission floored at the per-order minimum.

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{CAPITAL, ScriptedStrategy, daily_packets, jan, minute_bundle, run_packets};
use tradesim::{
    SimulationParams,
    assets::Sid,
    data::Frequency,
    finance::{ExecutionStyle, NoSlippage, OrderStatus, PerShare},
};

#[test]
fn market_buy_settles_with_minimum_commission() {
    // Ten flat minutes of trading from the Jan 3rd open.
    let open = Utc.with_ymd_and_hms(2023, 1, 3, 14, 30, 0).unwrap();
    let bars = (1..=10)
        .map(|m| (open + Duration::minutes(m), 100.0, 1_000_000.0))
        .collect();
    let bundle = minute_bundle(1, bars);

    let strategy = ScriptedStrategy::new(Box::new(|ctx, _data, bar_ix| {
        if bar_ix == 0 {
            let id = ctx.order(Sid(1), 10, ExecutionStyle::Market)?;
            assert!(id.is_some());
        }
        Ok(())
    }))
    .with_init(Box::new(|ctx| {
        ctx.set_slippage(Some(Box::new(NoSlippage)), None)?;
        ctx.set_commission(
            Some(Box::new(PerShare {
                cost_per_share: 0.01,
                min_trade_cost: 1.0,
            })),
            None,
        )?;
        Ok(())
    }));

    let params = SimulationParams::new(jan(3), jan(3), CAPITAL)
        .unwrap()
        .with_bar_frequency(Frequency::MINUTE)
        .with_emission_rate(Frequency::DAILY);

    let packets = run_packets(strategy, bundle, params).unwrap();
    let daily = daily_packets(&packets);
    assert_eq!(daily.len(), 1);
    let perf = daily[0];

    // Position: 10 shares at 100, with the 1.00 commission folded into the
    // cost basis.
    assert_eq!(perf.positions.len(), 1);
    assert_eq!(perf.positions[0].amount, 10);
    assert!((perf.positions[0].cost_basis - 100.1).abs() < 1e-9);
    assert_eq!(perf.positions[0].last_sale_price, 100.0);

    // Cash: 100_000 - 1_000 notional - 1.00 commission.
    assert_eq!(perf.ending_cash, 98_999.0);
    assert!((perf.pnl - -1.0).abs() < 1e-9);
    assert!((perf.returns - -1.0 / CAPITAL).abs() < 1e-12);
    assert_eq!(perf.portfolio_value, 99_999.0);

    // Exactly one transaction, at the close of the bar after the order.
    assert_eq!(perf.transactions.len(), 1);
    let txn = &perf.transactions[0];
    assert_eq!(txn.amount, 10);
    assert_eq!(txn.price, 100.0);
    assert_eq!(
        txn.dt,
        Utc.with_ymd_and_hms(2023, 1, 3, 14, 32, 0).unwrap()
    );

    // The order journal shows the single, fully filled order.
    assert_eq!(perf.orders.len(), 1);
    assert_eq!(perf.orders[0].status, OrderStatus::Filled);
    assert_eq!(perf.orders[0].filled, 10);
    assert!((perf.orders[0].commission - 1.0).abs() < 1e-12);
}

#[test]
fn order_placed_on_a_bar_is_not_eligible_on_that_bar() {
    let open = Utc.with_ymd_and_hms(2023, 1, 3, 14, 30, 0).unwrap();
    let bars = (1..=5)
        .map(|m| (open + Duration::minutes(m), 100.0, 1_000_000.0))
        .collect();
    let bundle = minute_bundle(1, bars);

    let strategy = ScriptedStrategy::frictionless(Box::new(|ctx, _data, bar_ix| {
        if bar_ix == 0 {
            ctx.order(Sid(1), 10, ExecutionStyle::Market)?;
        }
        if bar_ix == 1 {
            // One bar later the order is still unfilled: the matcher ran
            // before this callback and consumed the previous bar's order.
            let open_orders = ctx.get_open_orders(Some(Sid(1)));
            assert!(open_orders.is_empty(), "order filled on the second bar");
            assert_eq!(ctx.position_amount(Sid(1)), 10);
        }
        Ok(())
    }));

    let params = SimulationParams::new(jan(3), jan(3), CAPITAL)
        .unwrap()
        .with_bar_frequency(Frequency::MINUTE)
        .with_emission_rate(Frequency::DAILY);

    let packets = run_packets(strategy, bundle, params).unwrap();
    let daily = daily_packets(&packets);
    let txn = &daily[0].transactions[0];
    // Placed at 14:31, first eligible and filled at 14:32.
    assert_eq!(
        txn.dt,
        Utc.with_ymd_and_hms(2023, 1, 3, 14, 32, 0).unwrap()
    );
}
