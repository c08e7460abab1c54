//! End-of-day cancellation of resting orders.

mod common;

use common::{CAPITAL, EquityFixture, ScriptedStrategy, daily_bundle, daily_packets, jan, run_packets};
use tradesim::{
    SimulationParams,
    assets::Sid,
    data::AdjustmentRepository,
    finance::{CancelPolicy, ExecutionStyle, OrderStatus},
};

fn far_limit_buy() -> ScriptedStrategy {
    // A buy limited at 1.00 against a 100.00 close never triggers.
    ScriptedStrategy::frictionless(Box::new(|ctx, _data, bar_ix| {
        if bar_ix == 0 {
            ctx.order(Sid(1), 10, ExecutionStyle::Limit { limit_price: 1.0 })?;
        }
        Ok(())
    }))
}

fn hundred_dollar_bundle() -> std::sync::Arc<tradesim::data::BundleData> {
    daily_bundle(
        vec![EquityFixture::new(
            1,
            "ACME",
            vec![(jan(3), 100.0), (jan(4), 100.0)],
        )],
        AdjustmentRepository::new(),
    )
}

#[test]
fn eod_cancel_sweeps_resting_orders_at_session_end() {
    let params = SimulationParams::new(jan(3), jan(4), CAPITAL).unwrap();
    let packets = run_packets(far_limit_buy(), hundred_dollar_bundle(), params).unwrap();
    let daily = daily_packets(&packets);

    // The first session's journal carries the cancelled order.
    let day1_orders = &daily[0].orders;
    assert_eq!(day1_orders.len(), 1);
    assert_eq!(day1_orders[0].status, OrderStatus::Cancelled);
    assert_eq!(day1_orders[0].filled, 0);

    // Nothing survives into the next session: no fills, no orders.
    assert!(daily[1].transactions.is_empty());
    assert!(daily[1].orders.is_empty());
    assert_eq!(daily[1].ending_cash, CAPITAL);
}

#[test]
fn never_cancel_carries_orders_across_sessions() {
    let strategy = ScriptedStrategy::new(Box::new(|ctx, _data, bar_ix| {
        if bar_ix == 0 {
            ctx.order(Sid(1), 10, ExecutionStyle::Limit { limit_price: 1.0 })?;
        }
        Ok(())
    }))
    .with_init(Box::new(|ctx| {
        ctx.set_cancel_policy(CancelPolicy::NeverCancel)?;
        Ok(())
    }));

    let params = SimulationParams::new(jan(3), jan(4), CAPITAL).unwrap();
    let packets = run_packets(strategy, hundred_dollar_bundle(), params).unwrap();
    let daily = daily_packets(&packets);

    // The order is still open at the end of day one.
    assert_eq!(daily[0].orders.len(), 1);
    assert_eq!(daily[0].orders[0].status, OrderStatus::Open);
}

#[test]
fn cancel_policy_cannot_change_after_initialize() {
    let strategy = ScriptedStrategy::new(Box::new(|ctx, _data, bar_ix| {
        if bar_ix == 0 {
            assert!(ctx.set_cancel_policy(CancelPolicy::NeverCancel).is_err());
        }
        Ok(())
    }));

    let params = SimulationParams::new(jan(3), jan(4), CAPITAL).unwrap();
    run_packets(strategy, hundred_dollar_bundle(), params).unwrap();
}
