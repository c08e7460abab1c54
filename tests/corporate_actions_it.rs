//! Splits and dividends against held positions, applied on session rollover.

mod common;

use common::{CAPITAL, EquityFixture, ScriptedStrategy, daily_packets, daily_bundle, jan, run_packets};
use tradesim::{
    SimulationParams,
    assets::Sid,
    data::{AdjustmentRepository, Dividend, Split},
    finance::ExecutionStyle,
};

fn buy_ten_on_first_bar() -> ScriptedStrategy {
    ScriptedStrategy::frictionless(Box::new(|ctx, _data, bar_ix| {
        if bar_ix == 0 {
            ctx.order(Sid(1), 10, ExecutionStyle::Market)?;
        }
        Ok(())
    }))
}

#[test]
fn two_for_one_split_doubles_shares_and_halves_prices() {
    let mut adjustments = AdjustmentRepository::new();
    adjustments.add_split(Split {
        sid: Sid(1),
        ratio: 2.0,
        effective_date: jan(5),
    });

    let bundle = daily_bundle(
        vec![EquityFixture::new(
            1,
            "ACME",
            // Post-split price on Jan 5th.
            vec![(jan(3), 50.0), (jan(4), 50.0), (jan(5), 25.0)],
        )],
        adjustments,
    );

    let params = SimulationParams::new(jan(3), jan(5), CAPITAL).unwrap();
    let packets = run_packets(buy_ten_on_first_bar(), bundle, params).unwrap();
    let daily = daily_packets(&packets);
    assert_eq!(daily.len(), 3);

    // Day two: filled 10 @ 50.
    let day2 = daily[1];
    assert_eq!(day2.positions[0].amount, 10);
    assert_eq!(day2.positions[0].cost_basis, 50.0);

    // Day three: the split applied before the open.
    let day3 = daily[2];
    assert_eq!(day3.positions[0].amount, 20);
    assert_eq!(day3.positions[0].cost_basis, 25.0);
    assert_eq!(day3.positions[0].last_sale_price, 25.0);

    // Total notional is preserved through the split: returns stay flat.
    for packet in &daily {
        assert!(packet.returns.abs() < 1e-12);
        assert_eq!(packet.portfolio_value, CAPITAL);
    }
}

#[test]
fn cash_dividend_is_earned_on_ex_date_and_paid_on_pay_date() {
    let mut adjustments = AdjustmentRepository::new();
    adjustments.add_dividend(Dividend {
        sid: Sid(1),
        amount: 0.5,
        ex_date: jan(5),
        pay_date: jan(6),
        declared_date: None,
        record_date: None,
    });

    let bundle = daily_bundle(
        vec![EquityFixture::new(
            1,
            "ACME",
            vec![
                (jan(3), 100.0),
                (jan(4), 100.0),
                (jan(5), 100.0),
                (jan(6), 100.0),
            ],
        )],
        adjustments,
    );

    let params = SimulationParams::new(jan(3), jan(6), CAPITAL).unwrap();
    let packets = run_packets(buy_ten_on_first_bar(), bundle, params).unwrap();
    let daily = daily_packets(&packets);
    assert_eq!(daily.len(), 4);

    // Ex-date: nothing paid yet.
    assert_eq!(daily[2].ending_cash, CAPITAL - 1_000.0);
    // Pay-date: 10 shares x 0.50, landing with the session rollover.
    assert_eq!(daily[3].ending_cash, CAPITAL - 1_000.0 + 5.0);
    assert!((daily[3].returns - 5.0 / CAPITAL).abs() < 1e-9);
    assert!((daily[3].portfolio_value - (CAPITAL + 5.0)).abs() < 1e-9);
}
