//! Identical inputs must produce byte-identical packet streams.

mod common;

use common::{CAPITAL, EquityFixture, ScriptedStrategy, daily_bundle, jan, run_packets};
use tradesim::{
    SimulationParams,
    assets::Sid,
    data::AdjustmentRepository,
    finance::ExecutionStyle,
};

fn busy_strategy() -> ScriptedStrategy {
    ScriptedStrategy::frictionless(Box::new(|ctx, data, bar_ix| {
        match bar_ix {
            0 => {
                ctx.order(Sid(1), 10, ExecutionStyle::Market)?;
                ctx.order(Sid(2), -5, ExecutionStyle::Market)?;
            }
            2 => {
                ctx.order_target(Sid(1), 0, ExecutionStyle::Market)?;
                ctx.record("mid_close", data.current(Sid(1), tradesim::data::BarField::Close));
            }
            _ => {}
        }
        Ok(())
    }))
}

fn fixture_bundle() -> std::sync::Arc<tradesim::data::BundleData> {
    daily_bundle(
        vec![
            EquityFixture::new(
                1,
                "AAA",
                vec![
                    (jan(3), 100.0),
                    (jan(4), 102.0),
                    (jan(5), 99.0),
                    (jan(6), 103.0),
                ],
            ),
            EquityFixture::new(
                2,
                "BBB",
                vec![
                    (jan(3), 40.0),
                    (jan(4), 39.0),
                    (jan(5), 41.0),
                    (jan(6), 40.5),
                ],
            ),
        ],
        AdjustmentRepository::new(),
    )
}

#[test]
fn repeated_runs_emit_identical_packets() {
    let params = SimulationParams::new(jan(3), jan(6), CAPITAL).unwrap();

    let run = || {
        let packets =
            run_packets(busy_strategy(), fixture_bundle(), params.clone()).unwrap();
        // NaN-bearing fields compare unequal under PartialEq; serialized
        // form is the byte-identity the contract is stated in.
        serde_json::to_string(&packets).unwrap()
    };

    let first = run();
    let second = run();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn daily_returns_compound_to_the_cumulative_return() {
    let params = SimulationParams::new(jan(3), jan(6), CAPITAL).unwrap();
    let packets = run_packets(busy_strategy(), fixture_bundle(), params).unwrap();

    let daily = common::daily_packets(&packets);
    let compounded = daily
        .iter()
        .fold(1.0, |acc, p| acc * (1.0 + p.returns))
        - 1.0;
    let cumulative = common::risk_report(&packets)
        .cumulative
        .algorithm_period_return;
    assert!(
        (compounded - cumulative).abs() < 1e-9,
        "daily returns {compounded} diverge from cumulative {cumulative}"
    );
}
