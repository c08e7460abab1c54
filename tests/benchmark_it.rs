//! Benchmark validation happens at construction, before any clock event, and
//! benchmark-relative metrics flow into the cumulative risk block.

mod common;

use common::{CAPITAL, EquityFixture, Idle, daily_bundle, daily_packets, jan, run_packets};
use tradesim::{
    SimulationDriver, SimulationParams,
    assets::Sid,
    data::AdjustmentRepository,
    sim::BenchmarkSpec,
};

#[test]
fn delisted_benchmark_fails_before_the_clock_starts() {
    let mut fixture = EquityFixture::new(1, "SPY", vec![(jan(3), 100.0), (jan(4), 101.0)]);
    // The benchmark asset stops trading mid-range.
    fixture.end_date = Some(jan(4));
    let bundle = daily_bundle(vec![fixture], AdjustmentRepository::new());

    let params = SimulationParams::new(jan(3), jan(10), CAPITAL)
        .unwrap()
        .with_benchmark(BenchmarkSpec::Asset(Sid(1)));

    let err = SimulationDriver::new(Idle, bundle, params).unwrap_err();
    assert!(err.to_string().contains("before the last session"));
}

#[test]
fn benchmark_returns_reach_the_session_packets() {
    let bundle = daily_bundle(
        vec![EquityFixture::new(
            1,
            "SPY",
            vec![(jan(3), 100.0), (jan(4), 110.0), (jan(5), 110.0)],
        )],
        AdjustmentRepository::new(),
    );

    let params = SimulationParams::new(jan(3), jan(5), CAPITAL)
        .unwrap()
        .with_benchmark(BenchmarkSpec::Asset(Sid(1)));

    let packets = run_packets(Idle, bundle, params).unwrap();
    let daily = daily_packets(&packets);

    // An idle portfolio underperforms a rising benchmark.
    let day2 = &daily[1].cumulative_risk_metrics;
    assert!((day2.benchmark_period_return - 0.1).abs() < 1e-9);
    assert!(day2.algorithm_period_return.abs() < 1e-12);
    assert!((day2.excess_return - -0.1).abs() < 1e-9);
    assert_eq!(day2.trading_days, 2);
}
