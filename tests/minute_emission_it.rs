//! Minute emission mode: one minute packet per emission boundary in addition
//! to the session packet.

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{CAPITAL, ScriptedStrategy, jan, minute_bundle, run_packets};
use tradesim::{
    SimulationParams,
    assets::Sid,
    data::Frequency,
    finance::ExecutionStyle,
    metrics::packet::PerfPacket,
};

#[test]
fn minute_packets_track_the_partial_day() {
    let open = Utc.with_ymd_and_hms(2023, 1, 3, 14, 30, 0).unwrap();
    let bars = (1..=10)
        .map(|m| (open + Duration::minutes(m), 100.0 + m as f64, 1_000_000.0))
        .collect();
    let bundle = minute_bundle(1, bars);

    let strategy = ScriptedStrategy::frictionless(Box::new(|ctx, _data, bar_ix| {
        if bar_ix == 0 {
            ctx.order(Sid(1), 10, ExecutionStyle::Market)?;
        }
        Ok(())
    }));

    let params = SimulationParams::new(jan(3), jan(3), CAPITAL)
        .unwrap()
        .with_bar_frequency(Frequency::MINUTE)
        .with_emission_rate(Frequency::MINUTE);

    let packets = run_packets(strategy, bundle, params).unwrap();

    let minutes: Vec<_> = packets
        .iter()
        .filter_map(|p| match p {
            PerfPacket::Minute(m) => Some(m),
            _ => None,
        })
        .collect();
    let dailies = packets
        .iter()
        .filter(|p| matches!(p, PerfPacket::Daily(_)))
        .count();

    // One emission boundary per trading minute (390), one session packet.
    assert_eq!(minutes.len(), 390);
    assert_eq!(dailies, 1);

    // Before the fill the portfolio is flat.
    assert_eq!(minutes[0].portfolio_value, CAPITAL);
    assert!(minutes[0].transactions.is_empty());

    // The fill lands in the 14:32 packet: 10 shares at 102.
    let fill_packet = minutes[1];
    assert_eq!(fill_packet.transactions.len(), 1);
    assert_eq!(fill_packet.transactions[0].price, 102.0);
    assert_eq!(fill_packet.positions.len(), 1);

    // Minute packets carry the partial day's cumulative state: by 14:35 the
    // position has marked up to 105.
    let later = minutes[4];
    assert_eq!(later.positions[0].last_sale_price, 105.0);
    assert!((later.pnl - 10.0 * 3.0).abs() < 1e-9);
}
