use std::collections::BTreeSet;

use polars::{
    df,
    prelude::{Column, DataFrame, DataType, IntoLazy, TimeUnit, col},
};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    error::{DataError, TradesimResult},
    metrics::packet::DailyPerf,
};

/// Column names of the session performance frame, one row per session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumIter, Display, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum PerfCol {
    PeriodOpen,
    PeriodClose,
    Pnl,
    Returns,
    PortfolioValue,
    LongsCount,
    ShortsCount,
    LongValue,
    ShortValue,
    StartingExposure,
    EndingExposure,
    StartingValue,
    EndingValue,
    StartingCash,
    EndingCash,
    GrossLeverage,
    NetLeverage,
    CashFlow,
    AlgorithmPeriodReturn,
    BenchmarkPeriodReturn,
    AlgoVolatility,
    BenchmarkVolatility,
    Sharpe,
    Sortino,
    Alpha,
    Beta,
    MaxDrawdown,
    ExcessReturn,
    TradingDays,
}

impl PerfCol {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Flatten the session packets into the host-facing performance frame.
///
/// Fixed columns come from [`PerfCol`]; every recorded variable name that
/// appears in any session contributes one extra column, NaN-filled where the
/// strategy did not record it.
pub fn daily_perf_frame(packets: &[DailyPerf]) -> TradesimResult<DataFrame> {
    let opens: Vec<i64> = packets
        .iter()
        .map(|p| p.period_open.timestamp_micros())
        .collect();
    let closes: Vec<i64> = packets
        .iter()
        .map(|p| p.period_close.timestamp_micros())
        .collect();

    let f64_col = |get: fn(&DailyPerf) -> f64| -> Vec<f64> { packets.iter().map(get).collect() };
    let u32_col = |get: fn(&DailyPerf) -> usize| -> Vec<u32> {
        packets.iter().map(|p| get(p) as u32).collect()
    };

    let mut frame = df![
        PerfCol::PeriodOpen.as_str()            => opens,
        PerfCol::PeriodClose.as_str()           => closes,
        PerfCol::Pnl.as_str()                   => f64_col(|p| p.pnl),
        PerfCol::Returns.as_str()               => f64_col(|p| p.returns),
        PerfCol::PortfolioValue.as_str()        => f64_col(|p| p.portfolio_value),
        PerfCol::LongsCount.as_str()            => u32_col(|p| p.longs_count),
        PerfCol::ShortsCount.as_str()           => u32_col(|p| p.shorts_count),
        PerfCol::LongValue.as_str()             => f64_col(|p| p.long_value),
        PerfCol::ShortValue.as_str()            => f64_col(|p| p.short_value),
        PerfCol::StartingExposure.as_str()      => f64_col(|p| p.starting_exposure),
        PerfCol::EndingExposure.as_str()        => f64_col(|p| p.ending_exposure),
        PerfCol::StartingValue.as_str()         => f64_col(|p| p.starting_value),
        PerfCol::EndingValue.as_str()           => f64_col(|p| p.ending_value),
        PerfCol::StartingCash.as_str()          => f64_col(|p| p.starting_cash),
        PerfCol::EndingCash.as_str()            => f64_col(|p| p.ending_cash),
        PerfCol::GrossLeverage.as_str()         => f64_col(|p| p.gross_leverage),
        PerfCol::NetLeverage.as_str()           => f64_col(|p| p.net_leverage),
        PerfCol::CashFlow.as_str()              => f64_col(|p| p.cash_flow),
        PerfCol::AlgorithmPeriodReturn.as_str() => f64_col(|p| p.cumulative_risk_metrics.algorithm_period_return),
        PerfCol::BenchmarkPeriodReturn.as_str() => f64_col(|p| p.cumulative_risk_metrics.benchmark_period_return),
        PerfCol::AlgoVolatility.as_str()        => f64_col(|p| p.cumulative_risk_metrics.algo_volatility),
        PerfCol::BenchmarkVolatility.as_str()   => f64_col(|p| p.cumulative_risk_metrics.benchmark_volatility),
        PerfCol::Sharpe.as_str()                => f64_col(|p| p.cumulative_risk_metrics.sharpe),
        PerfCol::Sortino.as_str()               => f64_col(|p| p.cumulative_risk_metrics.sortino),
        PerfCol::Alpha.as_str()                 => f64_col(|p| p.cumulative_risk_metrics.alpha),
        PerfCol::Beta.as_str()                  => f64_col(|p| p.cumulative_risk_metrics.beta),
        PerfCol::MaxDrawdown.as_str()           => f64_col(|p| p.cumulative_risk_metrics.max_drawdown),
        PerfCol::ExcessReturn.as_str()          => f64_col(|p| p.cumulative_risk_metrics.excess_return),
        PerfCol::TradingDays.as_str()           => packets
            .iter()
            .map(|p| p.cumulative_risk_metrics.trading_days as u32)
            .collect::<Vec<u32>>(),
    ]
    .map_err(to_data_error)?;

    // Recorded variables become dynamic columns.
    let recorded_names: BTreeSet<&String> = packets
        .iter()
        .flat_map(|p| p.recorded_vars.keys())
        .collect();
    for name in recorded_names {
        if PerfCol::iter().any(|c| c.as_str() == name.as_str()) {
            // Do not let a recorded var shadow a fixed column.
            tracing::warn!(name, "recorded variable collides with a perf column; skipped");
            continue;
        }
        let values: Vec<f64> = packets
            .iter()
            .map(|p| p.recorded_vars.get(name).copied().unwrap_or(f64::NAN))
            .collect();
        frame
            .with_column(Column::new(name.as_str().into(), values))
            .map_err(to_data_error)?;
    }

    frame
        .lazy()
        .with_columns([
            col(PerfCol::PeriodOpen.as_str()).cast(DataType::Datetime(
                TimeUnit::Microseconds,
                Some(polars::prelude::TimeZone::UTC),
            )),
            col(PerfCol::PeriodClose.as_str()).cast(DataType::Datetime(
                TimeUnit::Microseconds,
                Some(polars::prelude::TimeZone::UTC),
            )),
        ])
        .collect()
        .map_err(to_data_error)
        .map_err(Into::into)
}

fn to_data_error(err: polars::error::PolarsError) -> DataError {
    DataError::DataFrame(err.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn packet(day: u32, returns: f64) -> DailyPerf {
        let open = Utc.with_ymd_and_hms(2023, 1, day, 14, 30, 0).unwrap();
        let close = Utc.with_ymd_and_hms(2023, 1, day, 21, 0, 0).unwrap();
        let mut p = DailyPerf::new(open, close);
        p.returns = returns;
        p
    }

    #[test]
    fn frame_has_one_row_per_session() {
        let packets = vec![packet(3, 0.01), packet(4, -0.02)];
        let frame = daily_perf_frame(&packets).unwrap();
        assert_eq!(frame.height(), 2);
        let returns = frame.column(PerfCol::Returns.as_str()).unwrap();
        assert_eq!(returns.f64().unwrap().get(1), Some(-0.02));
    }

    #[test]
    fn recorded_vars_become_columns() {
        let mut first = packet(3, 0.0);
        first.recorded_vars.insert("signal".to_string(), 1.5);
        let second = packet(4, 0.0);

        let frame = daily_perf_frame(&[first, second]).unwrap();
        let signal = frame.column("signal").unwrap();
        assert_eq!(signal.f64().unwrap().get(0), Some(1.5));
        assert!(signal.f64().unwrap().get(1).unwrap().is_nan());
    }

    #[test]
    fn empty_run_yields_empty_frame() {
        let frame = daily_perf_frame(&[]).unwrap();
        assert_eq!(frame.height(), 0);
    }
}
