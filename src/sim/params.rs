use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use crate::{
    assets::Sid,
    data::Frequency,
    error::{ConfigurationError, TradesimResult},
    finance::ledger::CapitalChange,
};

/// How the benchmark returns series is obtained.
#[derive(Debug, Clone)]
pub enum BenchmarkSpec {
    /// Compute returns from an asset's price history.
    Asset(Sid),
    /// Use a pre-supplied series of `(period_end, return)` points, reindexed
    /// onto the emission grid.
    Returns(Vec<(DateTime<Utc>, f64)>),
}

/// Everything that parameterizes one simulation run.
///
/// The session range is intersected with the bundle's calendar; the bar
/// frequency must match the bundle or be a coarser multiple of it.
#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub start_session: NaiveDate,
    pub end_session: NaiveDate,
    pub capital_base: f64,
    pub bar_frequency: Frequency,
    pub emission_rate: Frequency,
    pub before_trading_start_offset: Duration,
    /// Abort on strategy callback errors, or record them and keep going.
    pub stop_on_error: bool,
    pub benchmark: Option<BenchmarkSpec>,
    pub capital_changes: BTreeMap<DateTime<Utc>, CapitalChange>,
}

impl SimulationParams {
    pub fn new(
        start_session: NaiveDate,
        end_session: NaiveDate,
        capital_base: f64,
    ) -> TradesimResult<Self> {
        if start_session > end_session {
            return Err(ConfigurationError::InvalidDateRange {
                start: Utc.from_utc_datetime(&start_session.and_hms_opt(0, 0, 0).unwrap()),
                end: Utc.from_utc_datetime(&end_session.and_hms_opt(0, 0, 0).unwrap()),
            }
            .into());
        }
        if !(capital_base > 0.0) {
            return Err(ConfigurationError::NonPositiveCapital(capital_base).into());
        }
        Ok(Self {
            start_session,
            end_session,
            capital_base,
            bar_frequency: Frequency::DAILY,
            emission_rate: Frequency::DAILY,
            before_trading_start_offset: Duration::minutes(45),
            stop_on_error: true,
            benchmark: None,
            capital_changes: BTreeMap::new(),
        })
    }

    pub fn with_bar_frequency(self, bar_frequency: Frequency) -> Self {
        Self {
            bar_frequency,
            ..self
        }
    }

    pub fn with_emission_rate(self, emission_rate: Frequency) -> Self {
        Self {
            emission_rate,
            ..self
        }
    }

    pub fn with_before_trading_start_offset(self, offset: Duration) -> Self {
        Self {
            before_trading_start_offset: offset,
            ..self
        }
    }

    pub fn with_stop_on_error(self, stop_on_error: bool) -> Self {
        Self {
            stop_on_error,
            ..self
        }
    }

    pub fn with_benchmark(self, benchmark: BenchmarkSpec) -> Self {
        Self {
            benchmark: Some(benchmark),
            ..self
        }
    }

    pub fn with_capital_change(mut self, dt: DateTime<Utc>, change: CapitalChange) -> Self {
        self.capital_changes.insert(dt, change);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn inverted_ranges_and_bad_capital_are_rejected() {
        assert!(SimulationParams::new(date(2023, 2, 1), date(2023, 1, 1), 1000.0).is_err());
        assert!(SimulationParams::new(date(2023, 1, 1), date(2023, 2, 1), 0.0).is_err());
        assert!(SimulationParams::new(date(2023, 1, 1), date(2023, 2, 1), -5.0).is_err());
        assert!(SimulationParams::new(date(2023, 1, 1), date(2023, 2, 1), f64::NAN).is_err());
    }

    #[test]
    fn builder_defaults_are_daily() {
        let params = SimulationParams::new(date(2023, 1, 1), date(2023, 2, 1), 1000.0).unwrap();
        assert_eq!(params.bar_frequency, Frequency::DAILY);
        assert_eq!(params.emission_rate, Frequency::DAILY);
        assert!(params.stop_on_error);
    }
}
