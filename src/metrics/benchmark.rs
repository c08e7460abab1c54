use chrono::{DateTime, TimeZone, Utc};

use crate::{
    assets::Sid,
    calendar::{Session, TradingCalendar},
    data::{BarField, BundleData, Frequency},
    error::{ConfigurationError, TradesimResult},
};

// ================================================================================================
// Benchmark Source
// ================================================================================================

/// The reference returns series used by the cumulative risk metrics.
///
/// Built either from a benchmark asset's price history or from a supplied
/// returns series reindexed onto the emission grid. Construction validates
/// the benchmark before the clock starts; a bad benchmark never reaches the
/// simulation loop.
#[derive(Debug, Clone)]
pub struct BenchmarkSource {
    sessions: Vec<Session>,
    /// One return per session.
    daily_returns: Vec<f64>,
    /// Per-emission-period series: session closes in daily emission mode, a
    /// finer grid otherwise.
    period_timestamps: Vec<DateTime<Utc>>,
    period_returns: Vec<f64>,
}

impl BenchmarkSource {
    /// A zero-returns benchmark over the sessions. Used when no benchmark is
    /// configured so benchmark-relative metrics degrade gracefully.
    pub fn zero(calendar: &TradingCalendar, sessions: &[Session]) -> TradesimResult<Self> {
        let mut period_timestamps = Vec::with_capacity(sessions.len());
        for &session in sessions {
            period_timestamps.push(calendar.session_close(session)?);
        }
        Ok(Self {
            sessions: sessions.to_vec(),
            daily_returns: vec![0.0; sessions.len()],
            period_returns: vec![0.0; period_timestamps.len()],
            period_timestamps,
        })
    }

    /// Precompute the benchmark series from an asset's adjusted history.
    pub fn from_asset(
        sid: Sid,
        bundle: &BundleData,
        sessions: &[Session],
        emission_rate: Frequency,
    ) -> TradesimResult<Self> {
        let calendar = bundle.calendar();
        let (first, last) = match (sessions.first(), sessions.last()) {
            (Some(&f), Some(&l)) => (f, l),
            _ => return Err(ConfigurationError::EmptySessionRange.into()),
        };
        validate_benchmark_asset(sid, bundle, first, last)?;

        let last_close = calendar.session_close(last)?;
        let window = bundle.history_window(
            &[sid],
            last_close,
            sessions.len() + 1,
            Frequency::DAILY,
            &[BarField::Open, BarField::Close],
            true,
        )?;

        let opens = window.column(BarField::Open)?;
        let closes = window.column(BarField::Close)?;
        let timestamps = window.timestamps();

        // Close per session, with the last close before the range (if any)
        // seeding the first day's percent change.
        let mut prior_close = f64::NAN;
        let mut session_bars: Vec<(Session, f64, f64)> = Vec::new();
        for (ix, &dt) in timestamps.iter().enumerate() {
            let session = calendar.minute_to_session(dt)?;
            if session < first {
                prior_close = closes[ix];
            } else {
                session_bars.push((session, opens[ix], closes[ix]));
            }
        }

        let mut daily_returns = vec![0.0; sessions.len()];
        let mut prev = prior_close;
        for (session, open, close) in session_bars {
            let Some(ix) = sessions.iter().position(|&s| s == session) else {
                continue;
            };
            daily_returns[ix] = if prev.is_finite() && prev != 0.0 {
                close / prev - 1.0
            } else if open.is_finite() && open != 0.0 {
                // No prior close: the asset starts with the simulation, so
                // day one uses its open-to-close return.
                close / open - 1.0
            } else {
                0.0
            };
            if close.is_finite() {
                prev = close;
            }
        }

        let (period_timestamps, period_returns) = if emission_rate.is_intraday() {
            intraday_series(sid, bundle, sessions, emission_rate)?
        } else {
            let mut stamps = Vec::with_capacity(sessions.len());
            for &session in sessions {
                stamps.push(calendar.session_close(session)?);
            }
            (stamps, daily_returns.clone())
        };

        Ok(Self {
            sessions: sessions.to_vec(),
            daily_returns,
            period_timestamps,
            period_returns,
        })
    }

    /// Reindex a supplied returns series onto the emission grid, zero-filling
    /// gaps. Daily returns are derived by compounding period returns within
    /// each session.
    pub fn from_returns(
        series: &[(DateTime<Utc>, f64)],
        calendar: &TradingCalendar,
        sessions: &[Session],
        emission_rate: Frequency,
    ) -> TradesimResult<Self> {
        let mut period_timestamps = Vec::new();
        if emission_rate.is_intraday() {
            for &session in sessions {
                let open = calendar.session_open(session)?;
                let close = calendar.session_close(session)?;
                let step = emission_rate.duration();
                let mut dt = open + step;
                while dt <= close {
                    period_timestamps.push(dt);
                    dt += step;
                }
                if period_timestamps.last() != Some(&close) {
                    period_timestamps.push(close);
                }
            }
        } else {
            for &session in sessions {
                period_timestamps.push(calendar.session_close(session)?);
            }
        }

        let period_returns: Vec<f64> = period_timestamps
            .iter()
            .map(|ts| {
                series
                    .iter()
                    .find(|(s, _)| s == ts)
                    .map(|(_, r)| *r)
                    .unwrap_or(0.0)
            })
            .collect();

        let mut daily_returns = vec![0.0; sessions.len()];
        for (ix, &session) in sessions.iter().enumerate() {
            let close = calendar.session_close(session)?;
            let open = calendar.session_midnight(session);
            let compounded = period_timestamps
                .iter()
                .zip(&period_returns)
                .filter(|(ts, _)| **ts > open && **ts <= close)
                .fold(1.0, |acc, (_, r)| acc * (1.0 + r));
            daily_returns[ix] = compounded - 1.0;
        }

        Ok(Self {
            sessions: sessions.to_vec(),
            daily_returns,
            period_timestamps,
            period_returns,
        })
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// The return of the emission period containing `dt` (exact or most
    /// recent boundary).
    pub fn get_value(&self, dt: DateTime<Utc>) -> f64 {
        match self.period_timestamps.partition_point(|&ts| ts <= dt) {
            0 => 0.0,
            n => self.period_returns[n - 1],
        }
    }

    /// Period returns inside `[start_dt, end_dt]`.
    pub fn get_range(&self, start_dt: DateTime<Utc>, end_dt: DateTime<Utc>) -> Vec<(DateTime<Utc>, f64)> {
        self.period_timestamps
            .iter()
            .zip(&self.period_returns)
            .filter(|(ts, _)| (start_dt..=end_dt).contains(*ts))
            .map(|(ts, r)| (*ts, *r))
            .collect()
    }

    /// Daily returns through the given session index (inclusive).
    pub fn daily_returns_through(&self, session_ix: usize) -> &[f64] {
        let end = (session_ix + 1).min(self.daily_returns.len());
        &self.daily_returns[..end]
    }

    pub fn daily_returns(&self) -> &[f64] {
        &self.daily_returns
    }
}

fn validate_benchmark_asset(
    sid: Sid,
    bundle: &BundleData,
    first: Session,
    last: Session,
) -> TradesimResult<()> {
    let stock_dividends = bundle
        .adjustment_repository()
        .stock_dividends_in_range(sid, first, last);
    if let Some(dividend) = stock_dividends.first() {
        return Err(ConfigurationError::InvalidBenchmarkAsset {
            sid: sid.0,
            ex_date: Utc.from_utc_datetime(&dividend.ex_date.and_hms_opt(0, 0, 0).unwrap()),
        }
        .into());
    }

    let asset = bundle.asset_repository().retrieve(sid)?;
    let first_midnight = Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0).unwrap());
    let last_midnight = Utc.from_utc_datetime(&last.and_hms_opt(0, 0, 0).unwrap());
    if asset.start_date > first_midnight {
        return Err(ConfigurationError::BenchmarkAssetNotAvailableTooEarly {
            sid: sid.0,
            start_date: asset.start_date,
            first_session: first_midnight,
        }
        .into());
    }
    if asset.end_date < last_midnight {
        return Err(ConfigurationError::BenchmarkAssetNotAvailableTooLate {
            sid: sid.0,
            end_date: asset.end_date,
            last_session: last_midnight,
        }
        .into());
    }
    Ok(())
}

/// Percent change of the close at each emission boundary.
fn intraday_series(
    sid: Sid,
    bundle: &BundleData,
    sessions: &[Session],
    emission_rate: Frequency,
) -> TradesimResult<(Vec<DateTime<Utc>>, Vec<f64>)> {
    let calendar = bundle.calendar();
    let frequency = bundle.frequency();
    let mut timestamps = Vec::new();
    let mut returns = Vec::new();
    let mut prev_close = f64::NAN;

    for &session in sessions {
        let open = calendar.session_open(session)?;
        let close = calendar.session_close(session)?;
        let step = emission_rate.duration();
        let mut dt = open + step;
        loop {
            let boundary = dt.min(close);
            let spot = bundle
                .spot_value(sid, BarField::Close, boundary, frequency)
                .unwrap_or(f64::NAN);
            let value = if spot.is_finite() && prev_close.is_finite() && prev_close != 0.0 {
                spot / prev_close - 1.0
            } else {
                0.0
            };
            timestamps.push(boundary);
            returns.push(value);
            if spot.is_finite() {
                prev_close = spot;
            }
            if boundary == close {
                break;
            }
            dt += step;
        }
    }
    Ok((timestamps, returns))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::{
        assets::{Asset, AssetRepository},
        data::{AdjustmentRepository, Bar, BarStore, StockDividend},
    };

    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, d).unwrap()
    }

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, d, h, 0, 0).unwrap()
    }

    fn bundle_with_closes(
        start_day: u32,
        closes: &[(u32, f64)],
        stock_dividend: bool,
    ) -> BundleData {
        let calendar = TradingCalendar::from_name("XNYS", date(1), date(31)).unwrap();
        let mut assets = AssetRepository::new();
        assets
            .insert(Asset::equity(
                Sid(1),
                "SPY",
                "XNYS",
                ts(start_day, 0),
                Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            ))
            .unwrap();
        let mut bars = BarStore::new(Frequency::DAILY);
        for &(day, close) in closes {
            bars.push_bar(
                Sid(1),
                Bar {
                    dt: ts(day, 21),
                    open: close - 1.0,
                    high: close + 1.0,
                    low: close - 2.0,
                    close,
                    volume: 1000.0,
                },
            )
            .unwrap();
        }
        let mut adjustments = AdjustmentRepository::new();
        if stock_dividend {
            adjustments.add_stock_dividend(StockDividend {
                sid: Sid(1),
                payment_sid: Sid(1),
                ratio: 0.1,
                ex_date: date(5),
                pay_date: date(20),
            });
        }
        BundleData::new("t", "v1", calendar, bars, assets, adjustments)
    }

    #[test]
    fn daily_returns_are_close_to_close() {
        let bundle = bundle_with_closes(1, &[(3, 100.0), (4, 110.0), (5, 99.0)], false);
        let sessions = vec![date(4), date(5)];
        let source =
            BenchmarkSource::from_asset(Sid(1), &bundle, &sessions, Frequency::DAILY).unwrap();

        let daily = source.daily_returns();
        assert!((daily[0] - 0.1).abs() < 1e-12);
        assert!((daily[1] - (99.0 / 110.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn first_day_uses_open_to_close_when_asset_starts_with_the_range() {
        // No bar before Jan 3rd: day one must use its own open->close move.
        let bundle = bundle_with_closes(3, &[(3, 100.0), (4, 110.0)], false);
        let sessions = vec![date(3), date(4)];
        let source =
            BenchmarkSource::from_asset(Sid(1), &bundle, &sessions, Frequency::DAILY).unwrap();

        let daily = source.daily_returns();
        // Open is close - 1 = 99.
        assert!((daily[0] - (100.0 / 99.0 - 1.0)).abs() < 1e-12);
        assert!((daily[1] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn stock_dividends_disqualify_the_benchmark() {
        let bundle = bundle_with_closes(1, &[(3, 100.0), (4, 110.0)], true);
        let sessions = vec![date(3), date(4)];
        let err = BenchmarkSource::from_asset(Sid(1), &bundle, &sessions, Frequency::DAILY)
            .unwrap_err();
        assert!(err.to_string().contains("stock dividend"));
    }

    #[test]
    fn delisted_benchmark_fails_too_late() {
        let calendar = TradingCalendar::from_name("XNYS", date(1), date(31)).unwrap();
        let mut assets = AssetRepository::new();
        // Asset delists mid-January.
        assets
            .insert(Asset::equity(Sid(1), "SPY", "XNYS", ts(1, 0), ts(10, 0)))
            .unwrap();
        let bundle = BundleData::new(
            "t",
            "v1",
            calendar,
            BarStore::new(Frequency::DAILY),
            assets,
            AdjustmentRepository::new(),
        );
        let sessions = vec![date(3), date(20)];
        let err = BenchmarkSource::from_asset(Sid(1), &bundle, &sessions, Frequency::DAILY)
            .unwrap_err();
        assert!(err.to_string().contains("before the last session"));
    }

    #[test]
    fn supplied_series_zero_fills_the_grid() {
        let calendar = TradingCalendar::from_name("XNYS", date(1), date(31)).unwrap();
        let sessions = vec![date(3), date(4), date(5)];
        // Only Jan 4th has a supplied value.
        let series = vec![(calendar.session_close(date(4)).unwrap(), 0.02)];
        let source =
            BenchmarkSource::from_returns(&series, &calendar, &sessions, Frequency::DAILY)
                .unwrap();

        assert_eq!(source.daily_returns(), &[0.0, 0.02, 0.0]);
        assert_eq!(source.get_value(calendar.session_close(date(4)).unwrap()), 0.02);
    }

    #[test]
    fn zero_benchmark_is_all_zeros() {
        let calendar = TradingCalendar::from_name("XNYS", date(1), date(31)).unwrap();
        let sessions: Vec<Session> = calendar.sessions().to_vec();
        let source = BenchmarkSource::zero(&calendar, &sessions).unwrap();
        assert!(source.daily_returns().iter().all(|r| *r == 0.0));
    }
}
