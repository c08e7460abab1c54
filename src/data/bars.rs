use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    assets::{Asset, Sid},
    calendar::TradingCalendar,
    data::Frequency,
    error::{DataError, TradesimResult},
};

// ================================================================================================
// Bars
// ================================================================================================

/// One OHLCV record at the store's bar frequency. The close is authoritative
/// for adjustments and last-sale pricing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub dt: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum BarField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl BarField {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_price(&self) -> bool {
        !matches!(self, BarField::Volume)
    }
}

/// Column-oriented bar history for one asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BarSeries {
    timestamps: Vec<DateTime<Utc>>,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
}

impl BarSeries {
    fn push(&mut self, bar: Bar) -> TradesimResult<()> {
        if let Some(&last) = self.timestamps.last()
            && bar.dt <= last
        {
            return Err(DataError::TimestampConversion(format!(
                "bars must be appended in strictly increasing order: {} after {last}",
                bar.dt
            ))
            .into());
        }
        self.timestamps.push(bar.dt);
        self.open.push(bar.open);
        self.high.push(bar.high);
        self.low.push(bar.low);
        self.close.push(bar.close);
        self.volume.push(bar.volume);
        Ok(())
    }

    fn len(&self) -> usize {
        self.timestamps.len()
    }

    fn field(&self, field: BarField) -> &[f64] {
        match field {
            BarField::Open => &self.open,
            BarField::High => &self.high,
            BarField::Low => &self.low,
            BarField::Close => &self.close,
            BarField::Volume => &self.volume,
        }
    }

    fn bar_at(&self, ix: usize) -> Bar {
        Bar {
            dt: self.timestamps[ix],
            open: self.open[ix],
            high: self.high[ix],
            low: self.low[ix],
            close: self.close[ix],
            volume: self.volume[ix],
        }
    }

    /// Index of the last bar with timestamp <= dt.
    fn ix_at_or_before(&self, dt: DateTime<Utc>) -> Option<usize> {
        match self.timestamps.partition_point(|&ts| ts <= dt) {
            0 => None,
            n => Some(n - 1),
        }
    }

    /// Aggregate groups of bars into coarser bars. `group_of` maps a bar
    /// timestamp to an opaque group key; consecutive equal keys form one
    /// output bar labeled with the group's last timestamp.
    fn resample_by<K: PartialEq>(&self, group_of: impl Fn(DateTime<Utc>) -> K) -> BarSeries {
        let mut out = BarSeries::default();
        let mut current: Option<(K, Bar)> = None;

        for ix in 0..self.len() {
            let bar = self.bar_at(ix);
            let key = group_of(bar.dt);
            match &mut current {
                Some((k, agg)) if *k == key => {
                    agg.high = agg.high.max(bar.high);
                    agg.low = agg.low.min(bar.low);
                    agg.close = bar.close;
                    agg.volume += bar.volume;
                    agg.dt = bar.dt;
                }
                Some((_, agg)) => {
                    // push never fails here: group labels inherit bar order
                    let _ = out.push(*agg);
                    current = Some((key, bar));
                }
                None => current = Some((key, bar)),
            }
        }
        if let Some((_, agg)) = current {
            let _ = out.push(agg);
        }
        out
    }
}

// ================================================================================================
// Bar Store
// ================================================================================================

/// Columnar OHLCV store for every asset of a bundle, at one base frequency.
///
/// The store is read-only after ingestion and safe to share across
/// simulations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarStore {
    frequency: Frequency,
    series: BTreeMap<Sid, BarSeries>,
}

impl BarStore {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            series: BTreeMap::new(),
        }
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn push_bar(&mut self, sid: Sid, bar: Bar) -> TradesimResult<()> {
        self.series.entry(sid).or_default().push(bar)
    }

    pub fn bar_count(&self, sid: Sid) -> usize {
        self.series.get(&sid).map(BarSeries::len).unwrap_or(0)
    }

    /// The latest value of `field` at or before `dt`, at the store's base
    /// frequency. `None` when the asset has no bars that early.
    pub fn spot(&self, sid: Sid, field: BarField, dt: DateTime<Utc>) -> Option<f64> {
        let series = self.series.get(&sid)?;
        let ix = series.ix_at_or_before(dt)?;
        Some(series.field(field)[ix])
    }

    /// The latest full bar at or before `dt`.
    pub fn spot_bar(&self, sid: Sid, dt: DateTime<Utc>) -> Option<Bar> {
        let series = self.series.get(&sid)?;
        let ix = series.ix_at_or_before(dt)?;
        Some(series.bar_at(ix))
    }

    /// A history window of `bar_count` bars per asset ending at or before
    /// `end_dt`, resampled to `frequency`.
    ///
    /// Forward-fill replaces NaN values with the previous valid value, but
    /// only inside the asset's listed lifetime: leading NaNs before
    /// `start_date` never propagate, and bars after `end_date` stay NaN.
    pub fn history_window(
        &self,
        assets: &[&Asset],
        end_dt: DateTime<Utc>,
        bar_count: usize,
        frequency: Frequency,
        fields: &[BarField],
        ffill: bool,
        calendar: &TradingCalendar,
    ) -> TradesimResult<BarWindow> {
        let mut window = BarWindow::new(fields.to_vec());

        for asset in assets {
            let resampled = self.resampled_series(asset.sid, frequency, calendar)?;
            let Some(series) = resampled else {
                continue;
            };
            let end_ix = match series.ix_at_or_before(end_dt) {
                Some(ix) => ix,
                None => continue,
            };
            let start_ix = (end_ix + 1).saturating_sub(bar_count);

            for ix in start_ix..=end_ix {
                let dt = series.timestamps[ix];
                let values = fields
                    .iter()
                    .map(|&f| {
                        let raw = series.field(f)[ix];
                        if ffill && raw.is_nan() {
                            ffill_value(&series, f, ix, asset)
                        } else {
                            raw
                        }
                    })
                    .collect();
                window.push_row(asset.sid, dt, values);
            }
        }
        Ok(window)
    }

    fn resampled_series(
        &self,
        sid: Sid,
        requested: Frequency,
        calendar: &TradingCalendar,
    ) -> TradesimResult<Option<BarSeries>> {
        let Some(series) = self.series.get(&sid) else {
            return Ok(None);
        };
        let stored = self.frequency;

        if requested == stored {
            return Ok(Some(series.clone()));
        }
        if requested < stored {
            return Err(DataError::UnsupportedFrequency {
                stored_seconds: stored.seconds(),
                requested_seconds: requested.seconds(),
            }
            .into());
        }
        if requested.is_daily() && stored.is_intraday() {
            // Daily bars group by trading session, labeled with the last
            // intraday bar of each session.
            let resampled = series.resample_by(|dt| {
                calendar
                    .minute_to_session(dt)
                    .unwrap_or_else(|_| dt.date_naive())
            });
            return Ok(Some(resampled));
        }
        if requested.seconds() % stored.seconds() == 0 {
            let step = requested.seconds() as i64;
            let resampled = series.resample_by(|dt| dt.timestamp().div_euclid(step));
            return Ok(Some(resampled));
        }
        Err(DataError::UnsupportedFrequency {
            stored_seconds: stored.seconds(),
            requested_seconds: requested.seconds(),
        }
        .into())
    }

    pub fn sids(&self) -> impl Iterator<Item = Sid> + '_ {
        self.series.keys().copied()
    }
}

/// Walk backwards for the nearest valid value, stopping at the edge of the
/// asset's lifetime.
fn ffill_value(series: &BarSeries, field: BarField, ix: usize, asset: &Asset) -> f64 {
    if series.timestamps[ix] > asset.end_date {
        return f64::NAN;
    }
    let values = series.field(field);
    for back in (0..ix).rev() {
        if series.timestamps[back] < asset.start_date {
            break;
        }
        if !values[back].is_nan() {
            return values[back];
        }
    }
    f64::NAN
}

// ================================================================================================
// Bar Window
// ================================================================================================

/// Columnar result of a history query: one logical row per (asset, bar),
/// with one column per requested field.
#[derive(Debug, Clone, PartialEq)]
pub struct BarWindow {
    fields: Vec<BarField>,
    sids: Vec<Sid>,
    timestamps: Vec<DateTime<Utc>>,
    columns: Vec<Vec<f64>>,
}

impl BarWindow {
    pub fn new(fields: Vec<BarField>) -> Self {
        let columns = fields.iter().map(|_| Vec::new()).collect();
        Self {
            fields,
            sids: Vec::new(),
            timestamps: Vec::new(),
            columns,
        }
    }

    fn push_row(&mut self, sid: Sid, dt: DateTime<Utc>, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.fields.len());
        self.sids.push(sid);
        self.timestamps.push(dt);
        for (col, value) in self.columns.iter_mut().zip(values) {
            col.push(value);
        }
    }

    pub fn len(&self) -> usize {
        self.sids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sids.is_empty()
    }

    pub fn fields(&self) -> &[BarField] {
        &self.fields
    }

    pub fn sids(&self) -> &[Sid] {
        &self.sids
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn column(&self, field: BarField) -> TradesimResult<&[f64]> {
        self.fields
            .iter()
            .position(|&f| f == field)
            .map(|ix| self.columns[ix].as_slice())
            .ok_or_else(|| DataError::UnknownField(field.to_string()).into())
    }

    /// The column restricted to a single asset's rows, with timestamps.
    pub fn asset_column(
        &self,
        sid: Sid,
        field: BarField,
    ) -> TradesimResult<Vec<(DateTime<Utc>, f64)>> {
        let column = self.column(field)?;
        Ok(self
            .sids
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s == sid)
            .map(|(ix, _)| (self.timestamps[ix], column[ix]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn flat_bar(dt: DateTime<Utc>, price: f64, volume: f64) -> Bar {
        Bar {
            dt,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn minute_store() -> (BarStore, Asset, TradingCalendar) {
        let calendar = TradingCalendar::from_name(
            "XNYS",
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
        )
        .unwrap();
        let asset = Asset::equity(
            Sid(1),
            "ACME",
            "XNYS",
            ts(2023, 1, 1, 0, 0),
            ts(2023, 12, 31, 0, 0),
        );
        let mut store = BarStore::new(Frequency::MINUTE);
        // Five minutes from the open on Jan 3rd, prices 100..104.
        for (i, minute) in (0..5).enumerate() {
            let dt = ts(2023, 1, 3, 14, 30) + chrono::Duration::minutes(minute);
            store
                .push_bar(
                    Sid(1),
                    Bar {
                        dt,
                        open: 100.0 + i as f64,
                        high: 100.5 + i as f64,
                        low: 99.5 + i as f64,
                        close: 100.0 + i as f64,
                        volume: 10.0,
                    },
                )
                .unwrap();
        }
        (store, asset, calendar)
    }

    #[test]
    fn spot_returns_latest_at_or_before() {
        let (store, _, _) = minute_store();
        assert_eq!(
            store.spot(Sid(1), BarField::Close, ts(2023, 1, 3, 14, 32)),
            Some(102.0)
        );
        // Before the first bar there is nothing to return.
        assert_eq!(store.spot(Sid(1), BarField::Close, ts(2023, 1, 3, 14, 0)), None);
    }

    #[test]
    fn out_of_order_appends_are_rejected() {
        let mut store = BarStore::new(Frequency::MINUTE);
        store
            .push_bar(Sid(1), flat_bar(ts(2023, 1, 3, 14, 31), 1.0, 1.0))
            .unwrap();
        assert!(
            store
                .push_bar(Sid(1), flat_bar(ts(2023, 1, 3, 14, 30), 1.0, 1.0))
                .is_err()
        );
    }

    #[test]
    fn upsampling_aggregates_with_field_rules() {
        let (store, asset, calendar) = minute_store();
        let five_min = Frequency::from_seconds(300).unwrap();
        let window = store
            .history_window(
                &[&asset],
                ts(2023, 1, 3, 14, 35),
                10,
                five_min,
                &[
                    BarField::Open,
                    BarField::High,
                    BarField::Low,
                    BarField::Close,
                    BarField::Volume,
                ],
                false,
                &calendar,
            )
            .unwrap();

        // 14:30..14:34 all fall into one five-minute bucket.
        assert_eq!(window.len(), 1);
        assert_eq!(window.column(BarField::Open).unwrap(), &[100.0]);
        assert_eq!(window.column(BarField::High).unwrap(), &[104.5]);
        assert_eq!(window.column(BarField::Low).unwrap(), &[99.5]);
        assert_eq!(window.column(BarField::Close).unwrap(), &[104.0]);
        assert_eq!(window.column(BarField::Volume).unwrap(), &[50.0]);
    }

    #[test]
    fn downsampling_fails() {
        let mut store = BarStore::new(Frequency::DAILY);
        store
            .push_bar(Sid(1), flat_bar(ts(2023, 1, 3, 21, 0), 100.0, 10.0))
            .unwrap();
        let calendar = TradingCalendar::from_name(
            "XNYS",
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
        )
        .unwrap();
        let asset = Asset::equity(
            Sid(1),
            "ACME",
            "XNYS",
            ts(2023, 1, 1, 0, 0),
            ts(2023, 12, 31, 0, 0),
        );
        let err = store
            .history_window(
                &[&asset],
                ts(2023, 1, 4, 0, 0),
                1,
                Frequency::MINUTE,
                &[BarField::Close],
                false,
                &calendar,
            )
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported frequency"));
    }

    #[test]
    fn minute_bars_roll_up_to_daily_by_session() {
        let (store, asset, calendar) = minute_store();
        let window = store
            .history_window(
                &[&asset],
                ts(2023, 1, 4, 0, 0),
                5,
                Frequency::DAILY,
                &[BarField::Close, BarField::Volume],
                false,
                &calendar,
            )
            .unwrap();
        // All five minutes belong to the Jan 3rd session: one daily bar.
        assert_eq!(window.len(), 1);
        assert_eq!(window.column(BarField::Close).unwrap(), &[104.0]);
        assert_eq!(window.column(BarField::Volume).unwrap(), &[50.0]);
    }

    #[test]
    fn ffill_is_clamped_to_asset_lifetime() {
        let calendar = TradingCalendar::from_name(
            "XNYS",
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
        )
        .unwrap();
        // Asset lists on Jan 4th; the Jan 3rd bar predates its lifetime.
        let asset = Asset::equity(
            Sid(1),
            "ACME",
            "XNYS",
            ts(2023, 1, 4, 0, 0),
            ts(2023, 12, 31, 0, 0),
        );
        let mut store = BarStore::new(Frequency::DAILY);
        store
            .push_bar(Sid(1), flat_bar(ts(2023, 1, 3, 21, 0), 50.0, 10.0))
            .unwrap();
        store
            .push_bar(
                Sid(1),
                Bar {
                    dt: ts(2023, 1, 4, 21, 0),
                    open: f64::NAN,
                    high: f64::NAN,
                    low: f64::NAN,
                    close: f64::NAN,
                    volume: 0.0,
                },
            )
            .unwrap();

        let window = store
            .history_window(
                &[&asset],
                ts(2023, 1, 5, 0, 0),
                2,
                Frequency::DAILY,
                &[BarField::Close],
                true,
                &calendar,
            )
            .unwrap();

        let closes = window.column(BarField::Close).unwrap();
        assert_eq!(closes.len(), 2);
        // The pre-listing value must not forward-fill into the lifetime.
        assert!(closes[1].is_nan());
    }
}
