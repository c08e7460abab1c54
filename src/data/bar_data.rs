use chrono::{DateTime, Utc};

use crate::{
    assets::Sid,
    data::{
        Frequency,
        bars::{Bar, BarField, BarWindow},
        bundle::BundleData,
    },
    error::TradesimResult,
};

/// The strategy's window onto market data at the current simulation minute.
///
/// A fresh view is handed to every callback invocation; it cannot see past
/// the simulation clock. Missing bars at an open minute surface as NaN for
/// price fields and 0.0 for volume, so strategies can branch on
/// `value.is_nan()` without error plumbing.
#[derive(Debug, Clone, Copy)]
pub struct BarData<'a> {
    bundle: &'a BundleData,
    dt: DateTime<Utc>,
    frequency: Frequency,
}

impl<'a> BarData<'a> {
    pub fn new(bundle: &'a BundleData, dt: DateTime<Utc>, frequency: Frequency) -> Self {
        Self {
            bundle,
            dt,
            frequency,
        }
    }

    /// The simulation timestamp this view is anchored to.
    pub fn current_dt(&self) -> DateTime<Utc> {
        self.dt
    }

    /// The current value of one field for one asset.
    pub fn current(&self, sid: Sid, field: BarField) -> f64 {
        match self.bundle.spot_value(sid, field, self.dt, self.frequency) {
            Ok(value) => value,
            Err(_) => missing_value(field),
        }
    }

    /// The full bar in effect at the current timestamp, if any.
    pub fn current_bar(&self, sid: Sid) -> Option<Bar> {
        self.bundle.bar_store().spot_bar(sid, self.dt)
    }

    /// A history window ending at the current timestamp.
    pub fn history(
        &self,
        sids: &[Sid],
        fields: &[BarField],
        bar_count: usize,
        frequency: Frequency,
    ) -> TradesimResult<BarWindow> {
        self.bundle
            .history_window(sids, self.dt, bar_count, frequency, fields, true)
    }

    /// Whether the asset can currently be ordered: listed, not past its
    /// auto-close date, and trading has begun.
    pub fn can_trade(&self, sid: Sid) -> bool {
        match self.bundle.asset_repository().retrieve(sid) {
            Ok(asset) => asset.is_tradable_at(self.dt) && asset.first_traded <= self.dt,
            Err(_) => false,
        }
    }

    /// Whether the asset is alive but did not trade in the current bar.
    pub fn is_stale(&self, sid: Sid) -> bool {
        let Ok(asset) = self.bundle.asset_repository().retrieve(sid) else {
            return false;
        };
        if !asset.is_alive_at(self.dt) {
            return false;
        }
        match self.bundle.bar_store().spot_bar(sid, self.dt) {
            Some(bar) => bar.dt < self.dt,
            None => true,
        }
    }
}

fn missing_value(field: BarField) -> f64 {
    if field.is_price() { f64::NAN } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use crate::{
        assets::{Asset, AssetRepository},
        calendar::TradingCalendar,
        data::{AdjustmentRepository, bars::BarStore},
    };

    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn bundle() -> BundleData {
        let calendar = TradingCalendar::from_name(
            "XNYS",
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
        )
        .unwrap();
        let mut assets = AssetRepository::new();
        assets
            .insert(Asset::equity(
                Sid(1),
                "ACME",
                "XNYS",
                ts(2023, 1, 1, 0, 0),
                ts(2023, 12, 31, 0, 0),
            ))
            .unwrap();
        let mut bars = BarStore::new(Frequency::DAILY);
        bars.push_bar(
            Sid(1),
            Bar {
                dt: ts(2023, 1, 3, 21, 0),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 1000.0,
            },
        )
        .unwrap();
        BundleData::new(
            "test",
            "v1",
            calendar,
            bars,
            assets,
            AdjustmentRepository::new(),
        )
    }

    #[test]
    fn missing_prices_are_nan_and_missing_volume_is_zero() {
        let bundle = bundle();
        // Anchored before the first bar: nothing is visible yet.
        let data = BarData::new(&bundle, ts(2023, 1, 2, 21, 0), Frequency::DAILY);
        assert!(data.current(Sid(1), BarField::Close).is_nan());
        assert_eq!(data.current(Sid(1), BarField::Volume), 0.0);
    }

    #[test]
    fn current_reads_the_latest_bar() {
        let bundle = bundle();
        let data = BarData::new(&bundle, ts(2023, 1, 3, 21, 0), Frequency::DAILY);
        assert_eq!(data.current(Sid(1), BarField::Close), 100.5);
        assert!(!data.is_stale(Sid(1)));
    }

    #[test]
    fn stale_when_no_trade_in_current_bar() {
        let bundle = bundle();
        let data = BarData::new(&bundle, ts(2023, 1, 4, 21, 0), Frequency::DAILY);
        // Latest bar is Jan 3rd; the Jan 4th view still sees it but flags it.
        assert_eq!(data.current(Sid(1), BarField::Close), 100.5);
        assert!(data.is_stale(Sid(1)));
    }

    #[test]
    fn unknown_assets_cannot_trade() {
        let bundle = bundle();
        let data = BarData::new(&bundle, ts(2023, 1, 3, 21, 0), Frequency::DAILY);
        assert!(data.can_trade(Sid(1)));
        assert!(!data.can_trade(Sid(99)));
    }
}
