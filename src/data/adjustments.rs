use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{assets::Sid, data::bars::BarField};

// ================================================================================================
// Corporate Actions
// ================================================================================================

/// A share split. `ratio` is the multiplier applied to share counts on the
/// effective date: a 2-for-1 split has `ratio = 2.0`. Prices recorded before
/// the effective date are multiplied by `1 / ratio`; volumes by `ratio`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub sid: Sid,
    pub ratio: f64,
    pub effective_date: NaiveDate,
}

/// A cash dividend: `amount` is paid per share held at the ex-date, with the
/// cash arriving on the pay date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dividend {
    pub sid: Sid,
    pub amount: f64,
    pub ex_date: NaiveDate,
    pub pay_date: NaiveDate,
    pub declared_date: Option<NaiveDate>,
    pub record_date: Option<NaiveDate>,
}

/// A dividend paid in shares of `payment_sid` rather than cash:
/// `ratio` shares of the payment asset per share held at the ex-date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StockDividend {
    pub sid: Sid,
    pub payment_sid: Sid,
    pub ratio: f64,
    pub ex_date: NaiveDate,
    pub pay_date: NaiveDate,
}

// ================================================================================================
// Adjustment Repository
// ================================================================================================

/// Store of corporate actions for a bundle, queried by the ledger on each
/// session start and by the reader for adjusted values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdjustmentRepository {
    splits: Vec<Split>,
    dividends: Vec<Dividend>,
    stock_dividends: Vec<StockDividend>,
}

impl AdjustmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_split(&mut self, split: Split) {
        self.splits.push(split);
        self.splits
            .sort_by(|a, b| (a.effective_date, a.sid).cmp(&(b.effective_date, b.sid)));
    }

    pub fn add_dividend(&mut self, dividend: Dividend) {
        self.dividends.push(dividend);
        self.dividends
            .sort_by(|a, b| (a.ex_date, a.sid).cmp(&(b.ex_date, b.sid)));
    }

    pub fn add_stock_dividend(&mut self, dividend: StockDividend) {
        self.stock_dividends.push(dividend);
        self.stock_dividends
            .sort_by(|a, b| (a.ex_date, a.sid).cmp(&(b.ex_date, b.sid)));
    }

    /// Splits for any of `sids` taking effect on `date`.
    pub fn splits_on(&self, sids: &BTreeSet<Sid>, date: NaiveDate) -> Vec<Split> {
        self.splits
            .iter()
            .filter(|s| s.effective_date == date && sids.contains(&s.sid))
            .copied()
            .collect()
    }

    /// Cash dividends for any of `sids` going ex on `date`.
    pub fn dividends_with_ex_date(&self, sids: &BTreeSet<Sid>, date: NaiveDate) -> Vec<Dividend> {
        self.dividends
            .iter()
            .filter(|d| d.ex_date == date && sids.contains(&d.sid))
            .copied()
            .collect()
    }

    /// Stock dividends for any of `sids` going ex on `date`.
    pub fn stock_dividends_with_ex_date(
        &self,
        sids: &BTreeSet<Sid>,
        date: NaiveDate,
    ) -> Vec<StockDividend> {
        self.stock_dividends
            .iter()
            .filter(|d| d.ex_date == date && sids.contains(&d.sid))
            .copied()
            .collect()
    }

    /// Stock dividends of one asset with ex-date inside `[start, end]`.
    /// Used to validate benchmark assets, whose returns a stock dividend
    /// would contaminate.
    pub fn stock_dividends_in_range(
        &self,
        sid: Sid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<StockDividend> {
        self.stock_dividends
            .iter()
            .filter(|d| d.sid == sid && (start..=end).contains(&d.ex_date))
            .copied()
            .collect()
    }

    /// Cumulative adjustment ratio for observing `field` as of `dt` from the
    /// later vantage point `perspective_date`: the product over all splits
    /// (and, for price fields, dividend ratios) effective in
    /// `(dt, perspective_date]`.
    ///
    /// `prior_close` supplies the close used to convert a cash dividend into
    /// a multiplicative ratio; dividends are skipped when it is unknown.
    pub fn cumulative_ratio(
        &self,
        sid: Sid,
        field: BarField,
        date: NaiveDate,
        perspective_date: NaiveDate,
        prior_close: impl Fn(NaiveDate) -> Option<f64>,
    ) -> f64 {
        let mut ratio = 1.0;
        for split in &self.splits {
            if split.sid == sid
                && split.effective_date > date
                && split.effective_date <= perspective_date
            {
                if field.is_price() {
                    ratio /= split.ratio;
                } else {
                    ratio *= split.ratio;
                }
            }
        }
        if field.is_price() {
            for dividend in &self.dividends {
                if dividend.sid == sid
                    && dividend.ex_date > date
                    && dividend.ex_date <= perspective_date
                    && let Some(close) = prior_close(dividend.ex_date)
                    && close > 0.0
                {
                    ratio *= 1.0 - dividend.amount / close;
                }
            }
        }
        ratio
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty() && self.dividends.is_empty() && self.stock_dividends.is_empty()
    }
}
