pub mod adjustments;
pub mod bar_data;
pub mod bars;
pub mod bundle;

pub use adjustments::{AdjustmentRepository, Dividend, Split, StockDividend};
pub use bar_data::BarData;
pub use bars::{Bar, BarField, BarStore, BarWindow};
pub use bundle::{BundleData, BundleManifest, BundleRegistry, CleanCriteria};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, TradesimResult};

// ================================================================================================
// Frequency
// ================================================================================================

/// A bar or emission frequency, expressed in seconds per bar.
///
/// Daily bars live on the session-close grid rather than a fixed-step grid,
/// so [`Frequency::DAILY`] is special-cased throughout: resampling intraday
/// data up to daily groups by trading session, not by 86400-second buckets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Frequency(u64);

impl Frequency {
    pub const MINUTE: Frequency = Frequency(60);
    pub const DAILY: Frequency = Frequency(86_400);

    pub fn from_seconds(seconds: u64) -> TradesimResult<Self> {
        if seconds == 0 {
            return Err(
                ConfigurationError::InvalidEmissionRate("zero-length frequency".to_string()).into(),
            );
        }
        Ok(Self(seconds))
    }

    /// Parse a human-readable frequency such as `1m`, `5m` or `1day`.
    pub fn parse(s: &str) -> TradesimResult<Self> {
        let duration = humantime::parse_duration(s).map_err(|e| {
            ConfigurationError::InvalidEmissionRate(format!("'{s}': {e}"))
        })?;
        Self::from_seconds(duration.as_secs())
    }

    pub fn seconds(&self) -> u64 {
        self.0
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.0 as i64)
    }

    pub fn is_daily(&self) -> bool {
        self.0 >= Frequency::DAILY.0
    }

    pub fn is_intraday(&self) -> bool {
        !self.is_daily()
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_daily() {
            write!(f, "{}d", self.0 / Frequency::DAILY.0)
        } else if self.0 % 60 == 0 {
            write!(f, "{}m", self.0 / 60)
        } else {
            write!(f, "{}s", self.0)
        }
    }
}
