use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};
use strum_macros::EnumString;

use crate::{
    error::{DataError, TradesimResult},
    impl_from_primitive,
};

// ================================================================================================
// Domain Strong Types (NewTypes)
// ================================================================================================

/// Stable integer security identifier, globally unique across asset kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Sid(pub u64);
impl_from_primitive!(Sid, u64);

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of instrument an [`Asset`] represents.
///
/// The kind decides how the ledger settles fills: equities and currencies
/// move cash by `price * amount` at execution, futures settle mark-to-market
/// differences scaled by the contract's `price_multiplier`.
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
#[strum(serialize_all = "snake_case")]
pub enum AssetKind {
    Equity,
    Future,
    Currency,
    ContinuousFuture,
}

impl AssetKind {
    pub fn is_cash_settled(&self) -> bool {
        matches!(self, AssetKind::Future | AssetKind::ContinuousFuture)
    }
}

// ================================================================================================
// Asset
// ================================================================================================

/// A tradable instrument with a bounded lifetime.
///
/// Invariant: `start_date <= first_traded <= end_date`. `auto_close_date`,
/// when set, is the session on which any remaining position is liquidated
/// regardless of the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub sid: Sid,
    pub kind: AssetKind,
    pub symbol: String,
    pub exchange: String,
    pub start_date: DateTime<Utc>,
    pub first_traded: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub auto_close_date: Option<DateTime<Utc>>,
    /// 1.0 for equities and currencies; the contract multiplier for futures.
    pub price_multiplier: f64,
}

impl Asset {
    pub fn equity(
        sid: Sid,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            sid,
            kind: AssetKind::Equity,
            symbol: symbol.into(),
            exchange: exchange.into(),
            start_date,
            first_traded: start_date,
            end_date,
            auto_close_date: None,
            price_multiplier: 1.0,
        }
    }

    pub fn future(
        sid: Sid,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        price_multiplier: f64,
    ) -> Self {
        Self {
            sid,
            kind: AssetKind::Future,
            symbol: symbol.into(),
            exchange: exchange.into(),
            start_date,
            first_traded: start_date,
            end_date,
            auto_close_date: Some(end_date),
            price_multiplier,
        }
    }

    pub fn with_auto_close_date(self, auto_close_date: DateTime<Utc>) -> Self {
        Self {
            auto_close_date: Some(auto_close_date),
            ..self
        }
    }

    pub fn with_first_traded(self, first_traded: DateTime<Utc>) -> Self {
        Self {
            first_traded,
            ..self
        }
    }

    /// Whether the asset is alive (listed) at `dt`.
    pub fn is_alive_at(&self, dt: DateTime<Utc>) -> bool {
        self.start_date <= dt && dt <= self.end_date
    }

    /// Whether the asset can still be ordered at `dt`. An asset whose
    /// auto-close date has arrived is no longer orderable even if its
    /// listing lifetime has not ended.
    pub fn is_tradable_at(&self, dt: DateTime<Utc>) -> bool {
        if !self.is_alive_at(dt) {
            return false;
        }
        match self.auto_close_date {
            Some(acd) => dt < acd,
            None => true,
        }
    }

    fn validate(&self) -> TradesimResult<()> {
        if self.start_date <= self.first_traded && self.first_traded <= self.end_date {
            Ok(())
        } else {
            Err(DataError::InvalidAssetLifetime { sid: self.sid.0 }.into())
        }
    }
}

// ================================================================================================
// Asset Repository
// ================================================================================================

/// Asset metadata store: lookup by sid or by symbol.
///
/// Symbols map to the most recently listed asset carrying them, so a recycled
/// ticker resolves to its latest owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetRepository {
    by_sid: BTreeMap<Sid, Asset>,
}

impl AssetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset: Asset) -> TradesimResult<()> {
        asset.validate()?;
        if self.by_sid.contains_key(&asset.sid) {
            return Err(DataError::DuplicateSid(asset.sid.0).into());
        }
        self.by_sid.insert(asset.sid, asset);
        Ok(())
    }

    pub fn retrieve(&self, sid: Sid) -> TradesimResult<&Asset> {
        self.by_sid
            .get(&sid)
            .ok_or_else(|| DataError::UnknownSid(sid.0).into())
    }

    pub fn retrieve_all(
        &self,
        sids: impl IntoIterator<Item = Sid>,
    ) -> TradesimResult<Vec<&Asset>> {
        sids.into_iter().map(|sid| self.retrieve(sid)).collect()
    }

    pub fn lookup_symbol(&self, symbol: &str) -> TradesimResult<&Asset> {
        self.by_sid
            .values()
            .filter(|a| a.symbol.eq_ignore_ascii_case(symbol))
            .max_by_key(|a| a.start_date)
            .ok_or_else(|| DataError::UnknownSymbol(symbol.to_string()).into())
    }

    pub fn sids(&self) -> impl Iterator<Item = Sid> + '_ {
        self.by_sid.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Asset> {
        self.by_sid.values()
    }

    pub fn len(&self) -> usize {
        self.by_sid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn dt(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn repo_with_two_listings() -> AssetRepository {
        let mut repo = AssetRepository::new();
        repo.insert(Asset::equity(
            Sid(1),
            "ACME",
            "XNYS",
            dt(2010, 1, 1),
            dt(2015, 1, 1),
        ))
        .unwrap();
        // Ticker recycled by a newer listing.
        repo.insert(Asset::equity(
            Sid(2),
            "ACME",
            "XNYS",
            dt(2016, 1, 1),
            dt(2025, 1, 1),
        ))
        .unwrap();
        repo
    }

    #[test]
    fn symbol_lookup_prefers_latest_listing() {
        let repo = repo_with_two_listings();
        assert_eq!(repo.lookup_symbol("ACME").unwrap().sid, Sid(2));
        assert_eq!(repo.lookup_symbol("acme").unwrap().sid, Sid(2));
    }

    #[test]
    fn duplicate_sid_is_rejected() {
        let mut repo = repo_with_two_listings();
        let dup = Asset::equity(Sid(1), "OTHER", "XNYS", dt(2020, 1, 1), dt(2021, 1, 1));
        assert!(repo.insert(dup).is_err());
    }

    #[test]
    fn lifetime_invariant_is_enforced() {
        let mut repo = AssetRepository::new();
        let bad = Asset::equity(Sid(9), "BAD", "XNYS", dt(2020, 1, 1), dt(2021, 1, 1))
            .with_first_traded(dt(2019, 1, 1));
        assert!(repo.insert(bad).is_err());
    }

    #[test]
    fn auto_close_bounds_tradability() {
        let asset = Asset::equity(Sid(3), "EXP", "XNYS", dt(2020, 1, 1), dt(2022, 1, 1))
            .with_auto_close_date(dt(2021, 6, 1));

        // Alive and orderable the day before auto-close.
        assert!(asset.is_tradable_at(dt(2021, 5, 31)));
        // On the auto-close date the asset can no longer be ordered.
        assert!(!asset.is_tradable_at(dt(2021, 6, 1)));
        assert!(asset.is_alive_at(dt(2021, 6, 1)));
    }
}
