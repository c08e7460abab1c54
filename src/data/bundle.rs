use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    assets::{AssetRepository, Sid},
    calendar::TradingCalendar,
    data::{
        AdjustmentRepository, Dividend, Frequency, Split, StockDividend,
        bars::{Bar, BarField, BarStore, BarWindow},
    },
    error::{DataError, IoError, TradesimResult},
};

const MANIFEST_FILE: &str = "manifest.json";
const BARS_FILE: &str = "bars.postcard";
const ASSETS_FILE: &str = "assets.postcard";
const ADJUSTMENTS_FILE: &str = "adjustments.postcard";

// ================================================================================================
// Bundle Data
// ================================================================================================

/// An ingested bundle: bar store, asset metadata and corporate actions bound
/// to one trading calendar. Read-only after ingestion; one instance can back
/// any number of simulations.
#[derive(Debug, Clone)]
pub struct BundleData {
    name: String,
    version: String,
    calendar: TradingCalendar,
    bars: BarStore,
    assets: AssetRepository,
    adjustments: AdjustmentRepository,
}

impl BundleData {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        calendar: TradingCalendar,
        bars: BarStore,
        assets: AssetRepository,
        adjustments: AdjustmentRepository,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            calendar,
            bars,
            assets,
            adjustments,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    pub fn frequency(&self) -> Frequency {
        self.bars.frequency()
    }

    pub fn asset_repository(&self) -> &AssetRepository {
        &self.assets
    }

    pub fn adjustment_repository(&self) -> &AdjustmentRepository {
        &self.adjustments
    }

    pub fn bar_store(&self) -> &BarStore {
        &self.bars
    }

    /// Tabular history slice: `bar_count` bars per asset at `frequency`,
    /// ending at or before `end_dt`.
    pub fn history_window(
        &self,
        sids: &[Sid],
        end_dt: DateTime<Utc>,
        bar_count: usize,
        frequency: Frequency,
        fields: &[BarField],
        ffill: bool,
    ) -> TradesimResult<BarWindow> {
        let assets = self.assets.retrieve_all(sids.iter().copied())?;
        self.bars.history_window(
            &assets,
            end_dt,
            bar_count,
            frequency,
            fields,
            ffill,
            &self.calendar,
        )
    }

    /// The latest value of `field` at or before `dt`, at `frequency`.
    pub fn spot_value(
        &self,
        sid: Sid,
        field: BarField,
        dt: DateTime<Utc>,
        frequency: Frequency,
    ) -> TradesimResult<f64> {
        if frequency == self.bars.frequency() {
            return self
                .bars
                .spot(sid, field, dt)
                .ok_or_else(|| DataError::NoBarsBefore { sid: sid.0, dt }.into());
        }
        let window = self.history_window(&[sid], dt, 1, frequency, &[field], false)?;
        window
            .column(field)?
            .last()
            .copied()
            .ok_or_else(|| DataError::NoBarsBefore { sid: sid.0, dt }.into())
    }

    /// Spot value adjusted for splits and dividends effective between `dt`
    /// (exclusive) and `perspective_dt` (inclusive). Equities only; other
    /// asset kinds pass through unadjusted.
    pub fn adjusted_value(
        &self,
        sid: Sid,
        field: BarField,
        dt: DateTime<Utc>,
        perspective_dt: DateTime<Utc>,
    ) -> TradesimResult<f64> {
        let spot = self.spot_value(sid, field, dt, self.bars.frequency())?;
        let asset = self.assets.retrieve(sid)?;
        if !matches!(asset.kind, crate::assets::AssetKind::Equity) {
            return Ok(spot);
        }
        let ratio = self.adjustments.cumulative_ratio(
            sid,
            field,
            dt.date_naive(),
            perspective_dt.date_naive(),
            |ex_date| self.prior_close(sid, ex_date),
        );
        Ok(spot * ratio)
    }

    pub fn splits(&self, sids: &BTreeSet<Sid>, date: NaiveDate) -> Vec<Split> {
        self.adjustments.splits_on(sids, date)
    }

    pub fn dividends_with_ex_date(&self, sids: &BTreeSet<Sid>, date: NaiveDate) -> Vec<Dividend> {
        self.adjustments.dividends_with_ex_date(sids, date)
    }

    pub fn stock_dividends_with_ex_date(
        &self,
        sids: &BTreeSet<Sid>,
        date: NaiveDate,
    ) -> Vec<StockDividend> {
        self.adjustments.stock_dividends_with_ex_date(sids, date)
    }

    /// The last close recorded strictly before `date`'s session.
    fn prior_close(&self, sid: Sid, date: NaiveDate) -> Option<f64> {
        let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
        self.bars.spot(sid, BarField::Close, midnight)
    }

    pub fn manifest(&self, timestamp: DateTime<Utc>) -> TradesimResult<BundleManifest> {
        Ok(BundleManifest {
            start_date: self.calendar.first_session()?,
            end_date: self.calendar.last_session()?,
            frequency_seconds: self.bars.frequency().seconds(),
            trading_calendar_name: self.calendar.name().to_string(),
            timestamp: timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            version: self.version.clone(),
            storage_class: "postcard_bar_store".to_string(),
            asset_repository_class: "asset_repository".to_string(),
            adjustment_repository_class: "adjustment_repository".to_string(),
        })
    }
}

// ================================================================================================
// Manifest
// ================================================================================================

/// The JSON manifest persisted next to a bundle version's stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub frequency_seconds: u64,
    pub trading_calendar_name: String,
    pub timestamp: String,
    pub version: String,
    pub storage_class: String,
    pub asset_repository_class: String,
    pub adjustment_repository_class: String,
}

// ================================================================================================
// Bundle Registry
// ================================================================================================

/// Criteria for pruning bundle versions.
#[derive(Debug, Clone)]
pub enum CleanCriteria {
    /// Remove versions whose ingestion timestamp is before the date.
    Before(NaiveDate),
    /// Remove versions whose ingestion timestamp is after the date.
    After(NaiveDate),
    /// Keep only the `n` most recent versions.
    KeepLast(usize),
}

/// Filesystem layout: `<root>/<bundle_name>/<version>/` holding the manifest
/// and the postcard-encoded bar, asset and adjustment stores.
#[derive(Debug, Clone)]
pub struct BundleRegistry {
    root: PathBuf,
}

impl BundleRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(version)
    }

    /// Persist a bundle version to disk.
    pub async fn write_bundle(
        &self,
        bundle: &BundleData,
        timestamp: DateTime<Utc>,
    ) -> TradesimResult<()> {
        let dir = self.version_dir(bundle.name(), bundle.version());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| fs_err(&dir, e))?;

        let manifest = bundle.manifest(timestamp)?;
        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| IoError::Serialize(e.to_string()))?;
        write_file(&dir.join(MANIFEST_FILE), &manifest_json).await?;

        write_file(&dir.join(BARS_FILE), &encode(&bundle.bars)?).await?;
        write_file(&dir.join(ASSETS_FILE), &encode(&bundle.assets)?).await?;
        write_file(&dir.join(ADJUSTMENTS_FILE), &encode(&bundle.adjustments)?).await?;

        tracing::info!(
            bundle = bundle.name(),
            version = bundle.version(),
            path = %dir.display(),
            "bundle written"
        );
        Ok(())
    }

    /// Load a bundle version; the newest version when none is given.
    pub async fn load_bundle(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> TradesimResult<BundleData> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self
                .versions(name)
                .await?
                .into_iter()
                .max()
                .ok_or_else(|| IoError::BundleNotFound(name.to_string()))?,
        };
        let dir = self.version_dir(name, &version);
        if !dir.is_dir() {
            return Err(IoError::BundleVersionNotFound {
                name: name.to_string(),
                version,
            }
            .into());
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest_raw = read_file(&manifest_path).await?;
        let manifest: BundleManifest = serde_json::from_slice(&manifest_raw).map_err(|e| {
            IoError::MalformedManifest {
                path: manifest_path.display().to_string(),
                message: e.to_string(),
            }
        })?;

        let calendar = TradingCalendar::from_name(
            &manifest.trading_calendar_name,
            manifest.start_date,
            manifest.end_date,
        )?;
        let bars: BarStore = decode(&read_file(&dir.join(BARS_FILE)).await?)?;
        let assets: AssetRepository = decode(&read_file(&dir.join(ASSETS_FILE)).await?)?;
        let adjustments: AdjustmentRepository =
            decode(&read_file(&dir.join(ADJUSTMENTS_FILE)).await?)?;

        Ok(BundleData::new(
            name, version, calendar, bars, assets, adjustments,
        ))
    }

    /// Names of every bundle under the root.
    pub async fn bundles(&self) -> TradesimResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(names),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| fs_err(&self.root, e))?
        {
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// All versions of one bundle, ascending.
    pub async fn versions(&self, name: &str) -> TradesimResult<Vec<String>> {
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(IoError::BundleNotFound(name.to_string()).into());
        }
        let mut versions = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| fs_err(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| fs_err(&dir, e))? {
            if entry.path().is_dir()
                && let Some(version) = entry.file_name().to_str()
            {
                versions.push(version.to_string());
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Prune bundle versions per the criteria. Returns the removed versions.
    pub async fn clean(
        &self,
        name: &str,
        criteria: CleanCriteria,
    ) -> TradesimResult<Vec<String>> {
        let versions = self.versions(name).await?;
        let doomed: Vec<String> = match criteria {
            CleanCriteria::Before(date) => {
                let mut doomed = Vec::new();
                for v in &versions {
                    if let Some(ts) = self.version_timestamp(name, v).await?
                        && ts.date_naive() < date
                    {
                        doomed.push(v.clone());
                    }
                }
                doomed
            }
            CleanCriteria::After(date) => {
                let mut doomed = Vec::new();
                for v in &versions {
                    if let Some(ts) = self.version_timestamp(name, v).await?
                        && ts.date_naive() > date
                    {
                        doomed.push(v.clone());
                    }
                }
                doomed
            }
            CleanCriteria::KeepLast(n) => {
                let cutoff = versions.len().saturating_sub(n);
                versions[..cutoff].to_vec()
            }
        };

        for version in &doomed {
            let dir = self.version_dir(name, version);
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| fs_err(&dir, e))?;
            tracing::info!(bundle = name, version, "bundle version removed");
        }
        Ok(doomed)
    }

    async fn version_timestamp(
        &self,
        name: &str,
        version: &str,
    ) -> TradesimResult<Option<DateTime<Utc>>> {
        let path = self.version_dir(name, version).join(MANIFEST_FILE);
        let raw = match read_file(&path).await {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let manifest: BundleManifest =
            serde_json::from_slice(&raw).map_err(|e| IoError::MalformedManifest {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(DateTime::parse_from_rfc3339(&manifest.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

fn encode<T: Serialize>(value: &T) -> TradesimResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| IoError::Serialize(e.to_string()).into())
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &[u8]) -> TradesimResult<T> {
    postcard::from_bytes(raw).map_err(|e| IoError::Deserialize(e.to_string()).into())
}

async fn write_file(path: &Path, contents: &[u8]) -> TradesimResult<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| fs_err(path, e).into())
}

async fn read_file(path: &Path) -> TradesimResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| fs_err(path, e).into())
}

fn fs_err(path: &Path, source: std::io::Error) -> IoError {
    IoError::Filesystem {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use crate::assets::Asset;

    use super::*;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn sample_bundle(version: &str) -> BundleData {
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
        for (i, session) in calendar.sessions().iter().take(5).enumerate() {
            let close_dt = calendar.session_close(*session).unwrap();
            bars.push_bar(
                Sid(1),
                Bar {
                    dt: close_dt,
                    open: 100.0 + i as f64,
                    high: 101.0 + i as f64,
                    low: 99.0 + i as f64,
                    close: 100.5 + i as f64,
                    volume: 1000.0,
                },
            )
            .unwrap();
        }
        BundleData::new(
            "test-bundle",
            version,
            calendar,
            bars,
            assets,
            AdjustmentRepository::new(),
        )
    }

    #[tokio::test]
    async fn bundle_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BundleRegistry::new(dir.path());
        let bundle = sample_bundle("20230201T000000");
        registry
            .write_bundle(&bundle, ts(2023, 2, 1, 0, 0))
            .await
            .unwrap();

        let loaded = registry.load_bundle("test-bundle", None).await.unwrap();
        assert_eq!(loaded.version(), "20230201T000000");

        // Any in-range query must be identical before and after the round trip.
        let end = ts(2023, 1, 10, 0, 0);
        let before = bundle
            .history_window(&[Sid(1)], end, 3, Frequency::DAILY, &[BarField::Close], false)
            .unwrap();
        let after = loaded
            .history_window(&[Sid(1)], end, 3, Frequency::DAILY, &[BarField::Close], false)
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn missing_bundle_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BundleRegistry::new(dir.path());
        let err = registry.load_bundle("nope", None).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn clean_keep_last_removes_oldest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BundleRegistry::new(dir.path());
        for (i, version) in ["20230101T000000", "20230102T000000", "20230103T000000"]
            .iter()
            .enumerate()
        {
            let bundle = sample_bundle(version);
            registry
                .write_bundle(&bundle, ts(2023, 1, 1 + i as u32, 0, 0))
                .await
                .unwrap();
        }

        let removed = registry
            .clean("test-bundle", CleanCriteria::KeepLast(1))
            .await
            .unwrap();
        assert_eq!(removed, vec!["20230101T000000", "20230102T000000"]);
        assert_eq!(
            registry.versions("test-bundle").await.unwrap(),
            vec!["20230103T000000"]
        );
    }

    #[tokio::test]
    async fn newest_version_wins_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BundleRegistry::new(dir.path());
        for version in ["20230101T000000", "20230105T000000"] {
            registry
                .write_bundle(&sample_bundle(version), ts(2023, 1, 6, 0, 0))
                .await
                .unwrap();
        }
        let loaded = registry.load_bundle("test-bundle", None).await.unwrap();
        assert_eq!(loaded.version(), "20230105T000000");
    }
}
