use chrono::{DateTime, Utc};
use thiserror::Error;

pub type TradesimResult<T> = Result<T, TradesimError>;

#[derive(Debug, Error)]
pub enum TradesimError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Io(#[from] IoError),
}

/// Errors surfaced at construction time, before the clock starts.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid simulation date range: start {start} is after end {end}")]
    InvalidDateRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Capital base must be strictly positive, got {0}")]
    NonPositiveCapital(f64),

    #[error("Unknown trading calendar: '{0}'")]
    UnknownCalendar(String),

    #[error("Session query outside calendar range [{first}, {last}]: {queried}")]
    SessionOutOfRange {
        first: DateTime<Utc>,
        last: DateTime<Utc>,
        queried: DateTime<Utc>,
    },

    #[error("No sessions in the configured simulation range")]
    EmptySessionRange,

    #[error(
        "Benchmark asset {sid} pays a stock dividend on {ex_date} inside the simulation range"
    )]
    InvalidBenchmarkAsset { sid: u64, ex_date: DateTime<Utc> },

    #[error("Benchmark asset {sid} starts trading on {start_date}, after the first session {first_session}")]
    BenchmarkAssetNotAvailableTooEarly {
        sid: u64,
        start_date: DateTime<Utc>,
        first_session: DateTime<Utc>,
    },

    #[error("Benchmark asset {sid} stops trading on {end_date}, before the last session {last_session}")]
    BenchmarkAssetNotAvailableTooLate {
        sid: u64,
        end_date: DateTime<Utc>,
        last_session: DateTime<Utc>,
    },

    #[error("Must provide either a benchmark asset or a benchmark returns series")]
    MissingBenchmark,

    #[error("Invalid emission rate: {0}")]
    InvalidEmissionRate(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("{0}")]
    InvalidArguments(String),
}

/// Errors related to bundle loading, bar queries, and asset lookup.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Unknown asset sid: {0}")]
    UnknownSid(u64),

    #[error("Unknown symbol: '{0}'")]
    UnknownSymbol(String),

    #[error("Duplicate sid {0} in asset repository")]
    DuplicateSid(u64),

    #[error(
        "Invalid asset lifetime for sid {sid}: requires start_date <= first_traded <= end_date"
    )]
    InvalidAssetLifetime { sid: u64 },

    #[error("Unsupported frequency: cannot resample stored {stored_seconds}s bars to {requested_seconds}s")]
    UnsupportedFrequency {
        stored_seconds: u64,
        requested_seconds: u64,
    },

    #[error("No bars for sid {sid} at or before {dt}")]
    NoBarsBefore { sid: u64, dt: DateTime<Utc> },

    #[error("Unknown bar field: '{0}'")]
    UnknownField(String),

    #[error("Failed timestamp conversion: {0}")]
    TimestampConversion(String),

    #[error("Data frame error: {0}")]
    DataFrame(String),
}

/// Order validation and lifecycle errors. These are locally recovered: the
/// order is rejected before entering the blotter and the simulation proceeds.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Unsupported order parameters: {0}")]
    UnsupportedOrderParameters(String),

    #[error("Cannot order delisted asset {sid} at {dt}")]
    CannotOrderDelistedAsset { sid: u64, dt: DateTime<Utc> },

    #[error("Order for {amount} shares of sid {sid} at {dt} violates trading constraint: {constraint}")]
    TradingControlViolation {
        sid: u64,
        amount: i64,
        dt: DateTime<Utc>,
        constraint: String,
    },

    #[error("Account control violated at {dt}: {constraint}")]
    AccountControlViolation {
        dt: DateTime<Utc>,
        constraint: String,
    },

    #[error("Orders cannot be placed inside before_trading_start")]
    OrderInBeforeTradingStart,

    #[error("Market data dependent operations are not available inside initialize")]
    OrderDuringInitialize,

    #[error("Unknown order id: {0}")]
    UnknownOrderId(String),

    #[error("Invalid status transition for order {order_id}: {from} -> {to}")]
    InvalidStatusTransition {
        order_id: String,
        from: String,
        to: String,
    },
}

/// An error raised inside a user strategy callback.
#[derive(Debug, Error)]
#[error("Strategy callback '{callback}' failed at {dt}: {message}")]
pub struct StrategyError {
    pub callback: &'static str,
    pub dt: DateTime<Utc>,
    pub message: String,
}

/// Ledger invariant breaches. These are fatal: the simulation aborts with a
/// diagnostic dump after emitting the partial risk report.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Portfolio value diverged from cash + positions value: {diagnostic}")]
    PortfolioValueMismatch { diagnostic: String },

    #[error("Transaction for order {order_id} overfills the order: |filled| {filled} > |amount| {amount}")]
    Overfill {
        order_id: String,
        filled: i64,
        amount: i64,
    },

    #[error("Transaction amount sign does not match order {order_id}")]
    SignMismatch { order_id: String },

    #[error("No position in sid {sid} to {operation}")]
    NoSuchPosition { sid: u64, operation: &'static str },
}

/// Errors touching the filesystem and bundle storage layout.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("Bundle '{0}' not found")]
    BundleNotFound(String),

    #[error("Bundle '{name}' has no version '{version}'")]
    BundleVersionNotFound { name: String, version: String },

    #[error("Malformed bundle manifest at {path}: {message}")]
    MalformedManifest { path: String, message: String },

    #[error("Failed to serialize store: {0}")]
    Serialize(String),

    #[error("Failed to deserialize store: {0}")]
    Deserialize(String),

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TradesimError {
    /// Whether this error is recovered locally (the simulation keeps going)
    /// or must propagate to the driver.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TradesimError::Order(_) | TradesimError::Data(DataError::NoBarsBefore { .. })
        )
    }
}
