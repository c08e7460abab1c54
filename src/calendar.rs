use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::{ConfigurationError, TradesimResult};

/// A trading session, labeled by its calendar date in the exchange timezone.
pub type Session = NaiveDate;

// ================================================================================================
// Trading Calendar
// ================================================================================================

/// Sessions, market opens/closes and minute <-> session mapping for one venue.
///
/// All wall-clock times (open, close, early closes) are expressed in the
/// calendar's timezone; every timestamp handed out by the calendar is UTC.
/// Half-days are reflected in `session_close`.
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    name: String,
    tz: Tz,
    open_time: NaiveTime,
    close_time: NaiveTime,
    weekmask: [bool; 7],
    holidays: BTreeSet<NaiveDate>,
    early_closes: BTreeMap<NaiveDate, NaiveTime>,
    sessions: Vec<Session>,
}

impl TradingCalendar {
    /// Build a calendar with explicit parameters over `[first, last]`.
    pub fn new(
        name: impl Into<String>,
        tz: Tz,
        open_time: NaiveTime,
        close_time: NaiveTime,
        first: NaiveDate,
        last: NaiveDate,
    ) -> TradesimResult<Self> {
        if first > last {
            return Err(ConfigurationError::InvalidDateRange {
                start: utc_midnight(first),
                end: utc_midnight(last),
            }
            .into());
        }
        let mut cal = Self {
            name: name.into(),
            tz,
            open_time,
            close_time,
            weekmask: [true, true, true, true, true, false, false],
            holidays: BTreeSet::new(),
            early_closes: BTreeMap::new(),
            sessions: Vec::new(),
        };
        cal.rebuild_sessions(first, last);
        Ok(cal)
    }

    /// Build a calendar by name. Known names: `XNYS` (New York, 09:30-16:00
    /// America/New_York, US holiday schedule, 13:00 early closes around
    /// Independence Day and Thanksgiving) and `24/7`.
    pub fn from_name(name: &str, first: NaiveDate, last: NaiveDate) -> TradesimResult<Self> {
        match name {
            "XNYS" => {
                let mut cal = Self::new(
                    "XNYS",
                    chrono_tz::America::New_York,
                    NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                    NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
                    first,
                    last,
                )?;
                let holidays = us_equity_holidays(first.year(), last.year());
                let early_closes = us_equity_early_closes(first.year(), last.year());
                cal = cal.with_holidays(holidays).with_early_closes(early_closes);
                Ok(cal)
            }
            "24/7" => {
                let mut cal = Self::new(
                    "24/7",
                    chrono_tz::UTC,
                    NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
                    first,
                    last,
                )?;
                cal.weekmask = [true; 7];
                cal.rebuild_sessions(first, last);
                Ok(cal)
            }
            other => Err(ConfigurationError::UnknownCalendar(other.to_string()).into()),
        }
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        let (first, last) = self.bounds();
        self.rebuild_sessions(first, last);
        self
    }

    pub fn with_early_closes(
        mut self,
        early_closes: impl IntoIterator<Item = (NaiveDate, NaiveTime)>,
    ) -> Self {
        self.early_closes.extend(early_closes);
        self
    }

    pub fn with_weekmask(mut self, weekmask: [bool; 7]) -> Self {
        self.weekmask = weekmask;
        let (first, last) = self.bounds();
        self.rebuild_sessions(first, last);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn first_session(&self) -> TradesimResult<Session> {
        self.sessions
            .first()
            .copied()
            .ok_or_else(|| ConfigurationError::EmptySessionRange.into())
    }

    pub fn last_session(&self) -> TradesimResult<Session> {
        self.sessions
            .last()
            .copied()
            .ok_or_else(|| ConfigurationError::EmptySessionRange.into())
    }

    pub fn is_session(&self, date: NaiveDate) -> bool {
        self.in_bounds(date) && self.is_trading_day(date)
    }

    /// The UTC timestamp at which the session's market opens.
    pub fn session_open(&self, session: Session) -> TradesimResult<DateTime<Utc>> {
        self.check_bounds(session)?;
        self.local_to_utc(session, self.open_time)
    }

    /// The UTC timestamp at which the session's market closes. Early closes
    /// override the regular close time.
    pub fn session_close(&self, session: Session) -> TradesimResult<DateTime<Utc>> {
        self.check_bounds(session)?;
        let close = self
            .early_closes
            .get(&session)
            .copied()
            .unwrap_or(self.close_time);
        self.local_to_utc(session, close)
    }

    /// UTC midnight of the session label. This is where SessionStart events
    /// are emitted and where interday capital changes take effect.
    pub fn session_midnight(&self, session: Session) -> DateTime<Utc> {
        utc_midnight(session)
    }

    pub fn is_open_on_minute(&self, dt: DateTime<Utc>) -> TradesimResult<bool> {
        let date = dt.with_timezone(&self.tz).date_naive();
        if !self.is_session(date) {
            return Ok(false);
        }
        Ok(self.session_open(date)? <= dt && dt <= self.session_close(date)?)
    }

    /// Maps a minute to the session it belongs to; minutes outside market
    /// hours map forward to the next session.
    pub fn minute_to_session(&self, dt: DateTime<Utc>) -> TradesimResult<Session> {
        for &session in &self.sessions {
            if dt <= self.session_close(session)? {
                return Ok(session);
            }
        }
        Err(self.out_of_range(dt))
    }

    /// First market open strictly after `dt`.
    pub fn next_open(&self, dt: DateTime<Utc>) -> TradesimResult<DateTime<Utc>> {
        for &session in &self.sessions {
            let open = self.session_open(session)?;
            if open > dt {
                return Ok(open);
            }
        }
        Err(self.out_of_range(dt))
    }

    /// All sessions in `[start, end]` (inclusive labels).
    pub fn sessions_in_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<Session> {
        self.sessions
            .iter()
            .copied()
            .filter(|s| (start..=end).contains(s))
            .collect()
    }

    /// Every trading minute of every session in `[start, end]`, in order.
    pub fn sessions_minutes(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> TradesimResult<Vec<DateTime<Utc>>> {
        let mut minutes = Vec::new();
        for session in self.sessions_in_range(start, end) {
            minutes.extend(self.session_minutes(session)?);
        }
        Ok(minutes)
    }

    /// Every trading minute of one session: `[open, close]` at 1-minute steps.
    pub fn session_minutes(&self, session: Session) -> TradesimResult<Vec<DateTime<Utc>>> {
        let open = self.session_open(session)?;
        let close = self.session_close(session)?;
        let mut minutes = Vec::new();
        let mut cursor = open;
        while cursor <= close {
            minutes.push(cursor);
            cursor += Duration::minutes(1);
        }
        Ok(minutes)
    }

    pub fn session_index(&self, session: Session) -> Option<usize> {
        self.sessions.binary_search(&session).ok()
    }
}

impl TradingCalendar {
    fn bounds(&self) -> (NaiveDate, NaiveDate) {
        match (self.sessions.first(), self.sessions.last()) {
            (Some(&f), Some(&l)) => (f, l),
            _ => {
                let today = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
                (today, today)
            }
        }
    }

    fn rebuild_sessions(&mut self, first: NaiveDate, last: NaiveDate) {
        self.sessions = first
            .iter_days()
            .take_while(|d| *d <= last)
            .filter(|d| self.is_trading_day(*d))
            .collect();
    }

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.weekmask[date.weekday().num_days_from_monday() as usize]
            && !self.holidays.contains(&date)
    }

    fn in_bounds(&self, date: NaiveDate) -> bool {
        match (self.sessions.first(), self.sessions.last()) {
            (Some(&f), Some(&l)) => (f..=l).contains(&date),
            _ => false,
        }
    }

    fn check_bounds(&self, session: Session) -> TradesimResult<()> {
        if self.in_bounds(session) {
            Ok(())
        } else {
            Err(self.out_of_range(utc_midnight(session)))
        }
    }

    fn out_of_range(&self, queried: DateTime<Utc>) -> crate::error::TradesimError {
        let (first, last) = self.bounds();
        ConfigurationError::SessionOutOfRange {
            first: utc_midnight(first),
            last: utc_midnight(last),
            queried,
        }
        .into()
    }

    fn local_to_utc(&self, date: NaiveDate, time: NaiveTime) -> TradesimResult<DateTime<Utc>> {
        // DST gaps resolve to the earliest valid instant.
        self.tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| {
                ConfigurationError::UnknownCalendar(format!(
                    "unrepresentable local time {date} {time} in {}",
                    self.tz
                ))
                .into()
            })
    }
}

fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap())
}

// ================================================================================================
// US Equity Schedule
// ================================================================================================

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n as u8).unwrap()
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let mut n = 5;
    loop {
        if let Some(date) = NaiveDate::from_weekday_of_month_opt(year, month, weekday, n) {
            return date;
        }
        n -= 1;
    }
}

/// Shift weekend holidays to the observed weekday (Sat -> Fri, Sun -> Mon).
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn us_equity_holidays(first_year: i32, last_year: i32) -> Vec<NaiveDate> {
    let mut holidays = Vec::new();
    for year in first_year..=last_year {
        let fixed = |m: u32, d: u32| observed(NaiveDate::from_ymd_opt(year, m, d).unwrap());
        holidays.push(fixed(1, 1)); // New Year's Day
        holidays.push(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK Day
        holidays.push(nth_weekday(year, 2, Weekday::Mon, 3)); // Presidents' Day
        holidays.push(last_weekday(year, 5, Weekday::Mon)); // Memorial Day
        if year >= 2022 {
            holidays.push(fixed(6, 19)); // Juneteenth
        }
        holidays.push(fixed(7, 4)); // Independence Day
        holidays.push(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor Day
        holidays.push(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
        holidays.push(fixed(12, 25)); // Christmas
    }
    holidays
}

fn us_equity_early_closes(first_year: i32, last_year: i32) -> Vec<(NaiveDate, NaiveTime)> {
    let one_pm = NaiveTime::from_hms_opt(13, 0, 0).unwrap();
    let mut closes = Vec::new();
    for year in first_year..=last_year {
        // Day after Thanksgiving.
        let thanksgiving = nth_weekday(year, 11, Weekday::Thu, 4);
        closes.push((thanksgiving + Duration::days(1), one_pm));
        // July 3rd when Independence Day falls on a weekday.
        let july4 = NaiveDate::from_ymd_opt(year, 7, 4).unwrap();
        if !matches!(july4.weekday(), Weekday::Sat | Weekday::Sun | Weekday::Mon) {
            closes.push((july4 - Duration::days(1), one_pm));
        }
        // Christmas Eve when it falls on a weekday.
        let christmas_eve = NaiveDate::from_ymd_opt(year, 12, 24).unwrap();
        if !matches!(christmas_eve.weekday(), Weekday::Sat | Weekday::Sun) {
            closes.push((christmas_eve, one_pm));
        }
    }
    closes
}
