use chrono::{DateTime, Datelike, Duration, Utc};

use crate::{
    calendar::{Session, TradingCalendar},
    data::{BarData, Frequency},
    error::TradesimResult,
    sim::context::Context,
};

// ================================================================================================
// Rules
// ================================================================================================

/// Which sessions a scheduled function runs on. Offsets count trading days,
/// so `WeekStart(1)` is the second trading day of each week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRule {
    EveryDay,
    WeekStart(usize),
    WeekEnd(usize),
    MonthStart(usize),
    MonthEnd(usize),
}

/// Where within a session a scheduled function runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRule {
    /// First bar at or after `open + offset`.
    MarketOpen(Duration),
    /// First bar at or after `close - offset`.
    MarketClose(Duration),
    EveryBar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRule {
    pub date_rule: DateRule,
    pub time_rule: TimeRule,
}

impl EventRule {
    pub fn new(date_rule: DateRule, time_rule: TimeRule) -> Self {
        Self {
            date_rule,
            time_rule,
        }
    }
}

impl DateRule {
    /// Whether `session` (at `session_ix` in the calendar) matches.
    fn matches(&self, calendar: &TradingCalendar, session: Session, session_ix: usize) -> bool {
        let sessions = calendar.sessions();
        match self {
            DateRule::EveryDay => true,
            DateRule::WeekStart(offset) => {
                nth_in_group(sessions, session_ix, *offset, false, |s| {
                    (s.iso_week().year(), s.iso_week().week())
                }) == Some(session)
            }
            DateRule::WeekEnd(offset) => {
                nth_in_group(sessions, session_ix, *offset, true, |s| {
                    (s.iso_week().year(), s.iso_week().week())
                }) == Some(session)
            }
            DateRule::MonthStart(offset) => {
                nth_in_group(sessions, session_ix, *offset, false, |s| {
                    (s.year(), s.month())
                }) == Some(session)
            }
            DateRule::MonthEnd(offset) => {
                nth_in_group(sessions, session_ix, *offset, true, |s| (s.year(), s.month()))
                    == Some(session)
            }
        }
    }
}

/// The session `offset` trading days from the start (or end) of the group
/// containing `sessions[session_ix]`.
fn nth_in_group<K: PartialEq>(
    sessions: &[Session],
    session_ix: usize,
    offset: usize,
    from_end: bool,
    key: impl Fn(&Session) -> K,
) -> Option<Session> {
    let group_key = key(&sessions[session_ix]);
    let group: Vec<Session> = sessions
        .iter()
        .copied()
        .filter(|s| key(s) == group_key)
        .collect();
    if from_end {
        group.len().checked_sub(1 + offset).map(|ix| group[ix])
    } else {
        group.get(offset).copied()
    }
}

impl TimeRule {
    /// Whether a bar at `dt` is the rule's trigger bar. In daily mode the
    /// session's single bar triggers every time rule.
    fn matches(
        &self,
        dt: DateTime<Utc>,
        open: DateTime<Utc>,
        close: DateTime<Utc>,
        bar_frequency: Frequency,
        already_fired: bool,
    ) -> bool {
        if bar_frequency.is_daily() {
            return !already_fired || *self == TimeRule::EveryBar;
        }
        match self {
            TimeRule::EveryBar => true,
            TimeRule::MarketOpen(offset) => !already_fired && dt >= open + *offset,
            TimeRule::MarketClose(offset) => !already_fired && dt >= close - *offset,
        }
    }
}

// ================================================================================================
// Schedule
// ================================================================================================

type ScheduledFn = Box<dyn FnMut(&mut Context<'_>, &BarData<'_>) -> TradesimResult<()> + Send>;

struct ScheduledEvent {
    rule: EventRule,
    callback: ScheduledFn,
    fired_today: bool,
}

impl std::fmt::Debug for ScheduledEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledEvent")
            .field("rule", &self.rule)
            .field("fired_today", &self.fired_today)
            .finish()
    }
}

/// Scheduled strategy functions, registered during `initialize` and fired by
/// the driver on matching bars.
#[derive(Debug, Default)]
pub struct Schedule {
    events: Vec<ScheduledEvent>,
}

impl Schedule {
    pub fn add(&mut self, rule: EventRule, callback: ScheduledFn) {
        self.events.push(ScheduledEvent {
            rule,
            callback,
            fired_today: false,
        });
    }

    pub fn start_of_session(&mut self) {
        for event in &mut self.events {
            event.fired_today = false;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Run every function whose rule matches this bar.
    #[allow(clippy::too_many_arguments)]
    pub fn run_due(
        &mut self,
        ctx: &mut Context<'_>,
        data: &BarData<'_>,
        calendar: &TradingCalendar,
        session: Session,
        session_ix: usize,
        open: DateTime<Utc>,
        close: DateTime<Utc>,
        bar_frequency: Frequency,
    ) -> TradesimResult<()> {
        let dt = data.current_dt();
        for event in &mut self.events {
            if !event.rule.date_rule.matches(calendar, session, session_ix) {
                continue;
            }
            if !event
                .rule
                .time_rule
                .matches(dt, open, close, bar_frequency, event.fired_today)
            {
                continue;
            }
            event.fired_today = true;
            (event.callback)(ctx, data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn calendar() -> TradingCalendar {
        // Two full weeks of January 2023.
        TradingCalendar::from_name(
            "XNYS",
            NaiveDate::from_ymd_opt(2023, 1, 9).unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 20).unwrap(),
        )
        .unwrap()
    }

    fn matching_sessions(rule: DateRule) -> Vec<Session> {
        let cal = calendar();
        cal.sessions()
            .iter()
            .enumerate()
            .filter(|(ix, s)| rule.matches(&cal, **s, *ix))
            .map(|(_, s)| *s)
            .collect()
    }

    #[test]
    fn week_start_picks_the_first_trading_day() {
        let sessions = matching_sessions(DateRule::WeekStart(0));
        // The second week opens on Tuesday: the Monday is a holiday.
        assert_eq!(
            sessions,
            vec![
                NaiveDate::from_ymd_opt(2023, 1, 9).unwrap(),
                NaiveDate::from_ymd_opt(2023, 1, 17).unwrap(),
            ]
        );
    }

    #[test]
    fn week_end_with_offset_steps_back_trading_days() {
        let sessions = matching_sessions(DateRule::WeekEnd(1));
        // One trading day before each Friday.
        assert_eq!(
            sessions,
            vec![
                NaiveDate::from_ymd_opt(2023, 1, 12).unwrap(),
                NaiveDate::from_ymd_opt(2023, 1, 19).unwrap(),
            ]
        );
    }

    #[test]
    fn month_start_matches_first_session_in_range() {
        let sessions = matching_sessions(DateRule::MonthStart(0));
        assert_eq!(sessions, vec![NaiveDate::from_ymd_opt(2023, 1, 9).unwrap()]);
    }

    #[test]
    fn market_open_rule_fires_once() {
        let open = chrono::TimeZone::with_ymd_and_hms(&Utc, 2023, 1, 9, 14, 30, 0).unwrap();
        let close = chrono::TimeZone::with_ymd_and_hms(&Utc, 2023, 1, 9, 21, 0, 0).unwrap();
        let rule = TimeRule::MarketOpen(Duration::minutes(30));

        // Too early.
        assert!(!rule.matches(
            open + Duration::minutes(29),
            open,
            close,
            Frequency::MINUTE,
            false
        ));
        // The trigger bar.
        assert!(rule.matches(
            open + Duration::minutes(30),
            open,
            close,
            Frequency::MINUTE,
            false
        ));
        // Already fired today.
        assert!(!rule.matches(
            open + Duration::minutes(31),
            open,
            close,
            Frequency::MINUTE,
            true
        ));
    }
}
