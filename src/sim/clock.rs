use chrono::{DateTime, Duration, Utc};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    calendar::{Session, TradingCalendar},
    data::Frequency,
    error::{ConfigurationError, TradesimResult},
};

/// The kinds of events the simulation clock emits, in their within-timestamp
/// commit order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ClockEventKind {
    SessionStart,
    BeforeTradingStart,
    Bar,
    EmissionRateEnd,
    SessionEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEvent {
    pub dt: DateTime<Utc>,
    pub kind: ClockEventKind,
    pub session: Session,
    pub session_ix: usize,
}

// ================================================================================================
// Simulation Clock
// ================================================================================================

/// A finite, totally-ordered event stream over the configured sessions.
///
/// Per session the clock emits SessionStart at midnight, BeforeTradingStart
/// ahead of the open, one Bar per bar boundary (a single Bar at the close in
/// daily mode), EmissionRateEnd on emission boundaries finer than a session,
/// and SessionEnd at the close. Timestamps are non-decreasing and the stream
/// is fully determined by its inputs.
#[derive(Debug, Clone)]
pub struct SimulationClock {
    events: Vec<ClockEvent>,
    cursor: usize,
}

impl SimulationClock {
    pub fn new(
        calendar: &TradingCalendar,
        sessions: &[Session],
        bar_frequency: Frequency,
        emission_rate: Frequency,
        before_trading_start_offset: Duration,
    ) -> TradesimResult<Self> {
        if sessions.is_empty() {
            return Err(ConfigurationError::EmptySessionRange.into());
        }
        if emission_rate < bar_frequency {
            return Err(ConfigurationError::InvalidEmissionRate(format!(
                "emission rate {emission_rate} is finer than the bar frequency {bar_frequency}"
            ))
            .into());
        }
        if emission_rate.is_intraday()
            && emission_rate.seconds() % bar_frequency.seconds() != 0
        {
            return Err(ConfigurationError::InvalidEmissionRate(format!(
                "emission rate {emission_rate} is not a multiple of the bar frequency {bar_frequency}"
            ))
            .into());
        }

        let mut events = Vec::new();
        for (session_ix, &session) in sessions.iter().enumerate() {
            let open = calendar.session_open(session)?;
            let close = calendar.session_close(session)?;
            let midnight = calendar.session_midnight(session);

            let push = |events: &mut Vec<ClockEvent>, dt, kind| {
                events.push(ClockEvent {
                    dt,
                    kind,
                    session,
                    session_ix,
                });
            };

            push(&mut events, midnight, ClockEventKind::SessionStart);
            // On continuous calendars the offset could reach into the
            // previous session; clamp at midnight to keep ordering.
            let bts = (open - before_trading_start_offset).max(midnight);
            push(&mut events, bts, ClockEventKind::BeforeTradingStart);

            if bar_frequency.is_daily() {
                push(&mut events, close, ClockEventKind::Bar);
                if emission_rate.is_intraday() {
                    push(&mut events, close, ClockEventKind::EmissionRateEnd);
                }
            } else {
                let step = bar_frequency.duration();
                let emission_step = emission_rate.seconds() as i64;
                let mut dt = open + step;
                let mut last_emitted = open;
                while dt <= close {
                    push(&mut events, dt, ClockEventKind::Bar);
                    if emission_rate.is_intraday()
                        && (dt - open).num_seconds() % emission_step == 0
                    {
                        push(&mut events, dt, ClockEventKind::EmissionRateEnd);
                        last_emitted = dt;
                    }
                    dt += step;
                }
                // Early closes can cut the grid short of a boundary; the
                // session's final bar always lands on the close.
                if dt - step < close {
                    push(&mut events, close, ClockEventKind::Bar);
                    if emission_rate.is_intraday() && last_emitted < close {
                        push(&mut events, close, ClockEventKind::EmissionRateEnd);
                    }
                } else if emission_rate.is_intraday() && last_emitted < close {
                    push(&mut events, close, ClockEventKind::EmissionRateEnd);
                }
            }

            push(&mut events, close, ClockEventKind::SessionEnd);
        }

        Ok(Self { events, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.events.len() - self.cursor
    }

    pub fn peek(&self) -> Option<&ClockEvent> {
        self.events.get(self.cursor)
    }
}

impl Iterator for SimulationClock {
    type Item = ClockEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.events.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(event)
    }
}
