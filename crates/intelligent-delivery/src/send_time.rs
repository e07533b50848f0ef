//! Send-time optimization — picks the "magic" delivery time for a message.
//!
//! The heuristic keeps messages inside the business's daytime window and
//! biases them toward mid-week late mornings. It is a pure function of
//! `(anchor, now)` and the configured window, evaluated in the business's
//! local UTC offset.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, NaiveTime, Offset, Utc, Weekday,
};
use serde::Serialize;

use cadence_core::config::SendTimeConfig;
use cadence_core::error::CadenceError;

/// Which rule moved the candidate time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendTimeAdjustment {
    /// Before the daily window opened; moved to the opening time.
    ClampedToDayStart,
    /// After the daily window closed; moved to the next day's opening time.
    RolledToNextDay,
    /// Not a preferred weekday; moved to the next Tuesday.
    MovedToPreferredDay,
    /// Preferred weekday but too early; moved to the preferred start.
    RaisedToPreferredHour,
    /// Preferred weekday but past the preferred hours; moved to the next
    /// calendar day without re-checking the weekday.
    RolledPastPreferredHours,
}

/// Constants of the heuristic. Defaults: anchor + 2h, window 06:00–22:00,
/// Tue–Thu 10:00–13:00.
#[derive(Debug, Clone)]
pub struct SendWindow {
    pub anchor_offset: Duration,
    pub day_start: NaiveTime,
    pub day_end: NaiveTime,
    pub preferred_start: NaiveTime,
    pub preferred_end: NaiveTime,
}

impl SendWindow {
    pub fn from_config(config: &SendTimeConfig) -> Result<Self, CadenceError> {
        let hour = |name: &str, h: u32| {
            if h < 24 {
                Ok(NaiveTime::default() + Duration::hours(i64::from(h)))
            } else {
                Err(CadenceError::Config(format!("send_time.{name} must be < 24, got {h}")))
            }
        };
        let window = Self {
            anchor_offset: Duration::minutes(i64::from(config.anchor_offset_minutes)),
            day_start: hour("window_start_hour", config.window_start_hour)?,
            day_end: hour("window_end_hour", config.window_end_hour)?,
            preferred_start: hour("preferred_start_hour", config.preferred_start_hour)?,
            preferred_end: hour("preferred_end_hour", config.preferred_end_hour)?,
        };
        if window.day_start >= window.day_end {
            return Err(CadenceError::Config(
                "send_time window start must be before its end".into(),
            ));
        }
        if window.preferred_start < window.day_start
            || window.preferred_end > window.day_end
            || window.preferred_start >= window.preferred_end
        {
            return Err(CadenceError::Config(
                "send_time preferred hours must be a non-empty range inside the daily window".into(),
            ));
        }
        Ok(window)
    }

    fn is_preferred_day(day: Weekday) -> bool {
        matches!(day, Weekday::Tue | Weekday::Wed | Weekday::Thu)
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        let at = |h: i64| NaiveTime::default() + Duration::hours(h);
        Self {
            anchor_offset: Duration::hours(2),
            day_start: at(6),
            day_end: at(22),
            preferred_start: at(10),
            preferred_end: at(13),
        }
    }
}

/// Computes best send times in one business's local time.
#[derive(Debug, Clone)]
pub struct SendTimePlanner {
    offset: FixedOffset,
    window: SendWindow,
}

impl SendTimePlanner {
    pub fn new(offset: FixedOffset, window: SendWindow) -> Self {
        Self { offset, window }
    }

    pub fn from_config(config: &SendTimeConfig) -> Result<Self, CadenceError> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            CadenceError::Config(format!(
                "send_time.utc_offset_minutes out of range: {}",
                config.utc_offset_minutes
            ))
        })?;
        Ok(Self::new(offset, SendWindow::from_config(config)?))
    }

    /// Best delivery time for a message anchored at `anchor` (for example a
    /// job completion time), or as soon as sensible after `now`.
    pub fn best_send_at(&self, anchor: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        self.explain(anchor, now).0
    }

    /// Like [`best_send_at`](Self::best_send_at), also returning the rules
    /// that fired in order. A candidate too close to the end of the calendar
    /// to move is returned unchanged.
    pub fn explain(
        &self,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> (DateTime<Utc>, Vec<SendTimeAdjustment>) {
        let candidate = match anchor {
            Some(a) => a
                .checked_add_signed(self.window.anchor_offset)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            None => now,
        };
        self.adjust(candidate)
            .unwrap_or_else(|| (candidate, Vec::new()))
    }

    fn adjust(&self, candidate: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<SendTimeAdjustment>)> {
        let w = &self.window;
        let mut applied = Vec::new();
        let mut local = self.to_local(candidate)?;

        if local.time() < w.day_start {
            local = local.date().and_time(w.day_start);
            applied.push(SendTimeAdjustment::ClampedToDayStart);
        } else if local.time() >= w.day_end {
            local = days_later_at(local, 1, w.day_start)?;
            applied.push(SendTimeAdjustment::RolledToNextDay);
        }

        let weekday = local.weekday();
        if !SendWindow::is_preferred_day(weekday) {
            let days = (7 + Weekday::Tue.num_days_from_monday() - weekday.num_days_from_monday()) % 7;
            local = days_later_at(local, i64::from(days), w.preferred_start)?;
            applied.push(SendTimeAdjustment::MovedToPreferredDay);
        } else if local.time() < w.preferred_start {
            local = local.date().and_time(w.preferred_start);
            applied.push(SendTimeAdjustment::RaisedToPreferredHour);
        } else if local.time() >= w.preferred_end {
            local = days_later_at(local, 1, w.preferred_start)?;
            applied.push(SendTimeAdjustment::RolledPastPreferredHours);
        }

        Some((self.to_utc(local)?, applied))
    }

    fn utc_offset(&self) -> Duration {
        Duration::seconds(i64::from(self.offset.local_minus_utc()))
    }

    fn to_local(&self, at: DateTime<Utc>) -> Option<NaiveDateTime> {
        at.naive_utc().checked_add_signed(self.utc_offset())
    }

    fn to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        let utc = local.checked_sub_signed(self.utc_offset())?;
        Some(DateTime::<Utc>::from_naive_utc_and_offset(utc, Utc))
    }
}

/// `time` on the day `days` after `local`'s date.
fn days_later_at(local: NaiveDateTime, days: i64, time: NaiveTime) -> Option<NaiveDateTime> {
    local.date().and_time(time).checked_add_signed(Duration::days(days))
}

impl Default for SendTimePlanner {
    fn default() -> Self {
        Self::new(Utc.fix(), SendWindow::default())
    }
}
