// SPDX-License-Identifier: MIT

//! Cron-like timing match, the way Cronicle events declare their schedule:
//! independent sets of allowed minutes/hours/month-days/months/week-days.
//! An empty set for a field means "any value matches that field"; an event
//! with every field empty is manual-only (the scheduler never matches it).

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single broken-down minute, the granularity the scheduler ticks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinuteKey {
    pub year: i32,
    pub month: u32,
    pub mday: u32,
    pub hour: u32,
    pub minute: u32,
    pub wday: u32,
}

impl MinuteKey {
    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            mday: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            // Sunday = 0, matching Cronicle's wday convention.
            wday: dt.weekday().num_days_from_sunday(),
        }
    }

    /// A cursor value that increases monotonically minute-over-minute, used
    /// to compare "have we already fired this slot" cheaply.
    pub fn as_epoch_minute(&self) -> i64 {
        // Reconstructed from a UTC timestamp by callers that track wall time;
        // this method is only meaningful for keys produced from UTC.
        let naive = chrono::NaiveDate::from_ymd_opt(self.year, self.month, self.mday)
            .and_then(|d| d.and_hms_opt(self.hour, self.minute, 0));
        naive
            .map(|n| n.and_utc().timestamp() / 60)
            .unwrap_or_default()
    }
}

/// Timing specification: each set, when non-empty, restricts matches to
/// those values; an empty set imposes no restriction on that field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timing {
    #[serde(default)]
    pub minutes: BTreeSet<u32>,
    #[serde(default)]
    pub hours: BTreeSet<u32>,
    #[serde(default)]
    pub mdays: BTreeSet<u32>,
    #[serde(default)]
    pub months: BTreeSet<u32>,
    #[serde(default)]
    pub wdays: BTreeSet<u32>,
}

impl Timing {
    /// Manual-only: no field restricts anything, so there is nothing for the
    /// scheduler to match against a wall-clock minute.
    pub fn is_manual_only(&self) -> bool {
        self.minutes.is_empty()
            && self.hours.is_empty()
            && self.mdays.is_empty()
            && self.months.is_empty()
            && self.wdays.is_empty()
    }

    pub fn matches(&self, key: &MinuteKey) -> bool {
        if self.is_manual_only() {
            return false;
        }
        Self::field_matches(&self.minutes, key.minute)
            && Self::field_matches(&self.hours, key.hour)
            && Self::field_matches(&self.mdays, key.mday)
            && Self::field_matches(&self.months, key.month)
            && Self::field_matches(&self.wdays, key.wday)
    }

    fn field_matches(set: &BTreeSet<u32>, value: u32) -> bool {
        set.is_empty() || set.contains(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minute_key(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> MinuteKey {
        let dt = chrono::Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        MinuteKey::from_datetime(&dt)
    }

    #[test]
    fn empty_timing_is_manual_only_and_never_matches() {
        let t = Timing::default();
        assert!(t.is_manual_only());
        assert!(!t.matches(&minute_key(2026, 1, 1, 12, 5)));
    }

    #[test]
    fn minute_restriction_matches_only_that_minute() {
        let t = Timing {
            minutes: BTreeSet::from([5]),
            ..Default::default()
        };
        assert!(t.matches(&minute_key(2026, 1, 1, 12, 5)));
        assert!(!t.matches(&minute_key(2026, 1, 1, 12, 6)));
    }

    #[test]
    fn combined_fields_are_conjunctive() {
        let t = Timing {
            minutes: BTreeSet::from([0]),
            hours: BTreeSet::from([9, 17]),
            ..Default::default()
        };
        assert!(t.matches(&minute_key(2026, 3, 10, 9, 0)));
        assert!(t.matches(&minute_key(2026, 3, 10, 17, 0)));
        assert!(!t.matches(&minute_key(2026, 3, 10, 10, 0)));
    }

    #[test]
    fn wday_field_uses_sunday_zero_convention() {
        // 2026-01-04 is a Sunday.
        let t = Timing {
            wdays: BTreeSet::from([0]),
            ..Default::default()
        };
        assert!(t.matches(&minute_key(2026, 1, 4, 0, 0)));
        assert!(!t.matches(&minute_key(2026, 1, 5, 0, 0)));
    }
}
