//! Daily fire time at a fixed UTC offset.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};

/// Fires once a day at a local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    time: NaiveTime,
    offset: FixedOffset,
}

impl DailySchedule {
    /// `hour:minute` at UTC`offset_hours`. `None` for an invalid time or offset.
    #[must_use]
    pub fn new(hour: u32, minute: u32, offset_hours: i32) -> Option<Self> {
        Some(Self {
            time: NaiveTime::from_hms_opt(hour, minute, 0)?,
            offset: FixedOffset::east_opt(offset_hours * 3600)?,
        })
    }

    /// First fire time strictly after `now`.
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = now.with_timezone(&self.offset).date_naive();
        let today = self.fire_on(local_date);
        if today > now {
            today
        } else {
            self.fire_on(local_date + Duration::days(1))
        }
    }

    fn fire_on(&self, date: chrono::NaiveDate) -> DateTime<Utc> {
        // A fixed offset has no gaps or folds.
        let local = date.and_time(self.time);
        Utc.from_utc_datetime(&(local - self.offset_duration()))
    }

    fn offset_duration(&self) -> Duration {
        Duration::seconds(i64::from(self.offset.local_minus_utc()))
    }
}

impl std::fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} UTC{}", self.time.format("%H:%M"), self.offset)
    }
}
