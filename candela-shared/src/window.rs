use chrono::{DateTime, Datelike, Days, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{DataResult, error::DataError};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    /// Parses the lowercase wire name of a unit.
    ///
    /// # Error
    ///
    /// Returns `DataError::UnsupportedUnit` for anything outside the
    /// enumerated set.
    pub fn parse(s: &str) -> DataResult<Self> {
        Self::from_str(s).map_err(|_| DataError::UnsupportedUnit(s.to_owned()))
    }
}

/// The width of a candle bucket, e.g. `5 × Minute`.
///
/// Buckets are closed on the left and open on the right: a timestamp exactly
/// on a boundary belongs to the window *starting* at that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub size: u32,
    pub unit: TimeUnit,
}

impl TimeWindow {
    pub const ONE_SECOND: TimeWindow = TimeWindow::new(1, TimeUnit::Second);

    pub const fn new(size: u32, unit: TimeUnit) -> Self {
        Self { size, unit }
    }

    pub fn is_one_second(&self) -> bool {
        *self == Self::ONE_SECOND
    }

    /// Truncates `ts` to the start of the window containing it.
    ///
    /// Sub-day units truncate on wall-clock fields (`minute·60 + second` for
    /// seconds, `minute` for minutes, `hour` for hours); WEEK truncates to
    /// Monday 00:00 of the containing ISO week; MONTH and YEAR truncate to
    /// the first of the month and January 1st respectively.
    ///
    /// # Error
    ///
    /// `DataError::ZeroWindowSize` if `size` is 0, `DataError::WindowOutOfRange`
    /// if the boundary is not representable.
    pub fn window_start(&self, ts: DateTime<Utc>) -> DataResult<DateTime<Utc>> {
        if self.size == 0 {
            return Err(DataError::ZeroWindowSize);
        }

        let date = ts.date_naive();
        let start = match self.unit {
            TimeUnit::Second => {
                let total = ts.minute() * 60 + ts.second();
                let truncated = total - total % self.size;
                utc(
                    date.year(),
                    date.month(),
                    date.day(),
                    ts.hour(),
                    truncated / 60,
                    truncated % 60,
                )
            }
            TimeUnit::Minute => utc(
                date.year(),
                date.month(),
                date.day(),
                ts.hour(),
                ts.minute() - ts.minute() % self.size,
                0,
            ),
            TimeUnit::Hour => utc(
                date.year(),
                date.month(),
                date.day(),
                ts.hour() - ts.hour() % self.size,
                0,
                0,
            ),
            TimeUnit::Day => utc(date.year(), date.month(), date.day(), 0, 0, 0),
            TimeUnit::Week => {
                let monday = date
                    .checked_sub_days(Days::new(date.weekday().num_days_from_monday() as u64));
                monday.and_then(|d| utc(d.year(), d.month(), d.day(), 0, 0, 0))
            }
            TimeUnit::Month => utc(date.year(), date.month(), 1, 0, 0, 0),
            TimeUnit::Year => utc(date.year(), 1, 1, 0, 0, 0),
        };

        start.ok_or(DataError::WindowOutOfRange)
    }

    /// Exclusive upper bound of the window starting at `start`.
    ///
    /// Fixed-width units add `size` of the unit; MONTH and YEAR use calendar
    /// arithmetic (month modulo 12 with year carry, day forced to the 1st).
    pub fn window_end(&self, start: DateTime<Utc>) -> DataResult<DateTime<Utc>> {
        if self.size == 0 {
            return Err(DataError::ZeroWindowSize);
        }

        let size = self.size as i64;
        let end = match self.unit {
            TimeUnit::Second => start.checked_add_signed(Duration::seconds(size)),
            TimeUnit::Minute => start.checked_add_signed(Duration::minutes(size)),
            TimeUnit::Hour => start.checked_add_signed(Duration::hours(size)),
            TimeUnit::Day => start.checked_add_signed(Duration::days(size)),
            TimeUnit::Week => start.checked_add_signed(Duration::weeks(size)),
            TimeUnit::Month => {
                let month0 = start.month0() + self.size;
                let year = start.year() + (month0 / 12) as i32;
                utc(year, month0 % 12 + 1, 1, 0, 0, 0)
            }
            TimeUnit::Year => utc(start.year() + self.size as i32, 1, 1, 0, 0, 0),
        };

        end.ok_or(DataError::WindowOutOfRange)
    }

    /// True iff `now` has reached or passed the end of the window starting at
    /// `start`. Strict `>=`: a trade exactly on the boundary closes the
    /// previous window.
    pub fn is_complete(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> DataResult<bool> {
        Ok(now >= self.window_end(start)?)
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.size, self.unit)
    }
}

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeframes::timeframes;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        utc(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn second_truncation_respects_wall_clock_fields() {
        let tf = TimeWindow::new(15, TimeUnit::Second);
        let start = tf.window_start(at(2024, 3, 15, 10, 0, 44)).unwrap();
        assert_eq!(start, at(2024, 3, 15, 10, 0, 30));

        // 45s buckets span minute boundaries: 10:00:50 falls into the bucket
        // starting at minute*60+second = 45.
        let tf = TimeWindow::new(45, TimeUnit::Second);
        let start = tf.window_start(at(2024, 3, 15, 10, 0, 50)).unwrap();
        assert_eq!(start, at(2024, 3, 15, 10, 0, 45));
    }

    #[test]
    fn minute_hour_day_truncation() {
        let t = at(2024, 3, 15, 13, 47, 12);
        assert_eq!(
            TimeWindow::new(5, TimeUnit::Minute).window_start(t).unwrap(),
            at(2024, 3, 15, 13, 45, 0)
        );
        assert_eq!(
            TimeWindow::new(4, TimeUnit::Hour).window_start(t).unwrap(),
            at(2024, 3, 15, 12, 0, 0)
        );
        assert_eq!(
            TimeWindow::new(1, TimeUnit::Day).window_start(t).unwrap(),
            at(2024, 3, 15, 0, 0, 0)
        );
    }

    #[test]
    fn week_truncates_to_monday_midnight() {
        // 2024-03-15 is a Friday; the containing ISO week starts Monday 03-11.
        let tf = TimeWindow::new(1, TimeUnit::Week);
        let start = tf.window_start(at(2024, 3, 15, 13, 47, 12)).unwrap();
        assert_eq!(start, at(2024, 3, 11, 0, 0, 0));
        // A Monday timestamp stays in its own week.
        let start = tf.window_start(at(2024, 3, 11, 0, 0, 0)).unwrap();
        assert_eq!(start, at(2024, 3, 11, 0, 0, 0));
    }

    #[test]
    fn two_month_window_spans_calendar_months() {
        let tf = TimeWindow::new(2, TimeUnit::Month);
        let start = tf.window_start(at(2024, 3, 15, 10, 0, 0)).unwrap();
        assert_eq!(start, at(2024, 3, 1, 0, 0, 0));
        assert_eq!(tf.window_end(start).unwrap(), at(2024, 5, 1, 0, 0, 0));
    }

    #[test]
    fn month_end_carries_into_next_year() {
        let tf = TimeWindow::new(6, TimeUnit::Month);
        let start = at(2024, 11, 1, 0, 0, 0);
        assert_eq!(tf.window_end(start).unwrap(), at(2025, 5, 1, 0, 0, 0));
    }

    #[test]
    fn year_end_forces_january_first() {
        let tf = TimeWindow::new(3, TimeUnit::Year);
        let start = at(2024, 1, 1, 0, 0, 0);
        assert_eq!(tf.window_end(start).unwrap(), at(2027, 1, 1, 0, 0, 0));
    }

    #[test]
    fn boundary_belongs_to_the_window_starting_there() {
        let tf = TimeWindow::new(1, TimeUnit::Minute);
        let boundary = at(2024, 3, 15, 10, 1, 0);
        assert_eq!(tf.window_start(boundary).unwrap(), boundary);

        // ... and completeness is strict >=: the boundary instant closes the
        // previous window.
        let prev_start = at(2024, 3, 15, 10, 0, 0);
        assert!(tf.is_complete(prev_start, boundary).unwrap());
        assert!(
            !tf.is_complete(prev_start, at(2024, 3, 15, 10, 0, 59))
                .unwrap()
        );
    }

    #[test]
    fn start_is_never_complete_at_its_own_instant() {
        // For every configured timeframe: window_start(t) is not complete at
        // t, and is complete at its own window_end.
        let t = at(2024, 3, 15, 13, 47, 12);
        for tf in timeframes() {
            let start = tf.window_start(t).unwrap();
            assert!(
                !tf.is_complete(start, t).unwrap(),
                "{tf} complete at its own instant"
            );
            let end = tf.window_end(start).unwrap();
            assert!(tf.is_complete(start, end).unwrap(), "{tf} not complete at end");
        }
    }

    #[test]
    fn zero_size_is_rejected() {
        let tf = TimeWindow::new(0, TimeUnit::Minute);
        let t = at(2024, 3, 15, 13, 47, 12);
        assert!(matches!(tf.window_start(t), Err(DataError::ZeroWindowSize)));
        assert!(matches!(tf.window_end(t), Err(DataError::ZeroWindowSize)));
    }

    #[test]
    fn unit_wire_names_round_trip() {
        for unit in [
            TimeUnit::Second,
            TimeUnit::Minute,
            TimeUnit::Hour,
            TimeUnit::Day,
            TimeUnit::Week,
            TimeUnit::Month,
            TimeUnit::Year,
        ] {
            assert_eq!(TimeUnit::parse(&unit.to_string()).unwrap(), unit);
        }
        assert!(matches!(
            TimeUnit::parse("fortnight"),
            Err(DataError::UnsupportedUnit(_))
        ));
    }
}
