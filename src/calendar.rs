//! Monthly partition keys and their half-open UTC bounds.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MINUTE_MS: i64 = 60_000;

/// Serialized as `"YYYY-MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("invalid year-month '{0}', expected YYYY-MM")]
    InvalidYearMonth(String),
    #[error("month range is empty: {start} > {end}")]
    EmptyRange { start: YearMonth, end: YearMonth },
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, CalendarError> {
        if !(1..=12).contains(&month) || NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(CalendarError::InvalidYearMonth(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    pub fn from_ts_ms(ts_ms_utc: i64) -> Result<Self, CalendarError> {
        let dt = Utc
            .timestamp_millis_opt(ts_ms_utc)
            .single()
            .ok_or(CalendarError::InvalidTimestamp(ts_ms_utc))?;
        Ok(Self {
            year: dt.year(),
            month: dt.month(),
        })
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn prev(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn start_ms(self) -> i64 {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(i64::MIN)
    }

    pub fn end_ms_exclusive(self) -> i64 {
        self.next().start_ms()
    }

    pub fn contains(self, ts_ms_utc: i64) -> bool {
        ts_ms_utc >= self.start_ms() && ts_ms_utc < self.end_ms_exclusive()
    }

    /// `YYYY_MM`, the partition suffix used in table names.
    pub fn table_suffix(self) -> String {
        format!("{:04}_{:02}", self.year, self.month)
    }
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl std::str::FromStr for YearMonth {
    type Err = CalendarError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || CalendarError::InvalidYearMonth(raw.to_string());
        let (year, month) = raw.trim().split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl TryFrom<String> for YearMonth {
    type Error = CalendarError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<YearMonth> for String {
    fn from(month: YearMonth) -> Self {
        month.to_string()
    }
}

/// Inclusive month range `start..=end`.
pub fn month_range(start: YearMonth, end: YearMonth) -> Result<Vec<YearMonth>, CalendarError> {
    if start > end {
        return Err(CalendarError::EmptyRange { start, end });
    }
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        out.push(cursor);
        cursor = cursor.next();
    }
    Ok(out)
}

/// Months intersecting the half-open range `[start, end)`.
pub fn months_overlapping(
    start_ts_ms_utc: i64,
    end_ts_ms_utc_exclusive: i64,
) -> Result<Vec<YearMonth>, CalendarError> {
    if end_ts_ms_utc_exclusive <= start_ts_ms_utc {
        return Ok(Vec::new());
    }
    let first = YearMonth::from_ts_ms(start_ts_ms_utc)?;
    let last = YearMonth::from_ts_ms(end_ts_ms_utc_exclusive - 1)?;
    month_range(first, last)
}

pub fn day_start_ms(date: NaiveDate) -> i64 {
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(i64::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_bounds_are_half_open_and_contiguous() {
        let jan = YearMonth::new(2024, 1).unwrap();
        assert_eq!(jan.start_ms(), 1_704_067_200_000);
        assert_eq!(jan.end_ms_exclusive(), jan.next().start_ms());
        assert!(jan.contains(jan.start_ms()));
        assert!(!jan.contains(jan.end_ms_exclusive()));
        assert!(jan.contains(jan.end_ms_exclusive() - MINUTE_MS));
    }

    #[test]
    fn december_rolls_into_next_year() {
        let dec = YearMonth::new(2023, 12).unwrap();
        assert_eq!(dec.next(), YearMonth::new(2024, 1).unwrap());
        assert_eq!(dec.next().prev(), dec);
        assert_eq!(dec.table_suffix(), "2023_12");
        assert_eq!(dec.to_string(), "2023-12");
    }

    #[test]
    fn parse_rejects_bad_months() {
        assert_eq!(
            "2024-02".parse::<YearMonth>(),
            Ok(YearMonth {
                year: 2024,
                month: 2
            })
        );
        assert!("2024-13".parse::<YearMonth>().is_err());
        assert!("2024".parse::<YearMonth>().is_err());
        assert!("abcd-01".parse::<YearMonth>().is_err());
    }

    #[test]
    fn serde_uses_the_display_form() {
        let month = YearMonth::new(2020, 7).unwrap();
        assert_eq!(serde_json::to_string(&month).unwrap(), "\"2020-07\"");
        let back: YearMonth = serde_json::from_str("\"2020-07\"").unwrap();
        assert_eq!(back, month);
        assert!(serde_json::from_str::<YearMonth>("\"2020-13\"").is_err());
    }

    #[test]
    fn ranges_and_overlaps() {
        let start = YearMonth::new(2023, 11).unwrap();
        let end = YearMonth::new(2024, 2).unwrap();
        let months = month_range(start, end).unwrap();
        assert_eq!(months.len(), 4);
        assert_eq!(months[2], YearMonth::new(2024, 1).unwrap());
        assert!(matches!(
            month_range(end, start),
            Err(CalendarError::EmptyRange { .. })
        ));

        let jan = YearMonth::new(2024, 1).unwrap();
        let overlap = months_overlapping(jan.start_ms() - 45 * MINUTE_MS, jan.end_ms_exclusive())
            .unwrap();
        assert_eq!(overlap, vec![jan.prev(), jan]);
        assert!(months_overlapping(10, 10).unwrap().is_empty());
    }
}
