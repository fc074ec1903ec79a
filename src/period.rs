//! Calendar period arithmetic and ban aggregation
//!
//! Periods are half-open `[start, end)` intervals in UTC. Weeks follow ISO
//! 8601 and start on Monday. Month and year boundaries use calendar
//! arithmetic, so February, 31-day months and leap years all tile the
//! timeline without gaps or overlaps.
//!
//! Boundary arithmetic is checked. A period whose bounds would fall outside
//! chrono's representable range does not exist: [`Period::containing`]
//! reports it as [`BanwatchError::PeriodOutOfRange`] and the neighbour
//! accessors return `None`.

use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BanwatchError;
use crate::models::BanEvent;

/// Calendar unit used to bucket bans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub const ALL: [Granularity; 5] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    /// Capitalized name for user-facing text
    pub fn label(&self) -> &'static str {
        match self {
            Granularity::Hour => "Hour",
            Granularity::Day => "Day",
            Granularity::Week => "Week",
            Granularity::Month => "Month",
            Granularity::Year => "Year",
        }
    }

    /// Truncate an instant to the start of its containing period, or `None`
    /// if that start is not representable
    pub fn floor(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = instant.date_naive();
        let day_start = date.and_time(NaiveTime::MIN);

        let start = match self {
            Granularity::Hour => {
                day_start.checked_add_signed(Duration::hours(i64::from(instant.hour())))?
            }
            Granularity::Day => day_start,
            Granularity::Week => {
                let back = i64::from(date.weekday().num_days_from_monday());
                day_start.checked_sub_signed(Duration::days(back))?
            }
            Granularity::Month => {
                day_start.checked_sub_signed(Duration::days(i64::from(date.day0())))?
            }
            Granularity::Year => {
                day_start.checked_sub_signed(Duration::days(i64::from(date.ordinal0())))?
            }
        };

        Some(Utc.from_utc_datetime(&start))
    }

    /// Move a period boundary by `units` whole periods (negative = backwards).
    /// `None` when the result leaves the representable range.
    pub fn add_units(&self, start: DateTime<Utc>, units: i32) -> Option<DateTime<Utc>> {
        match self {
            Granularity::Hour => start.checked_add_signed(Duration::hours(i64::from(units))),
            Granularity::Day => start.checked_add_signed(Duration::days(i64::from(units))),
            Granularity::Week => start.checked_add_signed(Duration::weeks(i64::from(units))),
            Granularity::Month => shift_months(start, units),
            Granularity::Year => shift_months(start, units.checked_mul(12)?),
        }
    }

    /// Sub-interval used when breaking a period down into buckets
    fn bucket_step(&self) -> BucketStep {
        match self {
            Granularity::Hour => BucketStep::Fixed(Duration::minutes(5)),
            Granularity::Day => BucketStep::Calendar(Granularity::Hour),
            Granularity::Week | Granularity::Month => BucketStep::Calendar(Granularity::Day),
            Granularity::Year => BucketStep::Calendar(Granularity::Month),
        }
    }
}

fn shift_months(start: DateTime<Utc>, months: i32) -> Option<DateTime<Utc>> {
    let magnitude = Months::new(months.unsigned_abs());
    if months >= 0 {
        start.checked_add_months(magnitude)
    } else {
        start.checked_sub_months(magnitude)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = BanwatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            _ => Err(BanwatchError::InvalidGranularity(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BucketStep {
    Fixed(Duration),
    Calendar(Granularity),
}

impl BucketStep {
    fn advance(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            BucketStep::Fixed(step) => at.checked_add_signed(*step),
            BucketStep::Calendar(g) => g.add_units(at, 1),
        }
    }
}

/// Half-open interval `[start, end)` at one granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub granularity: Granularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// The period of `granularity` that contains `reference`
    pub fn containing(
        granularity: Granularity,
        reference: DateTime<Utc>,
    ) -> Result<Self, BanwatchError> {
        let out_of_range = || BanwatchError::PeriodOutOfRange {
            granularity,
            reference,
        };
        let start = granularity.floor(reference).ok_or_else(out_of_range)?;
        let end = granularity.add_units(start, 1).ok_or_else(out_of_range)?;
        Ok(Self {
            granularity,
            start,
            end,
        })
    }

    /// The period immediately before this one
    pub fn previous(&self) -> Option<Self> {
        Some(Self {
            granularity: self.granularity,
            start: self.granularity.add_units(self.start, -1)?,
            end: self.start,
        })
    }

    /// The period immediately after this one
    pub fn next(&self) -> Option<Self> {
        Some(Self {
            granularity: self.granularity,
            start: self.end,
            end: self.granularity.add_units(self.end, 1)?,
        })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Consecutive sub-intervals covering the whole period
    pub fn buckets(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let step = self.granularity.bucket_step();
        let mut bounds = Vec::new();
        let mut cursor = self.start;

        while cursor < self.end {
            let next = step.advance(cursor).map_or(self.end, |n| n.min(self.end));
            bounds.push((cursor, next));
            cursor = next;
        }

        bounds
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pattern = match self.granularity {
            Granularity::Hour => "%Y-%m-%d %H:%M",
            _ => "%Y-%m-%d",
        };
        write!(
            f,
            "{} .. {}",
            self.start.format(pattern),
            self.end.format(pattern)
        )
    }
}

/// Direction of change between two consecutive periods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Flat,
}

/// Ban counts for a period and the one before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodStats {
    pub period: Period,
    pub previous: Period,
    pub count: u64,
    pub previous_count: u64,
}

impl PeriodStats {
    pub fn previous_period(&self) -> Period {
        self.previous
    }

    pub fn delta(&self) -> i64 {
        self.count as i64 - self.previous_count as i64
    }

    pub fn trend(&self) -> Trend {
        match self.delta() {
            d if d > 0 => Trend::Up,
            d if d < 0 => Trend::Down,
            _ => Trend::Flat,
        }
    }

    /// Magnitude of change relative to the previous period, in percent.
    /// A rise from zero counts as 100%.
    pub fn percent_change(&self) -> f64 {
        if self.previous_count > 0 {
            self.delta().unsigned_abs() as f64 / self.previous_count as f64 * 100.0
        } else if self.count > 0 {
            100.0
        } else {
            0.0
        }
    }
}

/// Ban count for one sub-interval of a period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
}

/// The period containing `reference` and the one before it
pub fn comparison_window(
    granularity: Granularity,
    reference: DateTime<Utc>,
) -> Result<(Period, Period), BanwatchError> {
    let current = Period::containing(granularity, reference)?;
    let previous = current
        .previous()
        .ok_or(BanwatchError::PeriodOutOfRange {
            granularity,
            reference,
        })?;
    Ok((current, previous))
}

/// Count bans in the period containing `reference` and in the one before it
pub fn aggregate<'a, I>(
    events: I,
    granularity: Granularity,
    reference: DateTime<Utc>,
) -> Result<PeriodStats, BanwatchError>
where
    I: IntoIterator<Item = &'a BanEvent>,
{
    aggregate_timestamps(
        events.into_iter().map(|e| e.timestamp),
        granularity,
        reference,
    )
}

/// Same as [`aggregate`] over bare timestamps
pub fn aggregate_timestamps<I>(
    timestamps: I,
    granularity: Granularity,
    reference: DateTime<Utc>,
) -> Result<PeriodStats, BanwatchError>
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let (current, previous) = comparison_window(granularity, reference)?;

    let mut count = 0;
    let mut previous_count = 0;

    for ts in timestamps {
        if current.contains(ts) {
            count += 1;
        } else if previous.contains(ts) {
            previous_count += 1;
        }
    }

    Ok(PeriodStats {
        period: current,
        previous,
        count,
        previous_count,
    })
}

/// Break a period down into buckets and count the timestamps in each
pub fn bucket_counts<I>(timestamps: I, period: &Period) -> Vec<Bucket>
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let mut buckets: Vec<Bucket> = period
        .buckets()
        .into_iter()
        .map(|(start, end)| Bucket {
            start,
            end,
            count: 0,
        })
        .collect();

    for ts in timestamps {
        if !period.contains(ts) {
            continue;
        }
        let idx = buckets.partition_point(|b| b.start <= ts);
        if idx > 0 {
            buckets[idx - 1].count += 1;
        }
    }

    buckets
}
