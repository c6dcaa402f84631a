use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Separator between the day part and the time range of a slot key (full-width colon).
pub const KEY_SEPARATOR: char = '：';

const TIME_FORMAT: &str = "%H:%M";

const WEEKDAY_LABELS: [(Weekday, &str); 7] = [
    (Weekday::Mon, "周一"),
    (Weekday::Tue, "周二"),
    (Weekday::Wed, "周三"),
    (Weekday::Thu, "周四"),
    (Weekday::Fri, "周五"),
    (Weekday::Sat, "周六"),
    (Weekday::Sun, "周日"),
];

pub fn weekday_label(weekday: Weekday) -> &'static str {
    // Table is indexed by ISO weekday (Monday = 1).
    WEEKDAY_LABELS[weekday.number_from_monday() as usize - 1].1
}

pub fn weekday_from_label(label: &str) -> Option<Weekday> {
    WEEKDAY_LABELS
        .iter()
        .find(|(_, l)| *l == label)
        .map(|(w, _)| *w)
}

/// `"<Weekday>："` for the weekday of `date`.
pub fn weekly_prefix(date: NaiveDate) -> String {
    format!("{}{KEY_SEPARATOR}", weekday_label(date.weekday()))
}

/// `"MM-DD："` for `date`.
pub fn date_prefix(date: NaiveDate) -> String {
    format!("{:02}-{:02}{KEY_SEPARATOR}", date.month(), date.day())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotParseError {
    pub input: String,
    pub reason: &'static str,
}

impl SlotParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

impl fmt::Display for SlotParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid slot '{}': {}", self.input, self.reason)
    }
}

impl std::error::Error for SlotParseError {}

/// Half-open time-of-day range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, SlotParseError> {
        if start >= end {
            return Err(SlotParseError {
                input: format!("{}-{}", start.format(TIME_FORMAT), end.format(TIME_FORMAT)),
                reason: "range must end after it starts",
            });
        }
        Ok(Self { start, end })
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }

    /// Smallest range covering both.
    pub fn hull(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format(TIME_FORMAT),
            self.end.format(TIME_FORMAT)
        )
    }
}

impl FromStr for TimeRange {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| SlotParseError::new(s, "time range needs a '-'"))?;
        let start = parse_time(start.trim()).ok_or_else(|| SlotParseError::new(s, "bad start time"))?;
        let end = parse_time(end.trim()).ok_or_else(|| SlotParseError::new(s, "bad end time"))?;
        TimeRange::new(start, end).map_err(|e| SlotParseError::new(s, e.reason))
    }
}

/// Strict `HH:MM`; chrono alone would also accept `9:00`.
fn parse_time(s: &str) -> Option<NaiveTime> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    NaiveTime::parse_from_str(s, TIME_FORMAT).ok()
}

/// Month and day without a year. Date-override keys carry no year; the
/// provider's open-date set supplies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthDay {
    month: u32,
    day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> Option<Self> {
        // 2000 is a leap year, so 02-29 is accepted.
        NaiveDate::from_ymd_opt(2000, month, day).map(|_| Self { month, day })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            day: date.day(),
        }
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    pub fn matches(&self, date: NaiveDate) -> bool {
        date.month() == self.month && date.day() == self.day
    }
}

impl fmt::Display for MonthDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

/// What a slot key is anchored to: a recurring weekday or a calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotAnchor {
    Weekday(Weekday),
    Day(MonthDay),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Weekly,
    DateOverride,
}

/// A bookable time range of a provider: either recurring every week or
/// defined for one override date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Weekly { weekday: Weekday, range: TimeRange },
    DateOverride { day: MonthDay, range: TimeRange },
}

impl SlotKey {
    pub fn weekly(weekday: Weekday, range: TimeRange) -> Self {
        SlotKey::Weekly { weekday, range }
    }

    pub fn for_date(date: NaiveDate, range: TimeRange) -> Self {
        SlotKey::DateOverride {
            day: MonthDay::of(date),
            range,
        }
    }

    pub fn kind(&self) -> SlotKind {
        match self {
            SlotKey::Weekly { .. } => SlotKind::Weekly,
            SlotKey::DateOverride { .. } => SlotKind::DateOverride,
        }
    }

    pub fn range(&self) -> TimeRange {
        match self {
            SlotKey::Weekly { range, .. } | SlotKey::DateOverride { range, .. } => *range,
        }
    }

    pub fn anchor(&self) -> SlotAnchor {
        match self {
            SlotKey::Weekly { weekday, .. } => SlotAnchor::Weekday(*weekday),
            SlotKey::DateOverride { day, .. } => SlotAnchor::Day(*day),
        }
    }

    /// Same anchor, different time range.
    pub fn with_range(&self, range: TimeRange) -> Self {
        match self {
            SlotKey::Weekly { weekday, .. } => SlotKey::Weekly {
                weekday: *weekday,
                range,
            },
            SlotKey::DateOverride { day, .. } => SlotKey::DateOverride { day: *day, range },
        }
    }

    pub fn is_weekly_for(&self, date: NaiveDate) -> bool {
        matches!(self, SlotKey::Weekly { weekday, .. } if *weekday == date.weekday())
    }

    pub fn is_override_for(&self, date: NaiveDate) -> bool {
        matches!(self, SlotKey::DateOverride { day, .. } if day.matches(date))
    }

    /// True if the key carries either the weekly or the date prefix of `date`.
    pub fn matches(&self, date: NaiveDate) -> bool {
        self.is_weekly_for(date) || self.is_override_for(date)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Weekly { weekday, range } => {
                write!(f, "{}{KEY_SEPARATOR}{range}", weekday_label(*weekday))
            }
            SlotKey::DateOverride { day, range } => write!(f, "{day}{KEY_SEPARATOR}{range}"),
        }
    }
}

impl FromStr for SlotKey {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, tail) = s
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| SlotParseError::new(s, "missing '：' separator"))?;
        let head = head.trim();
        let range: TimeRange = tail.parse().map_err(|e: SlotParseError| SlotParseError::new(s, e.reason))?;

        if let Some(weekday) = weekday_from_label(head) {
            return Ok(SlotKey::Weekly { weekday, range });
        }

        let (month, day) = head
            .split_once('-')
            .ok_or_else(|| SlotParseError::new(s, "unknown weekday label"))?;
        if month.len() != 2 || day.len() != 2 {
            return Err(SlotParseError::new(s, "date must be MM-DD"));
        }
        let day = match (month.parse::<u32>(), day.parse::<u32>()) {
            (Ok(m), Ok(d)) => MonthDay::new(m, d),
            _ => None,
        }
        .ok_or_else(|| SlotParseError::new(s, "not a calendar date"))?;
        Ok(SlotKey::DateOverride { day, range })
    }
}

impl Serialize for SlotKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SlotKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
