//! Time grains for bucketing and time-range presets for plan filters.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Bucket sizes understood by `date_trunc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Day,
    Week,
    Month,
    Year,
}

impl TimeGrain {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "day" | "days" | "daily" | "d" => Some(TimeGrain::Day),
            "week" | "weeks" | "weekly" | "w" => Some(TimeGrain::Week),
            "month" | "months" | "monthly" | "mon" => Some(TimeGrain::Month),
            "year" | "years" | "yearly" | "annual" | "y" => Some(TimeGrain::Year),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Year => "year",
        }
    }

    /// Truncation expression for an already-qualified column.
    pub fn truncate(self, column_expr: &str) -> String {
        format!("date_trunc('{}', {column_expr})", self.as_str())
    }
}

/// Resolved window; a missing bound means that side is unrestricted.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeFilterSpec {
    RelativeHours(i64),
    RelativeDays(i64),
    Today,
    Yesterday,
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Since {
        start: DateTime<Utc>,
    },
    Until {
        end: DateTime<Utc>,
    },
}

impl TimeFilterSpec {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<TimeRange> {
        let range = match self {
            TimeFilterSpec::RelativeHours(hours) => TimeRange {
                start: Some(now - Duration::hours(*hours)),
                end: Some(now),
            },
            TimeFilterSpec::RelativeDays(days) => TimeRange {
                start: Some(now - Duration::days(*days)),
                end: Some(now),
            },
            TimeFilterSpec::Today => TimeRange {
                start: Some(midnight(now)),
                end: Some(now),
            },
            TimeFilterSpec::Yesterday => {
                let today = midnight(now);
                TimeRange {
                    start: Some(today - Duration::days(1)),
                    end: Some(today),
                }
            }
            TimeFilterSpec::Absolute { start, end } => TimeRange {
                start: Some(*start),
                end: Some(*end),
            },
            TimeFilterSpec::Since { start } => TimeRange {
                start: Some(*start),
                end: None,
            },
            TimeFilterSpec::Until { end } => TimeRange {
                start: None,
                end: Some(*end),
            },
        };

        if let (Some(start), Some(end)) = (range.start, range.end) {
            if start > end {
                return Err(ServiceError::InvalidRequest(
                    "time range start must be before end".to_string(),
                ));
            }
        }
        Ok(range)
    }
}

fn midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::default()))
}

/// Parses presets such as `today`, `last_7d`, `24h`, `3 days` or bracketed
/// ranges `[start,end]` where either bound may be empty.
pub fn parse_time_value(raw: &str) -> Result<TimeFilterSpec> {
    let value = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_lowercase();

    if value.starts_with('[') && value.ends_with(']') {
        return parse_bracketed(&value);
    }

    match value.as_str() {
        "today" => return Ok(TimeFilterSpec::Today),
        "yesterday" => return Ok(TimeFilterSpec::Yesterday),
        _ => {}
    }

    let compact: String = value
        .chars()
        .filter(|ch| !ch.is_whitespace() && !matches!(ch, '_' | '-'))
        .collect();
    let compact = compact.strip_prefix("last").unwrap_or(&compact);

    relative_amount(compact).ok_or_else(|| {
        ServiceError::InvalidRequest(format!("unsupported time range '{raw}'"))
    })
}

fn relative_amount(value: &str) -> Option<TimeFilterSpec> {
    let split = value.find(|ch: char| !ch.is_ascii_digit())?;
    let (digits, unit) = value.split_at(split);
    let amount: i64 = digits.parse().ok()?;
    if amount <= 0 {
        return None;
    }

    match unit {
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(TimeFilterSpec::RelativeHours(amount)),
        "d" | "day" | "days" => Some(TimeFilterSpec::RelativeDays(amount)),
        "w" | "week" | "weeks" => Some(TimeFilterSpec::RelativeDays(amount * 7)),
        _ => None,
    }
}

fn parse_bracketed(value: &str) -> Result<TimeFilterSpec> {
    let inner = value.trim_matches(['[', ']']);
    let (start_raw, end_raw) = inner
        .split_once(',')
        .ok_or_else(|| ServiceError::InvalidRequest("invalid time range".into()))?;

    match (start_raw.trim(), end_raw.trim()) {
        ("", "") => Err(ServiceError::InvalidRequest(
            "time range requires at least one bound".into(),
        )),
        (start, "") => Ok(TimeFilterSpec::Since {
            start: parse_datetime(start)?,
        }),
        ("", end) => Ok(TimeFilterSpec::Until {
            end: parse_datetime(end)?,
        }),
        (start, end) => Ok(TimeFilterSpec::Absolute {
            start: parse_datetime(start)?,
            end: parse_datetime(end)?,
        }),
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare date at midnight UTC.
pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dt%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::default())));
    }
    Err(ServiceError::InvalidRequest(format!(
        "invalid time literal '{value}'"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn grain_aliases() {
        assert_eq!(TimeGrain::parse("Daily"), Some(TimeGrain::Day));
        assert_eq!(TimeGrain::parse("monthly"), Some(TimeGrain::Month));
        assert_eq!(TimeGrain::parse("fortnight"), None);
        assert_eq!(
            TimeGrain::Week.truncate("t0.\"created_at\""),
            "date_trunc('week', t0.\"created_at\")"
        );
    }

    #[test]
    fn parses_relative_presets() {
        assert_eq!(parse_time_value("last_7d").unwrap(), TimeFilterSpec::RelativeDays(7));
        assert_eq!(parse_time_value("24h").unwrap(), TimeFilterSpec::RelativeHours(24));
        assert_eq!(parse_time_value("last 2 weeks").unwrap(), TimeFilterSpec::RelativeDays(14));
        assert!(parse_time_value("last_quarter").is_err());
    }

    #[test]
    fn yesterday_spans_previous_day() {
        let now = at("2025-03-10T15:30:00Z");
        let range = TimeFilterSpec::Yesterday.resolve(now).unwrap();
        assert_eq!(range.start, Some(at("2025-03-09T00:00:00Z")));
        assert_eq!(range.end, Some(at("2025-03-10T00:00:00Z")));
    }

    #[test]
    fn parses_absolute_and_open_ranges() {
        let window = parse_time_value("[2025-01-01 00:00:00,2025-01-02]").unwrap();
        let range = window.resolve(Utc::now()).unwrap();
        assert_eq!(range.start, Some(at("2025-01-01T00:00:00Z")));
        assert_eq!(range.end, Some(at("2025-01-02T00:00:00Z")));

        let open = parse_time_value("[2025-11-16T09:06:34.543Z,]").unwrap();
        let range = open.resolve(at("2025-11-17T00:00:00Z")).unwrap();
        assert_eq!(range.start, Some(at("2025-11-16T09:06:34.543Z")));
        assert_eq!(range.end, None);

        assert!(parse_time_value("[,]").is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        let window = parse_time_value("[2025-02-01,2025-01-01]").unwrap();
        assert!(window.resolve(Utc::now()).is_err());
    }
}
