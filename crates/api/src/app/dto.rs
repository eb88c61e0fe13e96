use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use dispatchgate_guards::{LogFilter, LogKind, LogStats, LogStatus};

// ─────────────────────────────────────────────────────────────────────────────
// Query DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// `GET /logs` query string.
#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub tool_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl LogQuery {
    pub fn into_filter(self) -> Result<LogFilter, String> {
        Ok(LogFilter {
            kind: parse_kind(self.kind.as_deref())?,
            tool_id: self.tool_id,
            user_id: self.user_id,
            status: self
                .status
                .as_deref()
                .map(|s| LogStatus::parse(s).ok_or_else(|| format!("unknown status '{s}'")))
                .transpose()?,
            started_after: self.since,
            started_before: self.until,
            ..LogFilter::default()
        }
        .with_limit(self.limit))
    }
}

/// `GET /logs/stats` query string.
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub window_secs: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub stale_after_secs: Option<i64>,
}

impl StatsQuery {
    pub const DEFAULT_WINDOW_SECS: i64 = 24 * 3600;

    pub fn window(&self) -> Result<Duration, String> {
        positive_secs("window_secs", self.window_secs.unwrap_or(Self::DEFAULT_WINDOW_SECS))
    }

    pub fn kind(&self) -> Result<Option<LogKind>, String> {
        parse_kind(self.kind.as_deref())
    }

    pub fn stale_after(&self) -> Result<Option<Duration>, String> {
        self.stale_after_secs
            .map(|s| positive_secs("stale_after_secs", s))
            .transpose()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Body DTOs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ResetConcurrencyRequest {
    pub job_type: Option<String>,
}

fn parse_kind(raw: Option<&str>) -> Result<Option<LogKind>, String> {
    raw.map(|k| LogKind::parse(k).ok_or_else(|| format!("unknown log type '{k}'")))
        .transpose()
}

fn positive_secs(name: &str, secs: i64) -> Result<Duration, String> {
    if secs <= 0 {
        return Err(format!("{name} must be positive"));
    }
    if secs > LogStats::MAX_WINDOW_SECS {
        return Err(format!(
            "{name} must be at most {} seconds",
            LogStats::MAX_WINDOW_SECS
        ));
    }
    Duration::try_seconds(secs).ok_or_else(|| format!("{name} is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_query_maps_to_filter() {
        let filter = LogQuery {
            kind: Some("dispatch".to_string()),
            status: Some("blocked".to_string()),
            limit: Some(5000),
            ..LogQuery::default()
        }
        .into_filter()
        .unwrap();

        assert_eq!(filter.kind, Some(LogKind::Dispatch));
        assert_eq!(filter.status, Some(LogStatus::Blocked));
        assert_eq!(filter.limit, LogFilter::MAX_LIMIT);
    }

    #[test]
    fn unknown_enums_are_rejected() {
        let bad = LogQuery {
            status: Some("exploded".to_string()),
            ..LogQuery::default()
        };
        assert!(bad.into_filter().is_err());
        assert!(
            StatsQuery {
                window_secs: Some(0),
                ..StatsQuery::default()
            }
            .window()
            .is_err()
        );
    }

    #[test]
    fn huge_durations_are_rejected_not_panicking() {
        let huge = StatsQuery {
            window_secs: Some(i64::MAX),
            stale_after_secs: Some(i64::MAX),
            ..StatsQuery::default()
        };
        assert!(huge.window().is_err());
        assert!(huge.stale_after().is_err());

        let year = StatsQuery {
            window_secs: Some(LogStats::MAX_WINDOW_SECS),
            ..StatsQuery::default()
        };
        assert_eq!(year.window().unwrap(), LogStats::max_window());
        assert_eq!(StatsQuery::default().window().unwrap(), Duration::days(1));
    }
}
