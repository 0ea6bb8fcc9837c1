//! Stats Aggregator: resolver point counters and 24h rollups over query events.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::logs::{QueryEvent, QueryStatus};
use crate::resolver::ResolverControl;

const TOP_BLOCKED: usize = 10;
const WINDOW_HOURS: i64 = 24;

/// Resolver counters as a flat map. Numeric values are emitted as numbers.
/// An unreachable control channel yields `{"error": ...}` instead of failing.
pub async fn point_stats(control: &ResolverControl) -> BTreeMap<String, Value> {
    match control.stats().await {
        Ok(raw) => raw
            .into_iter()
            .map(|(k, v)| {
                let value = v
                    .parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| v.parse::<f64>().map(Value::from))
                    .unwrap_or(Value::String(v));
                (k, value)
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Resolver stats unavailable: {}", e);
            BTreeMap::from([("error".to_string(), Value::String(e.to_string()))])
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    pub hour_label: String,
    pub allowed_count: u64,
    pub blocked_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DomainCount {
    pub domain: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub hourly: Vec<HourlyBucket>,
    pub total_allowed: u64,
    pub total_blocked: u64,
    pub total: u64,
    pub top_blocked: Vec<DomainCount>,
}

/// Roll events from the trailing 24 hours into hourly buckets, totals and
/// the most-blocked domains. Buckets run oldest to newest and all 24 are
/// present even when empty. Ties in the ranking keep first-seen order.
pub fn summarize(events: &[QueryEvent], now: DateTime<Utc>) -> Summary {
    let current_hour = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let first_hour = current_hour - Duration::hours(WINDOW_HOURS - 1);
    let cutoff = now - Duration::hours(WINDOW_HOURS);

    let mut hourly: Vec<HourlyBucket> = (0..WINDOW_HOURS)
        .map(|i| HourlyBucket {
            hour_label: format!("{:02}:00", (first_hour + Duration::hours(i)).hour()),
            allowed_count: 0,
            blocked_count: 0,
        })
        .collect();

    let mut total_allowed = 0u64;
    let mut total_blocked = 0u64;
    // domain -> (count, first-seen position)
    let mut blocked_counts: HashMap<&str, (u64, usize)> = HashMap::new();

    for ev in events.iter().filter(|e| e.timestamp > cutoff && e.timestamp <= now) {
        // Events from the partial hour before `first_hour` count toward totals only.
        let bucket = if ev.timestamp >= first_hour {
            usize::try_from((ev.timestamp - first_hour).num_hours())
                .ok()
                .and_then(|slot| hourly.get_mut(slot))
        } else {
            None
        };

        match ev.status {
            QueryStatus::Allowed => {
                total_allowed += 1;
                if let Some(b) = bucket {
                    b.allowed_count += 1;
                }
            }
            QueryStatus::Blocked => {
                total_blocked += 1;
                if let Some(b) = bucket {
                    b.blocked_count += 1;
                }
                let seen = blocked_counts.len();
                blocked_counts.entry(ev.domain.as_str()).or_insert((0, seen)).0 += 1;
            }
        }
    }

    let mut ranked: Vec<(&str, u64, usize)> = blocked_counts
        .into_iter()
        .map(|(d, (count, seen))| (d, count, seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    Summary {
        hourly,
        total_allowed,
        total_blocked,
        total: total_allowed + total_blocked,
        top_blocked: ranked
            .into_iter()
            .take(TOP_BLOCKED)
            .map(|(domain, count, _)| DomainCount { domain: domain.to_string(), count })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 30, 0).unwrap()
    }

    fn ev(minutes_ago: i64, domain: &str, status: QueryStatus) -> QueryEvent {
        QueryEvent::new(now() - Duration::minutes(minutes_ago), "10.0.0.1", domain, "A", status, 0)
    }

    #[test]
    fn test_empty_input_has_all_24_buckets() {
        let s = summarize(&[], now());
        assert_eq!(s.hourly.len(), 24);
        assert_eq!(s.hourly.first().unwrap().hour_label, "13:00");
        assert_eq!(s.hourly.last().unwrap().hour_label, "12:00");
        let labels: std::collections::HashSet<_> = s.hourly.iter().map(|b| b.hour_label.clone()).collect();
        assert_eq!(labels.len(), 24);
        assert!(s.hourly.iter().all(|b| b.allowed_count == 0 && b.blocked_count == 0));
        assert_eq!(s.total, 0);
        assert!(s.top_blocked.is_empty());
    }

    #[test]
    fn test_events_land_in_their_hour() {
        let events = vec![
            ev(5, "a.com", QueryStatus::Allowed),
            ev(10, "ads.com", QueryStatus::Blocked),
            ev(65, "b.com", QueryStatus::Allowed),
        ];
        let s = summarize(&events, now());
        let current = s.hourly.last().unwrap();
        assert_eq!((current.allowed_count, current.blocked_count), (1, 1));
        let previous = &s.hourly[22];
        assert_eq!(previous.hour_label, "11:00");
        assert_eq!(previous.allowed_count, 1);
        assert_eq!((s.total_allowed, s.total_blocked, s.total), (2, 1, 3));
    }

    #[test]
    fn test_old_events_discarded() {
        let events = vec![
            ev(24 * 60 + 1, "old.com", QueryStatus::Blocked),
            ev(3 * 24 * 60, "older.com", QueryStatus::Allowed),
        ];
        let s = summarize(&events, now());
        assert_eq!(s.total, 0);
        assert!(s.top_blocked.is_empty());
    }

    #[test]
    fn test_partial_hour_counts_in_totals_only() {
        // 23h45m ago: inside the 24h window but before the oldest bucket.
        let events = vec![ev(23 * 60 + 45, "edge.com", QueryStatus::Allowed)];
        let s = summarize(&events, now());
        assert_eq!(s.total_allowed, 1);
        assert!(s.hourly.iter().all(|b| b.allowed_count == 0));
    }

    #[test]
    fn test_top_blocked_ranking_and_ties() {
        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(ev(1, "tracker.net", QueryStatus::Blocked));
        }
        events.push(ev(2, "first-tie.com", QueryStatus::Blocked));
        events.push(ev(2, "second-tie.com", QueryStatus::Blocked));
        events.push(ev(2, "allowed.com", QueryStatus::Allowed));

        let s = summarize(&events, now());
        let ranked: Vec<(&str, u64)> = s.top_blocked.iter().map(|d| (d.domain.as_str(), d.count)).collect();
        assert_eq!(
            ranked,
            vec![("tracker.net", 3), ("first-tie.com", 1), ("second-tie.com", 1)]
        );
    }

    #[test]
    fn test_top_blocked_capped_at_ten() {
        let events: Vec<QueryEvent> = (0..15)
            .map(|i| ev(1, &format!("d{i}.com"), QueryStatus::Blocked))
            .collect();
        let s = summarize(&events, now());
        assert_eq!(s.top_blocked.len(), 10);
        assert_eq!(s.top_blocked[0].domain, "d0.com");
    }
}
