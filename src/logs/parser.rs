//! Resolver log line parser.
//!
//! Unbound emits different line shapes depending on `log-queries`,
//! `log-replies`, `log-local-actions`, `log-time-ascii`/`log-time-iso` and
//! whether it logs to a file or to syslog. Each shape gets one matcher; the
//! matchers are tried in order and the first hit wins, most specific first:
//!
//!   1. `... info: ads.example.com. always_refuse 127.0.0.1@59952 ads.example.com. A IN`
//!   2. `[1700000000] unbound[811:0] info: 192.168.1.5 example.com. A IN`
//!   3. `2024-01-15T10:30:00.123Z unbound[811:0] info: 192.168.1.5 example.com. A IN`
//!   4. `Jan 15 10:30:00 host unbound[811]: [811:0] info: 192.168.1.5 example.com. A IN NOERROR 0.012 0 45`
//!
//! Anything else is an info/partial line and is dropped.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

use super::event::{QueryEvent, QueryStatus};

/// Response code Unbound uses for policy refusals.
const REFUSED_RCODE: &str = "REFUSED";

static BLOCKED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"info:\s+\S+\s+always_refuse\s+([0-9A-Fa-f:.]+)@\d+\s+(\S+)\s+([A-Za-z0-9]+)\s+[A-Z0-9]+",
    )
    .expect("Invalid regex")
});

static EPOCH_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[(\d{9,11})\]\s+\S+\s+info:\s+([0-9A-Fa-f:.]+)\s+(\S+)\s+([A-Za-z0-9]+)\s+(?:IN|CH|HS|NONE|ANY|CLASS\d+)\b",
    )
    .expect("Invalid regex")
});

static ISO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\s+.*?info:\s+([0-9A-Fa-f:.]+)\s+(\S+)\s+([A-Za-z0-9]+)\s+(?:IN|CH|HS|NONE|ANY|CLASS\d+)\b",
    )
    .expect("Invalid regex")
});

static SYSLOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([A-Z][a-z]{2})\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})\s+.*?info:\s+([0-9A-Fa-f:.]+)\s+(\S+)\s+([A-Za-z0-9]+)\s+(?:IN|CH|HS|NONE|ANY|CLASS\d+)(?:\s+([A-Z]+)\s+(\d+(?:\.\d+)?)\s+(\d)\s+(\d+))?\s*$",
    )
    .expect("Invalid regex")
});

static EPOCH_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d{9,11})\]").expect("Invalid regex"));

static ISO_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)")
        .expect("Invalid regex")
});

static SYSLOG_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][a-z]{2})\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})").expect("Invalid regex")
});

/// One recognised line shape.
struct LineFormat {
    name: &'static str,
    parse: fn(&str, DateTime<Utc>) -> Option<QueryEvent>,
}

/// Ordered: the first matcher that accepts a line decides its classification.
const FORMATS: &[LineFormat] = &[
    LineFormat { name: "always_refuse", parse: parse_blocked },
    LineFormat { name: "epoch", parse: parse_epoch },
    LineFormat { name: "iso8601", parse: parse_iso },
    LineFormat { name: "syslog", parse: parse_syslog },
];

/// Parse one raw log line, or `None` if it is not a query line.
pub fn parse_line(raw: &str) -> Option<QueryEvent> {
    parse_line_at(raw, Utc::now())
}

/// Like [`parse_line`] with an explicit "now", used for year inference on
/// syslog lines and as the timestamp of last resort.
pub fn parse_line_at(raw: &str, now: DateTime<Utc>) -> Option<QueryEvent> {
    matching_format(raw, now).map(|(_, ev)| ev)
}

/// Name of the format that accepted `raw`, if any.
pub fn format_name(raw: &str) -> Option<&'static str> {
    matching_format(raw, Utc::now()).map(|(name, _)| name)
}

fn matching_format(raw: &str, now: DateTime<Utc>) -> Option<(&'static str, QueryEvent)> {
    let line = raw.trim();
    if line.is_empty() {
        return None;
    }
    FORMATS
        .iter()
        .find_map(|f| (f.parse)(line, now).map(|ev| (f.name, ev)))
}

fn parse_blocked(line: &str, now: DateTime<Utc>) -> Option<QueryEvent> {
    let caps = BLOCKED_LINE.captures(line)?;
    let ts = leading_timestamp(line, now).unwrap_or(now);
    Some(QueryEvent::new(ts, &caps[1], &caps[2], &caps[3], QueryStatus::Blocked, 0))
}

fn parse_epoch(line: &str, _now: DateTime<Utc>) -> Option<QueryEvent> {
    let caps = EPOCH_LINE.captures(line)?;
    let ts = epoch_to_utc(&caps[1])?;
    Some(QueryEvent::new(ts, &caps[2], &caps[3], &caps[4], QueryStatus::Allowed, 0))
}

fn parse_iso(line: &str, _now: DateTime<Utc>) -> Option<QueryEvent> {
    let caps = ISO_LINE.captures(line)?;
    let ts = iso_to_utc(&caps[1])?;
    Some(QueryEvent::new(ts, &caps[2], &caps[3], &caps[4], QueryStatus::Allowed, 0))
}

fn parse_syslog(line: &str, now: DateTime<Utc>) -> Option<QueryEvent> {
    let caps = SYSLOG_LINE.captures(line)?;
    let ts = syslog_to_utc(&caps[1], &caps[2], &caps[3], now)?;

    let (status, elapsed_ms) = match caps.get(7) {
        Some(rcode) => {
            let status = if rcode.as_str() == REFUSED_RCODE {
                QueryStatus::Blocked
            } else {
                QueryStatus::Allowed
            };
            let elapsed = caps
                .get(8)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .map(seconds_to_ms)
                .unwrap_or(0);
            (status, elapsed)
        }
        None => (QueryStatus::Allowed, 0),
    };

    Some(QueryEvent::new(ts, &caps[4], &caps[5], &caps[6], status, elapsed_ms))
}

fn seconds_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

/// Best-effort timestamp from whatever prefix a line carries.
fn leading_timestamp(line: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(c) = EPOCH_PREFIX.captures(line) {
        return epoch_to_utc(&c[1]);
    }
    if let Some(c) = SYSLOG_PREFIX.captures(line) {
        return syslog_to_utc(&c[1], &c[2], &c[3], now);
    }
    ISO_PREFIX.captures(line).and_then(|c| iso_to_utc(&c[1]))
}

fn epoch_to_utc(s: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = s.parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn iso_to_utc(s: &str) -> Option<DateTime<Utc>> {
    let s = s.replacen(' ', "T", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Offsets without a colon (+0100)
    if let Ok(dt) = DateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    // No offset at all: the resolver host is assumed to log in UTC
    let naive = NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Syslog stamps have no year. Use the current one, stepping back a year
/// when that would put the entry more than a day in the future (December
/// lines read in January).
fn syslog_to_utc(month: &str, day: &str, time: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let month = month_number(month)?;
    let day: u32 = day.parse().ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;

    let at_year = |year: i32| {
        NaiveDate::from_ymd_opt(year, month, day).map(|d| Utc.from_utc_datetime(&d.and_time(time)))
    };

    match at_year(now.year()) {
        Some(ts) if ts <= now + Duration::days(1) => Some(ts),
        _ => at_year(now.year() - 1),
    }
}

fn month_number(abbr: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS.iter().position(|m| *m == abbr).map(|i| i as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::event::QueryType;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_always_refuse_line_is_blocked() {
        let line = "[1718452800] unbound[811:0] info: ads.example.com. always_refuse 127.0.0.1@59952 ads.example.com. A IN";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.domain, "ads.example.com");
        assert_eq!(ev.status, QueryStatus::Blocked);
        assert_eq!(ev.client_ip, "127.0.0.1");
        assert_eq!(ev.qtype, QueryType::A);
        assert_eq!(ev.timestamp.timestamp(), 1718452800);
    }

    #[test]
    fn test_blocked_wins_over_generic_patterns() {
        // Syslog-prefixed, so the syslog matcher would also see it; must still be blocked.
        let line = "Jun 15 11:59:00 gw unbound[811]: [811:0] info: tracker.net. always_refuse 10.0.0.7@4242 tracker.net. AAAA IN";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.status, QueryStatus::Blocked);
        assert_eq!(format_name(line), Some("always_refuse"));
    }

    #[test]
    fn test_blocked_with_ipv6_client() {
        let line = "info: ads.example.com. always_refuse ::1@53000 ads.example.com. HTTPS IN";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.client_ip, "::1");
        assert_eq!(ev.qtype, QueryType::Https);
        // No timestamp prefix at all: falls back to "now"
        assert_eq!(ev.timestamp, now());
    }

    #[test]
    fn test_epoch_query_line() {
        let line = "[1718452800] unbound[811:0] info: 192.168.1.5 example.com. A IN";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.domain, "example.com");
        assert_eq!(ev.client_ip, "192.168.1.5");
        assert_eq!(ev.status, QueryStatus::Allowed);
        assert_eq!(ev.response_time_ms, 0);
        assert_eq!(format_name(line), Some("epoch"));
    }

    #[test]
    fn test_iso_query_line() {
        let line = "2024-06-15T10:30:00.250Z unbound[811:0] info: fe80::1 mail.example.org. MX IN";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.domain, "mail.example.org");
        assert_eq!(ev.qtype, QueryType::Mx);
        assert_eq!(ev.timestamp.to_rfc3339(), "2024-06-15T10:30:00.250+00:00");
    }

    #[test]
    fn test_iso_line_with_offset() {
        let line = "2024-06-15T12:30:00+02:00 unbound[811:0] info: 10.0.0.2 example.com. TXT IN";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.timestamp, Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_syslog_reply_line() {
        let line = "Jun 15 11:58:01 gw unbound[811]: [811:0] info: 192.168.1.5 example.com. A IN NOERROR 0.012345 0 45";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.status, QueryStatus::Allowed);
        assert_eq!(ev.response_time_ms, 12);
        assert_eq!(ev.timestamp, Utc.with_ymd_and_hms(2024, 6, 15, 11, 58, 1).unwrap());
    }

    #[test]
    fn test_syslog_refused_is_blocked() {
        let line = "Jun 15 11:58:01 gw unbound[811]: [811:0] info: 192.168.1.5 ads.example.com. A IN REFUSED 0.000200 0 34";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.status, QueryStatus::Blocked);
        assert_eq!(ev.response_time_ms, 0);
    }

    #[test]
    fn test_syslog_bare_query_line() {
        let line = "Jun  5 09:00:00 gw unbound[811]: [811:0] info: 192.168.1.5 example.com. SRV IN";
        let ev = parse_line_at(line, now()).unwrap();
        assert_eq!(ev.status, QueryStatus::Allowed);
        assert_eq!(ev.qtype, QueryType::Srv);
        assert_eq!(ev.response_time_ms, 0);
    }

    #[test]
    fn test_syslog_elapsed_rounding() {
        let line = "Jun 15 11:58:01 gw unbound[811]: [811:0] info: 10.0.0.1 a.com. A IN NOERROR 0.0126 1 45";
        assert_eq!(parse_line_at(line, now()).unwrap().response_time_ms, 13);
    }

    #[test]
    fn test_syslog_december_line_in_january_uses_previous_year() {
        let jan = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let line = "Dec 31 23:59:59 gw unbound[811]: [811:0] info: 10.0.0.1 a.com. A IN";
        let ev = parse_line_at(line, jan).unwrap();
        assert_eq!(ev.timestamp.year(), 2024);
    }

    #[test]
    fn test_unmatched_lines_dropped() {
        for line in [
            "",
            "   ",
            "[1718452800] unbound[811:0] notice: init module 0: validator",
            "Jun 15 11:58:01 gw unbound[811]: [811:0] info: start of service (unbound 1.17.1).",
            "[1718452800] unbound[811:0] info: server stats for thread 0: 12 queries",
            "garbage",
        ] {
            assert!(parse_line_at(line, now()).is_none(), "should not parse: {line:?}");
        }
    }

    #[test]
    fn test_reparse_is_stable() {
        let line = "Jun 15 11:58:01 gw unbound[811]: [811:0] info: 192.168.1.5 example.com. A IN NOERROR 0.2 0 45";
        let a = parse_line_at(line, now()).unwrap();
        let b = parse_line_at(line, now()).unwrap();
        assert_eq!(a.domain, b.domain);
        assert_eq!(a.qtype, b.qtype);
        assert_eq!(a.status, b.status);
        assert_eq!(a.response_time_ms, b.response_time_ms);
        assert_eq!(a.timestamp, b.timestamp);
        assert_ne!(a.id, b.id);
    }
}
