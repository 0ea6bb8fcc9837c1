/// Previously ingested query events, kept in the embedded database.
///
/// `/logs` reads from here only when the live source returned nothing. The
/// table is filled by `POST /logs/ingest`, which writes a whole parse pass in
/// a single transaction. Event ids are not stable across parses, so rows are
/// deduplicated on content: identical lines in one pass are told apart by an
/// occurrence number, and a re-parse of the same lines maps onto the same
/// `(content, occurrence)` keys.
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Connection;
use std::collections::HashMap;
use std::path::Path;

use super::{open_embedded, StoreError};
use crate::logs::{QueryEvent, QueryStatus, QueryType};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS query_events (
    id TEXT PRIMARY KEY,
    ts TEXT NOT NULL,
    client_ip TEXT NOT NULL,
    domain TEXT NOT NULL,
    qtype TEXT NOT NULL,
    status TEXT NOT NULL,
    response_time_ms INTEGER NOT NULL,
    occurrence INTEGER NOT NULL DEFAULT 0
)";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_query_events_ts ON query_events (ts)";

const CREATE_CONTENT_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_query_events_content
    ON query_events (ts, client_ip, domain, qtype, status, response_time_ms, occurrence)";

type EventRow = (String, String, String, String, String, String, i64);

/// Insert the events not already stored, in one transaction. Returns how
/// many rows were new.
pub async fn ingest(db_path: &Path, events: &[QueryEvent]) -> Result<u64, StoreError> {
    let mut conn = open_embedded(db_path).await?;
    ensure_table(&mut conn).await?;

    // (ts, client, domain, type, status, ms) -> copies seen so far in this pass
    let mut seen: HashMap<(String, &str, &str, String, &str, i64), i64> = HashMap::new();
    let mut inserted = 0u64;
    let mut tx = conn.begin().await?;
    for ev in events {
        let ts = ev.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        let qtype = ev.qtype.to_string();
        let response_time_ms = i64::try_from(ev.response_time_ms).unwrap_or(i64::MAX);
        let occurrence = seen
            .entry((ts.clone(), ev.client_ip.as_str(), ev.domain.as_str(), qtype.clone(), ev.status.as_str(), response_time_ms))
            .or_insert(0);

        let result = sqlx::query(
            "INSERT OR IGNORE INTO query_events
                (id, ts, client_ip, domain, qtype, status, response_time_ms, occurrence)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&ev.id)
        .bind(ts)
        .bind(&ev.client_ip)
        .bind(&ev.domain)
        .bind(qtype)
        .bind(ev.status.as_str())
        .bind(response_time_ms)
        .bind(*occurrence)
        .execute(&mut *tx)
        .await?;
        *occurrence += 1;
        inserted += result.rows_affected();
    }
    tx.commit().await?;
    conn.close().await?;

    tracing::debug!("Ingested {} of {} events", inserted, events.len());
    Ok(inserted)
}

/// Up to `limit` most recent stored events, newest first.
pub async fn recent(db_path: &Path, limit: usize) -> Result<Vec<QueryEvent>, StoreError> {
    let mut conn = open_embedded(db_path).await?;
    ensure_table(&mut conn).await?;

    let rows: Vec<EventRow> = sqlx::query_as(
        "SELECT id, ts, client_ip, domain, qtype, status, response_time_ms
         FROM query_events ORDER BY ts DESC, id DESC LIMIT ?",
    )
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(&mut conn)
    .await?;
    conn.close().await?;

    Ok(rows.into_iter().filter_map(row_to_event).collect())
}

async fn ensure_table(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_TABLE).execute(&mut *conn).await?;
    sqlx::query(CREATE_INDEX).execute(&mut *conn).await?;
    sqlx::query(CREATE_CONTENT_INDEX).execute(&mut *conn).await?;
    Ok(())
}

fn row_to_event((id, ts, client_ip, domain, qtype, status, response_time_ms): EventRow) -> Option<QueryEvent> {
    let timestamp = DateTime::parse_from_rfc3339(&ts).ok()?.with_timezone(&Utc);
    let status = match status.as_str() {
        "blocked" => QueryStatus::Blocked,
        _ => QueryStatus::Allowed,
    };
    Some(QueryEvent {
        id,
        timestamp,
        client_ip,
        domain,
        qtype: QueryType::parse(&qtype),
        status,
        response_time_ms: u64::try_from(response_time_ms).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_ingest_then_recent_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bridge.db");
        let t0 = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let events = vec![
            QueryEvent::new(t0, "10.0.0.1", "old.com", "A", QueryStatus::Allowed, 3),
            QueryEvent::new(t0 + chrono::Duration::minutes(5), "10.0.0.2", "ads.com", "AAAA", QueryStatus::Blocked, 0),
        ];

        assert_eq!(ingest(&db, &events).await.unwrap(), 2);
        // A second pass over the same lines yields fresh ids but nothing new.
        let reparsed: Vec<QueryEvent> = events
            .iter()
            .map(|e| QueryEvent::new(e.timestamp, &e.client_ip, &e.domain, &e.qtype.to_string(), e.status, e.response_time_ms))
            .collect();
        assert_eq!(ingest(&db, &reparsed).await.unwrap(), 0);

        let stored = recent(&db, 10).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].domain, "ads.com");
        assert_eq!(stored[0].status, QueryStatus::Blocked);
        assert_eq!(stored[0].qtype, QueryType::Aaaa);
        assert_eq!(stored[1].response_time_ms, 3);
        assert_eq!(stored[1].timestamp, t0);

        assert_eq!(recent(&db, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_keeps_later_events_from_the_same_second() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bridge.db");
        let t0 = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let first = vec![QueryEvent::new(t0, "10.0.0.1", "a.com", "A", QueryStatus::Allowed, 0)];
        assert_eq!(ingest(&db, &first).await.unwrap(), 1);

        // b.com was logged in the same second, after the first pass ran.
        let second = vec![
            QueryEvent::new(t0, "10.0.0.1", "b.com", "A", QueryStatus::Allowed, 0),
            QueryEvent::new(t0, "10.0.0.1", "a.com", "A", QueryStatus::Allowed, 0),
        ];
        assert_eq!(ingest(&db, &second).await.unwrap(), 1);
        let mut domains: Vec<String> = recent(&db, 10).await.unwrap().into_iter().map(|e| e.domain).collect();
        domains.sort();
        assert_eq!(domains, vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn test_ingest_counts_repeated_identical_lines() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bridge.db");
        let t0 = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let copy = || QueryEvent::new(t0, "10.0.0.1", "a.com", "A", QueryStatus::Allowed, 0);

        assert_eq!(ingest(&db, &[copy(), copy()]).await.unwrap(), 2);
        // Same two lines plus a third identical one logged afterwards.
        assert_eq!(ingest(&db, &[copy(), copy(), copy()]).await.unwrap(), 1);
        assert_eq!(recent(&db, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_recent_on_fresh_database_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(recent(&dir.path().join("bridge.db"), 50).await.unwrap().is_empty());
    }
}
