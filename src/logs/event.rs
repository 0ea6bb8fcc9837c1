use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide sequence used to keep same-millisecond ids distinct.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_id(timestamp: &DateTime<Utc>) -> String {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", timestamp.timestamp_millis(), seq)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Allowed,
    Blocked,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Allowed => "allowed",
            QueryStatus::Blocked => "blocked",
        }
    }
}

/// DNS record type as it appears in resolver logs. Unknown mnemonics are
/// kept verbatim rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QueryType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Srv,
    Ptr,
    Ns,
    Soa,
    Https,
    Svcb,
    Caa,
    Naptr,
    Null,
    Any,
    Ds,
    Dnskey,
    Other(String),
}

impl QueryType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "A" => QueryType::A,
            "AAAA" => QueryType::Aaaa,
            "CNAME" => QueryType::Cname,
            "MX" => QueryType::Mx,
            "TXT" => QueryType::Txt,
            "SRV" => QueryType::Srv,
            "PTR" => QueryType::Ptr,
            "NS" => QueryType::Ns,
            "SOA" => QueryType::Soa,
            "HTTPS" => QueryType::Https,
            "SVCB" => QueryType::Svcb,
            "CAA" => QueryType::Caa,
            "NAPTR" => QueryType::Naptr,
            "NULL" => QueryType::Null,
            "ANY" => QueryType::Any,
            "DS" => QueryType::Ds,
            "DNSKEY" => QueryType::Dnskey,
            other => QueryType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryType::A => "A",
            QueryType::Aaaa => "AAAA",
            QueryType::Cname => "CNAME",
            QueryType::Mx => "MX",
            QueryType::Txt => "TXT",
            QueryType::Srv => "SRV",
            QueryType::Ptr => "PTR",
            QueryType::Ns => "NS",
            QueryType::Soa => "SOA",
            QueryType::Https => "HTTPS",
            QueryType::Svcb => "SVCB",
            QueryType::Caa => "CAA",
            QueryType::Naptr => "NAPTR",
            QueryType::Null => "NULL",
            QueryType::Any => "ANY",
            QueryType::Ds => "DS",
            QueryType::Dnskey => "DNSKEY",
            QueryType::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

impl From<String> for QueryType {
    fn from(s: String) -> Self {
        QueryType::parse(&s)
    }
}

impl From<QueryType> for String {
    fn from(t: QueryType) -> Self {
        t.to_string()
    }
}

/// One resolved or blocked lookup, normalized from a resolver log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub qtype: QueryType,
    pub status: QueryStatus,
    pub response_time_ms: u64,
}

impl QueryEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        client_ip: &str,
        domain: &str,
        qtype: &str,
        status: QueryStatus,
        response_time_ms: u64,
    ) -> Self {
        Self {
            id: next_id(&timestamp),
            timestamp,
            client_ip: client_ip.to_string(),
            domain: normalize_qname(domain),
            qtype: QueryType::parse(qtype),
            status,
            response_time_ms,
        }
    }
}

/// Strip the trailing root dot from a query name.
fn normalize_qname(name: &str) -> String {
    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() { ".".to_string() } else { trimmed.to_string() }
}
