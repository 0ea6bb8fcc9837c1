//! One-off DNS lookups: ad-hoc query tests against the local resolver and
//! latency probes against public upstreams.

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Name probed against upstreams; any answer (even negative) proves reachability.
const PROBE_NAME: &str = "example.com.";

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub ttl: u32,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub domain: String,
    #[serde(rename = "type")]
    pub qtype: String,
    pub server: String,
    pub status: String,
    pub answers: Vec<Answer>,
    pub elapsed_ms: u64,
    /// NXDOMAIN and REFUSED are what a policy block looks like from outside.
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub name: String,
    pub addr: SocketAddr,
}

impl ProbeTarget {
    /// Accepts `name=ip`, `name=ip:port`, `ip` or `ip:port`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (name, addr) = match spec.split_once('=') {
            Some((n, a)) => (n.trim().to_string(), a.trim()),
            None => (spec.trim().to_string(), spec.trim()),
        };
        let addr = parse_server_addr(addr)?;
        Some(Self { name, addr })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub name: String,
    pub address: String,
    pub ok: bool,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn parse_server_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(a) = s.parse::<SocketAddr>() {
        return Some(a);
    }
    s.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
}

fn single_server_resolver(addr: SocketAddr, timeout: Duration) -> TokioAsyncResolver {
    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));

    let mut opts = ResolverOpts::default();
    opts.cache_size = 0;
    opts.use_hosts_file = false;
    opts.timeout = timeout;
    opts.attempts = 1;

    TokioAsyncResolver::tokio(config, opts)
}

/// dig-style mnemonic for a response code.
fn rcode_mnemonic(code: ResponseCode) -> String {
    match code {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        other => format!("RCODE{}", u16::from(other)),
    }
}

/// Status for a failed lookup: the response code when the server answered,
/// `TIMEOUT` when it did not, `ERROR` otherwise.
fn error_status(e: &ResolveError) -> String {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => rcode_mnemonic(*response_code),
        ResolveErrorKind::Timeout => "TIMEOUT".to_string(),
        _ => {
            let msg = e.to_string();
            if msg.contains("Refused") || msg.contains("REFUSED") {
                rcode_mnemonic(ResponseCode::Refused)
            } else {
                "ERROR".to_string()
            }
        }
    }
}

fn is_block_signature(status: &str) -> bool {
    status == "NXDOMAIN" || status == "REFUSED"
}

/// Resolve `domain`/`qtype` against `server` once and describe the outcome.
pub async fn query(server: SocketAddr, domain: &str, qtype: RecordType, timeout: Duration) -> QueryResult {
    let resolver = single_server_resolver(server, timeout);
    let fqdn = if domain.ends_with('.') { domain.to_string() } else { format!("{domain}.") };

    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, resolver.lookup(fqdn.as_str(), qtype)).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut result = QueryResult {
        domain: domain.trim_end_matches('.').to_string(),
        qtype: qtype.to_string(),
        server: server.to_string(),
        status: String::new(),
        answers: Vec::new(),
        elapsed_ms,
        blocked: false,
        error: None,
    };

    match outcome {
        Ok(Ok(lookup)) => {
            result.status = rcode_mnemonic(ResponseCode::NoError);
            result.answers = lookup
                .records()
                .iter()
                .map(|r| Answer {
                    name: r.name().to_string(),
                    rtype: r.record_type().to_string(),
                    ttl: r.ttl(),
                    data: r.data().map(|d| d.to_string()).unwrap_or_default(),
                })
                .collect();
        }
        Ok(Err(e)) => {
            result.status = error_status(&e);
            result.error = Some(e.to_string());
        }
        Err(_) => {
            result.status = "TIMEOUT".to_string();
            result.error = Some(format!("no answer within {}ms", timeout.as_millis()));
        }
    }

    result.blocked = is_block_signature(&result.status);
    tracing::debug!("Query {} {} via {}: {}", result.domain, result.qtype, server, result.status);
    result
}

async fn ping_one(target: ProbeTarget, timeout: Duration) -> PingResult {
    let resolver = single_server_resolver(target.addr, timeout);
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, resolver.lookup_ip(PROBE_NAME)).await;
    let latency = started.elapsed().as_millis() as u64;

    let error = match outcome {
        Ok(Ok(_)) => None,
        // A negative answer still means the server responded.
        Ok(Err(e)) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => None,
        Ok(Err(e)) if matches!(e.kind(), ResolveErrorKind::Timeout) => Some("timeout".to_string()),
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("timeout".to_string()),
    };

    PingResult {
        name: target.name,
        address: target.addr.to_string(),
        ok: error.is_none(),
        latency_ms: error.is_none().then_some(latency),
        error,
    }
}

/// Probe every target concurrently and return once all have finished,
/// in the same order as `targets`.
pub async fn ping_all(targets: Vec<ProbeTarget>, timeout: Duration) -> Vec<PingResult> {
    let handles: Vec<_> = targets
        .into_iter()
        .map(|t| {
            let fallback = PingResult {
                name: t.name.clone(),
                address: t.addr.to_string(),
                ok: false,
                latency_ms: None,
                error: Some("probe task failed".to_string()),
            };
            (tokio::spawn(ping_one(t, timeout)), fallback)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (handle, fallback) in handles {
        results.push(handle.await.unwrap_or(fallback));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_target_forms() {
        let t = ProbeTarget::parse("Cloudflare=1.1.1.1").unwrap();
        assert_eq!(t.name, "Cloudflare");
        assert_eq!(t.addr, "1.1.1.1:53".parse().unwrap());

        let t = ProbeTarget::parse("9.9.9.9:5353").unwrap();
        assert_eq!(t.name, "9.9.9.9:5353");
        assert_eq!(t.addr.port(), 5353);

        let t = ProbeTarget::parse("v6=[2606:4700::1111]:53").unwrap();
        assert!(t.addr.is_ipv6());

        assert!(ProbeTarget::parse("bogus=not-an-ip").is_none());
    }

    #[test]
    fn test_block_signature() {
        assert!(is_block_signature(&rcode_mnemonic(ResponseCode::NXDomain)));
        assert!(is_block_signature(&rcode_mnemonic(ResponseCode::Refused)));
        assert!(!is_block_signature(&rcode_mnemonic(ResponseCode::NoError)));
        assert!(!is_block_signature("TIMEOUT"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_reports_failure_within_timeout() {
        // TEST-NET-1, reserved and never routed.
        let targets = vec![ProbeTarget::parse("void=192.0.2.1").unwrap()];
        let started = Instant::now();
        let results = ping_all(targets, Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 1);
        assert!(!results[0].ok);
        assert!(results[0].latency_ms.is_none());
    }
}
