//! Host telemetry snapshot for `/info`.

use ipnet::Ipv4Net;
use moka::future::Cache;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, Networks, System};

use crate::exec::CommandRunner;

/// Sampling window for CPU usage and network throughput.
const SAMPLE_WINDOW: Duration = Duration::from_millis(500);
const EXTERNAL_IP_TTL: Duration = Duration::from_secs(600);
const EXTERNAL_IP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    pub name: String,
    pub address: String,
    pub netmask: String,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    #[serde(flatten)]
    pub usage: SystemUsage,
    pub interface: Option<InterfaceInfo>,
    pub gateway: Option<String>,
    pub external_ip: Option<String>,
}

pub struct HostProbe {
    runner: Arc<dyn CommandRunner>,
    http: reqwest::Client,
    external_ip_url: String,
    external_ip: Cache<String, String>,
    timeout: Duration,
}

impl HostProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, external_ip_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(EXTERNAL_IP_TIMEOUT)
            .user_agent(concat!("resolver-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            runner,
            http,
            external_ip_url: external_ip_url.into(),
            external_ip: Cache::builder()
                .max_capacity(1)
                .time_to_live(EXTERNAL_IP_TTL)
                .build(),
            timeout,
        }
    }

    pub async fn snapshot(&self) -> HostInfo {
        let usage_task = tokio::task::spawn_blocking(sample_usage);
        let (interface, gateway, external_ip) = tokio::join!(
            self.primary_interface(),
            self.default_gateway(),
            self.external_ip(),
        );
        let usage = usage_task.await.unwrap_or_else(|e| {
            tracing::warn!("System usage sampling failed: {}", e);
            SystemUsage::default()
        });

        HostInfo {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            os: System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string()),
            usage,
            interface,
            gateway,
            external_ip,
        }
    }

    async fn ip_json(&self, args: &[&str]) -> Option<serde_json::Value> {
        match self.runner.run("ip", args, self.timeout).await {
            Ok(out) => serde_json::from_str(&out.stdout).ok(),
            Err(e) => {
                tracing::debug!("ip {:?} failed: {}", args, e);
                None
            }
        }
    }

    /// Interface carrying the default route, with its first IPv4 address.
    pub async fn primary_interface(&self) -> Option<InterfaceInfo> {
        let routes = self.ip_json(&["-j", "route", "show", "default"]).await?;
        let dev = routes.as_array()?.first()?["dev"].as_str()?.to_string();
        if dev == "lo" {
            return None;
        }

        let addrs = self.ip_json(&["-j", "-4", "addr", "show", "dev", &dev]).await?;
        let (address, netmask) = first_ipv4(&addrs)?;
        let mac = read_mac(&PathBuf::from("/sys/class/net").join(&dev).join("address")).await;

        Some(InterfaceInfo { name: dev, address, netmask, mac })
    }

    pub async fn default_gateway(&self) -> Option<String> {
        let routes = self.ip_json(&["-j", "route", "show", "default"]).await?;
        Some(routes.as_array()?.first()?["gateway"].as_str()?.to_string())
    }

    /// Public address as seen from outside, cached for ten minutes.
    /// Failures are not cached.
    pub async fn external_ip(&self) -> Option<String> {
        if let Some(ip) = self.external_ip.get(&self.external_ip_url).await {
            return Some(ip);
        }
        let body = match self.http.get(&self.external_ip_url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.ok()?,
            Ok(resp) => {
                tracing::debug!("External IP lookup returned {}", resp.status());
                return None;
            }
            Err(e) => {
                tracing::debug!("External IP lookup failed: {}", e);
                return None;
            }
        };
        let ip = body.trim().to_string();
        if ip.parse::<std::net::IpAddr>().is_err() {
            return None;
        }
        self.external_ip.insert(self.external_ip_url.clone(), ip.clone()).await;
        Some(ip)
    }
}

/// First `(address, dotted netmask)` out of `ip -j -4 addr show` output.
pub fn first_ipv4(addrs: &serde_json::Value) -> Option<(String, String)> {
    let info = addrs.as_array()?.first()?["addr_info"].as_array()?.first()?;
    let local: Ipv4Addr = info["local"].as_str()?.parse().ok()?;
    let prefix = u8::try_from(info["prefixlen"].as_u64()?).ok()?;
    let net = Ipv4Net::new(local, prefix).ok()?;
    Some((local.to_string(), net.netmask().to_string()))
}

async fn read_mac(path: &Path) -> Option<String> {
    let mac = tokio::fs::read_to_string(path).await.ok()?;
    let mac = mac.trim();
    (!mac.is_empty()).then(|| mac.to_string())
}

fn percent(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        0.0
    } else {
        ((part as f64 / whole as f64) * 1000.0).round() as f32 / 10.0
    }
}

/// Blocking: sleeps for one sample window.
fn sample_usage() -> SystemUsage {
    let mut sys = System::new();
    let mut networks = Networks::new_with_refreshed_list();
    sys.refresh_cpu();

    std::thread::sleep(SAMPLE_WINDOW.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));

    sys.refresh_cpu();
    sys.refresh_memory();
    networks.refresh();

    let (rx, tx) = networks
        .iter()
        .filter(|(name, _)| name.as_str() != "lo")
        .fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx + data.received(), tx + data.transmitted())
        });
    let window_secs = SAMPLE_WINDOW.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).as_secs_f64();

    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.iter().next());
    let disk_percent = root
        .map(|d| percent(d.total_space().saturating_sub(d.available_space()), d.total_space()))
        .unwrap_or(0.0);

    SystemUsage {
        cpu_percent: (sys.global_cpu_info().cpu_usage() * 10.0).round() / 10.0,
        memory_percent: percent(sys.used_memory(), sys.total_memory()),
        disk_percent,
        rx_bytes_per_sec: (rx as f64 / window_secs) as u64,
        tx_bytes_per_sec: (tx as f64 / window_secs) as u64,
    }
}
