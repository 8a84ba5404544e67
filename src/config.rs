use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub domains: DomainsConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    /// DNS servers queried for every domain, `host` or `host:port`
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,
    #[serde(default = "default_resolver_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// TCP connect round-trip to `tcp_port`
    Tcp,
    /// One ICMP echo through the system `ping` binary
    Ping,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_kind")]
    pub kind: ProbeKind,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_tcp_port")]
    pub tcp_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Delay between full sweeps, measured from the end of the previous sweep
    #[serde(default = "default_full_sweep_secs")]
    pub full_sweep_secs: u64,
    /// Delay between rechecks of unresolved domains
    #[serde(default = "default_recheck_secs")]
    pub recheck_secs: u64,
    #[serde(default = "default_recheck_secs")]
    pub recheck_initial_delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Inbound bytes buffered while the outbound connect is in flight
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    #[serde(default = "default_header_read_timeout_ms")]
    pub header_read_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DomainsConfig {
    /// Operator-supplied domain list merged with the bundled one
    pub extra_file: Option<String>,
    /// Pinned IPs per domain; reachable ones become preferred candidates
    #[serde(default)]
    pub fixed_ips: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            port: default_listen_port(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dns_servers: default_dns_servers(),
            timeout_ms: default_resolver_timeout_ms(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: default_probe_kind(),
            timeout_ms: default_probe_timeout_ms(),
            tcp_port: default_probe_tcp_port(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full_sweep_secs: default_full_sweep_secs(),
            recheck_secs: default_recheck_secs(),
            recheck_initial_delay_secs: default_recheck_secs(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_header_bytes: default_max_header_bytes(),
            max_pending_bytes: default_max_pending_bytes(),
            header_read_timeout_ms: default_header_read_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_web_address(),
            port: default_web_port(),
        }
    }
}

// Default value functions
fn default_listen_address() -> String { "0.0.0.0".to_string() }
fn default_listen_port() -> u16 { 8080 }
fn default_dns_servers() -> Vec<String> {
    vec!["223.5.5.5".to_string(), "119.29.29.29".to_string(), "8.8.8.8".to_string(), "1.1.1.1".to_string()]
}
fn default_resolver_timeout_ms() -> u64 { 2000 }
fn default_probe_kind() -> ProbeKind { ProbeKind::Tcp }
fn default_probe_timeout_ms() -> u64 { 1000 }
fn default_probe_tcp_port() -> u16 { 443 }
fn default_full_sweep_secs() -> u64 { 300 }
fn default_recheck_secs() -> u64 { 10 }
fn default_connect_timeout_ms() -> u64 { 5000 }
fn default_max_header_bytes() -> usize { 65536 }
fn default_max_pending_bytes() -> usize { 256 * 1024 }
fn default_header_read_timeout_ms() -> u64 { 10_000 }
fn default_max_connections() -> usize { 4096 }
fn default_web_address() -> String { "127.0.0.1".to_string() }
fn default_web_port() -> u16 { 8081 }

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content).map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.resolver.dns_servers.is_empty() {
            return Err(anyhow::anyhow!("At least one DNS server is required"));
        }
        Ok(config)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver.timeout_ms)
    }
}
