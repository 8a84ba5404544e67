//! Proxy counters and Prometheus text exposition
//!
//! Endpoint: GET /metrics (in-band on the proxy port, and on the admin port when enabled)

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::registry::DomainRegistry;

/// Atomically updated from connection handling
pub struct ProxyMetrics {
    /// Accepted inbound connections
    pub connections_total: AtomicU64,
    /// Inbound connections currently being handled
    pub connections_active: AtomicU64,
    /// CONNECT tunnels established
    pub tunnels_total: AtomicU64,
    /// Plain HTTP requests forwarded
    pub forwards_total: AtomicU64,
    /// Requests served by the internal endpoints
    pub local_requests_total: AtomicU64,
    /// Outbound connects that failed or timed out
    pub connect_failures_total: AtomicU64,
    /// Outbound connects routed through a registry candidate
    pub registry_routed_total: AtomicU64,
    /// Requests answered 400
    pub bad_requests_total: AtomicU64,
    /// Connections turned away at the connection limit
    pub rejected_total: AtomicU64,
    pub bytes_client_to_target: AtomicU64,
    pub bytes_target_to_client: AtomicU64,
    pub start_time: Instant,
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            tunnels_total: AtomicU64::new(0),
            forwards_total: AtomicU64::new(0),
            local_requests_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            registry_routed_total: AtomicU64::new(0),
            bad_requests_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            bytes_client_to_target: AtomicU64::new(0),
            bytes_target_to_client: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay(&self, to_target: u64, to_client: u64) {
        self.bytes_client_to_target.fetch_add(to_target, Ordering::Relaxed);
        self.bytes_target_to_client.fetch_add(to_client, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.start_time.elapsed().as_secs(),
            "connections_total": self.connections_total.load(Ordering::Relaxed),
            "connections_active": self.connections_active.load(Ordering::Relaxed),
            "tunnels_total": self.tunnels_total.load(Ordering::Relaxed),
            "forwards_total": self.forwards_total.load(Ordering::Relaxed),
            "local_requests_total": self.local_requests_total.load(Ordering::Relaxed),
            "connect_failures_total": self.connect_failures_total.load(Ordering::Relaxed),
            "registry_routed_total": self.registry_routed_total.load(Ordering::Relaxed),
            "bad_requests_total": self.bad_requests_total.load(Ordering::Relaxed),
            "rejected_total": self.rejected_total.load(Ordering::Relaxed),
            "bytes_client_to_target": self.bytes_client_to_target.load(Ordering::Relaxed),
            "bytes_target_to_client": self.bytes_target_to_client.load(Ordering::Relaxed),
        })
    }
}

/// Keeps `connections_active` honest for the lifetime of one connection task
pub struct ActiveConnection {
    metrics: Arc<ProxyMetrics>,
}

impl ActiveConnection {
    pub fn new(metrics: Arc<ProxyMetrics>) -> Self {
        ProxyMetrics::inc(&metrics.connections_total);
        ProxyMetrics::inc(&metrics.connections_active);
        Self { metrics }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Generate Prometheus-format metrics text
pub fn render_metrics(metrics: &ProxyMetrics, registry: &DomainRegistry) -> String {
    let mut out = String::with_capacity(4096);

    write_help_type(&mut out, "xproxy_up", "Whether the proxy is up.", "gauge");
    writeln!(out, "xproxy_up 1").ok();

    write_help_type(&mut out, "xproxy_uptime_seconds_total", "Uptime since start in seconds.", "counter");
    writeln!(out, "xproxy_uptime_seconds_total {:.3}", metrics.start_time.elapsed().as_secs_f64()).ok();

    let counters: [(&str, &str, &AtomicU64); 8] = [
        ("xproxy_connections_total", "Accepted inbound connections.", &metrics.connections_total),
        ("xproxy_tunnels_total", "CONNECT tunnels established.", &metrics.tunnels_total),
        ("xproxy_forwards_total", "Plain HTTP requests forwarded.", &metrics.forwards_total),
        ("xproxy_local_requests_total", "Requests served by internal endpoints.", &metrics.local_requests_total),
        ("xproxy_connect_failures_total", "Outbound connect attempts that failed.", &metrics.connect_failures_total),
        ("xproxy_registry_routed_total", "Outbound connects routed through a registry candidate.", &metrics.registry_routed_total),
        ("xproxy_bad_requests_total", "Requests rejected as malformed.", &metrics.bad_requests_total),
        ("xproxy_rejected_total", "Connections refused at the connection limit.", &metrics.rejected_total),
    ];
    for (name, help, counter) in counters {
        write_help_type(&mut out, name, help, "counter");
        writeln!(out, "{} {}", name, counter.load(Ordering::Relaxed)).ok();
    }
    write_help_type(&mut out, "xproxy_bytes_relayed_total", "Bytes relayed through established connections.", "counter");
    writeln!(out, "xproxy_bytes_relayed_total{{direction=\"to_target\"}} {}", metrics.bytes_client_to_target.load(Ordering::Relaxed)).ok();
    writeln!(out, "xproxy_bytes_relayed_total{{direction=\"to_client\"}} {}", metrics.bytes_target_to_client.load(Ordering::Relaxed)).ok();

    write_help_type(&mut out, "xproxy_connections_active", "Inbound connections being handled.", "gauge");
    writeln!(out, "xproxy_connections_active {}", metrics.connections_active.load(Ordering::Relaxed)).ok();

    // Registry
    write_help_type(&mut out, "xproxy_registry_domains", "Domains with at least one reachable candidate.", "gauge");
    writeln!(out, "xproxy_registry_domains {}", registry.len()).ok();

    write_help_type(&mut out, "xproxy_unresolved_domains", "Domains without a reachable candidate.", "gauge");
    writeln!(out, "xproxy_unresolved_domains {}", registry.unresolved_domains().len()).ok();

    let entries = registry.entries();

    write_help_type(&mut out, "xproxy_candidate_latency_ms", "Probe latency metric per candidate.", "gauge");
    for entry in &entries {
        for c in &entry.candidates {
            if let Some(latency) = c.latency_ms() {
                writeln!(out, "xproxy_candidate_latency_ms{{domain=\"{}\",ip=\"{}\"}} {}", c.domain(), c.ip(), latency).ok();
            }
        }
    }

    write_help_type(&mut out, "xproxy_candidate_errors", "Connect failures since the candidate was published.", "gauge");
    for entry in &entries {
        for c in &entry.candidates {
            write_gauge_if_nonzero(&mut out, "xproxy_candidate_errors", c.domain(), &c.ip().to_string(), c.error_count());
        }
    }

    out
}

// ── helpers ─────────────────────────────────────────

fn write_help_type(out: &mut String, name: &str, help: &str, metric_type: &str) {
    writeln!(out, "# HELP {} {}", name, help).ok();
    writeln!(out, "# TYPE {} {}", name, metric_type).ok();
}

fn write_gauge_if_nonzero(out: &mut String, name: &str, domain: &str, ip: &str, value: u32) {
    if value > 0 {
        writeln!(out, "{}{{domain=\"{}\",ip=\"{}\"}} {}", name, domain, ip, value).ok();
    }
}
