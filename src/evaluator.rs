use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::{Config, ProbeKind};
use crate::probe::{PingProbe, Probe, TcpProbe};
use crate::registry::IpCandidate;
use crate::resolver::{Resolver, UdpResolver};

/// Turns a domain into health-annotated candidates: resolve against every
/// configured DNS server concurrently, probe every answer, keep the reachable ones.
pub struct CandidateEvaluator {
    resolver: Arc<dyn Resolver>,
    probe: Arc<dyn Probe>,
    dns_servers: Vec<String>,
    fixed_ips: HashMap<String, Vec<Ipv4Addr>>,
    probe_timeout: Duration,
}

impl CandidateEvaluator {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        probe: Arc<dyn Probe>,
        dns_servers: Vec<String>,
        fixed_ips: &HashMap<String, Vec<String>>,
        probe_timeout: Duration,
    ) -> Self {
        let mut pinned = HashMap::new();
        for (domain, ips) in fixed_ips {
            let parsed: Vec<Ipv4Addr> = ips
                .iter()
                .filter_map(|ip| match ip.trim().parse() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!("Ignoring fixed IP '{}' for {}: not an IPv4 address", ip, domain);
                        None
                    }
                })
                .collect();
            if !parsed.is_empty() {
                pinned.insert(domain.trim().to_ascii_lowercase(), parsed);
            }
        }

        Self {
            resolver,
            probe,
            dns_servers,
            fixed_ips: pinned,
            probe_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let resolver: Arc<dyn Resolver> = Arc::new(UdpResolver::new(config.resolver_timeout()));
        let probe: Arc<dyn Probe> = match config.probe.kind {
            ProbeKind::Tcp => Arc::new(TcpProbe::new(config.probe.tcp_port)),
            ProbeKind::Ping => Arc::new(PingProbe),
        };
        Self::new(
            resolver,
            probe,
            config.resolver.dns_servers.clone(),
            &config.domains.fixed_ips,
            config.probe_timeout(),
        )
    }

    /// Never fails: an empty result means no reachable candidate was found.
    pub async fn evaluate(&self, domain: &str) -> Vec<IpCandidate> {
        if let Some(fixed) = self.fixed_ips.get(domain) {
            let candidates = self.evaluate_fixed(domain, fixed).await;
            if !candidates.is_empty() {
                return candidates;
            }
            let listed: Vec<String> = fixed.iter().map(|ip| ip.to_string()).collect();
            warn!(
                "Fixed IPs [{}] for {} are all unreachable, falling back to DNS. Update the configuration.",
                listed.join(", "),
                domain
            );
        }
        self.evaluate_dns(domain).await
    }

    async fn evaluate_fixed(&self, domain: &str, ips: &[Ipv4Addr]) -> Vec<IpCandidate> {
        self.probe_all(domain, ips)
            .await
            .into_iter()
            .map(|(ip, latency)| IpCandidate::new(domain, ip, Some(latency)).preferred(true))
            .collect()
    }

    async fn evaluate_dns(&self, domain: &str) -> Vec<IpCandidate> {
        let mut set = JoinSet::new();
        for (index, server) in self.dns_servers.iter().enumerate() {
            let resolver = self.resolver.clone();
            let server = server.clone();
            let domain = domain.to_string();
            set.spawn(async move {
                let ips = resolver.resolve_a(&server, &domain).await;
                debug!("{} via {}: {} answer(s)", domain, server, ips.len());
                (index, ips)
            });
        }

        // Join everything, then merge in server order so the result does not
        // depend on which server answered first
        let mut per_server: Vec<Vec<Ipv4Addr>> = vec![Vec::new(); self.dns_servers.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, ips)) => per_server[index] = ips,
                Err(e) => warn!("Resolution task for {} failed: {}", domain, e),
            }
        }

        let mut unique: Vec<Ipv4Addr> = Vec::new();
        for ip in per_server.into_iter().flatten() {
            if !unique.contains(&ip) {
                unique.push(ip);
            }
        }

        let mut reachable = self.probe_all(domain, &unique).await;
        reachable.sort_by_key(|(_, latency)| *latency);
        reachable
            .into_iter()
            .map(|(ip, latency)| IpCandidate::new(domain, ip, Some(latency)))
            .collect()
    }

    /// Probe every address once, concurrently. Keeps input order; drops
    /// unreachable addresses and any without a positive metric.
    async fn probe_all(&self, domain: &str, ips: &[Ipv4Addr]) -> Vec<(Ipv4Addr, u32)> {
        let mut set = JoinSet::new();
        for (index, ip) in ips.iter().copied().enumerate() {
            let probe = self.probe.clone();
            let timeout = self.probe_timeout;
            set.spawn(async move { (index, ip, probe.probe(ip, timeout).await) });
        }

        let mut reachable = Vec::with_capacity(ips.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, ip, Some(latency))) if latency > 0 => reachable.push((index, ip, latency)),
                Ok((_, ip, Some(_))) => debug!("{} for {} returned no usable metric", ip, domain),
                Ok((_, ip, None)) => debug!("{} for {} unreachable", ip, domain),
                Err(e) => warn!("Probe task for {} failed: {}", domain, e),
            }
        }
        reachable.sort_by_key(|(index, _, _)| *index);
        reachable.into_iter().map(|(_, ip, latency)| (ip, latency)).collect()
    }
}
