use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::dns::packet;
use crate::dns::types::{RecordType, ResponseCode};

const DNS_PORT: u16 = 53;

/// Resolver port: candidate IPv4 addresses of `domain` according to one DNS server.
///
/// Implementations never fail; any error collapses to an empty list.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_a(&self, dns_server: &str, domain: &str) -> Vec<Ipv4Addr>;
}

/// Plain UDP resolver speaking the crate's own wire codec
pub struct UdpResolver {
    timeout: Duration,
}

impl UdpResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Accepts `1.1.1.1`, `1.1.1.1:5353`, `::1` and `[::1]:53`
    pub fn server_addr(dns_server: &str) -> anyhow::Result<SocketAddr> {
        let trimmed = dns_server.trim();
        if let Ok(addr) = trimmed.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let ip: IpAddr = trimmed
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid DNS server address '{}': {}", dns_server, e))?;
        Ok(SocketAddr::new(ip, DNS_PORT))
    }

    async fn query(&self, addr: SocketAddr, domain: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
        let id: u16 = rand::random();
        let query = packet::build_query(id, domain, RecordType::A)?;

        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        socket.send(&query).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut buf = vec![0u8; 4096];
        loop {
            let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| anyhow::anyhow!("Timeout querying {}", addr))??;

            let response = match packet::parse_response(&buf[..len]) {
                Ok(r) => r,
                Err(e) => {
                    debug!("Discarding malformed answer from {}: {}", addr, e);
                    continue;
                }
            };
            // Stale or spoofed datagram - keep waiting for ours
            if !response.header.qr || response.header.id != id {
                continue;
            }
            if response.header.rcode != ResponseCode::NoError {
                return Err(anyhow::anyhow!("{} answered {:?} for {}", addr, response.header.rcode, domain));
            }
            if response.header.tc {
                debug!("Truncated answer from {} for {}, using what arrived", addr, domain);
            }
            for record in &response.answers {
                debug!("{} -> {} {:?} ttl={}", addr, record.name, record.rtype, record.ttl);
            }
            return Ok(response.a_records());
        }
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    async fn resolve_a(&self, dns_server: &str, domain: &str) -> Vec<Ipv4Addr> {
        let result = match Self::server_addr(dns_server) {
            Ok(addr) => self.query(addr, domain).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(ips) => ips,
            Err(e) => {
                debug!("Resolve {} via {} failed: {}", domain, dns_server, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-shot fake DNS server answering with `ips` (or never answering)
    async fn fake_server(ips: Option<Vec<Ipv4Addr>>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let id = u16::from_be_bytes([buf[0], buf[1]]);
            let mut offset = 12;
            let name = packet::parse_name(&buf[..len], &mut offset).unwrap();
            if let Some(ips) = ips {
                let reply = packet::fake_a_response(id, &name, &ips);
                socket.send_to(&reply, peer).await.unwrap();
            } else {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
        addr
    }

    #[test]
    fn test_server_addr_forms() {
        assert_eq!(UdpResolver::server_addr("1.1.1.1").unwrap(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(UdpResolver::server_addr("9.9.9.9:5353").unwrap(), "9.9.9.9:5353".parse().unwrap());
        assert_eq!(UdpResolver::server_addr("[::1]:53").unwrap(), "[::1]:53".parse().unwrap());
        assert!(UdpResolver::server_addr("dns.example").is_err());
    }

    #[tokio::test]
    async fn test_resolves_a_records() {
        let ips = vec![Ipv4Addr::new(198, 51, 100, 7), Ipv4Addr::new(198, 51, 100, 8)];
        let server = fake_server(Some(ips.clone())).await;
        let resolver = UdpResolver::new(Duration::from_secs(2));
        assert_eq!(resolver.resolve_a(&server.to_string(), "example.test").await, ips);
    }

    #[tokio::test]
    async fn test_silent_server_yields_empty() {
        let server = fake_server(None).await;
        let resolver = UdpResolver::new(Duration::from_millis(200));
        assert!(resolver.resolve_a(&server.to_string(), "example.test").await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_server_address_yields_empty() {
        let resolver = UdpResolver::new(Duration::from_millis(200));
        assert!(resolver.resolve_a("not-an-ip", "example.test").await.is_empty());
    }
}
