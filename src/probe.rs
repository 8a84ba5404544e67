use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::net::TcpStream;
use tracing::debug;

/// Probe port: is `ip` reachable, and how fast.
///
/// Returns the latency metric in milliseconds (always >= 1) when reachable,
/// `None` on failure or timeout.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Option<u32>;
}

fn elapsed_metric(elapsed: Duration) -> u32 {
    let ms = elapsed.as_micros().div_ceil(1000);
    ms.clamp(1, u32::MAX as u128) as u32
}

/// Round-trip of a TCP handshake to a fixed port
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Option<u32> {
        let addr = SocketAddr::from((ip, self.port));
        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Some(elapsed_metric(start.elapsed())),
            Ok(Err(e)) => {
                debug!("TCP probe {} failed: {}", addr, e);
                None
            }
            Err(_) => {
                debug!("TCP probe {} timed out", addr);
                None
            }
        }
    }
}

/// One ICMP echo through the system `ping` binary (no raw socket privileges needed)
pub struct PingProbe;

fn rtt_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // "time=14.0 ms" (unix) / "time=14ms" / "time<1ms" (windows)
    PATTERN.get_or_init(|| Regex::new(r"(?i)time[=<]\s*([0-9.]+)\s*ms").expect("static regex"))
}

/// Round-trip milliseconds from one line of ping output
pub fn parse_ping_rtt(output: &str) -> Option<u32> {
    let caps = rtt_pattern().captures(output)?;
    let ms: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some((ms.ceil() as u32).max(1))
}

#[async_trait]
impl Probe for PingProbe {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> Option<u32> {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let wait_ms = timeout.as_millis().max(1).to_string();
        let target = ip.to_string();

        let mut cmd = tokio::process::Command::new("ping");
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w", &wait_ms, &target]);
        } else {
            cmd.args(["-n", "-c", "1", "-W", &wait_secs, &target]);
        }
        cmd.kill_on_drop(true);

        // The binary's own wait is whole seconds on unix; bound it precisely here
        let output = match tokio::time::timeout(timeout + Duration::from_millis(200), cmd.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                debug!("ping {} could not run: {}", ip, e);
                return None;
            }
            Err(_) => return None,
        };
        if !output.status.success() {
            return None;
        }
        parse_ping_rtt(&String::from_utf8_lossy(&output.stdout))
    }
}
