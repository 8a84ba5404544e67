use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::metrics::ProxyMetrics;
use crate::proxy::context::ConnectionContext;
use crate::proxy::relay::{relay, RelayTotals};
use crate::proxy::request::{encode_response, parse_head, HttpFailure, RequestHead, RESPONSE_CONNECT_ESTABLISHED};
use crate::registry::DomainRegistry;

/// Where a request goes once its head has been read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Addressed to the proxy itself, answered in-process
    LocalRequest,
    /// CONNECT: opaque bytes after the 200
    Tunneling,
    /// Plain HTTP: the head is replayed to the target
    Forwarding,
}

enum ConnectStep {
    Done(anyhow::Result<TcpStream>),
    Read(std::io::Result<usize>),
}

/// Opens outbound TCP connections for the router
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> anyhow::Result<TcpStream>;
}

/// System resolver, keepalive off, Nagle off
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let mut last_error = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
            socket.set_keepalive(false)?;
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => Err(anyhow::anyhow!("{} resolved to no address", host)),
        }
    }
}

/// Drives one inbound connection from the first request head to close
pub struct ConnectionRouter {
    registry: Arc<DomainRegistry>,
    metrics: Arc<ProxyMetrics>,
    endpoints: axum::Router,
    dialer: Arc<dyn Dialer>,
    listen_address: String,
    listen_port: u16,
    connect_timeout: Duration,
    header_read_timeout: Duration,
    max_header_bytes: usize,
    max_pending_bytes: usize,
}

impl ConnectionRouter {
    pub fn new(
        registry: Arc<DomainRegistry>,
        metrics: Arc<ProxyMetrics>,
        endpoints: axum::Router,
        dialer: Arc<dyn Dialer>,
        listen_address: &str,
        listen_port: u16,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            endpoints,
            dialer,
            listen_address: listen_address.to_ascii_lowercase(),
            listen_port,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            header_read_timeout: Duration::from_millis(config.header_read_timeout_ms),
            max_header_bytes: config.max_header_bytes,
            max_pending_bytes: config.max_pending_bytes,
        }
    }

    pub fn classify(&self, head: &RequestHead, local_ip: IpAddr) -> Route {
        if self.is_self_addressed(&head.host, head.port, local_ip) {
            Route::LocalRequest
        } else if head.is_connect() {
            Route::Tunneling
        } else {
            Route::Forwarding
        }
    }

    fn is_self_addressed(&self, host: &str, port: u16, local_ip: IpAddr) -> bool {
        if port != self.listen_port {
            return false;
        }
        if host == "localhost" || host == self.listen_address {
            return true;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => ip.is_loopback() || ip == local_ip,
            Err(_) => false,
        }
    }

    pub async fn handle(&self, mut inbound: TcpStream, client: SocketAddr) -> anyhow::Result<()> {
        let local_ip = inbound.local_addr()?.ip();
        let mut buf = BytesMut::with_capacity(4096);

        let head = match self.read_head(&mut inbound, &mut buf).await {
            Ok(Some(head)) => head,
            Ok(None) => {
                debug!(client = %client, "Closed before a complete request head");
                return Ok(());
            }
            Err(e) => match e.downcast_ref::<HttpFailure>() {
                Some(failure) => {
                    ProxyMetrics::inc(&self.metrics.bad_requests_total);
                    debug!(client = %client, "Rejecting request: {}", failure);
                    reply_failure(&mut inbound, *failure).await;
                    return Ok(());
                }
                None => return Err(e),
            },
        };

        let route = self.classify(&head, local_ip);
        debug!(
            client = %client,
            host = %head.host,
            port = head.port,
            route = ?route,
            "{} {}",
            head.method,
            head.target
        );

        match route {
            Route::LocalRequest => self.serve_local(inbound, head, buf).await,
            Route::Tunneling | Route::Forwarding => self.route_outbound(inbound, client, head, buf, route).await,
        }
    }

    /// Read until the head parses. `Ok(None)` if the client left first.
    async fn read_head(&self, inbound: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<Option<RequestHead>> {
        loop {
            if let Some(head) = parse_head(&buf[..])? {
                return Ok(Some(head));
            }
            if buf.len() >= self.max_header_bytes {
                return Err(HttpFailure::BadRequest.into());
            }
            buf.reserve(4096);
            let n = tokio::time::timeout(self.header_read_timeout, inbound.read_buf(buf))
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for request head"))??;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    async fn serve_local(&self, mut inbound: TcpStream, head: RequestHead, mut buf: BytesMut) -> anyhow::Result<()> {
        ProxyMetrics::inc(&self.metrics.local_requests_total);
        buf.advance(head.len);

        let body_len = match head.content_length() {
            Ok(n) if n <= self.max_pending_bytes => n,
            _ => {
                ProxyMetrics::inc(&self.metrics.bad_requests_total);
                reply_failure(&mut inbound, HttpFailure::BadRequest).await;
                return Ok(());
            }
        };
        while buf.len() < body_len {
            let n = tokio::time::timeout(self.header_read_timeout, inbound.read_buf(&mut buf))
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for request body"))??;
            if n == 0 {
                return Ok(());
            }
        }

        let request = match head.to_local_request(buf.split_to(body_len).freeze()) {
            Ok(request) => request,
            Err(e) => {
                debug!("Cannot rebuild local request: {}", e);
                reply_failure(&mut inbound, HttpFailure::BadRequest).await;
                return Ok(());
            }
        };
        let response = match self.endpoints.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        let bytes = match encode_response(response).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode local response for {}: {}", head.target, e);
                reply_failure(&mut inbound, HttpFailure::Internal).await;
                return Ok(());
            }
        };
        inbound.write_all(&bytes).await?;
        inbound.shutdown().await?;
        Ok(())
    }

    async fn route_outbound(
        &self,
        mut inbound: TcpStream,
        client: SocketAddr,
        head: RequestHead,
        mut buf: BytesMut,
        route: Route,
    ) -> anyhow::Result<()> {
        let candidate = self.registry.select(&head.host);
        let mut ctx = ConnectionContext::new(client, &head.host, head.port, candidate, self.max_pending_bytes);
        let target = ctx.connect_host();

        // A tunnel starts after the head; a forward replays it
        if route == Route::Tunneling {
            buf.advance(head.len);
        }
        ctx.push_pending(buf.split().freeze())?;

        let connect = connect_outbound(self.dialer.as_ref(), &target, ctx.port(), self.connect_timeout);
        tokio::pin!(connect);

        // EOF from the client here is a half-close: what is queued still goes out
        let mut client_eof = false;
        let connected = loop {
            let mut chunk = BytesMut::with_capacity(8192);
            let step = tokio::select! {
                result = &mut connect => ConnectStep::Done(result),
                read = inbound.read_buf(&mut chunk), if !client_eof && !ctx.is_full() => ConnectStep::Read(read),
            };
            match step {
                ConnectStep::Done(result) => break result,
                ConnectStep::Read(Ok(0)) => {
                    debug!(
                        client = %ctx.client(),
                        host = %ctx.origin_host(),
                        pending = ctx.pending_bytes(),
                        "Client half-closed while connecting"
                    );
                    client_eof = true;
                }
                ConnectStep::Read(Ok(_)) => ctx.push_pending(chunk.freeze())?,
                ConnectStep::Read(Err(e)) => {
                    // Dropping the pending connect closes the outbound socket
                    debug!(client = %ctx.client(), host = %ctx.origin_host(), "Client gone while connecting: {}", e);
                    return Ok(());
                }
            }
        };

        let mut outbound = match connected {
            Ok(stream) => stream,
            Err(e) => {
                ProxyMetrics::inc(&self.metrics.connect_failures_total);
                let errors = ctx.record_connect_failure();
                warn!(
                    client = %ctx.client(),
                    host = %ctx.origin_host(),
                    port = ctx.port(),
                    target = %target,
                    errors = ?errors,
                    "Connect failed: {}",
                    e
                );
                reply_failure(&mut inbound, HttpFailure::BadGateway).await;
                return Ok(());
            }
        };

        ctx.record_connect_success();
        if ctx.candidate().is_some() {
            ProxyMetrics::inc(&self.metrics.registry_routed_total);
        }
        if route == Route::Tunneling {
            ProxyMetrics::inc(&self.metrics.tunnels_total);
            inbound.write_all(RESPONSE_CONNECT_ESTABLISHED).await?;
        } else {
            ProxyMetrics::inc(&self.metrics.forwards_total);
        }
        let mut delivered = 0u64;
        for chunk in ctx.drain_pending() {
            outbound.write_all(&chunk).await?;
            delivered += chunk.len() as u64;
        }

        info!(
            client = %client,
            host = %head.host,
            port = head.port,
            target = %target,
            "{}",
            if route == Route::Tunneling { "Tunnel established" } else { "Forwarding" }
        );

        let totals = if client_eof {
            outbound.shutdown().await?;
            let to_client = tokio::io::copy(&mut outbound, &mut inbound).await?;
            let _ = inbound.shutdown().await;
            RelayTotals { to_target: 0, to_client }
        } else {
            relay(inbound, outbound).await
        };
        self.metrics.record_relay(delivered + totals.to_target, totals.to_client);
        debug!(
            client = %client,
            host = %head.host,
            "Closed ({} bytes to target, {} to client)",
            delivered + totals.to_target,
            totals.to_client
        );
        Ok(())
    }
}

/// Outbound connect bounded by `timeout`
pub async fn connect_outbound(dialer: &dyn Dialer, host: &str, port: u16, timeout: Duration) -> anyhow::Result<TcpStream> {
    tokio::time::timeout(timeout, dialer.dial(host, port))
        .await
        .map_err(|_| anyhow::anyhow!("connect to {}:{} timed out after {:?}", host, port, timeout))?
}

async fn reply_failure(inbound: &mut TcpStream, failure: HttpFailure) {
    if let Err(e) = inbound.write_all(failure.response()).await {
        debug!("Could not send {}: {}", failure, e);
    }
    let _ = inbound.shutdown().await;
}
