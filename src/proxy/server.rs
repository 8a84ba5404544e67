use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domains::DomainSource;
use crate::evaluator::CandidateEvaluator;
use crate::metrics::{ActiveConnection, ProxyMetrics};
use crate::proxy::request::HttpFailure;
use crate::proxy::router::{ConnectionRouter, TcpDialer};
use crate::registry::DomainRegistry;
use crate::scheduler::{ResolutionScheduler, ScheduleTimings};
use crate::web::server::{internal_router, AppState, WebServer};

const BIND_TIMEOUT: Duration = Duration::from_secs(30);

/// The proxy process: listening socket, registry, scheduler and admin listener
pub struct ProxyServer {
    config: Arc<Config>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    registry: Arc<DomainRegistry>,
    metrics: Arc<ProxyMetrics>,
    scheduler: Arc<ResolutionScheduler>,
    router: Arc<ConnectionRouter>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub async fn bind(config: Arc<Config>) -> anyhow::Result<Self> {
        let evaluator = CandidateEvaluator::from_config(&config);
        let source = DomainSource::new(config.domains.extra_file.as_deref());
        Self::bind_with(config, evaluator, source).await
    }

    /// Bind the listening port. Failure here is fatal for the process.
    pub async fn bind_with(
        config: Arc<Config>,
        evaluator: CandidateEvaluator,
        source: DomainSource,
    ) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", config.listen.address, config.listen.port);
        let listener = tokio::time::timeout(BIND_TIMEOUT, TcpListener::bind(&addr))
            .await
            .map_err(|_| anyhow::anyhow!("Timed out binding proxy port {}", addr))?
            .map_err(|e| anyhow::anyhow!("Failed to bind proxy port {}: {}", addr, e))?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(DomainRegistry::new());
        let metrics = Arc::new(ProxyMetrics::new());
        let scheduler = Arc::new(ResolutionScheduler::new(
            registry.clone(),
            Arc::new(evaluator),
            source,
            ScheduleTimings::from(&config.schedule),
        ));
        let endpoints = internal_router(AppState {
            registry: registry.clone(),
            metrics: metrics.clone(),
            proxy_addr: local_addr.to_string(),
        });
        let router = Arc::new(ConnectionRouter::new(
            registry.clone(),
            metrics.clone(),
            endpoints,
            Arc::new(TcpDialer),
            &config.listen.address,
            local_addr.port(),
            &config.proxy,
        ));

        Ok(Self {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            registry,
            metrics,
            scheduler,
            router,
            accept_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start accepting connections and both resolution loops
    pub fn start(&self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("Proxy server already started"))?;

        self.scheduler.start();

        if self.config.web.enabled {
            let web = WebServer::new(
                AppState {
                    registry: self.registry.clone(),
                    metrics: self.metrics.clone(),
                    proxy_addr: self.local_addr.to_string(),
                },
                self.config.web.clone(),
            );
            let shutdown = self.shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = web.run(shutdown).await {
                    error!("Admin listener error: {}", e);
                }
            });
        }

        let task = tokio::spawn(accept_loop(
            listener,
            self.router.clone(),
            self.metrics.clone(),
            Arc::new(Semaphore::new(self.config.proxy.max_connections)),
            self.shutdown.clone(),
        ));
        *self.accept_task.lock() = Some(task);

        info!("Proxy listening on {}", self.local_addr);
        Ok(())
    }

    /// Stop the scheduler and release the listening port. Established
    /// connections run until either side closes.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Proxy server stopping");
        self.scheduler.stop();
        self.shutdown.cancel();
    }

    /// Wait for the accept loop to finish after `stop`
    pub async fn join(&self) {
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Accept loop aborted: {}", e);
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<ConnectionRouter>,
    metrics: Arc<ProxyMetrics>,
    limit: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (mut stream, client) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let permit = match limit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                ProxyMetrics::inc(&metrics.rejected_total);
                debug!(client = %client, "Connection limit reached");
                tokio::spawn(async move {
                    let _ = stream.write_all(HttpFailure::Unavailable.response()).await;
                    let _ = stream.shutdown().await;
                });
                continue;
            }
        };

        let router = router.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _active = ActiveConnection::new(metrics);
            let handler = tokio::spawn(async move { router.handle(stream, client).await });
            match handler.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(client = %client, "Connection ended with error: {}", e),
                Err(e) => error!(client = %client, "Connection task aborted: {}", e),
            }
        });
    }
    info!("Proxy listener closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::fakes::{FakeProbe, FakeResolver};
    use crate::proxy::request::RESPONSE_CONNECT_ESTABLISHED;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn test_config(extra: &str) -> Arc<Config> {
        let text = format!("[listen]\naddress = \"127.0.0.1\"\nport = 0\n{}", extra);
        Arc::new(Config::parse(&text).unwrap())
    }

    fn offline_evaluator(answers: &[(&str, &[Ipv4Addr])], latency: &[(Ipv4Addr, u32)]) -> CandidateEvaluator {
        CandidateEvaluator::new(
            Arc::new(FakeResolver::with(answers)),
            Arc::new(FakeProbe::with(latency)),
            vec!["dns-a".to_string()],
            &HashMap::new(),
            Duration::from_millis(50),
        )
    }

    async fn started(extra: &str, domains: &str, evaluator: CandidateEvaluator) -> ProxyServer {
        let server = ProxyServer::bind_with(test_config(extra), evaluator, DomainSource::from_list(domains, None))
            .await
            .unwrap();
        server.start().unwrap();
        server
    }

    #[tokio::test]
    async fn test_health_over_http() {
        let server = started("", "", offline_evaluator(&[], &[])).await;
        let base = format!("http://{}", server.local_addr);
        let client = reqwest::Client::builder().no_proxy().build().unwrap();

        let response = client.get(format!("{}/health", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK");

        let stats: serde_json::Value = client
            .get(format!("{}/api/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(stats["local_requests_total"].as_u64().unwrap() >= 2);
        server.stop();
    }

    #[tokio::test]
    async fn test_sweep_feeds_router() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let evaluator = offline_evaluator(&[("dns-a", &[Ipv4Addr::LOCALHOST])], &[(Ipv4Addr::LOCALHOST, 3)]);
        let server = started("", "routed.test\n", evaluator).await;
        for _ in 0..100 {
            if server.registry.get("routed.test").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.registry.get("routed.test").is_some());

        let mut client = TcpStream::connect(server.local_addr).await.unwrap();
        let request = format!("CONNECT routed.test:{} HTTP/1.1\r\n\r\nhi", echo_port);
        client.write_all(request.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; RESPONSE_CONNECT_ESTABLISHED.len() + 2];
        client.read_exact(&mut buf).await.unwrap();
        assert!(buf.ends_with(b"hi"));
        assert_eq!(server.metrics.registry_routed_total.load(std::sync::atomic::Ordering::Relaxed), 1);
        server.stop();
    }

    #[tokio::test]
    async fn test_connection_limit_answers_503() {
        let server = started("[proxy]\nmax_connections = 1\n", "", offline_evaluator(&[], &[])).await;

        let _holder = TcpStream::connect(server.local_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = TcpStream::connect(server.local_addr).await.unwrap();
        let mut response = Vec::new();
        second.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 503 Service Unavailable\r\n"));
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let server = started("", "", offline_evaluator(&[], &[])).await;
        let addr = server.local_addr;
        assert!(server.start().is_err());

        server.stop();
        server.join().await;
        assert!(TcpListener::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = test_config("").as_ref().clone();
        let config = Arc::new(Config {
            listen: crate::config::ListenConfig {
                address: "127.0.0.1".to_string(),
                port,
            },
            ..config
        });
        let result = ProxyServer::bind_with(config, offline_evaluator(&[], &[]), DomainSource::from_list("", None)).await;
        assert!(result.is_err());
    }
}
