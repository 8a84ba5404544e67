use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ScheduleConfig;
use crate::domains::DomainSource;
use crate::evaluator::CandidateEvaluator;
use crate::registry::{DomainRegistry, PublishOutcome};

#[derive(Debug, Clone, Copy)]
pub struct ScheduleTimings {
    pub full_sweep_every: Duration,
    pub recheck_every: Duration,
    pub recheck_initial_delay: Duration,
}

impl From<&ScheduleConfig> for ScheduleTimings {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            full_sweep_every: Duration::from_secs(config.full_sweep_secs),
            recheck_every: Duration::from_secs(config.recheck_secs),
            recheck_initial_delay: Duration::from_secs(config.recheck_initial_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    FullSweep,
    Recheck,
}

impl std::fmt::Display for Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pass::FullSweep => write!(f, "full-sweep"),
            Pass::Recheck => write!(f, "recheck"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub evaluated: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

/// Keeps the registry fresh: a full sweep over every configured domain on a
/// coarse delay, and a recheck of unresolved domains on a fine one.
pub struct ResolutionScheduler {
    registry: Arc<DomainRegistry>,
    evaluator: Arc<CandidateEvaluator>,
    source: DomainSource,
    timings: ScheduleTimings,
    shutdown: CancellationToken,
}

impl ResolutionScheduler {
    pub fn new(
        registry: Arc<DomainRegistry>,
        evaluator: Arc<CandidateEvaluator>,
        source: DomainSource,
        timings: ScheduleTimings,
    ) -> Self {
        Self {
            registry,
            evaluator,
            source,
            timings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn both loops. The full sweep runs immediately.
    pub fn start(self: &Arc<Self>) {
        info!(
            "Resolution scheduler started (full sweep every {:?}, recheck every {:?})",
            self.timings.full_sweep_every, self.timings.recheck_every
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.run_every(Duration::ZERO, this.timings.full_sweep_every, Pass::FullSweep).await;
        });

        let this = self.clone();
        tokio::spawn(async move {
            this.run_every(this.timings.recheck_initial_delay, this.timings.recheck_every, Pass::Recheck)
                .await;
        });
    }

    /// Stop scheduling further passes. A pass already running finishes on its own.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Resolution scheduler stopping");
            self.shutdown.cancel();
        }
    }

    /// Fixed-delay loop: the next pass is scheduled after the previous one ends
    async fn run_every(self: &Arc<Self>, initial_delay: Duration, delay: Duration, pass: Pass) {
        if !self.pause(initial_delay).await {
            return;
        }
        loop {
            let this = self.clone();
            let handle = tokio::spawn(async move {
                match pass {
                    Pass::FullSweep => this.run_full_sweep().await,
                    Pass::Recheck => this.run_recheck().await,
                }
            });
            // A panicking pass is skipped, the loop carries on
            if let Err(e) = handle.await {
                error!("[{}] pass aborted: {}", pass, e);
            }
            if !self.pause(delay).await {
                break;
            }
        }
        debug!("[{}] loop exited", pass);
    }

    /// false once stopped
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => !self.shutdown.is_cancelled(),
        }
    }

    /// Evaluate every configured domain that is not waiting in the unresolved set
    pub async fn run_full_sweep(&self) -> PassSummary {
        let started = Instant::now();
        let domains = self.source.load();
        let mut summary = PassSummary::default();

        for domain in domains {
            if self.registry.is_unresolved(&domain) {
                continue;
            }
            self.evaluate_and_publish(&domain, &mut summary).await;
        }

        info!(
            "[full-sweep] {} domain(s) evaluated in {:?}: {} resolved, {} unresolved",
            summary.evaluated,
            started.elapsed(),
            summary.resolved,
            summary.unresolved
        );
        self.registry.log_summary("full-sweep");
        summary
    }

    /// Re-evaluate unresolved domains; a hit promotes the domain into the registry
    pub async fn run_recheck(&self) -> PassSummary {
        let mut summary = PassSummary::default();
        if !self.registry.has_unresolved() {
            return summary;
        }

        let started = Instant::now();
        for domain in self.registry.unresolved_domains() {
            self.evaluate_and_publish(&domain, &mut summary).await;
        }

        info!(
            "[recheck] {} unresolved domain(s) retried in {:?}: {} promoted",
            summary.evaluated,
            started.elapsed(),
            summary.resolved
        );
        if summary.resolved > 0 {
            self.registry.log_summary("recheck");
        }
        summary
    }

    async fn evaluate_and_publish(&self, domain: &str, summary: &mut PassSummary) {
        let candidates = self.evaluator.evaluate(domain).await;
        summary.evaluated += 1;
        match self.registry.publish(domain, candidates) {
            PublishOutcome::Resolved(count) => {
                debug!("{} -> {} candidate(s)", domain, count);
                summary.resolved += 1;
            }
            PublishOutcome::Unresolved => {
                debug!("{} has no reachable candidate", domain);
                summary.unresolved += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::fakes::{FakeProbe, FakeResolver};
    use crate::probe::Probe;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};

    const IP: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    /// Reachable only once switched on
    #[derive(Default)]
    struct SwitchProbe {
        up: AtomicBool,
    }

    #[async_trait]
    impl Probe for SwitchProbe {
        async fn probe(&self, _ip: Ipv4Addr, _timeout: Duration) -> Option<u32> {
            self.up.load(Ordering::SeqCst).then_some(25)
        }
    }

    fn timings(ms: u64) -> ScheduleTimings {
        ScheduleTimings {
            full_sweep_every: Duration::from_millis(ms),
            recheck_every: Duration::from_millis(ms),
            recheck_initial_delay: Duration::from_millis(ms),
        }
    }

    fn scheduler(resolver: Arc<FakeResolver>, probe: Arc<dyn Probe>, list: &str) -> Arc<ResolutionScheduler> {
        let evaluator = CandidateEvaluator::new(
            resolver,
            probe,
            vec!["dns-a".to_string()],
            &HashMap::new(),
            Duration::from_millis(50),
        );
        Arc::new(ResolutionScheduler::new(
            Arc::new(DomainRegistry::new()),
            Arc::new(evaluator),
            DomainSource::from_list(list, None),
            timings(20),
        ))
    }

    #[tokio::test]
    async fn test_full_sweep_splits_resolved_and_unresolved() {
        let resolver = Arc::new(FakeResolver::with(&[("dns-a", &[IP])]));
        let probe = Arc::new(FakeProbe::with(&[(IP, 30)]));
        let s = scheduler(resolver.clone(), probe, "up.test\n");

        let summary = s.run_full_sweep().await;
        assert_eq!(summary, PassSummary { evaluated: 1, resolved: 1, unresolved: 0 });
        assert_eq!(s.registry.select("up.test").unwrap().ip(), IP);

        let s = scheduler(resolver, Arc::new(FakeProbe::default()), "down.test\n");
        let summary = s.run_full_sweep().await;
        assert_eq!(summary.unresolved, 1);
        assert!(s.registry.get("down.test").is_none());
        assert!(s.registry.is_unresolved("down.test"));
    }

    #[tokio::test]
    async fn test_full_sweep_skips_unresolved_domains() {
        let resolver = Arc::new(FakeResolver::with(&[("dns-a", &[IP])]));
        let s = scheduler(resolver.clone(), Arc::new(FakeProbe::default()), "down.test\n");

        s.run_full_sweep().await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        let summary = s.run_full_sweep().await;
        assert_eq!(summary.evaluated, 0);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recheck_promotes_recovered_domain() {
        let resolver = Arc::new(FakeResolver::with(&[("dns-a", &[IP])]));
        let probe = Arc::new(SwitchProbe::default());
        let s = scheduler(resolver.clone(), probe.clone(), "flaky.test\n");

        assert_eq!(s.run_recheck().await.evaluated, 0);
        s.run_full_sweep().await;
        assert!(s.registry.is_unresolved("flaky.test"));

        assert_eq!(s.run_recheck().await.resolved, 0);
        probe.up.store(true, Ordering::SeqCst);
        let summary = s.run_recheck().await;
        assert_eq!(summary.resolved, 1);
        assert!(!s.registry.is_unresolved("flaky.test"));
        assert_eq!(s.registry.select("flaky.test").unwrap().latency_ms(), Some(25));

        // Nothing left to recheck
        let calls = resolver.calls.load(Ordering::SeqCst);
        assert_eq!(s.run_recheck().await.evaluated, 0);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_stop_suppresses_further_passes() {
        let resolver = Arc::new(FakeResolver::with(&[("dns-a", &[IP])]));
        let probe = Arc::new(FakeProbe::with(&[(IP, 5)]));
        let s = scheduler(resolver.clone(), probe, "a.test\nb.test\n");

        s.start();
        for _ in 0..100 {
            if resolver.calls.load(Ordering::SeqCst) >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(resolver.calls.load(Ordering::SeqCst) >= 4, "sweeps should repeat");
        assert!(s.registry.get("a.test").is_some());

        s.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = resolver.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), after_stop);
    }
}
