use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;

/// Candidates with more connect failures than this are skipped (unless preferred)
pub const ERROR_THRESHOLD: u32 = 5;

/// One resolved address for a domain with its health data.
///
/// Identity is the IP alone. The error counter is shared by every connection
/// holding this record and lives as long as the record is published; a later
/// evaluation pass publishes fresh records, which starts the counters over.
#[derive(Debug)]
pub struct IpCandidate {
    ip: Ipv4Addr,
    domain: String,
    latency_ms: Option<u32>,
    preferred: bool,
    error_count: AtomicU32,
}

impl IpCandidate {
    pub fn new(domain: &str, ip: Ipv4Addr, latency_ms: Option<u32>) -> Self {
        Self {
            ip,
            domain: domain.to_string(),
            latency_ms,
            preferred: false,
            error_count: AtomicU32::new(0),
        }
    }

    pub fn preferred(mut self, preferred: bool) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn latency_ms(&self) -> Option<u32> {
        self.latency_ms
    }

    pub fn is_preferred(&self) -> bool {
        self.preferred
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Returns the new count
    pub fn record_connect_failure(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    pub fn record_connect_success(&self) {
        self.error_count.store(0, Ordering::Relaxed);
    }

    fn rank(&self) -> u32 {
        self.latency_ms.unwrap_or(u32::MAX)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ip": self.ip.to_string(),
            "preferred": self.preferred,
            "latency_ms": self.latency_ms,
            "error_count": self.error_count(),
        })
    }
}

impl PartialEq for IpCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
    }
}

impl Eq for IpCandidate {}

impl Hash for IpCandidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
    }
}

/// Pick the routing target for a candidate list.
///
/// 1. first preferred candidate, whatever its health
/// 2. otherwise the lowest latency among candidates with `error_count <= ERROR_THRESHOLD`,
///    earliest in list order on ties
/// 3. `None` when nothing is eligible
pub fn select_target(candidates: &[Arc<IpCandidate>]) -> Option<Arc<IpCandidate>> {
    if let Some(preferred) = candidates.iter().find(|c| c.is_preferred()) {
        return Some(preferred.clone());
    }

    let mut best: Option<&Arc<IpCandidate>> = None;
    for candidate in candidates.iter().filter(|c| c.error_count() <= ERROR_THRESHOLD) {
        match best {
            Some(b) if b.rank() <= candidate.rank() => {}
            _ => best = Some(candidate),
        }
    }
    best.cloned()
}

/// Immutable published value for one domain
#[derive(Debug)]
pub struct DomainEntry {
    pub domain: String,
    pub candidates: Vec<Arc<IpCandidate>>,
    pub evaluated_at: DateTime<Utc>,
}

impl DomainEntry {
    pub fn new(domain: &str, candidates: Vec<Arc<IpCandidate>>) -> Self {
        Self {
            domain: domain.to_string(),
            candidates,
            evaluated_at: Utc::now(),
        }
    }

    pub fn select_target(&self) -> Option<Arc<IpCandidate>> {
        select_target(&self.candidates)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "domain": self.domain,
            "evaluated_at": self.evaluated_at.to_rfc3339(),
            "candidates": self.candidates.iter().map(|c| c.to_json()).collect::<Vec<_>>(),
        })
    }

    fn summary(&self) -> String {
        let parts: Vec<String> = self
            .candidates
            .iter()
            .map(|c| {
                format!(
                    "{}{} latency={} errors={}",
                    c.ip,
                    if c.preferred { "*" } else { "" },
                    c.latency_ms.map_or_else(|| "-".to_string(), |l| format!("{}ms", l)),
                    c.error_count()
                )
            })
            .collect();
        parts.join(", ")
    }
}

/// What a publish did with the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Resolved(usize),
    Unresolved,
}

/// Domain -> candidates, shared by the scheduler (writer) and every connection (readers).
///
/// Each value is an `Arc<DomainEntry>` built completely before it is swapped in,
/// so a reader holds either the old list or the new one, never a mix.
pub struct DomainRegistry {
    entries: DashMap<String, Arc<DomainEntry>>,
    unresolved: RwLock<BTreeSet<String>>,
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            unresolved: RwLock::new(BTreeSet::new()),
        }
    }

    fn key(domain: &str) -> String {
        domain.trim_end_matches('.').to_ascii_lowercase()
    }

    pub fn get(&self, domain: &str) -> Option<Arc<DomainEntry>> {
        self.entries.get(&Self::key(domain)).map(|e| e.value().clone())
    }

    /// Replace the whole candidate list for `domain`
    pub fn put(&self, domain: &str, candidates: Vec<Arc<IpCandidate>>) {
        let key = Self::key(domain);
        let entry = Arc::new(DomainEntry::new(&key, candidates));
        self.entries.insert(key, entry);
    }

    pub fn remove(&self, domain: &str) -> Option<Arc<DomainEntry>> {
        self.entries.remove(&Self::key(domain)).map(|(_, e)| e)
    }

    /// Current routing target for `domain`, if the registry knows one
    pub fn select(&self, domain: &str) -> Option<Arc<IpCandidate>> {
        self.get(domain).and_then(|e| e.select_target())
    }

    /// Publish an evaluation result, moving the domain between the registry and
    /// the unresolved set. It is never observable in both.
    pub fn publish(&self, domain: &str, candidates: Vec<IpCandidate>) -> PublishOutcome {
        let key = Self::key(domain);
        if candidates.is_empty() {
            self.remove(&key);
            self.unresolved.write().insert(key);
            PublishOutcome::Unresolved
        } else {
            let count = candidates.len();
            self.unresolved.write().remove(&key);
            self.put(&key, candidates.into_iter().map(Arc::new).collect());
            PublishOutcome::Resolved(count)
        }
    }

    pub fn is_unresolved(&self, domain: &str) -> bool {
        self.unresolved.read().contains(&Self::key(domain))
    }

    pub fn unresolved_domains(&self) -> Vec<String> {
        self.unresolved.read().iter().cloned().collect()
    }

    pub fn has_unresolved(&self) -> bool {
        !self.unresolved.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current entries sorted by domain
    pub fn entries(&self) -> Vec<Arc<DomainEntry>> {
        let mut entries: Vec<Arc<DomainEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.domain.cmp(&b.domain));
        entries
    }

    /// Snapshot for the internal API
    pub fn to_json(&self) -> serde_json::Value {
        let domains: Vec<serde_json::Value> = self.entries().iter().map(|e| e.to_json()).collect();
        serde_json::json!({
            "domains": domains,
            "unresolved": self.unresolved_domains(),
        })
    }

    /// One line per domain, then the unresolved set
    pub fn log_summary(&self, pass: &str) {
        if self.is_empty() {
            info!("[{}] registry is empty", pass);
        } else {
            info!("[{}] registry holds {} domain(s)", pass, self.len());
        }
        for entry in self.entries() {
            info!("[{}]   {} -> {}", pass, entry.domain, entry.summary());
        }
        let unresolved = self.unresolved_domains();
        if !unresolved.is_empty() {
            info!("[{}] unresolved ({}): {}", pass, unresolved.len(), unresolved.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(ip: [u8; 4], latency: u32) -> Arc<IpCandidate> {
        Arc::new(IpCandidate::new("example.test", Ipv4Addr::from(ip), Some(latency)))
    }

    fn fail_times(c: &IpCandidate, n: u32) {
        for _ in 0..n {
            c.record_connect_failure();
        }
    }

    #[test]
    fn test_preferred_wins_regardless_of_health() {
        let fast = cand([198, 51, 100, 1], 5);
        let pinned = Arc::new(IpCandidate::new("example.test", Ipv4Addr::new(203, 0, 113, 5), Some(400)).preferred(true));
        fail_times(&pinned, 50);

        let picked = select_target(&[fast, pinned.clone()]).unwrap();
        assert_eq!(picked.ip(), pinned.ip());
    }

    #[test]
    fn test_first_preferred_in_list_order() {
        let a = Arc::new(IpCandidate::new("d", Ipv4Addr::new(10, 0, 0, 1), Some(90)).preferred(true));
        let b = Arc::new(IpCandidate::new("d", Ipv4Addr::new(10, 0, 0, 2), Some(10)).preferred(true));
        assert_eq!(select_target(&[a.clone(), b]).unwrap().ip(), a.ip());
    }

    #[test]
    fn test_threshold_excludes_fastest() {
        let fastest = cand([198, 51, 100, 1], 5);
        let slower = cand([198, 51, 100, 2], 200);
        fail_times(&fastest, ERROR_THRESHOLD + 1);
        assert_eq!(select_target(&[fastest, slower.clone()]).unwrap().ip(), slower.ip());
    }

    #[test]
    fn test_threshold_is_inclusive_at_five() {
        let c = cand([198, 51, 100, 1], 5);
        fail_times(&c, ERROR_THRESHOLD);
        assert!(select_target(&[c]).is_some());
    }

    #[test]
    fn test_all_excluded_yields_none() {
        let a = cand([198, 51, 100, 1], 5);
        let b = cand([198, 51, 100, 2], 6);
        fail_times(&a, 6);
        fail_times(&b, 9);
        assert!(select_target(&[a, b]).is_none());
        assert!(select_target(&[]).is_none());
    }

    #[test]
    fn test_latency_tie_goes_to_first() {
        let a = cand([198, 51, 100, 1], 80);
        let b = cand([198, 51, 100, 2], 80);
        let list = vec![a.clone(), b];
        for _ in 0..10 {
            assert_eq!(select_target(&list).unwrap().ip(), a.ip());
        }
    }

    #[test]
    fn test_missing_latency_ranks_last() {
        let unknown = Arc::new(IpCandidate::new("d", Ipv4Addr::new(10, 0, 0, 1), None));
        let known = cand([10, 0, 0, 2], 900);
        assert_eq!(select_target(&[unknown, known.clone()]).unwrap().ip(), known.ip());
    }

    #[test]
    fn test_success_resets_error_count() {
        let c = cand([198, 51, 100, 1], 5);
        assert_eq!(c.record_connect_failure(), 1);
        assert_eq!(c.record_connect_failure(), 2);
        c.record_connect_success();
        assert_eq!(c.error_count(), 0);
    }

    #[test]
    fn test_candidate_identity_is_ip() {
        let a = IpCandidate::new("a.test", Ipv4Addr::new(10, 0, 0, 1), Some(1));
        let b = IpCandidate::new("b.test", Ipv4Addr::new(10, 0, 0, 1), Some(99)).preferred(true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_publish_moves_between_registry_and_unresolved() {
        let registry = DomainRegistry::new();
        let outcome = registry.publish("Example.Test", vec![]);
        assert_eq!(outcome, PublishOutcome::Unresolved);
        assert!(registry.is_unresolved("example.test"));
        assert!(registry.get("example.test").is_none());

        let outcome = registry.publish(
            "example.test",
            vec![IpCandidate::new("example.test", Ipv4Addr::new(198, 51, 100, 7), Some(120))],
        );
        assert_eq!(outcome, PublishOutcome::Resolved(1));
        assert!(!registry.is_unresolved("example.test"));
        assert_eq!(registry.select("EXAMPLE.test").unwrap().ip(), Ipv4Addr::new(198, 51, 100, 7));

        registry.publish("example.test", vec![]);
        assert!(registry.get("example.test").is_none());
        assert_eq!(registry.unresolved_domains(), vec!["example.test".to_string()]);
    }

    #[test]
    fn test_old_reference_stays_consistent_after_put() {
        let registry = DomainRegistry::new();
        registry.put("d.test", vec![cand([10, 0, 0, 1], 1)]);
        let old = registry.get("d.test").unwrap();
        registry.put("d.test", vec![cand([10, 0, 0, 2], 2), cand([10, 0, 0, 3], 3)]);

        assert_eq!(old.candidates.len(), 1);
        assert_eq!(old.candidates[0].ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(registry.get("d.test").unwrap().candidates.len(), 2);
    }

    #[test]
    fn test_concurrent_readers_never_see_mixed_lists() {
        let registry = Arc::new(DomainRegistry::new());
        let generation = |g: u8| -> Vec<Arc<IpCandidate>> {
            (1..=4).map(|i| cand([10, g, 0, i], g as u32)).collect()
        };
        registry.put("race.test", generation(0));

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for g in 1..=200u8 {
                    registry.put("race.test", generation(g));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let entry = registry.get("race.test").unwrap();
                        let g = entry.candidates[0].ip().octets()[1];
                        assert_eq!(entry.candidates.len(), 4);
                        assert!(entry.candidates.iter().all(|c| c.ip().octets()[1] == g));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn test_snapshot_json() {
        let registry = DomainRegistry::new();
        registry.put("b.test", vec![cand([10, 0, 0, 2], 7)]);
        registry.publish("a.test", vec![]);
        let json = registry.to_json();
        assert_eq!(json["domains"][0]["domain"], "b.test");
        assert_eq!(json["domains"][0]["candidates"][0]["latency_ms"], 7);
        assert_eq!(json["unresolved"][0], "a.test");
    }
}
