use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{debug, warn};

const BUNDLED_DOMAINS: &str = include_str!("../assets/proxy_domains");

/// Where the proxied domain list comes from: the bundled list plus an optional
/// operator file. Re-read on every full sweep so file edits apply without restart.
#[derive(Debug, Clone)]
pub struct DomainSource {
    bundled: String,
    extra_file: Option<PathBuf>,
}

impl DomainSource {
    pub fn new(extra_file: Option<&str>) -> Self {
        Self {
            bundled: BUNDLED_DOMAINS.to_string(),
            extra_file: extra_file.map(PathBuf::from),
        }
    }

    /// A source that only knows `list` (no bundled domains)
    pub fn from_list(list: &str, extra_file: Option<&str>) -> Self {
        Self {
            bundled: list.to_string(),
            extra_file: extra_file.map(PathBuf::from),
        }
    }

    /// Merged, de-duplicated list in first-seen order
    pub fn load(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut domains = Vec::new();
        merge_list(&self.bundled, &mut seen, &mut domains);

        if let Some(path) = &self.extra_file {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    let before = domains.len();
                    merge_list(&text, &mut seen, &mut domains);
                    debug!("{} added {} domain(s)", path.display(), domains.len() - before);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot read domain list {}: {}", path.display(), e),
            }
        }
        domains
    }
}

fn merge_list(text: &str, seen: &mut HashSet<String>, out: &mut Vec<String>) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let domain = line.to_ascii_lowercase();
        if seen.insert(domain.clone()) {
            out.push(domain);
        }
    }
}
