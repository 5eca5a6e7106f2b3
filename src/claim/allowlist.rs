//! Recognized-organization allowlist.
//!
//! Lookup order: configured domains, then the remote source (answers cached
//! for a TTL), then the static suffix patterns when the source is down.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::AllowlistConfig;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("allowlist source unavailable: {0}")]
    Unavailable(String),
}

/// Remote list of recognized organizations.
#[async_trait]
pub trait AllowlistSource: Send + Sync {
    async fn is_recognized_domain(&self, domain: &str) -> Result<bool, SourceError>;
}

struct CachedAnswer {
    recognized: bool,
    fetched: Instant,
}

pub struct DomainAllowlist {
    domains: Vec<String>,
    patterns: Vec<String>,
    source: Option<Arc<dyn AllowlistSource>>,
    cache: RwLock<HashMap<String, CachedAnswer>>,
    cache_ttl: Duration,
}

impl DomainAllowlist {
    pub fn new(config: &AllowlistConfig) -> Self {
        Self {
            domains: config.domains.iter().map(|d| normalize(d)).collect(),
            patterns: config.patterns.iter().map(|p| normalize(p)).collect(),
            source: None,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn AllowlistSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether `domain` belongs to a recognized organization.
    pub async fn is_recognized(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        if domain.is_empty() {
            return false;
        }

        if self.domains.iter().any(|entry| suffix_match(&domain, entry)) {
            return true;
        }

        let Some(source) = &self.source else {
            return self.matches_pattern(&domain);
        };

        if let Some(recognized) = self.cached(&domain).await {
            return recognized;
        }

        match source.is_recognized_domain(&domain).await {
            Ok(recognized) => {
                debug!(%domain, recognized, "allowlist source answered");
                let mut cache = self.cache.write().await;
                cache.retain(|_, answer| answer.fetched.elapsed() < self.cache_ttl);
                cache.insert(
                    domain,
                    CachedAnswer {
                        recognized,
                        fetched: Instant::now(),
                    },
                );
                recognized
            }
            Err(e) => {
                warn!("{e}; falling back to static patterns");
                self.matches_pattern(&domain)
            }
        }
    }

    /// Synchronous check against the static patterns only.
    pub fn matches_pattern(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        self.patterns.iter().any(|pattern| suffix_match(&domain, pattern))
    }

    async fn cached(&self, domain: &str) -> Option<bool> {
        let cache = self.cache.read().await;
        cache
            .get(domain)
            .filter(|answer| answer.fetched.elapsed() < self.cache_ttl)
            .map(|answer| answer.recognized)
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_matches('.').to_lowercase()
}

/// Exact match, or `entry` is a parent domain on a label boundary.
fn suffix_match(domain: &str, entry: &str) -> bool {
    !entry.is_empty()
        && (domain == entry
            || domain
                .strip_suffix(entry)
                .is_some_and(|prefix| prefix.ends_with('.')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        answer: Result<bool, ()>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AllowlistSource for CountingSource {
        async fn is_recognized_domain(&self, _domain: &str) -> Result<bool, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .map_err(|_| SourceError::Unavailable("connection refused".into()))
        }
    }

    fn config() -> AllowlistConfig {
        AllowlistConfig {
            domains: vec!["state-u.edu".into(), "ox.ac.uk".into()],
            patterns: vec!["edu".into(), "ac.uk".into()],
            cache_ttl_secs: 3600,
        }
    }

    #[test]
    fn test_suffix_match_respects_labels() {
        assert!(suffix_match("state-u.edu", "state-u.edu"));
        assert!(suffix_match("cs.state-u.edu", "state-u.edu"));
        assert!(!suffix_match("notstate-u.edu", "state-u.edu"));
        assert!(!suffix_match("state-u.edu.evil.com", "state-u.edu"));
    }

    #[tokio::test]
    async fn test_local_entries_and_patterns() {
        let allowlist = DomainAllowlist::new(&config());
        assert!(allowlist.is_recognized("State-U.edu").await);
        assert!(allowlist.is_recognized("mail.ox.ac.uk").await);
        assert!(allowlist.is_recognized("other-college.edu").await);
        assert!(!allowlist.is_recognized("gmail.com").await);
        assert!(!allowlist.is_recognized("").await);
    }

    #[tokio::test]
    async fn test_remote_answer_is_cached() {
        let source = Arc::new(CountingSource {
            answer: Ok(false),
            calls: AtomicUsize::new(0),
        });
        let allowlist = DomainAllowlist::new(&config()).with_source(source.clone());

        // Remote answer wins over the pattern
        assert!(!allowlist.is_recognized("diploma-mill.edu").await);
        assert!(!allowlist.is_recognized("diploma-mill.edu").await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Configured entries never hit the source
        assert!(allowlist.is_recognized("state-u.edu").await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_answers_are_pruned() {
        let source = Arc::new(CountingSource {
            answer: Ok(true),
            calls: AtomicUsize::new(0),
        });
        let allowlist = DomainAllowlist::new(&AllowlistConfig {
            cache_ttl_secs: 0,
            ..config()
        })
        .with_source(source.clone());

        for domain in ["a-college.org", "b-college.org", "c-college.org"] {
            assert!(allowlist.is_recognized(domain).await);
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(allowlist.cache.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_source_falls_back_to_patterns() {
        let source = Arc::new(CountingSource {
            answer: Err(()),
            calls: AtomicUsize::new(0),
        });
        let allowlist = DomainAllowlist::new(&config()).with_source(source);

        assert!(allowlist.is_recognized("new-college.edu").await);
        assert!(!allowlist.is_recognized("example.com").await);
    }
}
