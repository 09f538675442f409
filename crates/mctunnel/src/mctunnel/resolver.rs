//! Virtual host to backend resolution.
//!
//! A client connects to `<name>.<domain>`; the tunnel strips the domain and
//! looks up `_minecraft._tcp.<name>`. Names without an SRV record fall back to
//! `<name>:25565`.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
};
use rand::{RngExt, rng};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LookupError {
    #[error("no such record")]
    NotFound,
    #[error("{0}")]
    Failed(String),
}

/// Name-resolution capability used by [`BackendResolver`].
#[async_trait]
pub trait SrvLookup: Send + Sync {
    async fn lookup_srv(
        &self,
        service: &str,
        proto: &str,
        domain: &str,
    ) -> Result<Vec<SrvRecord>, LookupError>;
}

pub type SharedSrvLookup = Arc<dyn SrvLookup>;

pub struct HickorySrvLookup {
    resolver: TokioAsyncResolver,
}

impl HickorySrvLookup {
    /// Uses the host's resolver configuration, falling back to the library
    /// defaults when it cannot be read.
    pub fn from_system_conf() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(err = %err, "resolver: system config unavailable; using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self { resolver }
    }
}

#[async_trait]
impl SrvLookup for HickorySrvLookup {
    async fn lookup_srv(
        &self,
        service: &str,
        proto: &str,
        domain: &str,
    ) -> Result<Vec<SrvRecord>, LookupError> {
        let name = format!("_{service}._{proto}.{domain}.");
        match self.resolver.srv_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|srv| SrvRecord {
                    target: srv.target().to_utf8(),
                    port: srv.port(),
                    priority: srv.priority(),
                    weight: srv.weight(),
                })
                .collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(LookupError::NotFound),
                _ => Err(LookupError::Failed(err.to_string())),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    /// The virtual host with the tunnel domain removed.
    pub server_address: String,
    pub host: String,
    pub port: u16,
}

impl BackendTarget {
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("empty hostname")]
    EmptyHost,
    #[error("host {0:?} is not under the tunnel domain")]
    UnknownHost(String),
    #[error("srv lookup for {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: LookupError,
    },
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Domain suffix without the leading dot. Empty disables stripping.
    pub domain: String,
    pub strict_domain: bool,
    pub service: String,
    pub proto: String,
    pub default_port: u16,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            domain: String::new(),
            strict_domain: false,
            service: "minecraft".into(),
            proto: "tcp".into(),
            default_port: 25565,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    target: BackendTarget,
    expires_at: Instant,
}

pub struct BackendResolver {
    lookup: SharedSrvLookup,
    opts: ResolverOptions,
    suffix: String,
    cache: DashMap<String, CacheEntry>,
}

impl BackendResolver {
    pub fn new(lookup: SharedSrvLookup, opts: ResolverOptions) -> Self {
        let domain = opts.domain.trim().trim_matches('.').to_ascii_lowercase();
        let suffix = if domain.is_empty() {
            String::new()
        } else {
            format!(".{domain}")
        };
        Self {
            lookup,
            opts,
            suffix,
            cache: DashMap::new(),
        }
    }

    /// Maps a virtual host to the name used for the SRV lookup.
    pub fn lookup_key(&self, virtual_host: &str) -> Result<String, ResolveError> {
        let host = normalize_host(virtual_host);
        if host.is_empty() {
            return Err(ResolveError::EmptyHost);
        }
        if self.suffix.is_empty() {
            return Ok(host);
        }
        match host.strip_suffix(self.suffix.as_str()) {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ if self.opts.strict_domain => Err(ResolveError::UnknownHost(host)),
            _ => Ok(host),
        }
    }

    pub async fn resolve(&self, virtual_host: &str) -> Result<BackendTarget, ResolveError> {
        let cache_key = normalize_host(virtual_host);
        let now = Instant::now();
        let hit = self
            .cache
            .get(&cache_key)
            .and_then(|e| (e.expires_at > now).then(|| e.target.clone()));
        if let Some(target) = hit {
            return Ok(target);
        }

        let key = self.lookup_key(virtual_host)?;
        let target = match self
            .lookup
            .lookup_srv(&self.opts.service, &self.opts.proto, &key)
            .await
        {
            Ok(records) => match pick_record(&records) {
                Some(rec) => BackendTarget {
                    server_address: key.clone(),
                    host: rec.target.trim_end_matches('.').to_string(),
                    port: rec.port,
                },
                None => self.fallback(&key),
            },
            Err(LookupError::NotFound) => self.fallback(&key),
            Err(source) => return Err(ResolveError::Lookup { host: key, source }),
        };

        if target.host.is_empty() {
            return Ok(self.fallback(&key));
        }

        tracing::debug!(host = %cache_key, backend = %target.addr(), "resolver: resolved");
        self.store(cache_key, target.clone());
        Ok(target)
    }

    fn fallback(&self, key: &str) -> BackendTarget {
        BackendTarget {
            server_address: key.to_string(),
            host: key.to_string(),
            port: self.opts.default_port,
        }
    }

    fn store(&self, key: String, target: BackendTarget) {
        if self.opts.cache_ttl.is_zero() || self.opts.cache_capacity == 0 {
            return;
        }
        if self.cache.len() >= self.opts.cache_capacity && !self.cache.contains_key(&key) {
            let now = Instant::now();
            self.cache.retain(|_, e| e.expires_at > now);
            if self.cache.len() >= self.opts.cache_capacity {
                let victim = self.cache.iter().next().map(|e| e.key().clone());
                if let Some(victim) = victim {
                    self.cache.remove(&victim);
                }
            }
        }
        self.cache.insert(
            key,
            CacheEntry {
                target,
                expires_at: Instant::now() + self.opts.cache_ttl,
            },
        );
    }

    #[cfg(test)]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

fn normalize_host(h: &str) -> String {
    h.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Lowest priority wins; ties are broken by weight.
fn pick_record(records: &[SrvRecord]) -> Option<&SrvRecord> {
    let best = records.iter().map(|r| r.priority).min()?;
    let candidates: Vec<&SrvRecord> = records.iter().filter(|r| r.priority == best).collect();
    if candidates.len() == 1 {
        return Some(candidates[0]);
    }
    let total: u32 = candidates.iter().map(|r| r.weight as u32).sum();
    if total == 0 {
        return Some(candidates[rng().random_range(0..candidates.len())]);
    }
    let mut roll = rng().random_range(0..total);
    for c in candidates.iter().copied() {
        let w = c.weight as u32;
        if roll < w {
            return Some(c);
        }
        roll -= w;
    }
    candidates.last().copied()
}
