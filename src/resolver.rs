//! Origin address resolution with a bounded-TTL cache.
//!
//! The connection layer looks the origin host up here every time it builds an
//! upstream peer. Successful resolutions are cached for at most
//! `resolver.max_ttl_secs` regardless of the TTL the nameserver reports, so a
//! reassigned origin address is picked up within that bound even without an
//! explicit invalidation. Failed resolutions are cached for the much shorter
//! `resolver.failure_ttl_secs` so a burst of requests against a dead name does
//! not re-query on every request, while recovery stays quick.
//!
//! `invalidate` removes an entry outright; the proxy calls it when a
//! connection to a cached address fails.

use crate::config::ResolverConfig;
use crate::error::{GatewayError, Result};
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, ResolverConfig as UpstreamConfig, ResolverOpts,
};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Address family hint for a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// Both A and AAAA records.
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

/// One cached resolution. Replaced wholesale on every fresh lookup.
#[derive(Debug, Clone)]
struct ResolutionEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
    outcome: Outcome,
}

/// Hostname-to-address cache backed by a DNS resolver.
#[derive(Clone)]
pub struct ResolvingCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    resolver: TokioResolver,
    entries: RwLock<HashMap<String, ResolutionEntry>>,
    max_ttl: Duration,
    failure_ttl: Duration,
}

impl ResolvingCache {
    /// Creates a cache from the resolver configuration section.
    ///
    /// The underlying resolver's own cache is disabled; this table is the
    /// only cache, so `invalidate` is authoritative.
    pub fn new(config: &ResolverConfig) -> Self {
        let upstream = if config.nameservers.is_empty() {
            UpstreamConfig::default()
        } else {
            let mut upstream = UpstreamConfig::new();
            for addr in &config.nameservers {
                upstream.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
                upstream.add_name_server(NameServerConfig::new(*addr, Protocol::Tcp));
            }
            upstream
        };

        let mut opts = ResolverOpts::default();
        opts.cache_size = 0;
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

        let resolver =
            Resolver::builder_with_config(upstream, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self {
            inner: Arc::new(CacheInner {
                resolver,
                entries: RwLock::new(HashMap::new()),
                max_ttl: config.max_ttl(),
                failure_ttl: config.failure_ttl(),
            }),
        }
    }

    /// Resolves a hostname, consulting the cache first.
    ///
    /// A live failure marker short-circuits to an error without a network
    /// query. Concurrent lookups for the same hostname resolve independently;
    /// the last result written wins.
    pub async fn lookup(&self, hostname: &str, family: AddressFamily) -> Result<Vec<IpAddr>> {
        let key = hostname.to_ascii_lowercase();

        if let Some(entry) = self.peek(&key) {
            return match entry.outcome {
                Outcome::Success => {
                    trace!(hostname = %hostname, "Resolver cache hit");
                    Ok(entry.addresses)
                }
                Outcome::Failure => {
                    trace!(hostname = %hostname, "Resolver cache holds a failure marker");
                    Err(GatewayError::resolution(hostname, "cached resolution failure"))
                }
            };
        }

        match self.query(hostname, family).await {
            Ok((addresses, reported_ttl)) if !addresses.is_empty() => {
                self.store_success(&key, addresses.clone(), reported_ttl);
                debug!(
                    hostname = %hostname,
                    addresses = addresses.len(),
                    ttl_secs = reported_ttl.as_secs(),
                    "Resolved"
                );
                Ok(addresses)
            }
            Ok(_) => {
                self.store_failure(&key);
                warn!(hostname = %hostname, "Resolution returned no addresses");
                Err(GatewayError::resolution(hostname, "no addresses returned"))
            }
            Err(message) => {
                self.store_failure(&key);
                warn!(hostname = %hostname, error = %message, "Resolution failed");
                Err(GatewayError::resolution(hostname, message))
            }
        }
    }

    /// Removes any cached entry (success or failure) for a hostname, forcing
    /// the next lookup to query the network.
    pub fn invalidate(&self, hostname: &str) {
        let key = hostname.to_ascii_lowercase();
        let removed = self.inner.entries.write().unwrap().remove(&key);
        if removed.is_some() {
            debug!(hostname = %hostname, "Resolver cache entry invalidated");
        }
    }

    /// Returns the live (unexpired) entry for a key, if any.
    fn peek(&self, key: &str) -> Option<ResolutionEntry> {
        let entries = self.inner.entries.read().unwrap();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .cloned()
    }

    fn store_success(&self, key: &str, addresses: Vec<IpAddr>, reported_ttl: Duration) {
        // The effective lifetime never exceeds the configured cap, whatever
        // the nameserver reported.
        let ttl = reported_ttl.min(self.inner.max_ttl);
        let entry = ResolutionEntry {
            addresses,
            expires_at: Instant::now() + ttl,
            outcome: Outcome::Success,
        };
        self.inner.entries.write().unwrap().insert(key.to_string(), entry);
    }

    fn store_failure(&self, key: &str) {
        let entry = ResolutionEntry {
            addresses: Vec::new(),
            expires_at: Instant::now() + self.inner.failure_ttl,
            outcome: Outcome::Failure,
        };
        self.inner.entries.write().unwrap().insert(key.to_string(), entry);
    }

    /// Performs the actual DNS query and extracts the remaining TTL from the
    /// response.
    async fn query(
        &self,
        hostname: &str,
        family: AddressFamily,
    ) -> std::result::Result<(Vec<IpAddr>, Duration), String> {
        match family {
            AddressFamily::Any => {
                let lookup = self
                    .inner
                    .resolver
                    .lookup_ip(hostname)
                    .await
                    .map_err(|e| e.to_string())?;
                let ttl = remaining_ttl(lookup.valid_until());
                Ok((lookup.iter().collect(), ttl))
            }
            AddressFamily::V4 => {
                let lookup = self
                    .inner
                    .resolver
                    .ipv4_lookup(hostname)
                    .await
                    .map_err(|e| e.to_string())?;
                let ttl = remaining_ttl(lookup.valid_until());
                Ok((lookup.iter().map(|r| IpAddr::V4(r.0)).collect(), ttl))
            }
            AddressFamily::V6 => {
                let lookup = self
                    .inner
                    .resolver
                    .ipv6_lookup(hostname)
                    .await
                    .map_err(|e| e.to_string())?;
                let ttl = remaining_ttl(lookup.valid_until());
                Ok((lookup.iter().map(|r| IpAddr::V6(r.0)).collect(), ttl))
            }
        }
    }
}

/// Remaining validity of a DNS response as a duration from now.
fn remaining_ttl(valid_until: Instant) -> Duration {
    let now = Instant::now();
    if valid_until > now {
        valid_until.duration_since(now)
    } else {
        Duration::ZERO
    }
}
