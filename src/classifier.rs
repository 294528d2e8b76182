//! Reverse-DNS identification of well-known search crawlers.
//!
//! Crawler operators publish PTR records in fixed shapes that embed the
//! address; a strict equality check on the PTR response identifies the
//! crawler without trusting forward DNS. Resolver failures are treated as
//! "not a crawler", never as errors.

use moka::future::Cache;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

const CACHE_CAPACITY: u64 = 10_000;
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// PTR-based crawler classifier with a per-address result cache.
#[derive(Clone)]
pub struct CrawlerClassifier {
    resolver: TokioAsyncResolver,
    cache: Cache<IpAddr, Option<&'static str>>,
}

impl CrawlerClassifier {
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        let cache = Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(CACHE_TTL)
            .build();

        Self { resolver, cache }
    }

    /// Identify the address as a known crawler. Returns the label to record
    /// in the whitelist, or `None` when the address is not a verified
    /// crawler. Only IPv4 crawlers are identified; the dash-form hostname
    /// shape is ill-defined for IPv6.
    pub async fn match_auto(&self, ip: IpAddr) -> Option<&'static str> {
        if let Some(cached) = self.cache.get(&ip).await {
            return cached;
        }

        let label = self.lookup(ip).await;
        self.cache.insert(ip, label).await;
        label
    }

    async fn lookup(&self, ip: IpAddr) -> Option<&'static str> {
        let IpAddr::V4(v4) = ip else {
            return None;
        };

        let hosts = match self.resolver.reverse_lookup(ip).await {
            Ok(hosts) => hosts,
            Err(_) => return None,
        };

        hosts
            .iter()
            .find_map(|host| classify_host(&host.to_string(), v4))
    }
}

impl Default for CrawlerClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare one PTR hostname (trailing dot included) against the known
/// crawler shapes. Exact, case-sensitive match only.
fn classify_host(host: &str, ip: Ipv4Addr) -> Option<&'static str> {
    let dashed = dash_form(ip);

    if host == format!("msnbot-{dashed}.search.msn.com.") {
        return Some("msnbot autodetect");
    }
    if host == format!("spider-{dashed}.yandex.com.") {
        return Some("yandex.com autodetect");
    }
    if host == format!("crawl-{dashed}.googlebot.com.") {
        return Some("googlebot autodetect");
    }

    None
}

/// `a.b.c.d` → `a-b-c-d`, the shape crawler PTR records embed.
fn dash_form(ip: Ipv4Addr) -> String {
    ip.to_string().replace('.', "-")
}
