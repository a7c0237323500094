//! DNS resolution of normalized addresses.
//!
//! Resolution failures of any kind are data: they map to
//! [`Resolution::Unresolved`], never to an error.
use std::net::IpAddr;

use async_trait::async_trait;
use log::debug;
use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(IpAddr),
    Unresolved,
}

impl Resolution {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Resolution::Resolved(ip) => Some(*ip),
            Resolution::Unresolved => None,
        }
    }
}

/// Resolves a normalized address (`scheme://host`) to its first IP address.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, address: &str) -> Resolution;
}

/// Parse a normalized address into a URL, assuming `http://` when the
/// address carries no scheme.
pub fn address_url(address: &str) -> Option<Url> {
    Url::parse(address)
        .ok()
        .filter(|u| u.has_host())
        .or_else(|| Url::parse(&format!("http://{}", address)).ok())
}

/// Resolver backed by the operating system. `tokio::net::lookup_host` runs
/// the blocking libc lookup on tokio's blocking pool, keeping the scheduler
/// thread free.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, address: &str) -> Resolution {
        let Some(url) = address_url(address) else {
            debug!("cannot parse address {}", address);
            return Resolution::Unresolved;
        };
        let port = url.port_or_known_default().unwrap_or(80);
        let host = match url.host() {
            Some(Host::Ipv4(ip)) => return Resolution::Resolved(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => return Resolution::Resolved(IpAddr::V6(ip)),
            Some(Host::Domain(domain)) => domain.to_string(),
            None => return Resolution::Unresolved,
        };
        match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(sock) => Resolution::Resolved(sock.ip()),
                None => Resolution::Unresolved,
            },
            Err(e) => {
                debug!("resolution of {} failed: {}", host, e);
                Resolution::Unresolved
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Answers every lookup with the same resolution.
    pub struct FixedResolver(pub Resolution);

    #[async_trait]
    impl Resolve for FixedResolver {
        async fn resolve(&self, _address: &str) -> Resolution {
            self.0
        }
    }

    /// Fails every lookup after a short pause, recording how many lookups
    /// were in flight at once.
    #[derive(Default)]
    pub struct CountingResolver {
        pub in_flight: AtomicUsize,
        pub peak: AtomicUsize,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Resolve for CountingResolver {
        async fn resolve(&self, _address: &str) -> Resolution {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Resolution::Unresolved
        }
    }
}
