//! Destination host resolution.
//!
//! MX records are looked up and followed to their addresses in priority
//! order; a domain with no MX records falls back to its own A/AAAA
//! records per RFC 5321 section 5.1. In smart-host mode the configured
//! gateway list replaces the lookup entirely.

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from host resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records exist; no host will ever answer.
    #[error("Cannot get MX record for {0}")]
    NoMailServers(String),

    /// The resolver itself failed; worth retrying later.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// A configured gateway entry that names no usable host.
    #[error("Unusable gateway: {0}")]
    BadGateway(String),
}

impl DnsError {
    /// A definitive "no such destination" is permanent; resolver
    /// trouble is not.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::NoMailServers(_) | Self::BadGateway(_) => true,
            Self::LookupFailed(err) => err.is_nx_domain() || err.is_no_records_found(),
        }
    }
}

/// One candidate host for a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailHost {
    pub ip: IpAddr,
    pub port: u16,
}

impl MailHost {
    #[must_use]
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

/// Resolver handle shared by all delivery tasks.
#[derive(Debug)]
pub struct Resolver {
    inner: TokioResolver,
}

impl Resolver {
    /// Build a resolver from the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the system configuration cannot be read.
    pub fn new() -> Result<Self, DnsError> {
        let opts = ResolverOpts::default();
        let inner = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();
        Ok(Self { inner })
    }

    /// All candidate hosts for `domain`, best first.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NoMailServers`] when the domain has neither
    /// MX nor address records, or a lookup error for resolver failures.
    pub async fn mail_hosts(&self, domain: &str) -> Result<Vec<MailHost>, DnsError> {
        debug!("Resolving mail hosts for {domain}");
        let exchanges = match self.inner.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut exchanges: Vec<(u16, String)> = lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect();
                exchanges.sort_by(|a, b| a.0.cmp(&b.0));
                exchanges
            }
            Err(err) if err.is_no_records_found() => Vec::new(),
            Err(err) => return Err(DnsError::LookupFailed(err)),
        };

        if exchanges.is_empty() {
            // Implicit MX: the domain's own addresses, priority 0.
            debug!("No MX records for {domain}, falling back to A/AAAA");
            let hosts = self.addresses(domain).await?;
            return if hosts.is_empty() {
                Err(DnsError::NoMailServers(domain.to_string()))
            } else {
                Ok(hosts)
            };
        }

        let mut hosts = Vec::new();
        for (preference, exchange) in exchanges {
            match self.addresses(&exchange).await {
                Ok(found) => {
                    debug!("MX {exchange} (priority {preference}): {} address(es)", found.len());
                    hosts.extend(found);
                }
                Err(err) => warn!("Address lookup failed for MX {exchange}: {err}"),
            }
        }
        if hosts.is_empty() {
            Err(DnsError::NoMailServers(domain.to_string()))
        } else {
            Ok(hosts)
        }
    }

    /// Resolve the configured gateway list for smart-host delivery.
    /// Entries are `host` or `host:port`; IP literals skip the lookup.
    ///
    /// # Errors
    ///
    /// Returns an error when no gateway resolves to any address.
    pub async fn gateway_hosts(&self, gateways: &[String]) -> Result<Vec<MailHost>, DnsError> {
        let mut hosts = Vec::new();
        for gateway in gateways {
            if let Ok(socket) = gateway.parse::<SocketAddr>() {
                hosts.push(MailHost::new(socket.ip(), socket.port()));
                continue;
            }
            let (name, port) = match gateway.rsplit_once(':') {
                Some((name, port)) => (
                    name,
                    port.parse::<u16>()
                        .map_err(|_| DnsError::BadGateway(gateway.clone()))?,
                ),
                None => (gateway.as_str(), 25),
            };
            if let Ok(ip) = name.parse::<IpAddr>() {
                hosts.push(MailHost::new(ip, port));
                continue;
            }
            match self.inner.lookup_ip(name).await {
                Ok(lookup) => hosts.extend(lookup.iter().map(|ip| MailHost::new(ip, port))),
                Err(err) => warn!("Gateway lookup failed for {name}: {err}"),
            }
        }
        if hosts.is_empty() {
            Err(DnsError::BadGateway(gateways.join(", ")))
        } else {
            Ok(hosts)
        }
    }

    async fn addresses(&self, name: &str) -> Result<Vec<MailHost>, DnsError> {
        match self.inner.lookup_ip(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|ip| MailHost::new(ip, 25)).collect()),
            Err(err) if err.is_no_records_found() => Ok(Vec::new()),
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}
