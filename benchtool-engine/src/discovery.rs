//! Resolution of endpoint targets into backend addresses.
//!
//! Endpoints use the service discovery notation known from Thanos and Cortex:
//!
//! - `dns+<host>:<port>` resolves `host` via A/AAAA lookups and appends `port`,
//! - `dnssrv+<name>` resolves SRV records and then the A/AAAA records of every SRV target,
//! - `dnssrvnoa+<name>` resolves SRV records and uses their target names verbatim,
//! - anything else is used as a single `host:port` address as is.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use thiserror::Error;

/// Errors resolving an endpoint target.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The target string is empty.
    #[error("no endpoint configured")]
    EmptyTarget,
    /// A `dns+` target is not of the form `host:port`.
    #[error("invalid dns target `{0}`, expected `dns+<host>:<port>`")]
    InvalidTarget(String),
    /// The DNS lookup failed.
    #[error("failed to resolve `{target}`: {source}")]
    Lookup {
        target: String,
        #[source]
        source: ResolveError,
    },
}

/// A parsed endpoint target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A single address used verbatim.
    Static(String),
    /// A host name resolved via A/AAAA records.
    Dns { host: String, port: u16 },
    /// A SRV name whose targets are resolved via A/AAAA records.
    Srv(String),
    /// A SRV name whose targets are used without further resolution.
    SrvNoA(String),
}

impl Target {
    /// Parses a target string.
    pub fn parse(target: &str) -> Result<Self, DiscoveryError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(DiscoveryError::EmptyTarget);
        }

        if let Some(name) = target.strip_prefix("dnssrvnoa+") {
            Ok(Target::SrvNoA(name.to_owned()))
        } else if let Some(name) = target.strip_prefix("dnssrv+") {
            Ok(Target::Srv(name.to_owned()))
        } else if let Some(host_port) = target.strip_prefix("dns+") {
            let (host, port) = host_port
                .rsplit_once(':')
                .filter(|(host, _)| !host.is_empty())
                .ok_or_else(|| DiscoveryError::InvalidTarget(target.to_owned()))?;
            let port = port
                .parse()
                .map_err(|_| DiscoveryError::InvalidTarget(target.to_owned()))?;

            Ok(Target::Dns {
                host: host.to_owned(),
                port,
            })
        } else {
            Ok(Target::Static(target.to_owned()))
        }
    }
}

/// A provider of backend addresses.
#[async_trait]
pub trait Discovery: fmt::Debug + Send + Sync {
    /// Resolves a target into a list of `host:port` addresses.
    ///
    /// The returned list may be empty if the target currently has no records.
    async fn resolve(&self, target: &str) -> Result<Vec<String>, DiscoveryError>;
}

/// Discovery through the system DNS resolver.
#[derive(Clone, Debug)]
pub struct DnsDiscovery {
    resolver: TokioAsyncResolver,
}

impl DnsDiscovery {
    /// Creates a resolver from the system configuration.
    ///
    /// Falls back to the default resolver configuration if the system configuration cannot be
    /// read.
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|error| {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to read system resolver configuration, using defaults"
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });

        Self { resolver }
    }

    async fn lookup_ip(&self, host: &str, port: u16) -> Result<Vec<String>, ResolveError> {
        let lookup = self.resolver.lookup_ip(host).await?;
        Ok(lookup
            .iter()
            .map(|ip| SocketAddr::new(ip, port).to_string())
            .collect())
    }

    async fn lookup_srv(&self, name: &str, resolve_targets: bool) -> Result<Vec<String>, ResolveError> {
        let lookup = self.resolver.srv_lookup(name).await?;

        let mut addresses = Vec::new();
        for srv in lookup.iter() {
            let target = srv.target().to_utf8();
            let target = target.trim_end_matches('.');

            if resolve_targets {
                addresses.extend(self.lookup_ip(target, srv.port()).await?);
            } else {
                addresses.push(format!("{target}:{}", srv.port()));
            }
        }

        Ok(addresses)
    }
}

impl Default for DnsDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for DnsDiscovery {
    async fn resolve(&self, target: &str) -> Result<Vec<String>, DiscoveryError> {
        let parsed = Target::parse(target)?;

        let result = match &parsed {
            Target::Static(addr) => return Ok(vec![addr.clone()]),
            Target::Dns { host, port } => self.lookup_ip(host, *port).await,
            Target::Srv(name) => self.lookup_srv(name, true).await,
            Target::SrvNoA(name) => self.lookup_srv(name, false).await,
        };

        let mut addresses = result.map_err(|source| DiscoveryError::Lookup {
            target: target.to_owned(),
            source,
        })?;

        addresses.sort();
        addresses.dedup();
        Ok(addresses)
    }
}
