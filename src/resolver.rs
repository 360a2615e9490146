//! Async DNS resolution, grounded on `resolv.c`. The original owns a single
//! UDP socket registered with `libev` and wraps `udns`'s C callback API;
//! since `tokio` tasks are the "suspension point" primitive here (spec §5),
//! each query becomes a spawned task driving `hickory-resolver` (the
//! `trust-dns-resolver` lineage used by `catwithtudou-socket_proxy`) and
//! `cancel` becomes aborting that task's `JoinHandle` -- which the tokio
//! runtime guarantees stops the callback from firing afterwards, matching
//! spec §4.6's "after cancel the callback MUST NOT fire."

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::error::ResolveError;

/// Address family preference for a query, per spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    Default,
    Ipv4Only,
    Ipv6Only,
    Ipv4First,
    Ipv6First,
}

/// A handle to an outstanding query; dropping or [`cancel`](Self::cancel)ing
/// it guarantees the callback future never resolves.
pub struct QueryHandle {
    task: JoinHandle<()>,
}

impl QueryHandle {
    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Wraps a [`TokioAsyncResolver`] behind the `query`/`cancel` shape spec
/// §4.6 asks for, so the rest of the reactor never depends on
/// `hickory-resolver`'s own async API directly.
#[derive(Clone)]
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    /// Build a resolver from explicit nameservers/search domains (config
    /// §6), falling back to the system resolver configuration when none are
    /// given.
    pub fn new(nameservers: &[SocketAddr], search_domains: &[String]) -> Self {
        let (mut cfg, opts) = if nameservers.is_empty() {
            hickory_resolver::system_conf::read_system_conf()
                .unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()))
        } else {
            (ResolverConfig::new(), ResolverOpts::default())
        };

        if !nameservers.is_empty() {
            cfg = ResolverConfig::new();
            for ns in nameservers {
                cfg.add_name_server(hickory_resolver::config::NameServerConfig::new(
                    *ns,
                    hickory_resolver::config::Protocol::Udp,
                ));
            }
        }
        for domain in search_domains {
            if let Ok(name) = hickory_resolver::Name::from_ascii(domain) {
                cfg.add_search(name);
            }
        }

        let inner = TokioAsyncResolver::tokio(cfg, opts);
        Resolver { inner }
    }

    /// Submit a query, invoking `callback` on the reactor's tasks with
    /// either a single resolved [`Address`] (sockaddr variant, port zero)
    /// or `None` on NXDOMAIN/failure. Returns a handle that can cancel the
    /// in-flight lookup before the callback fires.
    pub fn query<F>(&self, name: String, mode: LookupMode, callback: F) -> QueryHandle
    where
        F: FnOnce(Option<Address>) + Send + 'static,
    {
        let resolver = self.inner.clone();
        let task = tokio::spawn(async move {
            let result = resolve_one(&resolver, &name, mode).await;
            callback(result.ok().flatten());
        });
        QueryHandle { task }
    }

    pub async fn resolve(&self, name: &str, mode: LookupMode) -> Result<Address, ResolveError> {
        resolve_one(&self.inner, name, mode)
            .await?
            .ok_or(ResolveError::NxDomain)
    }
}

async fn resolve_one(
    resolver: &TokioAsyncResolver,
    name: &str,
    mode: LookupMode,
) -> Result<Option<Address>, ResolveError> {
    let lookup = resolver.lookup_ip(name).await.map_err(classify_error)?;

    let pick: Option<IpAddr> = match mode {
        LookupMode::Ipv4Only => lookup.iter().find(|ip| ip.is_ipv4()),
        LookupMode::Ipv6Only => lookup.iter().find(|ip| ip.is_ipv6()),
        LookupMode::Ipv4First => lookup
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| lookup.iter().next()),
        LookupMode::Ipv6First => lookup
            .iter()
            .find(|ip| ip.is_ipv6())
            .or_else(|| lookup.iter().next()),
        LookupMode::Default => lookup.iter().next(),
    };

    Ok(pick.map(|ip| {
        Address::parse(&SocketAddr::new(ip, 0).ip().to_string())
            .expect("formatted IP always parses")
    }))
}

fn classify_error(e: hickory_resolver::error::ResolveError) -> ResolveError {
    use hickory_resolver::error::ResolveErrorKind;
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => ResolveError::NxDomain,
        ResolveErrorKind::Timeout => ResolveError::Timeout,
        other => ResolveError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_mode_variants_are_distinct() {
        let modes = [
            LookupMode::Default,
            LookupMode::Ipv4Only,
            LookupMode::Ipv6Only,
            LookupMode::Ipv4First,
            LookupMode::Ipv6First,
        ];
        for (i, a) in modes.iter().enumerate() {
            for (j, b) in modes.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }
}
