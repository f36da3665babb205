//! Custom DNS resolution for `--dns-server`.
//!
//! Routes lookups through one explicitly configured UDP server instead of the
//! system resolver, with a 10-second query timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::RelayError;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct UdpResolver {
    inner: Arc<TokioResolver>,
}

impl UdpResolver {
    pub(crate) fn new(server: &str) -> Result<Self, RelayError> {
        let addr: SocketAddr = server
            .parse()
            .map_err(|_| RelayError::InvalidDnsServer(server.to_owned()))?;
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().timeout = QUERY_TIMEOUT;
        Ok(Self {
            inner: Arc::new(builder.build()),
        })
    }
}

impl Resolve for UdpResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = Arc::clone(&self.inner);
        Box::pin(async move {
            let lookup = resolver.lookup_ip(name.as_str()).await?;
            let addrs: Addrs = Box::new(lookup.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
