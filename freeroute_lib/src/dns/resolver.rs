//! Upstream A-record resolution. `hickory-resolver` is treated as an
//! opaque external collaborator (SPEC_FULL.md §1): this module only
//! adapts its lookup API to the `(Ipv4Addr, ttl_secs)` shape the proxy
//! needs, mirroring the Python original's thin wrapper around
//! `aiodnsresolver.Resolver` in `dns_proxy.py`.

use std::net::Ipv4Addr;
use std::time::SystemTime;

use hickory_proto::op::ResponseCode;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;

#[derive(Debug)]
pub enum LookupOutcome {
    Found(Vec<(Ipv4Addr, u32)>),
    DoesNotExist,
    /// Upstream returned no records along with an rcode other than
    /// NXDOMAIN (e.g. REFUSED); echoed to the client verbatim.
    UpstreamRcode(u8),
    ServerFailure,
}

pub struct UpstreamResolver {
    resolver: TokioAsyncResolver,
}

impl UpstreamResolver {
    pub async fn new() -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }

    pub async fn lookup_a(&self, name: &str) -> LookupOutcome {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => {
                let valid_until = lookup.as_lookup().valid_until();
                let ttl = valid_until
                    .duration_since(SystemTime::now().into())
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0);
                let ips = lookup.iter().map(|a| (a.0, ttl)).collect();
                LookupOutcome::Found(ips)
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. } => match *response_code {
                    ResponseCode::NXDomain => LookupOutcome::DoesNotExist,
                    other => LookupOutcome::UpstreamRcode(other.low()),
                },
                _ => LookupOutcome::ServerFailure,
            },
        }
    }
}
