//! Applies (or removes) a tunnel route for a resolved domain. Grounded on
//! `original_source/service/src/domain_router.py`.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{InterfaceConfig, FORCE_DEFAULT};
use crate::lists::registry::DomainListSpec;
use crate::route::manager::RouteManager;

const MAX_LAST_ROUTED_DOMAINS: usize = 1000;

pub struct Router {
    route_manager: Arc<RouteManager>,
    tunnels: HashMap<String, InterfaceConfig>,
    last_routed: Mutex<VecDeque<(String, Vec<Ipv4Addr>)>>,
}

impl Router {
    pub fn new(route_manager: Arc<RouteManager>, tunnels: Vec<InterfaceConfig>) -> Self {
        Self {
            route_manager,
            tunnels: tunnels.into_iter().map(|t| (t.name.clone(), t)).collect(),
            last_routed: Mutex::new(VecDeque::with_capacity(MAX_LAST_ROUTED_DOMAINS)),
        }
    }

    /// Applies the route implied by `spec` for `domain`/`ips`, and records
    /// the pair for later [`Router::re_route`] lookups.
    pub async fn route(&self, spec: Option<&DomainListSpec>, domain: &str, ips: &[Ipv4Addr]) {
        {
            let mut last_routed = self.last_routed.lock().await;
            if last_routed.len() == MAX_LAST_ROUTED_DOMAINS {
                last_routed.pop_front();
            }
            last_routed.push_back((domain.to_string(), ips.to_vec()));
        }

        match spec {
            Some(spec) if spec.name == FORCE_DEFAULT => {
                debug!("forcing default route to {:?} for {}", ips, domain);
                self.route_manager.del_route(ips).await;
            }
            Some(spec) => {
                if let Some(iface) = self.tunnels.get(&spec.interface) {
                    debug!("adding route to {:?} via {} for {}", ips, iface.name, domain);
                    self.route_manager.add_route(iface, ips).await;
                }
            }
            None => {
                debug!("no preferences for {}. trying to remove route if any", domain);
                self.route_manager.del_route(ips).await;
            }
        }
    }

    /// Re-applies the route for `domain` using the union of every IP it
    /// has previously resolved to, classified fresh via `spec` (the
    /// caller re-runs classification since re-routing follows a list
    /// edit, not a new resolution).
    pub async fn re_route(&self, domain: &str, spec: Option<&DomainListSpec>) {
        let ips: Vec<Ipv4Addr> = {
            let last_routed = self.last_routed.lock().await;
            let mut seen = std::collections::HashSet::new();
            for (d, ips) in last_routed.iter() {
                if d == domain {
                    seen.extend(ips.iter().copied());
                }
            }
            seen.into_iter().collect()
        };

        if ips.is_empty() {
            debug!("domain {} was not routed before. nothing to reroute", domain);
            return;
        }

        debug!("re-routing domain {} with ips {:?}", domain, ips);
        self.route(spec, domain, &ips).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::registry::ListKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tun0() -> InterfaceConfig {
        InterfaceConfig {
            name: "tun0".to_string(),
            gateway_ip: "1.2.3.4".parse().unwrap(),
        }
    }

    fn counting_manager() -> (Arc<RouteManager>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let adds = Arc::new(AtomicUsize::new(0));
        let dels = Arc::new(AtomicUsize::new(0));
        let adds2 = adds.clone();
        let dels2 = dels.clone();
        let run: crate::route::manager::RunFn = Arc::new(move |args| {
            let adds = adds2.clone();
            let dels = dels2.clone();
            Box::pin(async move {
                match args.first().map(String::as_str) {
                    Some("add") => {
                        adds.fetch_add(1, Ordering::SeqCst);
                    }
                    Some("del") => {
                        dels.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
                String::new()
            })
        });
        (
            Arc::new(RouteManager::with_runner(vec![tun0()], run)),
            adds,
            dels,
        )
    }

    // S7 from spec.md §8
    #[tokio::test]
    async fn s7_force_default_overrides_route() {
        let (rm, adds, dels) = counting_manager();
        let router = Router::new(rm, vec![tun0()]);
        let spec = DomainListSpec {
            name: FORCE_DEFAULT.to_string(),
            interface: "".to_string(),
            kind: ListKind::Manual,
        };
        router
            .route(Some(&spec), "googlevideo.com", &["1.1.1.1".parse().unwrap()])
            .await;
        assert_eq!(adds.load(Ordering::SeqCst), 0);
        assert_eq!(dels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unclassified_domain_clears_any_route() {
        let (rm, adds, dels) = counting_manager();
        let router = Router::new(rm, vec![tun0()]);
        router.route(None, "example.com", &["1.1.1.1".parse().unwrap()]).await;
        assert_eq!(adds.load(Ordering::SeqCst), 0);
        assert_eq!(dels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classified_domain_routes_via_its_tunnel() {
        let (rm, adds, dels) = counting_manager();
        let router = Router::new(rm, vec![tun0()]);
        let spec = DomainListSpec {
            name: "vpn".to_string(),
            interface: "tun0".to_string(),
            kind: ListKind::External,
        };
        router
            .route(Some(&spec), "youtube.com", &["1.1.1.1".parse().unwrap()])
            .await;
        assert_eq!(adds.load(Ordering::SeqCst), 1);
        assert_eq!(dels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn re_route_is_noop_for_never_routed_domain() {
        let (rm, adds, dels) = counting_manager();
        let router = Router::new(rm, vec![tun0()]);
        router.re_route("never-seen.com", None).await;
        assert_eq!(adds.load(Ordering::SeqCst), 0);
        assert_eq!(dels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn re_route_reapplies_using_remembered_ips() {
        let (rm, adds, dels) = counting_manager();
        let router = Router::new(rm, vec![tun0()]);
        router.route(None, "example.com", &["1.1.1.1".parse().unwrap()]).await;
        dels.store(0, Ordering::SeqCst);

        let spec = DomainListSpec {
            name: "vpn".to_string(),
            interface: "tun0".to_string(),
            kind: ListKind::External,
        };
        router.re_route("example.com", Some(&spec)).await;
        assert_eq!(adds.load(Ordering::SeqCst), 1);
    }
}
