//! In-memory `iface -> {ip}` cache, serialized `ip route` invocation, and
//! periodic reconciliation with the kernel. Grounded on
//! `original_source/service/src/ip_route.py`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::InterfaceConfig;

use super::command;

type RunFuture = Pin<Box<dyn Future<Output = String> + Send>>;
pub type RunFn = Arc<dyn Fn(Vec<String>) -> RunFuture + Send + Sync>;

static ROUTE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.\d+\.\d+\.\d+).*via (\d+\.\d+\.\d+\.\d+)").unwrap());

fn default_runner(command_str: String) -> RunFn {
    Arc::new(move |args: Vec<String>| {
        let command_str = command_str.clone();
        Box::pin(async move {
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            match command::ip_route(&command_str, &arg_refs).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(
                        "failed to run `{} {}`: {}",
                        command_str,
                        arg_refs.join(" "),
                        e
                    );
                    String::new()
                }
            }
        })
    })
}

pub struct RouteManager {
    tunnels: Vec<InterfaceConfig>,
    run: RunFn,
    cache: Mutex<HashMap<InterfaceConfig, HashSet<Ipv4Addr>>>,
}

impl RouteManager {
    pub fn new(tunnels: Vec<InterfaceConfig>, ip_route_command: String) -> Self {
        Self::with_runner(tunnels, default_runner(ip_route_command))
    }

    pub fn with_runner(tunnels: Vec<InterfaceConfig>, run: RunFn) -> Self {
        let cache = tunnels.iter().map(|t| (t.clone(), HashSet::new())).collect();
        Self {
            tunnels,
            run,
            cache: Mutex::new(cache),
        }
    }

    /// Adds a route for every IP not already cached under `iface`, then
    /// flushes the route cache once if anything was added.
    pub async fn add_route(&self, iface: &InterfaceConfig, ips: &[Ipv4Addr]) {
        let mut cache = self.cache.lock().await;
        let entry = cache.entry(iface.clone()).or_default();

        let mut dirty = false;
        for ip in ips {
            if entry.contains(ip) {
                continue;
            }
            dirty = true;
            entry.insert(*ip);
            (self.run)(vec![
                "add".to_string(),
                ip.to_string(),
                "via".to_string(),
                iface.gateway_ip.to_string(),
            ])
            .await;
        }

        if dirty {
            self.flush_cache().await;
        } else {
            debug!("route for {:?} already exists. nothing to add", ips);
        }
    }

    /// Removes a route for every IP found in some tunnel's cache, then
    /// flushes once if anything was removed.
    pub async fn del_route(&self, ips: &[Ipv4Addr]) {
        let mut cache = self.cache.lock().await;

        let mut dirty = false;
        for ip in ips {
            let owner = cache
                .iter()
                .find(|(_, ips)| ips.contains(ip))
                .map(|(iface, _)| iface.clone());
            let Some(owner) = owner else {
                continue;
            };
            dirty = true;
            cache.get_mut(&owner).unwrap().remove(ip);
            (self.run)(vec!["del".to_string(), ip.to_string()]).await;
        }

        if dirty {
            self.flush_cache().await;
        } else {
            debug!("no route for {:?}. nothing to remove", ips);
        }
    }

    pub async fn get_routes(&self) -> String {
        (self.run)(vec!["show".to_string()]).await
    }

    async fn flush_cache(&self) {
        (self.run)(vec!["flush".to_string(), "cache".to_string()]).await;
    }

    /// Replaces the cache with `{known_iface -> observed_ips}` parsed
    /// from `ip route show`. Unknown gateways are discarded (spec.md
    /// §4.5).
    pub async fn reconcile(&self) {
        info!("syncing ip route cache");
        let gateway_to_iface: HashMap<Ipv4Addr, InterfaceConfig> = self
            .tunnels
            .iter()
            .map(|t| (t.gateway_ip, t.clone()))
            .collect();

        let show_output = self.get_routes().await;

        let mut observed: HashMap<Ipv4Addr, HashSet<Ipv4Addr>> = HashMap::new();
        for line in show_output.lines() {
            let Some(caps) = ROUTE_LINE.captures(line) else {
                continue;
            };
            let (Ok(ip), Ok(gateway)) = (caps[1].parse(), caps[2].parse()) else {
                continue;
            };
            observed.entry(gateway).or_default().insert(ip);
        }

        let mut new_cache: HashMap<InterfaceConfig, HashSet<Ipv4Addr>> =
            self.tunnels.iter().map(|t| (t.clone(), HashSet::new())).collect();

        for (gateway, ips) in observed {
            if let Some(iface) = gateway_to_iface.get(&gateway) {
                new_cache.insert(iface.clone(), ips);
            }
        }

        *self.cache.lock().await = new_cache;
    }

    #[cfg(test)]
    async fn snapshot(&self, iface: &InterfaceConfig) -> HashSet<Ipv4Addr> {
        self.cache.lock().await.get(iface).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    fn recording_runner() -> (RunFn, Arc<TokioMutex<Vec<Vec<String>>>>) {
        let calls = Arc::new(TokioMutex::new(Vec::new()));
        let calls2 = calls.clone();
        let run: RunFn = Arc::new(move |args| {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.lock().await.push(args);
                String::new()
            })
        });
        (run, calls)
    }

    fn tun0() -> InterfaceConfig {
        InterfaceConfig {
            name: "tun0".to_string(),
            gateway_ip: "1.2.3.4".parse().unwrap(),
        }
    }

    // S4 from spec.md §8
    #[tokio::test]
    async fn s4_route_application() {
        let (run, calls) = recording_runner();
        let rm = RouteManager::with_runner(vec![tun0()], run);

        let ips: Vec<Ipv4Addr> = vec!["5.6.7.8".parse().unwrap(), "5.6.7.9".parse().unwrap()];
        rm.add_route(&tun0(), &ips).await;

        let calls = calls.lock().await;
        assert_eq!(
            *calls,
            vec![
                vec!["add", "5.6.7.8", "via", "1.2.3.4"],
                vec!["add", "5.6.7.9", "via", "1.2.3.4"],
                vec!["flush", "cache"],
            ]
        );
    }

    // S5 from spec.md §8
    #[tokio::test]
    async fn s5_force_default_teardown() {
        let (run, calls) = recording_runner();
        let rm = RouteManager::with_runner(vec![tun0()], run);
        let ip: Ipv4Addr = "9.9.9.9".parse().unwrap();
        rm.add_route(&tun0(), &[ip]).await;
        calls.lock().await.clear();

        rm.del_route(&[ip]).await;

        let calls = calls.lock().await;
        assert_eq!(*calls, vec![vec!["del", "9.9.9.9"], vec!["flush", "cache"]]);
        assert!(rm.snapshot(&tun0()).await.is_empty());
    }

    // Invariant 6 from spec.md §8
    #[tokio::test]
    async fn add_then_del_restores_prior_cache_state() {
        let (run, calls) = recording_runner();
        let rm = RouteManager::with_runner(vec![tun0()], run);
        let ip: Ipv4Addr = "5.6.7.8".parse().unwrap();

        let before = rm.snapshot(&tun0()).await;
        rm.add_route(&tun0(), &[ip]).await;
        rm.del_route(&[ip]).await;
        let after = rm.snapshot(&tun0()).await;

        assert_eq!(before, after);
        let add_count = calls
            .lock()
            .await
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("add"))
            .count();
        let del_count = calls
            .lock()
            .await
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("del"))
            .count();
        assert_eq!(add_count, 1);
        assert_eq!(del_count, 1);
    }

    #[tokio::test]
    async fn add_route_skips_existing_ip() {
        let (run, calls) = recording_runner();
        let rm = RouteManager::with_runner(vec![tun0()], run);
        let ip: Ipv4Addr = "5.6.7.8".parse().unwrap();
        rm.add_route(&tun0(), &[ip]).await;
        calls.lock().await.clear();

        rm.add_route(&tun0(), &[ip]).await;
        assert!(calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn del_route_skips_unknown_ip() {
        let (run, calls) = recording_runner();
        let rm = RouteManager::with_runner(vec![tun0()], run);
        rm.del_route(&["1.1.1.1".parse().unwrap()]).await;
        assert!(calls.lock().await.is_empty());
    }

    // Invariant 7 from spec.md §8
    #[tokio::test]
    async fn reconcile_is_idempotent_on_stable_state() {
        let show_calls = Arc::new(AtomicUsize::new(0));
        let show_calls2 = show_calls.clone();
        let run: RunFn = Arc::new(move |args| {
            let show_calls = show_calls2.clone();
            Box::pin(async move {
                if args.first().map(String::as_str) == Some("show") {
                    show_calls.fetch_add(1, Ordering::SeqCst);
                    "5.6.7.8 dev tun0 via 1.2.3.4\n".to_string()
                } else {
                    String::new()
                }
            })
        });
        let rm = RouteManager::with_runner(vec![tun0()], run);
        rm.reconcile().await;
        let first = rm.snapshot(&tun0()).await;
        rm.reconcile().await;
        let second = rm.snapshot(&tun0()).await;
        assert_eq!(first, second);
        assert_eq!(show_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reconcile_discards_unknown_gateway() {
        let run: RunFn = Arc::new(|args| {
            Box::pin(async move {
                if args.first().map(String::as_str) == Some("show") {
                    "9.9.9.9 dev eth1 via 10.0.0.1\n".to_string()
                } else {
                    String::new()
                }
            })
        });
        let rm = RouteManager::with_runner(vec![tun0()], run);
        rm.reconcile().await;
        assert!(rm.snapshot(&tun0()).await.is_empty());
    }
}
