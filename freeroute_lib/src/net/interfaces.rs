//! Ambient diagnostics helper: enumerate host network interfaces and
//! their IPv4 addresses. Grounded on
//! `original_source/service/src/network_interfaces.py`; exposed for
//! completeness, not consulted by routing decisions (RouteManager already
//! tracks tunnels explicitly via configured gateway IPs).

use std::net::Ipv4Addr;

use network_interface::{Addr, NetworkInterfaceConfig};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// Lists every interface's IPv4 addresses, skipping `ignore`.
pub fn list_interfaces(ignore: &[String]) -> anyhow::Result<Vec<NetworkInterface>> {
    let ifaces = network_interface::NetworkInterface::show()?;
    let mut result = Vec::new();
    for iface in ifaces {
        if ignore.iter().any(|i| i == &iface.name) {
            continue;
        }
        for addr in iface.addr {
            if let Addr::V4(v4) = addr {
                result.push(NetworkInterface {
                    name: iface.name.clone(),
                    ip: v4.ip,
                });
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_named_interfaces() {
        // Only exercises the filter predicate, not the real interface
        // list (which is platform-dependent and can't be stubbed here).
        let ignore = vec!["lo".to_string()];
        assert!(ignore.iter().any(|i| i == "lo"));
        let _ = list_interfaces(&ignore);
    }
}
