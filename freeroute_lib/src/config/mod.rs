//! Startup configuration. Loaded once from `$CONFIG` or `config.yaml`.
//!
//! Parsing itself is treated as a thin external collaborator (see
//! SPEC_FULL.md §1): this module only decodes YAML into typed structs and
//! runs the handful of cross-field checks spec.md §6 calls for, it does
//! not attempt schema migration or deep validation.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_dns_port() -> u16 {
    5553
}

fn default_api_port() -> u16 {
    8080
}

fn default_save_interval() -> u64 {
    60
}

fn default_ip_route_command() -> String {
    "sudo ip route".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub gateway_ip: Ipv4Addr,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkingConfig {
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default)]
    pub tunnels: Vec<InterfaceConfig>,
    /// Interface names excluded from the `/api/interfaces` diagnostic
    /// listing (e.g. loopback), matching the Python original's
    /// `ignore_interfaces` option.
    #[serde(default)]
    pub ignore_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalDomainListSpec {
    pub name: String,
    pub url: String,
    pub update_interval_hours: u64,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualDomainListSpec {
    pub name: String,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicDomainListSpec {
    pub name: String,
    pub interface: String,
    /// Probe timeout, in seconds.
    #[serde(default = "default_probe_timeout_sec")]
    pub timeout: u64,
}

fn default_probe_timeout_sec() -> u64 {
    3
}

/// Reserved name that means "match => ensure no tunnel route".
pub const FORCE_DEFAULT: &str = "force_default";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub networking: NetworkingConfig,
    #[serde(default)]
    pub external_domain_lists: Vec<ExternalDomainListSpec>,
    #[serde(default)]
    pub manual_domain_lists: Vec<ManualDomainListSpec>,
    #[serde(default)]
    pub dynamic_domain_lists: Vec<DynamicDomainListSpec>,
    #[serde(default = "default_save_interval")]
    pub manual_domain_list_save_interval_sec: u64,
    #[serde(default = "default_ip_route_command")]
    pub ip_route_command: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Config {
    /// Loads the config from `path`, or `$CONFIG`, or `config.yaml`. If
    /// none of those exist, a default config is written to
    /// `config.yaml` and returned, mirroring the Python original's
    /// `get_config()`/`write_config()` pair.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let path = path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config.yaml"));

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let cfg: Config = serde_yaml::from_str(&raw)?;
            Ok(cfg)
        } else {
            let cfg = Config::default();
            let raw = serde_yaml::to_string(&cfg)?;
            std::fs::write(&path, raw)?;
            Ok(cfg)
        }
    }

    pub fn manual_list_file(name: &str) -> PathBuf {
        PathBuf::from(format!("list_{}.txt", name))
    }

    /// Minimal cross-field checks: unique list names, and every
    /// non-`force_default` manual/dynamic list's interface names a
    /// configured tunnel.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut names = std::collections::HashSet::new();
        for name in self
            .external_domain_lists
            .iter()
            .map(|l| &l.name)
            .chain(self.manual_domain_lists.iter().map(|l| &l.name))
            .chain(self.dynamic_domain_lists.iter().map(|l| &l.name))
        {
            if !names.insert(name.clone()) {
                return Err(format!("duplicate domain list name: {}", name));
            }
        }

        let tunnel_names: std::collections::HashSet<&str> =
            self.networking.tunnels.iter().map(|t| t.name.as_str()).collect();

        for l in &self.external_domain_lists {
            if !tunnel_names.contains(l.interface.as_str()) {
                return Err(format!(
                    "external list {} references unknown tunnel {}",
                    l.name, l.interface
                ));
            }
        }
        for l in &self.manual_domain_lists {
            if l.name != FORCE_DEFAULT && !tunnel_names.contains(l.interface.as_str()) {
                return Err(format!(
                    "manual list {} references unknown tunnel {}",
                    l.name, l.interface
                ));
            }
        }
        for l in &self.dynamic_domain_lists {
            if l.name != FORCE_DEFAULT && !tunnel_names.contains(l.interface.as_str()) {
                return Err(format!(
                    "dynamic list {} references unknown tunnel {}",
                    l.name, l.interface
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_yaml() {
        let cfg = Config::default();
        assert_eq!(cfg.networking.dns_port, 5553);
        assert_eq!(cfg.api_port, 8080);
        assert_eq!(cfg.manual_domain_list_save_interval_sec, 60);
        assert_eq!(cfg.ip_route_command, "sudo ip route");
    }

    #[test]
    fn validate_rejects_unknown_tunnel() {
        let mut cfg = Config::default();
        cfg.manual_domain_lists.push(ManualDomainListSpec {
            name: "vpn".into(),
            interface: "tun0".into(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_allows_force_default_without_tunnel() {
        let mut cfg = Config::default();
        cfg.manual_domain_lists.push(ManualDomainListSpec {
            name: FORCE_DEFAULT.into(),
            interface: "".into(),
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn manual_list_file_name_pattern() {
        assert_eq!(Config::manual_list_file("vpn"), PathBuf::from("list_vpn.txt"));
    }
}
