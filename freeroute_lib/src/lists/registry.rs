//! Maps each configured list to its matcher. Grounded on
//! `original_source/service/src/domain_lists.py`.

use std::net::Ipv4Addr;
use std::time::Duration;

use hyper::body::HttpBody;
use tracing::info;

use crate::config::{Config, ExternalDomainListSpec};

use super::persistent::PersistentMatcher;
use super::probe::ProbeMatcher;
use super::suffix::SuffixMatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    External,
    Manual,
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct DomainListSpec {
    pub name: String,
    pub interface: String,
    pub kind: ListKind,
}

/// Capability shared by all matcher kinds (spec.md §9's "duck-typed
/// matchers" redesign note: a tagged variant instead of a trait object).
pub enum Matcher {
    Suffix(SuffixMatcher),
    Persistent(PersistentMatcher),
    Probe(ProbeMatcher),
}

impl Matcher {
    pub async fn matches(&self, domain: &str, ips: &[Ipv4Addr]) -> bool {
        match self {
            Matcher::Suffix(m) => m.matches(domain),
            Matcher::Persistent(m) => m.matches(domain),
            Matcher::Probe(m) => m.matches(domain, ips).await,
        }
    }

    pub fn get_all(&self) -> Vec<String> {
        match self {
            Matcher::Suffix(m) => m.get_all(),
            Matcher::Persistent(m) => m.get_all(),
            Matcher::Probe(m) => m.get_all(),
        }
    }

    pub fn add(&mut self, domain: &str) {
        match self {
            Matcher::Suffix(m) => m.add(domain),
            Matcher::Persistent(m) => m.add(domain),
            Matcher::Probe(m) => m.add(domain),
        }
    }

    pub fn remove(&mut self, domain: &str) {
        match self {
            Matcher::Suffix(m) => m.remove(domain),
            Matcher::Persistent(m) => m.remove(domain),
            Matcher::Probe(m) => m.remove(domain),
        }
    }
}

pub struct ListRegistry {
    /// Declaration order: external lists, then manual, then dynamic,
    /// each in their config-file order (the cross-kind ordering decision
    /// recorded in SPEC_FULL.md §3 / DESIGN.md).
    entries: Vec<(DomainListSpec, Matcher)>,
}

impl ListRegistry {
    pub async fn from_config(cfg: &Config) -> crate::Result<Self> {
        let mut entries = Vec::new();

        for spec in &cfg.external_domain_lists {
            entries.push((
                DomainListSpec {
                    name: spec.name.clone(),
                    interface: spec.interface.clone(),
                    kind: ListKind::External,
                },
                Matcher::Suffix(SuffixMatcher::new()),
            ));
        }

        for spec in &cfg.manual_domain_lists {
            let mut matcher = PersistentMatcher::new(Config::manual_list_file(&spec.name));
            matcher
                .load()
                .await
                .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
            entries.push((
                DomainListSpec {
                    name: spec.name.clone(),
                    interface: spec.interface.clone(),
                    kind: ListKind::Manual,
                },
                Matcher::Persistent(matcher),
            ));
        }

        for spec in &cfg.dynamic_domain_lists {
            entries.push((
                DomainListSpec {
                    name: spec.name.clone(),
                    interface: spec.interface.clone(),
                    kind: ListKind::Dynamic,
                },
                Matcher::Probe(ProbeMatcher::new(Duration::from_secs(spec.timeout))),
            ));
        }

        Ok(Self { entries })
    }

    /// First list (in declaration order) whose matcher reports true, or
    /// `None`.
    pub async fn classify(&self, domain: &str, ips: &[Ipv4Addr]) -> Option<&DomainListSpec> {
        for (spec, matcher) in &self.entries {
            if matcher.matches(domain, ips).await {
                return Some(spec);
            }
        }
        None
    }

    pub fn get_spec(&self, name: &str) -> Option<&DomainListSpec> {
        self.entries.iter().map(|(s, _)| s).find(|s| s.name == name)
    }

    pub fn get_manual_lists(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(s, _)| s.kind == ListKind::Manual)
            .map(|(s, _)| s.name.clone())
            .collect()
    }

    pub fn get_matcher_mut(&mut self, name: &str) -> Option<&mut Matcher> {
        self.entries
            .iter_mut()
            .find(|(s, _)| s.name == name && s.kind == ListKind::Manual)
            .map(|(_, m)| m)
    }

    pub fn get_all(&self, name: &str) -> Option<Vec<String>> {
        self.entries
            .iter()
            .find(|(s, _)| s.name == name && s.kind == ListKind::Manual)
            .map(|(_, m)| m.get_all())
    }

    /// Flushes every dirty persistent (manual) matcher to disk. Write
    /// errors leave the matcher dirty so the next tick retries
    /// (spec.md §7).
    pub async fn flush_dirty_persistent(&mut self) {
        for (spec, matcher) in &mut self.entries {
            if let Matcher::Persistent(m) = matcher {
                if m.is_dirty() {
                    if let Err(e) = m.dump().await {
                        tracing::warn!("failed to flush manual list {}: {}", spec.name, e);
                    }
                }
            }
        }
    }

    /// Refetches one external list's contents over HTTP(S) and replaces
    /// its matcher contents. Failures are logged and retried on the next
    /// scheduled tick (spec.md §7's "transient external-list fetch
    /// failure").
    pub async fn refresh_external(&mut self, spec: &ExternalDomainListSpec) {
        info!("updating list {}", spec.name);
        match fetch_domain_list(&spec.url).await {
            Ok(lines) => {
                if let Some((_, Matcher::Suffix(matcher))) =
                    self.entries.iter_mut().find(|(s, _)| s.name == spec.name)
                {
                    matcher.update(lines);
                    info!("updated list {}", spec.name);
                }
            }
            Err(e) => {
                tracing::warn!("failed to update list {}: {}", spec.name, e);
            }
        }
    }

    pub fn iter_specs(&self) -> impl Iterator<Item = &DomainListSpec> {
        self.entries.iter().map(|(s, _)| s)
    }
}

async fn fetch_domain_list(url: &str) -> anyhow::Result<Vec<String>> {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .build();
    let client = hyper::Client::builder().build::<_, hyper::Body>(https);

    let uri: hyper::Uri = url.parse()?;
    let mut resp = client.get(uri).await?;
    if resp.status() != hyper::StatusCode::OK {
        anyhow::bail!("unexpected status {} fetching {}", resp.status(), url);
    }

    let mut body = Vec::new();
    while let Some(chunk) = resp.body_mut().data().await {
        body.extend_from_slice(&chunk?);
    }
    let text = String::from_utf8(body)?;
    Ok(text.lines().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, interface: &str) -> DomainListSpec {
        DomainListSpec {
            name: name.to_string(),
            interface: interface.to_string(),
            kind: ListKind::External,
        }
    }

    // S2 from spec.md §8
    #[tokio::test]
    async fn s2_classification_order() {
        let mut entries = Vec::new();
        let mut vpn = SuffixMatcher::new();
        vpn.update(["youtube.com"]);
        entries.push((spec("vpn", "tun0"), Matcher::Suffix(vpn)));

        let mut force_default = SuffixMatcher::new();
        force_default.update(["googlevideo.com"]);
        entries.push((
            DomainListSpec {
                name: "force_default".to_string(),
                interface: "".to_string(),
                kind: ListKind::Manual,
            },
            Matcher::Suffix(force_default),
        ));

        let registry = ListRegistry { entries };
        let classified = registry.classify("www.youtube.com", &[]).await;
        assert_eq!(classified.unwrap().name, "vpn");

        let classified = registry.classify("r1.googlevideo.com", &[]).await;
        assert_eq!(classified.unwrap().name, "force_default");
    }

    #[tokio::test]
    async fn classify_returns_none_when_no_list_matches() {
        let entries = vec![(spec("vpn", "tun0"), Matcher::Suffix(SuffixMatcher::new()))];
        let registry = ListRegistry { entries };
        assert!(registry.classify("example.com", &[]).await.is_none());
    }

    #[tokio::test]
    async fn get_manual_lists_only_returns_manual_kind() {
        let entries = vec![
            (spec("vpn-ext", "tun0"), Matcher::Suffix(SuffixMatcher::new())),
            (
                DomainListSpec {
                    name: "vpn".to_string(),
                    interface: "tun0".to_string(),
                    kind: ListKind::Manual,
                },
                Matcher::Persistent(PersistentMatcher::new("list_vpn.txt".into())),
            ),
        ];
        let registry = ListRegistry { entries };
        assert_eq!(registry.get_manual_lists(), vec!["vpn".to_string()]);
    }
}
