//! Resolve-event fan-out. Grounded on
//! `original_source/service/src/web_server.py`'s per-subscriber
//! `asyncio.Queue` event log, redesigned per SPEC_FULL.md §4.9 around
//! [`tokio::sync::broadcast`] for bounded, ordered fan-out without a
//! dedicated relay task per subscriber.

use std::net::Ipv4Addr;

use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ResolveEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub remote: Ipv4Addr,
    pub domain: String,
    pub ips: Vec<Ipv4Addr>,
    pub list_name: Option<String>,
}

impl ResolveEvent {
    pub fn new(
        remote: Ipv4Addr,
        domain: String,
        ips: Vec<Ipv4Addr>,
        list_name: Option<String>,
    ) -> Self {
        Self {
            kind: "resolve",
            remote,
            domain,
            ips,
            list_name,
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<ResolveEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes to every current subscriber. A send error just means
    /// nobody is listening right now, which is not a failure.
    pub fn publish(&self, event: ResolveEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResolveEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(ResolveEvent::new(
            "127.0.0.1".parse().unwrap(),
            "example.com".to_string(),
            vec!["1.2.3.4".parse().unwrap()],
            Some("vpn".to_string()),
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "resolve");
        assert_eq!(event.domain, "example.com");
        assert_eq!(event.list_name.as_deref(), Some("vpn"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(ResolveEvent::new(
            "127.0.0.1".parse().unwrap(),
            "example.com".to_string(),
            vec![],
            None,
        ));
    }

    #[tokio::test]
    async fn each_subscriber_gets_its_own_copy() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(ResolveEvent::new(
            "127.0.0.1".parse().unwrap(),
            "example.com".to_string(),
            vec![],
            None,
        ));

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }
}
