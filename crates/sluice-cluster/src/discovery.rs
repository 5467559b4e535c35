//! Peer discovery by periodic DNS resolution.
//!
//! The configured name is resolved through the system resolver every poll
//! interval; each returned address (paired with the cluster port) is a peer
//! candidate. Membership changes are reported as up/down events.
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Up(String),
    Down(String),
}

#[derive(Debug, Clone)]
pub struct DnsDiscovery {
    /// Name to resolve, e.g. `sluice.headless.svc.cluster.local`.
    pub query: String,
    /// Cluster port every peer listens on.
    pub peer_port: u16,
    pub interval: Duration,
}

impl DnsDiscovery {
    pub fn new(query: impl Into<String>, peer_port: u16) -> Self {
        Self {
            query: query.into(),
            peer_port,
            interval: Duration::from_secs(5),
        }
    }

    pub async fn resolve(&self) -> std::io::Result<BTreeSet<String>> {
        let addrs = tokio::net::lookup_host((self.query.as_str(), self.peer_port)).await?;
        Ok(addrs.map(|addr| addr.to_string()).collect())
    }

    /// Poll until cancelled, emitting a `PeerEvent` per membership change.
    /// Resolution failures keep the last known view; DNS blips must not tear
    /// the cluster down.
    pub async fn run(self, events: mpsc::Sender<PeerEvent>, shutdown: CancellationToken) {
        let mut known: BTreeSet<String> = BTreeSet::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let current = match self.resolve().await {
                Ok(addrs) => addrs,
                Err(err) => {
                    tracing::warn!(query = %self.query, error = %err, "peer discovery resolve failed");
                    metrics::counter!("sluice_discovery_failures_total").increment(1);
                    continue;
                }
            };
            for addr in current.difference(&known) {
                if events.send(PeerEvent::Up(addr.clone())).await.is_err() {
                    return;
                }
            }
            for addr in known.difference(&current) {
                if events.send(PeerEvent::Down(addr.clone())).await.is_err() {
                    return;
                }
            }
            known = current;
        }
    }
}
