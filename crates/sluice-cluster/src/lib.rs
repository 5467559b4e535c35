// Cluster routing: DNS-discovered membership, a consistent-hash ring mapping
// each tenant to one owner node, and best-effort envelope forwarding between
// peers. Node identity is the advertised cluster address.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_wire::CdcChange;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;

pub mod discovery;
pub mod peer;
pub mod ring;

pub use discovery::{DnsDiscovery, PeerEvent};
pub use peer::PeerHandle;
pub use ring::HashRing;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("cluster io error: {0}")]
    Io(String),
    #[error("cluster codec error: {0}")]
    Codec(String),
    #[error("cluster config error: {0}")]
    Config(String),
}

/// Everything that travels between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Link announcement carrying the dialing node's identity.
    Hello { node: String },
    Broadcast {
        tenant: String,
        topic: String,
        event: String,
        payload: Value,
        origin_node: String,
        origin_seq: u64,
    },
    PresenceDiff {
        tenant: String,
        topic: String,
        diff: Value,
        origin_node: String,
        origin_seq: u64,
    },
    /// Full presence state for one topic, sent on membership changes.
    PresenceState {
        tenant: String,
        topic: String,
        state: Value,
    },
    Cdc {
        tenant: String,
        change: CdcChange,
        origin_node: String,
        origin_seq: u64,
    },
    TenantInvalidate { tenant: String },
    /// Ask the receiving node to start a tenant it now owns.
    TenantStart { tenant: String },
    /// The new owner finished bootstrapping its replicator; the old owner may
    /// stop.
    ReplicatorReady { tenant: String, node: String },
}

impl Envelope {
    /// The dedup identity of forwarded dataplane envelopes.
    fn dedup_key(&self) -> Option<(String, u64)> {
        match self {
            Envelope::Broadcast {
                origin_node,
                origin_seq,
                ..
            }
            | Envelope::PresenceDiff {
                origin_node,
                origin_seq,
                ..
            }
            | Envelope::Cdc {
                origin_node,
                origin_seq,
                ..
            } => Some((origin_node.clone(), *origin_seq)),
            _ => None,
        }
    }
}

/// Consumer of inbound envelopes; the gateway wires this to the hub and the
/// tenant layer.
#[async_trait::async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Address other nodes reach this one at; doubles as node identity.
    pub advertise_addr: String,
    pub bind_addr: SocketAddr,
    /// DNS name whose records enumerate the peers. None runs single-node.
    pub dns_query: Option<String>,
    pub peer_port: u16,
    pub dns_interval: Duration,
    pub rebalance_grace: Duration,
    pub dedup_window: Duration,
}

impl ClusterConfig {
    pub fn single_node(advertise_addr: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            advertise_addr: advertise_addr.into(),
            bind_addr,
            dns_query: None,
            peer_port: bind_addr.port(),
            dns_interval: Duration::from_secs(5),
            rebalance_grace: Duration::from_secs(10),
            dedup_window: Duration::from_secs(10),
        }
    }
}

pub struct ClusterRouter {
    config: ClusterConfig,
    ring: RwLock<HashRing>,
    peers: RwLock<HashMap<String, PeerHandle>>,
    seen: Mutex<HashMap<(String, u64), Instant>>,
    epoch: watch::Sender<u64>,
    shutdown: CancellationToken,
    me: Weak<Self>,
}

impl ClusterRouter {
    pub fn new(config: ClusterConfig, shutdown: CancellationToken) -> Arc<Self> {
        let mut ring = HashRing::new();
        ring.insert(&config.advertise_addr);
        let (epoch, _) = watch::channel(0);
        Arc::new_cyclic(|me| Self {
            config,
            ring: RwLock::new(ring),
            peers: RwLock::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
            epoch,
            shutdown,
            me: me.clone(),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.me.upgrade().expect("router alive")
    }

    pub fn node_id(&self) -> &str {
        &self.config.advertise_addr
    }

    pub fn rebalance_grace(&self) -> Duration {
        self.config.rebalance_grace
    }

    /// Bumped on every membership change; the tenant layer watches it to
    /// recompute ownership.
    pub fn watch_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    pub async fn owner(&self, tenant: &str) -> Option<String> {
        self.ring.read().await.owner(tenant).map(str::to_string)
    }

    pub async fn is_owner(&self, tenant: &str) -> bool {
        self.ring.read().await.owner(tenant) == Some(self.config.advertise_addr.as_str())
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Start the listener, the inbound pump, and (when configured) DNS
    /// discovery. Returns once the listener is bound.
    pub async fn start(&self, handler: Arc<dyn EnvelopeHandler>) -> ClusterResult<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|err| ClusterError::Io(err.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| ClusterError::Io(err.to_string()))?;
        tracing::info!(addr = %local_addr, node = %self.config.advertise_addr, "cluster listener started");

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Envelope>(8192);

        // Accept loop: every connection is a read-only inbound link.
        let accept_shutdown = self.shutdown.clone();
        let accept_tx = inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(peer::serve_inbound(
                            stream,
                            remote,
                            accept_tx.clone(),
                            accept_shutdown.clone(),
                        ));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "cluster accept failed");
                    }
                }
            }
        });

        // Inbound pump: fold membership envelopes into the ring, dedup the
        // dataplane ones, hand the rest to the handler.
        let router = self.strong();
        let pump_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = pump_shutdown.cancelled() => return,
                    envelope = inbound_rx.recv() => envelope,
                };
                let Some(envelope) = envelope else { return };
                match &envelope {
                    Envelope::Hello { node } => {
                        router.add_peer(node.clone()).await;
                        continue;
                    }
                    other => {
                        if let Some((origin, seq)) = other.dedup_key() {
                            if !router.should_deliver(&origin, seq).await {
                                continue;
                            }
                        }
                    }
                }
                handler.handle(envelope).await;
            }
        });

        if let Some(query) = self.config.dns_query.clone() {
            let discovery = DnsDiscovery {
                query,
                peer_port: self.config.peer_port,
                interval: self.config.dns_interval,
            };
            let (event_tx, mut event_rx) = mpsc::channel(64);
            tokio::spawn(discovery.run(event_tx, self.shutdown.clone()));
            let router = self.strong();
            let events_shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = events_shutdown.cancelled() => return,
                        event = event_rx.recv() => event,
                    };
                    match event {
                        Some(PeerEvent::Up(addr)) => router.add_peer(addr).await,
                        Some(PeerEvent::Down(addr)) => router.remove_peer(&addr).await,
                        None => return,
                    }
                }
            });
        }

        Ok(local_addr)
    }

    pub async fn add_peer(&self, addr: String) {
        if addr == self.config.advertise_addr {
            return;
        }
        {
            let mut peers = self.peers.write().await;
            if peers.contains_key(&addr) {
                return;
            }
            let hello = Envelope::Hello {
                node: self.config.advertise_addr.clone(),
            };
            let handle = peer::spawn_link(addr.clone(), hello, self.shutdown.clone());
            peers.insert(addr.clone(), handle);
        }
        self.ring.write().await.insert(&addr);
        self.bump_epoch();
        metrics::gauge!("sluice_cluster_peers").increment(1.0);
        tracing::info!(peer = %addr, "peer joined");
    }

    pub async fn remove_peer(&self, addr: &str) {
        let removed = self.peers.write().await.remove(addr).is_some();
        if !removed {
            return;
        }
        self.ring.write().await.remove(addr);
        self.bump_epoch();
        metrics::gauge!("sluice_cluster_peers").decrement(1.0);
        tracing::info!(peer = %addr, "peer left");
    }

    /// Send an envelope to every connected peer.
    pub async fn broadcast_envelope(&self, envelope: Envelope) {
        let peers = self.peers.read().await;
        for handle in peers.values() {
            handle.send(envelope.clone());
        }
    }

    pub async fn send_to(&self, node: &str, envelope: Envelope) {
        if let Some(handle) = self.peers.read().await.get(node) {
            handle.send(envelope);
        }
    }

    pub async fn announce_replicator_ready(&self, tenant: &str) {
        self.broadcast_envelope(Envelope::ReplicatorReady {
            tenant: tenant.to_string(),
            node: self.config.advertise_addr.clone(),
        })
        .await;
    }

    pub async fn broadcast_tenant_invalidate(&self, tenant: &str) {
        self.broadcast_envelope(Envelope::TenantInvalidate {
            tenant: tenant.to_string(),
        })
        .await;
    }

    /// Duplicate suppression for forwarded envelopes: each (origin, seq) is
    /// delivered once within the dedup window.
    async fn should_deliver(&self, origin: &str, seq: u64) -> bool {
        if origin == self.config.advertise_addr {
            return false;
        }
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, stamped| now.duration_since(*stamped) < self.config.dedup_window);
        match seen.insert((origin.to_string(), seq), now) {
            None => true,
            Some(_) => {
                metrics::counter!("sluice_cluster_duplicates_dropped_total").increment(1);
                false
            }
        }
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        seen: StdMutex<Vec<Envelope>>,
        notify: tokio::sync::Notify,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }
    }

    #[async_trait::async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle(&self, envelope: Envelope) {
            self.seen.lock().unwrap().push(envelope);
            self.notify.notify_one();
        }
    }

    fn test_config(advertise: &str) -> ClusterConfig {
        ClusterConfig::single_node(advertise, "127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn single_node_owns_every_tenant() {
        let shutdown = CancellationToken::new();
        let router = ClusterRouter::new(test_config("n1:7000"), shutdown.clone());
        assert!(router.is_owner("any-tenant").await);
        assert_eq!(router.owner("any-tenant").await.as_deref(), Some("n1:7000"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn membership_changes_bump_epoch() {
        let shutdown = CancellationToken::new();
        let router = ClusterRouter::new(test_config("n1:7000"), shutdown.clone());
        let epoch = router.watch_epoch();
        assert_eq!(*epoch.borrow(), 0);
        router.add_peer("n2:7000".to_string()).await;
        assert_eq!(*epoch.borrow(), 1);
        router.remove_peer("n2:7000").await;
        assert_eq!(*epoch.borrow(), 2);
        // Removing an unknown peer is a no-op.
        router.remove_peer("n3:7000").await;
        assert_eq!(*epoch.borrow(), 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn self_address_never_becomes_a_peer() {
        let shutdown = CancellationToken::new();
        let router = ClusterRouter::new(test_config("n1:7000"), shutdown.clone());
        router.add_peer("n1:7000".to_string()).await;
        assert_eq!(router.peer_count().await, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn forwarded_envelopes_flow_between_two_nodes() {
        let shutdown = CancellationToken::new();
        let a = ClusterRouter::new(test_config("node-a"), shutdown.clone());
        let b = ClusterRouter::new(test_config("node-b"), shutdown.clone());
        let recorder = Recorder::new();
        let _a_addr = a.start(Recorder::new()).await.expect("start a");
        let b_addr = b.start(recorder.clone()).await.expect("start b");

        a.add_peer(b_addr.to_string()).await;
        // Give the link a beat to dial.
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.broadcast_envelope(Envelope::Broadcast {
            tenant: "acme".into(),
            topic: "room:1".into(),
            event: "e".into(),
            payload: json!({"m": "v"}),
            origin_node: "node-a".into(),
            origin_seq: 1,
        })
        .await;

        tokio::time::timeout(Duration::from_secs(5), recorder.notify.notified())
            .await
            .expect("delivered");
        let seen = recorder.seen.lock().unwrap();
        assert!(seen.iter().any(|envelope| matches!(
            envelope,
            Envelope::Broadcast { tenant, origin_seq: 1, .. } if tenant == "acme"
        )));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn duplicates_within_window_are_dropped() {
        let shutdown = CancellationToken::new();
        let router = ClusterRouter::new(test_config("n1:7000"), shutdown.clone());
        assert!(router.should_deliver("n2:7000", 7).await);
        assert!(!router.should_deliver("n2:7000", 7).await);
        assert!(router.should_deliver("n2:7000", 8).await);
        // Envelopes from ourselves never deliver.
        assert!(!router.should_deliver("n1:7000", 1).await);
        shutdown.cancel();
    }
}
