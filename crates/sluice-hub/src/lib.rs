// Process-wide topic registry and fan-out engine. Topic state is partitioned
// across shards keyed by (tenant, topic) hash; authorization and any other
// I/O resolve before a shard lock is taken, never under one.
use serde_json::{Value, json};
use sluice_auth::{AuthError, Claims, TopicAuthorizer};
use sluice_common::TenantQuotas;
use sluice_common::ids::SessionRef;
use sluice_wire::{CdcChange, ChangeFilter, ChangeOp, JoinConfig, ServerFrame, close, event};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

pub mod limits;
pub mod presence;

pub use limits::{LimitExceeded, RateLimits, Resource, TenantBuckets};
pub use presence::{Meta, PresenceState};

pub type HubResult<T> = std::result::Result<T, HubError>;

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("You do not have permissions to read from this Channel topic: {topic}")]
    Unauthorized { topic: String },
    #[error(transparent)]
    RateLimited(#[from] LimitExceeded),
    #[error("tenant unavailable: {reason}")]
    TenantUnavailable { reason: String },
    #[error("not joined to topic: {topic}")]
    NotJoined { topic: String },
    #[error("invalid postgres_changes filter: {0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Authz(#[from] AuthError),
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub shard_count: usize,
    /// Outbound queue bounds per subscriber; whichever trips first closes the
    /// session as a slow consumer.
    pub queue_capacity: usize,
    pub queue_max_bytes: usize,
    /// Treat every topic as private regardless of join config.
    pub force_private: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shard_count: std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(16),
            queue_capacity: 1000,
            queue_max_bytes: 1024 * 1024,
            force_private: false,
        }
    }
}

/// Fire-and-forget forwarding to peer nodes. The cluster layer implements
/// this; a hub without one runs single-node.
pub trait RemoteFanout: Send + Sync {
    fn forward_broadcast(&self, tenant: &str, topic: &str, event: &str, payload: &Value, origin_seq: u64);
    fn forward_presence_diff(&self, tenant: &str, topic: &str, diff: &Value, origin_seq: u64);
    fn forward_cdc(&self, tenant: &str, change: &CdcChange, origin_seq: u64);
}

/// Column visibility oracle for CDC delivery: which columns a role may see on
/// a table, or None when unrestricted.
#[async_trait::async_trait]
pub trait ColumnGate: Send + Sync {
    async fn visible_columns(
        &self,
        tenant: &str,
        role: &str,
        schema: &str,
        table: &str,
    ) -> Option<HashSet<String>>;
}

/// Gate that restricts nothing. Used by tests and broadcast-only setups.
pub struct OpenGate;

#[async_trait::async_trait]
impl ColumnGate for OpenGate {
    async fn visible_columns(&self, _: &str, _: &str, _: &str, _: &str) -> Option<HashSet<String>> {
        None
    }
}

#[derive(Debug)]
pub struct SessionGate {
    code: std::sync::OnceLock<u16>,
    token: CancellationToken,
}

impl SessionGate {
    pub fn close_code(&self) -> Option<u16> {
        self.code.get().copied()
    }

    pub fn force_close(&self, code: u16) {
        let _ = self.code.set(code);
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}

#[derive(Debug)]
pub enum PushError {
    Overflow,
    Closed,
}

/// Sending half of a subscriber's outbound queue, shared between the hub and
/// the session that owns the socket.
#[derive(Clone)]
pub struct SessionHandle {
    session: SessionRef,
    sender: mpsc::Sender<Arc<str>>,
    queued_bytes: Arc<AtomicUsize>,
    max_queued_bytes: usize,
    gate: Arc<SessionGate>,
}

impl SessionHandle {
    pub fn session(&self) -> SessionRef {
        self.session
    }

    pub fn gate(&self) -> &Arc<SessionGate> {
        &self.gate
    }

    pub fn push(&self, text: &Arc<str>) -> Result<(), PushError> {
        if self.gate.is_closed() {
            return Err(PushError::Closed);
        }
        let queued = self.queued_bytes.load(Ordering::Relaxed);
        if queued + text.len() > self.max_queued_bytes {
            return Err(PushError::Overflow);
        }
        match self.sender.try_send(text.clone()) {
            Ok(()) => {
                self.queued_bytes.fetch_add(text.len(), Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Overflow),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    pub fn push_frame(&self, frame: &ServerFrame) -> Result<(), PushError> {
        self.push(&Arc::from(frame.encode().as_str()))
    }
}

/// Receiving half, held by the session's writer task.
pub struct SessionReceiver {
    receiver: mpsc::Receiver<Arc<str>>,
    queued_bytes: Arc<AtomicUsize>,
}

impl SessionReceiver {
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        let frame = self.receiver.recv().await;
        if let Some(text) = &frame {
            self.queued_bytes.fetch_sub(text.len(), Ordering::Relaxed);
        }
        frame
    }
}

pub fn session_channel(
    session: SessionRef,
    capacity: usize,
    max_bytes: usize,
) -> (SessionHandle, SessionReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let queued_bytes = Arc::new(AtomicUsize::new(0));
    let handle = SessionHandle {
        session,
        sender,
        queued_bytes: queued_bytes.clone(),
        max_queued_bytes: max_bytes,
        gate: Arc::new(SessionGate {
            code: std::sync::OnceLock::new(),
            token: CancellationToken::new(),
        }),
    };
    (
        handle,
        SessionReceiver {
            receiver,
            queued_bytes,
        },
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TopicKey {
    tenant: String,
    topic: String,
}

struct TopicSubscriber {
    handle: SessionHandle,
    self_send: bool,
    presence_key: Option<String>,
}

struct TopicState {
    private: bool,
    last_seq: u64,
    subscribers: HashMap<SessionRef, TopicSubscriber>,
    presence: PresenceState,
}

impl TopicState {
    fn new(private: bool) -> Self {
        Self {
            private,
            last_seq: 0,
            subscribers: HashMap::new(),
            presence: PresenceState::default(),
        }
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.presence.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    schema: String,
    table: Option<String>,
    op: Option<ChangeOp>,
}

#[derive(Clone)]
struct CdcRoute {
    id: u64,
    topic: String,
    session: SessionRef,
    handle: SessionHandle,
    role: String,
    filter: Option<ChangeFilter>,
}

pub struct SubscribeRequest {
    pub tenant: String,
    pub quotas: TenantQuotas,
    pub topic: String,
    pub session: SessionHandle,
    pub config: JoinConfig,
    pub claims: Option<Arc<Claims>>,
    /// How many channels this client already has open.
    pub channels_opened: u32,
}

#[derive(Debug)]
pub struct Subscribed {
    pub seq: u64,
    pub presence_state: Value,
    /// Ids assigned to the join's postgres_changes entries, in order.
    pub change_ids: Vec<u64>,
}

pub struct BroadcastRequest {
    pub tenant: String,
    pub quotas: TenantQuotas,
    pub topic: String,
    pub event: String,
    pub payload: Value,
    pub sender: Option<SessionRef>,
    pub claims: Option<Arc<Claims>>,
    /// Privacy assumption when the topic has no local state yet.
    pub assume_private: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BroadcastOutcome {
    pub seq: u64,
    pub delivered: usize,
}

pub struct ChannelHub {
    config: HubConfig,
    shards: Vec<RwLock<HashMap<TopicKey, TopicState>>>,
    routes: RwLock<HashMap<String, HashMap<RouteKey, Vec<CdcRoute>>>>,
    limits: RateLimits,
    authorizer: Arc<dyn TopicAuthorizer>,
    remote: RwLock<Option<Arc<dyn RemoteFanout>>>,
    next_change_id: AtomicU64,
    /// Node-wide sequence for cross-node envelopes; receivers deduplicate on
    /// (origin_node, origin_seq), so it must be monotonic per node, not per
    /// topic.
    forward_seq: AtomicU64,
}

impl ChannelHub {
    pub fn new(config: HubConfig, authorizer: Arc<dyn TopicAuthorizer>) -> Self {
        let shards = (0..config.shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            config,
            shards,
            routes: RwLock::new(HashMap::new()),
            limits: RateLimits::new(),
            authorizer,
            remote: RwLock::new(None),
            next_change_id: AtomicU64::new(1),
            forward_seq: AtomicU64::new(1),
        }
    }

    pub fn queue_bounds(&self) -> (usize, usize) {
        (self.config.queue_capacity, self.config.queue_max_bytes)
    }

    pub async fn set_remote(&self, remote: Arc<dyn RemoteFanout>) {
        *self.remote.write().await = Some(remote);
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Register a session on a topic. Authorization and rate limiting happen
    /// here, before the shard lock.
    pub async fn subscribe(&self, request: SubscribeRequest) -> HubResult<Subscribed> {
        let buckets = self
            .limits
            .for_tenant(&request.tenant, &request.quotas)
            .await;
        buckets.check_join()?;

        let private = request.config.private || self.config.force_private;
        if private {
            let claims = request
                .claims
                .as_deref()
                .ok_or_else(|| HubError::Unauthorized {
                    topic: request.topic.clone(),
                })?;
            let allowed = self
                .authorizer
                .can_read(&request.tenant, &request.topic, claims)
                .await?;
            if !allowed {
                return Err(HubError::Unauthorized {
                    topic: request.topic.clone(),
                });
            }
        }

        // Parse filters before mutating anything so a bad join is atomic.
        let mut parsed_changes = Vec::with_capacity(request.config.postgres_changes.len());
        for params in &request.config.postgres_changes {
            let filter = match &params.filter {
                Some(text) => Some(
                    ChangeFilter::parse(text)
                        .map_err(|err| HubError::InvalidFilter(err.to_string()))?,
                ),
                None => None,
            };
            let op = match params.event.as_str() {
                "*" => None,
                other => Some(
                    ChangeOp::parse(other)
                        .map_err(|err| HubError::InvalidFilter(err.to_string()))?,
                ),
            };
            parsed_changes.push((params.schema.clone(), params.table.clone(), op, filter));
        }

        buckets.check_channels(request.channels_opened)?;

        let key = TopicKey {
            tenant: request.tenant.clone(),
            topic: request.topic.clone(),
        };
        let role = request
            .claims
            .as_deref()
            .map(|claims| claims.role.clone())
            .unwrap_or_else(|| "anon".to_string());

        let mut overflowed = Vec::new();
        let (seq, presence_state, presence_diff, rejoined) = {
            let mut shard = self.shard(&key).write().await;
            let state = shard
                .entry(key.clone())
                .or_insert_with(|| TopicState::new(private));
            let presence_key = request.config.presence.as_ref().map(|p| p.key.clone());

            let rejoined = state
                .subscribers
                .insert(
                    request.session.session(),
                    TopicSubscriber {
                        handle: request.session.clone(),
                        self_send: request.config.broadcast.self_send,
                        presence_key: presence_key.clone(),
                    },
                )
                .is_some();

            // Begin tracking immediately when the join carries a presence key.
            let diff = presence_key.map(|presence_key| {
                state.presence.track(
                    &presence_key,
                    Meta {
                        phx_ref: uuid::Uuid::new_v4().to_string(),
                        session: request.session.session(),
                        payload: json!({}),
                    },
                )
            });
            if let Some(diff) = &diff {
                let frame = presence_diff_frame(&request.topic, diff);
                let text: Arc<str> = Arc::from(frame.encode().as_str());
                for (session, subscriber) in &state.subscribers {
                    if *session == request.session.session() {
                        continue;
                    }
                    push_or_mark(subscriber, &text, &mut overflowed);
                }
            }
            (state.last_seq, state.presence.state_payload(), diff, rejoined)
        };

        if rejoined {
            // The replaced registration already counted an open channel.
            buckets.channel_closed();
        }
        self.evict_slow(&key.tenant, &overflowed).await;
        if let Some(diff) = presence_diff {
            self.forward_presence(&key.tenant, &key.topic, &diff).await;
        }

        let mut change_ids = Vec::with_capacity(parsed_changes.len());
        if !parsed_changes.is_empty() {
            let mut routes = self.routes.write().await;
            let tenant_routes = routes.entry(request.tenant.clone()).or_default();
            for (schema, table, op, filter) in parsed_changes {
                let id = self.next_change_id.fetch_add(1, Ordering::Relaxed);
                change_ids.push(id);
                tenant_routes
                    .entry(RouteKey { schema, table, op })
                    .or_default()
                    .push(CdcRoute {
                        id,
                        topic: request.topic.clone(),
                        session: request.session.session(),
                        handle: request.session.clone(),
                        role: role.clone(),
                        filter,
                    });
            }
        }

        metrics::counter!("sluice_topic_joins_total").increment(1);
        Ok(Subscribed {
            seq,
            presence_state,
            change_ids,
        })
    }

    /// Remove a session from a topic, emitting presence leaves and deleting
    /// the topic once nothing references it.
    pub async fn unsubscribe(&self, tenant: &str, topic: &str, session: SessionRef) -> bool {
        let key = TopicKey {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
        };
        let mut overflowed = Vec::new();
        let (removed, leave_diff) = {
            let mut shard = self.shard(&key).write().await;
            let Some(state) = shard.get_mut(&key) else {
                return false;
            };
            let removed = state.subscribers.remove(&session).is_some();
            let diff = state.presence.untrack_session(session);
            if let Some(diff) = &diff {
                let frame = presence_diff_frame(topic, diff);
                let text: Arc<str> = Arc::from(frame.encode().as_str());
                for subscriber in state.subscribers.values() {
                    push_or_mark(subscriber, &text, &mut overflowed);
                }
            }
            if state.is_empty() {
                shard.remove(&key);
            }
            (removed, diff)
        };

        if removed {
            self.remove_routes(tenant, topic, session).await;
            if let Some(buckets) = self.limits.get(tenant).await {
                buckets.channel_closed();
            }
        }
        self.evict_slow(tenant, &overflowed).await;
        if let Some(diff) = leave_diff {
            self.forward_presence(tenant, topic, &diff).await;
        }
        removed
    }

    /// Sweep every remaining registration for a closed session.
    pub async fn session_closed(&self, tenant: &str, session: SessionRef) {
        let mut topics = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().await;
            for (key, state) in guard.iter() {
                if key.tenant == tenant && state.subscribers.contains_key(&session) {
                    topics.push(key.topic.clone());
                }
            }
        }
        for topic in topics {
            self.unsubscribe(tenant, &topic, session).await;
        }
        // Routes may outlive the subscriber map if a join half-failed.
        if let Some(tenant_routes) = self.routes.write().await.get_mut(tenant) {
            for routes in tenant_routes.values_mut() {
                routes.retain(|route| route.session != session);
            }
            tenant_routes.retain(|_, routes| !routes.is_empty());
        }
    }

    /// Fan a broadcast out to local subscribers and forward it to peers.
    /// Returns None when the topic has no local state (a silent no-op).
    pub async fn broadcast(&self, request: BroadcastRequest) -> HubResult<Option<BroadcastOutcome>> {
        let buckets = self
            .limits
            .for_tenant(&request.tenant, &request.quotas)
            .await;
        buckets.check_event()?;
        let payload_bytes = request.payload.to_string().len();
        buckets.check_bytes_in(payload_bytes)?;

        let key = TopicKey {
            tenant: request.tenant.clone(),
            topic: request.topic.clone(),
        };

        // Resolve the access flag without holding the write lock across the
        // authorization round trip.
        let private = {
            let shard = self.shard(&key).read().await;
            match shard.get(&key) {
                Some(state) => state.private,
                None => request.assume_private || self.config.force_private,
            }
        };
        if private {
            let claims = request
                .claims
                .as_deref()
                .ok_or_else(|| HubError::Unauthorized {
                    topic: request.topic.clone(),
                })?;
            let allowed = self
                .authorizer
                .can_write(&request.tenant, &request.topic, claims)
                .await?;
            if !allowed {
                return Err(HubError::Unauthorized {
                    topic: request.topic.clone(),
                });
            }
        }

        let mut overflowed = Vec::new();
        let outcome = {
            let mut shard = self.shard(&key).write().await;
            let Some(state) = shard.get_mut(&key) else {
                // No subscribers here; peers may still have some.
                drop(shard);
                self.forward_broadcast(&request).await;
                return Ok(None);
            };
            state.last_seq += 1;
            let seq = state.last_seq;
            let frame = broadcast_frame(&request.topic, &request.event, &request.payload);
            let text: Arc<str> = Arc::from(frame.encode().as_str());

            let recipients = state
                .subscribers
                .iter()
                .filter(|(session, subscriber)| {
                    Some(**session) != request.sender || subscriber.self_send
                })
                .count();
            buckets.check_bytes_out(text.len() * recipients.max(1))?;

            let mut delivered = 0usize;
            for (session, subscriber) in &state.subscribers {
                if Some(*session) == request.sender && !subscriber.self_send {
                    continue;
                }
                if push_or_mark(subscriber, &text, &mut overflowed) {
                    delivered += 1;
                }
            }
            BroadcastOutcome { seq, delivered }
        };

        self.evict_slow(&request.tenant, &overflowed).await;
        self.forward_broadcast(&request).await;
        metrics::counter!("sluice_broadcasts_total").increment(1);
        metrics::histogram!("sluice_broadcast_fanout").record(outcome.delivered as f64);
        Ok(Some(outcome))
    }

    /// Deliver a broadcast that arrived from a peer node. No limits, no
    /// authorization (the origin enforced both), no further forwarding.
    pub async fn deliver_remote_broadcast(
        &self,
        tenant: &str,
        topic: &str,
        event_name: &str,
        payload: &Value,
    ) -> usize {
        let key = TopicKey {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
        };
        let mut overflowed = Vec::new();
        let delivered = {
            let mut shard = self.shard(&key).write().await;
            let Some(state) = shard.get_mut(&key) else {
                return 0;
            };
            state.last_seq += 1;
            let frame = broadcast_frame(topic, event_name, payload);
            let text: Arc<str> = Arc::from(frame.encode().as_str());
            let mut delivered = 0usize;
            for subscriber in state.subscribers.values() {
                if push_or_mark(subscriber, &text, &mut overflowed) {
                    delivered += 1;
                }
            }
            delivered
        };
        self.evict_slow(tenant, &overflowed).await;
        delivered
    }

    /// Track a presence meta for a joined session and fan the diff out.
    pub async fn track(
        &self,
        tenant: &str,
        topic: &str,
        session: SessionRef,
        payload: Value,
    ) -> HubResult<()> {
        let key = TopicKey {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
        };
        let mut overflowed = Vec::new();
        let diff = {
            let mut shard = self.shard(&key).write().await;
            let state = shard.get_mut(&key).ok_or_else(|| HubError::NotJoined {
                topic: topic.to_string(),
            })?;
            let subscriber = state
                .subscribers
                .get(&session)
                .ok_or_else(|| HubError::NotJoined {
                    topic: topic.to_string(),
                })?;
            let presence_key = subscriber
                .presence_key
                .clone()
                .unwrap_or_else(|| session.to_string());
            let diff = state.presence.track(
                &presence_key,
                Meta {
                    phx_ref: uuid::Uuid::new_v4().to_string(),
                    session,
                    payload,
                },
            );
            let frame = presence_diff_frame(topic, &diff);
            let text: Arc<str> = Arc::from(frame.encode().as_str());
            for subscriber in state.subscribers.values() {
                push_or_mark(subscriber, &text, &mut overflowed);
            }
            diff
        };
        self.evict_slow(tenant, &overflowed).await;
        self.forward_presence(tenant, topic, &diff).await;
        Ok(())
    }

    /// Remove a session's presence metas and fan the leave diff out.
    pub async fn untrack(&self, tenant: &str, topic: &str, session: SessionRef) -> HubResult<()> {
        let key = TopicKey {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
        };
        let mut overflowed = Vec::new();
        let diff = {
            let mut shard = self.shard(&key).write().await;
            let state = shard.get_mut(&key).ok_or_else(|| HubError::NotJoined {
                topic: topic.to_string(),
            })?;
            let Some(diff) = state.presence.untrack_session(session) else {
                return Ok(());
            };
            let frame = presence_diff_frame(topic, &diff);
            let text: Arc<str> = Arc::from(frame.encode().as_str());
            for subscriber in state.subscribers.values() {
                push_or_mark(subscriber, &text, &mut overflowed);
            }
            diff
        };
        self.evict_slow(tenant, &overflowed).await;
        self.forward_presence(tenant, topic, &diff).await;
        Ok(())
    }

    /// Merge a peer's full presence state for one topic, fanning out the join
    /// diff when the merge added refs. Called on cluster membership changes.
    pub async fn merge_remote_presence(&self, tenant: &str, topic: &str, remote_state: &Value) {
        let key = TopicKey {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
        };
        let mut overflowed = Vec::new();
        {
            let mut shard = self.shard(&key).write().await;
            let Some(state) = shard.get_mut(&key) else {
                return;
            };
            if let Some(diff) = state.presence.merge_remote(remote_state) {
                let frame = presence_diff_frame(topic, &diff);
                let text: Arc<str> = Arc::from(frame.encode().as_str());
                for subscriber in state.subscribers.values() {
                    push_or_mark(subscriber, &text, &mut overflowed);
                }
            }
        }
        self.evict_slow(tenant, &overflowed).await;
    }

    /// Apply a presence diff that arrived from a peer node.
    pub async fn deliver_remote_presence(&self, tenant: &str, topic: &str, diff: &Value) {
        let key = TopicKey {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
        };
        let mut overflowed = Vec::new();
        {
            let mut shard = self.shard(&key).write().await;
            let Some(state) = shard.get_mut(&key) else {
                return;
            };
            // Keep the local OR-set in sync before fanning the diff out.
            if let Some(joins) = diff.get("joins") {
                let _ = state.presence.merge_remote(joins);
            }
            if let Some(leaves) = diff.get("leaves") {
                let _ = state.presence.apply_remote_leaves(leaves);
            }
            let frame = presence_diff_frame(topic, diff);
            let text: Arc<str> = Arc::from(frame.encode().as_str());
            for subscriber in state.subscribers.values() {
                push_or_mark(subscriber, &text, &mut overflowed);
            }
            if state.is_empty() {
                shard.remove(&key);
            }
        }
        self.evict_slow(tenant, &overflowed).await;
    }

    /// Full presence snapshots for a tenant, used to seed a joining peer.
    pub async fn presence_snapshots(&self, tenant: &str) -> Vec<(String, Value)> {
        let mut snapshots = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().await;
            for (key, state) in guard.iter() {
                if key.tenant == tenant && !state.presence.is_empty() {
                    snapshots.push((key.topic.clone(), state.presence.state_payload()));
                }
            }
        }
        snapshots
    }

    /// Tenants with any live topic on this node.
    pub async fn active_tenants(&self) -> Vec<String> {
        let mut tenants = HashSet::new();
        for shard in &self.shards {
            let guard = shard.read().await;
            for key in guard.keys() {
                tenants.insert(key.tenant.clone());
            }
        }
        tenants.into_iter().collect()
    }

    /// Deliver a row change to every matching subscriber. Returns the number
    /// of local deliveries; the change is only safe to ack upstream once this
    /// returns. `origin_local` is false for changes relayed from a peer.
    pub async fn emit_cdc(
        &self,
        tenant: &str,
        change: &CdcChange,
        gate: &dyn ColumnGate,
        origin_local: bool,
    ) -> HubResult<usize> {
        let matching: Vec<CdcRoute> = {
            let routes = self.routes.read().await;
            match routes.get(tenant) {
                Some(tenant_routes) => route_keys_for(change)
                    .into_iter()
                    .filter_map(|key| tenant_routes.get(&key))
                    .flatten()
                    .filter(|route| filter_matches(route, change))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        if matching.is_empty() {
            if origin_local {
                self.forward_cdc(tenant, change).await;
            }
            return Ok(0);
        }

        // Resolve column visibility per role before building payloads; the
        // gate may hit the tenant database.
        let mut visibility: HashMap<String, Option<HashSet<String>>> = HashMap::new();
        for route in &matching {
            if !visibility.contains_key(&route.role) {
                let visible = gate
                    .visible_columns(tenant, &route.role, &change.schema, &change.table)
                    .await;
                visibility.insert(route.role.clone(), visible);
            }
        }

        let mut delivered = 0usize;
        let mut overflowed = Vec::new();
        for route in &matching {
            let visible = visibility.get(&route.role).and_then(Option::as_ref);
            let data = change_payload(change, visible);
            let frame = ServerFrame {
                topic: route.topic.clone(),
                event: event::POSTGRES_CHANGES.to_string(),
                payload: json!({"ids": [route.id], "data": data}),
                reference: None,
            };
            match route.handle.push_frame(&frame) {
                Ok(()) => delivered += 1,
                Err(PushError::Overflow) => overflowed.push(route.session),
                Err(PushError::Closed) => {}
            }
        }

        self.evict_slow(tenant, &overflowed).await;
        if origin_local {
            self.forward_cdc(tenant, change).await;
        }
        metrics::counter!("sluice_cdc_deliveries_total").increment(delivered as u64);
        Ok(delivered)
    }

    /// Whether any subscription on this node wants changes for the tenant.
    pub async fn has_cdc_interest(&self, tenant: &str) -> bool {
        self.routes
            .read()
            .await
            .get(tenant)
            .is_some_and(|routes| !routes.is_empty())
    }

    async fn remove_routes(&self, tenant: &str, topic: &str, session: SessionRef) {
        let mut routes = self.routes.write().await;
        if let Some(tenant_routes) = routes.get_mut(tenant) {
            for entries in tenant_routes.values_mut() {
                entries.retain(|route| !(route.session == session && route.topic == topic));
            }
            tenant_routes.retain(|_, entries| !entries.is_empty());
            if tenant_routes.is_empty() {
                routes.remove(tenant);
            }
        }
    }

    /// Force-close slow consumers and scrub their topic registrations.
    async fn evict_slow(&self, tenant: &str, sessions: &[SessionRef]) {
        for session in sessions {
            metrics::counter!("sluice_slow_consumer_closes_total").increment(1);
            tracing::warn!(tenant, session = %session, "closing slow consumer");
        }
        for session in sessions {
            // The gate is shared; mark first so no further frames enqueue.
            for shard in &self.shards {
                let guard = shard.read().await;
                for (key, state) in guard.iter() {
                    if key.tenant == tenant {
                        if let Some(subscriber) = state.subscribers.get(session) {
                            subscriber.handle.gate().force_close(close::SLOW_CONSUMER);
                        }
                    }
                }
            }
            self.session_closed_inner(tenant, *session).await;
        }
    }

    // session_closed without the route sweep recursion guard; evict_slow
    // already holds no locks when calling this.
    async fn session_closed_inner(&self, tenant: &str, session: SessionRef) {
        let mut topics = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().await;
            for (key, state) in guard.iter() {
                if key.tenant == tenant && state.subscribers.contains_key(&session) {
                    topics.push(key.topic.clone());
                }
            }
        }
        for topic in topics {
            let key = TopicKey {
                tenant: tenant.to_string(),
                topic: topic.clone(),
            };
            let leave_diff = {
                let mut shard = self.shard(&key).write().await;
                let Some(state) = shard.get_mut(&key) else {
                    continue;
                };
                state.subscribers.remove(&session);
                let diff = state.presence.untrack_session(session);
                if state.is_empty() {
                    shard.remove(&key);
                }
                diff
            };
            self.remove_routes(tenant, &topic, session).await;
            if let Some(buckets) = self.limits.get(tenant).await {
                buckets.channel_closed();
            }
            if let Some(diff) = leave_diff {
                self.forward_presence(tenant, &topic, &diff).await;
            }
        }
    }

    async fn forward_broadcast(&self, request: &BroadcastRequest) {
        if let Some(remote) = self.remote.read().await.clone() {
            let seq = self.forward_seq.fetch_add(1, Ordering::Relaxed);
            remote.forward_broadcast(
                &request.tenant,
                &request.topic,
                &request.event,
                &request.payload,
                seq,
            );
        }
    }

    async fn forward_presence(&self, tenant: &str, topic: &str, diff: &Value) {
        if let Some(remote) = self.remote.read().await.clone() {
            let seq = self.forward_seq.fetch_add(1, Ordering::Relaxed);
            remote.forward_presence_diff(tenant, topic, diff, seq);
        }
    }

    async fn forward_cdc(&self, tenant: &str, change: &CdcChange) {
        if let Some(remote) = self.remote.read().await.clone() {
            let seq = self.forward_seq.fetch_add(1, Ordering::Relaxed);
            remote.forward_cdc(tenant, change, seq);
        }
    }

    fn shard(&self, key: &TopicKey) -> &RwLock<HashMap<TopicKey, TopicState>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }
}

fn push_or_mark(
    subscriber: &TopicSubscriber,
    text: &Arc<str>,
    overflowed: &mut Vec<SessionRef>,
) -> bool {
    match subscriber.handle.push(text) {
        Ok(()) => true,
        Err(PushError::Overflow) => {
            overflowed.push(subscriber.handle.session());
            false
        }
        Err(PushError::Closed) => false,
    }
}

fn broadcast_frame(topic: &str, event_name: &str, payload: &Value) -> ServerFrame {
    ServerFrame {
        topic: topic.to_string(),
        event: event::BROADCAST.to_string(),
        payload: json!({
            "type": "broadcast",
            "event": event_name,
            "payload": payload,
        }),
        reference: None,
    }
}

fn presence_diff_frame(topic: &str, diff: &Value) -> ServerFrame {
    ServerFrame {
        topic: topic.to_string(),
        event: event::PRESENCE_DIFF.to_string(),
        payload: diff.clone(),
        reference: None,
    }
}

fn route_keys_for(change: &CdcChange) -> [RouteKey; 4] {
    let schema = change.schema.clone();
    let table = change.table.clone();
    [
        RouteKey {
            schema: schema.clone(),
            table: Some(table.clone()),
            op: Some(change.operation),
        },
        RouteKey {
            schema: schema.clone(),
            table: Some(table),
            op: None,
        },
        RouteKey {
            schema: schema.clone(),
            table: None,
            op: Some(change.operation),
        },
        RouteKey {
            schema,
            table: None,
            op: None,
        },
    ]
}

fn filter_matches(route: &CdcRoute, change: &CdcChange) -> bool {
    let Some(filter) = &route.filter else {
        return true;
    };
    // DELETE only carries replica-identity values.
    let record = match change.operation {
        ChangeOp::Delete => &change.old_record,
        _ => &change.record,
    };
    filter.matches(record)
}

fn change_payload(change: &CdcChange, visible: Option<&HashSet<String>>) -> Value {
    let mut data = change.clone();
    if let Some(visible) = visible {
        data.record.retain(|column, _| visible.contains(column));
        data.old_record.retain(|column, _| visible.contains(column));
        data.columns.retain(|column| visible.contains(&column.name));
    }
    json!({
        "schema": data.schema,
        "table": data.table,
        "commit_timestamp": data.commit_timestamp,
        "eventType": data.operation.as_str(),
        "new": data.record,
        "old": data.old_record,
        "columns": data.columns,
        "errors": Value::Null,
    })
}
