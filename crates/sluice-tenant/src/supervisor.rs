//! Per-tenant lifecycle.
//!
//! A tenant node is started lazily on first use: connect the tenant pool,
//! apply pending tenant-schema migrations, warm the authorization store, and
//! start the CDC replicator when this node owns the tenant. Nodes drain after
//! an idle period or on process shutdown; replicators alone move on cluster
//! rebalance (sessions are node-agnostic, CDC is not).
use crate::pools::TenantPoolManager;
use crate::registry::{Lookup, TenantRegistry};
use crate::{TenantError, TenantResult};
use sluice_auth::AuthorizationStore;
use sluice_cdc::{Backoff, CdcError, ColumnVisibility, Replicator, ReplicatorConfig};
use sluice_cluster::ClusterRouter;
use sluice_common::{CdcSettings, Tenant};
use sluice_hub::ChannelHub;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub pool_size: u32,
    pub idle_shutdown_after: Duration,
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            idle_shutdown_after: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantPhase {
    Starting,
    Ready,
    Draining,
    Stopped,
}

struct ReplicatorChild {
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// One running tenant on this node.
pub struct TenantNode {
    tenant: Arc<Tenant>,
    pool: PgPool,
    gate: CancellationToken,
    sessions: AtomicUsize,
    last_active: StdMutex<Instant>,
    degraded: StdMutex<Option<String>>,
    phase: StdMutex<TenantPhase>,
    replicator: Mutex<Option<ReplicatorChild>>,
}

impl TenantNode {
    pub fn tenant(&self) -> &Arc<Tenant> {
        &self.tenant
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cancelled when the tenant drains; sessions watch it and close with
    /// GOING_AWAY.
    pub fn gate(&self) -> &CancellationToken {
        &self.gate
    }

    pub fn phase(&self) -> TenantPhase {
        *self.phase.lock().expect("phase lock")
    }

    pub fn session_started(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn session_ended(&self) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        *self.last_active.lock().expect("active lock") = Instant::now();
    }

    pub fn degraded(&self) -> Option<String> {
        self.degraded.lock().expect("degraded lock").clone()
    }

    pub fn mark_degraded(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(tenant = %self.tenant.external_id, reason, "tenant degraded");
        *self.degraded.lock().expect("degraded lock") = Some(reason);
    }

    fn idle_since(&self) -> Duration {
        self.last_active.lock().expect("active lock").elapsed()
    }

    fn set_phase(&self, phase: TenantPhase) {
        *self.phase.lock().expect("phase lock") = phase;
    }

    /// Append a broadcast to the tenant's audit table. Only called when the
    /// tenant opted into persistence, and always after fan-out.
    pub async fn persist_broadcast(
        &self,
        topic: &str,
        event: &str,
        payload: &serde_json::Value,
        private: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO realtime.messages (topic, extension, event, payload, private) \
             VALUES ($1, 'broadcast', $2, $3, $4)",
        )
        .bind(topic)
        .bind(event)
        .bind(payload)
        .bind(private)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct TenantSupervisors {
    config: SupervisorConfig,
    registry: Arc<TenantRegistry>,
    pools: Arc<TenantPoolManager>,
    authz: Arc<AuthorizationStore>,
    columns: Arc<ColumnVisibility>,
    hub: Arc<ChannelHub>,
    router: Option<Arc<ClusterRouter>>,
    nodes: RwLock<HashMap<String, Arc<TenantNode>>>,
    starting: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Pending CDC handovers awaiting the new owner's `replicator_ready`.
    handover: Mutex<HashMap<String, Arc<Notify>>>,
    shutdown: CancellationToken,
    me: Weak<Self>,
}

impl TenantSupervisors {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<TenantRegistry>,
        pools: Arc<TenantPoolManager>,
        authz: Arc<AuthorizationStore>,
        columns: Arc<ColumnVisibility>,
        hub: Arc<ChannelHub>,
        router: Option<Arc<ClusterRouter>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            registry,
            pools,
            authz,
            columns,
            hub,
            router,
            nodes: RwLock::new(HashMap::new()),
            starting: Mutex::new(HashMap::new()),
            handover: Mutex::new(HashMap::new()),
            shutdown,
            me: me.clone(),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.me.upgrade().expect("supervisors alive")
    }

    pub fn column_gate(&self) -> &Arc<ColumnVisibility> {
        &self.columns
    }

    /// The running node for a tenant, starting it when absent. Concurrent
    /// callers observe the same instance.
    pub async fn start_if_needed(&self, external_id: &str) -> TenantResult<Arc<TenantNode>> {
        if let Some(node) = self.running(external_id).await {
            return Ok(node);
        }
        let flight = {
            let mut starting = self.starting.lock().await;
            starting
                .entry(external_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;
        if let Some(node) = self.running(external_id).await {
            return Ok(node);
        }

        let tenant = match self.registry.lookup(external_id).await? {
            Lookup::Found(tenant) => tenant,
            Lookup::NotFound => return Err(TenantError::NotFound(external_id.to_string())),
            Lookup::Suspended => return Err(TenantError::Suspended(external_id.to_string())),
        };

        tracing::info!(tenant = external_id, "starting tenant");
        let node = self.start_node(tenant).await?;
        self.nodes
            .write()
            .await
            .insert(external_id.to_string(), node.clone());
        self.starting.lock().await.remove(external_id);
        self.spawn_idle_watcher(external_id.to_string());
        metrics::gauge!("sluice_tenants_running").increment(1.0);
        Ok(node)
    }

    async fn running(&self, external_id: &str) -> Option<Arc<TenantNode>> {
        let nodes = self.nodes.read().await;
        nodes
            .get(external_id)
            .filter(|node| {
                matches!(node.phase(), TenantPhase::Starting | TenantPhase::Ready)
            })
            .cloned()
    }

    // Every start step either succeeds or tears down what came before it.
    async fn start_node(&self, tenant: Arc<Tenant>) -> TenantResult<Arc<TenantNode>> {
        let external_id = tenant.external_id.clone();
        let pool = self.pools.pool_for(&tenant).await?;

        if let Err(err) = migrate_tenant(&pool).await {
            self.pools.close(&external_id).await;
            return Err(TenantError::Unavailable {
                tenant: external_id,
                reason: format!("tenant migrations failed: {err}"),
            });
        }
        if let Err(err) = self.authz.warm(&external_id).await {
            self.pools.close(&external_id).await;
            return Err(TenantError::Unavailable {
                tenant: external_id,
                reason: format!("authorization warm-up failed: {err}"),
            });
        }

        let node = Arc::new(TenantNode {
            tenant: tenant.clone(),
            pool,
            gate: self.shutdown.child_token(),
            sessions: AtomicUsize::new(0),
            last_active: StdMutex::new(Instant::now()),
            degraded: StdMutex::new(None),
            phase: StdMutex::new(TenantPhase::Starting),
            replicator: Mutex::new(None),
        });

        if let Some(settings) = tenant.cdc_settings() {
            if self.owns(&external_id).await {
                self.start_replicator(&node, settings.clone()).await;
            }
        }
        node.set_phase(TenantPhase::Ready);
        Ok(node)
    }

    async fn owns(&self, external_id: &str) -> bool {
        match &self.router {
            Some(router) => router.is_owner(external_id).await,
            None => true,
        }
    }

    async fn start_replicator(&self, node: &Arc<TenantNode>, settings: CdcSettings) {
        let mut slot = node.replicator.lock().await;
        if slot.is_some() {
            return;
        }
        let token = node.gate().child_token();
        let child = spawn_replicator_child(
            node.clone(),
            settings,
            self.hub.clone(),
            self.columns.clone(),
            self.router.clone(),
            token.clone(),
        );
        *slot = Some(ReplicatorChild { token, task: child });
    }

    async fn stop_replicator(&self, node: &Arc<TenantNode>) {
        let child = node.replicator.lock().await.take();
        if let Some(child) = child {
            child.token.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), child.task).await;
        }
    }

    /// A peer announced its replicator for `tenant` is live; release any
    /// handover waiting on it.
    pub async fn replicator_ready(&self, tenant: &str, node: &str) {
        if let Some(router) = &self.router {
            if node == router.node_id() {
                return;
            }
        }
        if let Some(notify) = self.handover.lock().await.remove(tenant) {
            tracing::info!(tenant, new_owner = node, "handover acknowledged");
            notify.notify_waiters();
        }
    }

    /// React to a cluster membership change: stop replicators for tenants we
    /// lost (after the new owner is ready or the grace expires) and start
    /// them for tenants we gained.
    pub async fn rebalance(&self) {
        let Some(router) = self.router.clone() else {
            return;
        };
        let nodes: Vec<(String, Arc<TenantNode>)> = {
            let guard = self.nodes.read().await;
            guard
                .iter()
                .map(|(id, node)| (id.clone(), node.clone()))
                .collect()
        };
        for (external_id, node) in nodes {
            let owns = router.is_owner(&external_id).await;
            let has_replicator = node.replicator.lock().await.is_some();
            let has_cdc = node.tenant.cdc_settings().is_some();
            if owns && !has_replicator && has_cdc {
                let settings = node.tenant.cdc_settings().cloned().expect("cdc settings");
                tracing::info!(tenant = %external_id, "gained CDC ownership");
                self.start_replicator(&node, settings).await;
            } else if !owns && has_replicator {
                tracing::info!(tenant = %external_id, "lost CDC ownership, awaiting handover");
                // The new owner may not have this tenant running yet; ask it
                // to start so its replicator can take over.
                if let Some(owner) = router.owner(&external_id).await {
                    router
                        .send_to(
                            &owner,
                            sluice_cluster::Envelope::TenantStart {
                                tenant: external_id.clone(),
                            },
                        )
                        .await;
                }
                let notify = Arc::new(Notify::new());
                self.handover
                    .lock()
                    .await
                    .insert(external_id.clone(), notify.clone());
                let this = self.strong();
                let grace = router.rebalance_grace();
                tokio::spawn(async move {
                    // Brief duplicate emission is fine; a silent gap is not.
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(grace) => {
                            tracing::warn!(tenant = %external_id, "handover grace expired");
                        }
                    }
                    this.handover.lock().await.remove(&external_id);
                    this.stop_replicator(&node).await;
                });
            }
        }
    }

    /// Watch cluster epochs and rebalance on every change.
    pub fn spawn_rebalancer(&self) {
        let Some(router) = self.router.clone() else {
            return;
        };
        let this = self.strong();
        let shutdown = self.shutdown.clone();
        let mut epochs = router.watch_epoch();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = epochs.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        this.rebalance().await;
                    }
                }
            }
        });
    }

    fn spawn_idle_watcher(&self, external_id: String) {
        let this = self.strong();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(node) = this.running(&external_id).await else {
                    return;
                };
                if node.session_count() == 0
                    && node.idle_since() >= this.config.idle_shutdown_after
                {
                    tracing::info!(tenant = %external_id, "tenant idle, draining");
                    this.drain(&external_id).await;
                    return;
                }
            }
        });
    }

    /// Tear a tenant node down: stop the replicator, close sessions via the
    /// gate, wait out the drain timeout, release the pool.
    pub async fn drain(&self, external_id: &str) {
        let node = {
            let mut nodes = self.nodes.write().await;
            nodes.remove(external_id)
        };
        let Some(node) = node else { return };
        node.set_phase(TenantPhase::Draining);
        self.stop_replicator(&node).await;
        node.gate().cancel();

        let deadline = Instant::now() + self.config.drain_timeout;
        while node.session_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if node.session_count() > 0 {
            tracing::warn!(
                tenant = external_id,
                remaining = node.session_count(),
                "drain timeout expired with sessions still open"
            );
        }
        self.pools.close(external_id).await;
        node.set_phase(TenantPhase::Stopped);
        metrics::gauge!("sluice_tenants_running").decrement(1.0);
        tracing::info!(tenant = external_id, "tenant stopped");
    }

    /// Drain everything. Called on process shutdown.
    pub async fn drain_all(&self) {
        let ids: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        for id in ids {
            self.drain(&id).await;
        }
    }

    /// Full invalidation fan-in for one tenant: registry, token cache,
    /// authorization cache, rate buckets, and column visibility.
    pub async fn invalidate(&self, external_id: &str, verifier: &sluice_auth::JwtVerifier) {
        self.registry.invalidate(external_id).await;
        verifier.invalidate_tenant(external_id).await;
        self.authz.invalidate_tenant(external_id).await;
        self.columns.invalidate_tenant(external_id).await;
        self.hub.limits().invalidate_tenant(external_id).await;
    }
}

// The tenant schema every node expects. Statements are idempotent so a racing
// start on two nodes converges.
async fn migrate_tenant(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("CREATE SCHEMA IF NOT EXISTS realtime")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS realtime.messages (
             id bigserial PRIMARY KEY,
             topic text NOT NULL,
             extension text NOT NULL,
             event text,
             payload jsonb,
             private boolean NOT NULL DEFAULT false,
             inserted_at timestamptz NOT NULL DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS messages_topic_idx ON realtime.messages (topic, inserted_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn spawn_replicator_child(
    node: Arc<TenantNode>,
    settings: CdcSettings,
    hub: Arc<ChannelHub>,
    columns: Arc<ColumnVisibility>,
    router: Option<Arc<ClusterRouter>>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let tenant = node.tenant.external_id.clone();
    tokio::spawn(async move {
        let mut backoff = Backoff::default();
        loop {
            if token.is_cancelled() {
                return;
            }
            let pool = match sluice_cdc::connect(&settings).await {
                Ok(pool) => pool,
                Err(err) => {
                    if is_credential_failure(&err) {
                        node.mark_degraded(format!("replication credentials rejected: {err}"));
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(tenant, error = %err, "replication connect failed");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            backoff.reset();

            let (ready_tx, ready_rx) = oneshot::channel();
            if let Some(router) = router.clone() {
                let tenant = tenant.clone();
                tokio::spawn(async move {
                    if ready_rx.await.is_ok() {
                        router.announce_replicator_ready(&tenant).await;
                    }
                });
            } else {
                drop(ready_rx);
            }

            let replicator = Replicator::new(
                ReplicatorConfig::new(tenant.clone(), settings.clone()),
                pool.clone(),
                hub.clone(),
                columns.clone(),
                token.clone(),
                Some(ready_tx),
            );
            match replicator.run().await {
                Ok(()) => return,
                Err(CdcError::ReplicationLagged) => {
                    // Recreate the slot and accept the gap; it is logged loudly
                    // because rows between the old and new position are gone.
                    tracing::error!(tenant, "replication gap: dropping and recreating slot");
                    metrics::counter!("sluice_cdc_slot_recreations_total").increment(1);
                    if let Err(err) = sluice_cdc::recreate_slot(&pool, &settings.slot_name).await {
                        tracing::error!(tenant, error = %err, "slot recreation failed");
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(tenant, error = %err, "replicator exited, restarting");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    })
}

fn is_credential_failure(err: &CdcError) -> bool {
    if let CdcError::Db(sqlx::Error::Database(db_err)) = err {
        return db_err
            .code()
            .map(|code| code == "28P01" || code == "28000" || code == "3D000")
            .unwrap_or(false);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_contract() {
        let config = SupervisorConfig::default();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.idle_shutdown_after, Duration::from_secs(300));
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn credential_failure_detection_ignores_plain_errors() {
        assert!(!is_credential_failure(&CdcError::ReplicationLagged));
        assert!(!is_credential_failure(&CdcError::Db(
            sqlx::Error::RowNotFound
        )));
    }
}
