//! Process wiring: shared state, the HTTP router, and the adapters that
//! connect the hub to the cluster layer.
use crate::config::GatewayConfig;
use crate::{http, session};
use axum::Router;
use axum::routing::{get, post};
use serde_json::Value;
use sluice_auth::{AuthorizationStore, JwtVerifier, PolicyConfig, VerifierConfig};
use sluice_cdc::ColumnVisibility;
use sluice_cluster::{ClusterConfig, ClusterRouter, Envelope, EnvelopeHandler};
use sluice_hub::{ChannelHub, HubConfig, RemoteFanout};
use sluice_tenant::{
    ControlStore, RegistryConfig, SupervisorConfig, TenantPoolManager, TenantRegistry,
    TenantSupervisors,
};
use sluice_wire::CdcChange;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<TenantRegistry>,
    pub verifier: Arc<JwtVerifier>,
    pub hub: Arc<ChannelHub>,
    pub supervisors: Arc<TenantSupervisors>,
    pub router: Option<Arc<ClusterRouter>>,
}

/// Build the full dataplane: registry, verifier, authorization, hub,
/// cluster router, and tenant supervisors, wired together.
pub async fn build(
    config: GatewayConfig,
    control_pool: PgPool,
    shutdown: CancellationToken,
) -> anyhow::Result<Arc<AppState>> {
    let config = Arc::new(config);
    let registry = Arc::new(TenantRegistry::new(
        Arc::new(ControlStore::new(control_pool)),
        RegistryConfig::default(),
    ));
    let verifier = Arc::new(JwtVerifier::new(VerifierConfig {
        leeway_secs: 5,
        global_validators: config.jwt_claim_validators.clone(),
    }));
    let pools = Arc::new(TenantPoolManager::new(
        registry.clone(),
        SupervisorConfig::default().pool_size,
    ));
    let authz = Arc::new(AuthorizationStore::new(pools.clone(), PolicyConfig::default()));
    let columns = Arc::new(ColumnVisibility::new(pools.clone(), Duration::from_secs(120)));
    let hub = Arc::new(ChannelHub::new(
        HubConfig {
            force_private: config.secure_channels,
            ..HubConfig::default()
        },
        authz.clone(),
    ));

    let router = config.dns_nodes.as_ref().map(|query| {
        ClusterRouter::new(
            ClusterConfig {
                advertise_addr: config.cluster_advertise.clone(),
                bind_addr: config.cluster_bind,
                dns_query: Some(query.clone()),
                peer_port: config.cluster_bind.port(),
                dns_interval: Duration::from_secs(5),
                rebalance_grace: Duration::from_secs(10),
                dedup_window: Duration::from_secs(10),
            },
            shutdown.clone(),
        )
    });

    let supervisors = TenantSupervisors::new(
        SupervisorConfig::default(),
        registry.clone(),
        pools,
        authz,
        columns,
        hub.clone(),
        router.clone(),
        shutdown.clone(),
    );

    let state = Arc::new(AppState {
        config,
        registry,
        verifier,
        hub: hub.clone(),
        supervisors: supervisors.clone(),
        router: router.clone(),
    });

    if let Some(router) = &router {
        hub.set_remote(Arc::new(ClusterFanout {
            router: router.clone(),
        }))
        .await;
        router
            .start(Arc::new(InboundEnvelopes {
                state: state.clone(),
            }))
            .await
            .map_err(|err| anyhow::anyhow!("cluster start failed: {err}"))?;
        supervisors.spawn_rebalancer();
        spawn_presence_sync(state.clone(), shutdown);
    }

    Ok(state)
}

pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/socket/websocket", get(session::websocket_handler))
        .route("/api/broadcast", post(http::broadcast_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Hub-to-cluster forwarding. Methods are fire-and-forget by contract, so
/// each send runs on its own task.
struct ClusterFanout {
    router: Arc<ClusterRouter>,
}

impl RemoteFanout for ClusterFanout {
    fn forward_broadcast(
        &self,
        tenant: &str,
        topic: &str,
        event: &str,
        payload: &Value,
        origin_seq: u64,
    ) {
        let envelope = Envelope::Broadcast {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
            origin_node: self.router.node_id().to_string(),
            origin_seq,
        };
        let router = self.router.clone();
        tokio::spawn(async move { router.broadcast_envelope(envelope).await });
    }

    fn forward_presence_diff(&self, tenant: &str, topic: &str, diff: &Value, origin_seq: u64) {
        let envelope = Envelope::PresenceDiff {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
            diff: diff.clone(),
            origin_node: self.router.node_id().to_string(),
            origin_seq,
        };
        let router = self.router.clone();
        tokio::spawn(async move { router.broadcast_envelope(envelope).await });
    }

    fn forward_cdc(&self, tenant: &str, change: &CdcChange, origin_seq: u64) {
        let envelope = Envelope::Cdc {
            tenant: tenant.to_string(),
            change: change.clone(),
            origin_node: self.router.node_id().to_string(),
            origin_seq,
        };
        let router = self.router.clone();
        tokio::spawn(async move { router.broadcast_envelope(envelope).await });
    }
}

/// Cluster-to-hub delivery of peer envelopes.
struct InboundEnvelopes {
    state: Arc<AppState>,
}

#[async_trait::async_trait]
impl EnvelopeHandler for InboundEnvelopes {
    async fn handle(&self, envelope: Envelope) {
        match envelope {
            Envelope::Broadcast {
                tenant,
                topic,
                event,
                payload,
                ..
            } => {
                self.state
                    .hub
                    .deliver_remote_broadcast(&tenant, &topic, &event, &payload)
                    .await;
            }
            Envelope::PresenceDiff {
                tenant, topic, diff, ..
            } => {
                self.state
                    .hub
                    .deliver_remote_presence(&tenant, &topic, &diff)
                    .await;
            }
            Envelope::PresenceState {
                tenant,
                topic,
                state,
            } => {
                self.state
                    .hub
                    .merge_remote_presence(&tenant, &topic, &state)
                    .await;
            }
            Envelope::Cdc { tenant, change, .. } => {
                let gate = self.state.supervisors.column_gate().clone();
                if let Err(err) = self
                    .state
                    .hub
                    .emit_cdc(&tenant, &change, gate.as_ref(), false)
                    .await
                {
                    tracing::warn!(tenant, error = %err, "relayed change delivery failed");
                }
            }
            Envelope::TenantInvalidate { tenant } => {
                self.state
                    .supervisors
                    .invalidate(&tenant, &self.state.verifier)
                    .await;
            }
            Envelope::TenantStart { tenant } => {
                if let Err(err) = self.state.supervisors.start_if_needed(&tenant).await {
                    tracing::warn!(tenant, error = %err, "peer-requested tenant start failed");
                }
            }
            Envelope::ReplicatorReady { tenant, node } => {
                self.state.supervisors.replicator_ready(&tenant, &node).await;
            }
            Envelope::Hello { .. } => {}
        }
    }
}

/// On every membership change, offer our presence state to the (possibly
/// new) peers so their OR-sets converge.
fn spawn_presence_sync(state: Arc<AppState>, shutdown: CancellationToken) {
    let Some(router) = state.router.clone() else {
        return;
    };
    let mut epochs = router.watch_epoch();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = epochs.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            for tenant in state.hub.active_tenants().await {
                for (topic, snapshot) in state.hub.presence_snapshots(&tenant).await {
                    router
                        .broadcast_envelope(Envelope::PresenceState {
                            tenant: tenant.clone(),
                            topic,
                            state: snapshot,
                        })
                        .await;
                }
            }
        }
    });
}
