//! Per-tenant database pools.
//!
//! One bounded pool per tenant, created lazily from the tenant's stored
//! connection settings and shared by the authorization store, the CDC column
//! gate, and broadcast persistence. Waiters queue FIFO on the pool.
use crate::registry::{Lookup, TenantRegistry};
use crate::{TenantError, TenantResult};
use async_trait::async_trait;
use sluice_auth::{AuthError, AuthResult, TenantPools};
use sluice_common::Tenant;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct TenantPoolManager {
    registry: Arc<TenantRegistry>,
    pool_size: u32,
    pools: RwLock<HashMap<String, PgPool>>,
}

impl TenantPoolManager {
    pub fn new(registry: Arc<TenantRegistry>, pool_size: u32) -> Self {
        Self {
            registry,
            pool_size: pool_size.max(1),
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// The tenant's pool, connecting on first use. Every tenant has database
    /// settings; the CDC extension only gates the replicator, never the pool.
    pub async fn pool_for(&self, tenant: &Tenant) -> TenantResult<PgPool> {
        if let Some(pool) = self.pools.read().await.get(&tenant.external_id) {
            return Ok(pool.clone());
        }
        let options = sluice_cdc::connect_options(&tenant.db)
            .await
            .map_err(|err| TenantError::Unavailable {
                tenant: tenant.external_id.clone(),
                reason: format!("tenant database unresolvable: {err}"),
            })?;
        let pool = PgPoolOptions::new()
            .max_connections(self.pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|err| TenantError::Unavailable {
                tenant: tenant.external_id.clone(),
                reason: format!("tenant database unreachable: {err}"),
            })?;

        let mut pools = self.pools.write().await;
        // A racing creator may have won; keep the first pool.
        let entry = pools
            .entry(tenant.external_id.clone())
            .or_insert_with(|| pool.clone());
        Ok(entry.clone())
    }

    /// Close and drop the tenant's pool.
    pub async fn close(&self, external_id: &str) {
        if let Some(pool) = self.pools.write().await.remove(external_id) {
            pool.close().await;
        }
    }
}

#[async_trait]
impl TenantPools for TenantPoolManager {
    async fn pool(&self, external_id: &str) -> AuthResult<PgPool> {
        if let Some(pool) = self.pools.read().await.get(external_id) {
            return Ok(pool.clone());
        }
        let tenant = match self.registry.lookup(external_id).await {
            Ok(Lookup::Found(tenant)) => tenant,
            Ok(Lookup::NotFound) => {
                return Err(AuthError::PoolUnavailable(format!(
                    "tenant not found: {external_id}"
                )));
            }
            Ok(Lookup::Suspended) => {
                return Err(AuthError::PoolUnavailable(format!(
                    "tenant suspended: {external_id}"
                )));
            }
            Err(err) => return Err(AuthError::PoolUnavailable(err.to_string())),
        };
        self.pool_for(&tenant)
            .await
            .map_err(|err| AuthError::PoolUnavailable(err.to_string()))
    }
}
