//! Column visibility for CDC delivery.
//!
//! Before a change reaches a subscriber, columns its role cannot SELECT are
//! stripped. Visibility is computed from `has_column_privilege` on the
//! tenant's database and cached per (tenant, role, schema, table).
use async_trait::async_trait;
use sluice_auth::TenantPools;
use sluice_hub::ColumnGate;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

type VisibilityKey = (String, String, String, String);

pub struct ColumnVisibility {
    pools: Arc<dyn TenantPools>,
    ttl: Duration,
    cache: RwLock<HashMap<VisibilityKey, (Instant, HashSet<String>)>>,
}

impl ColumnVisibility {
    pub fn new(pools: Arc<dyn TenantPools>, ttl: Duration) -> Self {
        Self {
            pools,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn invalidate_tenant(&self, tenant: &str) {
        self.cache
            .write()
            .await
            .retain(|(cached_tenant, _, _, _), _| cached_tenant != tenant);
    }

    async fn query_visible(
        &self,
        tenant: &str,
        role: &str,
        schema: &str,
        table: &str,
    ) -> Result<HashSet<String>, sluice_auth::AuthError> {
        let pool = self.pools.pool(tenant).await?;
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = $2 AND table_name = $3 \
               AND has_column_privilege($1, \
                   quote_ident(table_schema) || '.' || quote_ident(table_name), \
                   column_name, 'SELECT')",
        )
        .bind(role)
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;
        Ok(names.into_iter().collect())
    }
}

#[async_trait]
impl ColumnGate for ColumnVisibility {
    async fn visible_columns(
        &self,
        tenant: &str,
        role: &str,
        schema: &str,
        table: &str,
    ) -> Option<HashSet<String>> {
        let key = (
            tenant.to_string(),
            role.to_string(),
            schema.to_string(),
            table.to_string(),
        );
        {
            let guard = self.cache.read().await;
            if let Some((fetched_at, columns)) = guard.get(&key) {
                if fetched_at.elapsed() < self.ttl {
                    return Some(columns.clone());
                }
            }
        }

        let columns = match self.query_visible(tenant, role, schema, table).await {
            Ok(columns) => columns,
            Err(err) => {
                // Fail closed: an unknown grant set must not leak columns.
                tracing::warn!(tenant, role, schema, table, error = %err, "column visibility lookup failed");
                HashSet::new()
            }
        };
        self.cache
            .write()
            .await
            .insert(key, (Instant::now(), columns.clone()));
        Some(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_auth::{AuthError, AuthResult};

    struct NoPools;

    #[async_trait]
    impl TenantPools for NoPools {
        async fn pool(&self, tenant: &str) -> AuthResult<sqlx::PgPool> {
            Err(AuthError::PoolUnavailable(tenant.to_string()))
        }
    }

    #[tokio::test]
    async fn lookup_failure_fails_closed() {
        let visibility = ColumnVisibility::new(Arc::new(NoPools), Duration::from_secs(60));
        let columns = visibility
            .visible_columns("acme", "anon", "public", "todos")
            .await
            .expect("always a set");
        assert!(columns.is_empty());
    }

    #[tokio::test]
    async fn failed_lookup_is_cached_until_ttl() {
        let visibility = ColumnVisibility::new(Arc::new(NoPools), Duration::from_secs(60));
        visibility
            .visible_columns("acme", "anon", "public", "todos")
            .await;
        assert_eq!(visibility.cache.read().await.len(), 1);

        visibility.invalidate_tenant("acme").await;
        assert!(visibility.cache.read().await.is_empty());
    }
}
