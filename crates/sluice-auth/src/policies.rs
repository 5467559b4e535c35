//! Topic authorization against the tenant's own database.
//!
//! Access to a private topic is decided by the tenant's row-level-security
//! policies on `realtime.messages`: the session role is set from the JWT's
//! `role` claim, the remaining claims are exposed as `request.jwt.claims`,
//! and the topic under test as `realtime.topic`. A read probe is a `SELECT
//! EXISTS` inside a read-only transaction; a write probe is an INSERT that is
//! always rolled back, because INSERT policies only fire on a write attempt.
//!
//! Decisions are cached per (tenant, topic, role, claims-hash) with a short
//! TTL, sharded by tenant so hot tenants do not contend on one lock.
use crate::{AuthError, AuthResult, Claims};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Source of per-tenant connection pools. Implemented by the tenant
/// supervisor, which owns pool lifecycles.
#[async_trait]
pub trait TenantPools: Send + Sync {
    async fn pool(&self, tenant: &str) -> AuthResult<PgPool>;
}

/// The seam the fan-out engine calls through. Resolved before any topic lock
/// is taken, never under one.
#[async_trait]
pub trait TopicAuthorizer: Send + Sync {
    async fn can_read(&self, tenant: &str, topic: &str, claims: &Claims) -> AuthResult<bool>;
    async fn can_write(&self, tenant: &str, topic: &str, claims: &Claims) -> AuthResult<bool>;
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub cache_ttl: Duration,
    pub cache_shards: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(120),
            cache_shards: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    tenant: String,
    topic: String,
    role: String,
    claims_hash: [u8; 32],
    write: bool,
}

#[derive(Debug, Clone, Copy)]
struct Decision {
    allowed: bool,
    expires_at: Instant,
}

pub struct AuthorizationStore {
    pools: std::sync::Arc<dyn TenantPools>,
    config: PolicyConfig,
    shards: Vec<RwLock<HashMap<DecisionKey, Decision>>>,
}

impl AuthorizationStore {
    pub fn new(pools: std::sync::Arc<dyn TenantPools>, config: PolicyConfig) -> Self {
        let shards = (0..config.cache_shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            pools,
            config,
            shards,
        }
    }

    /// Prime the tenant's pool so the first join does not pay connection
    /// setup latency.
    pub async fn warm(&self, tenant: &str) -> AuthResult<()> {
        let pool = self.pools.pool(tenant).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    /// Drop every cached decision for a tenant.
    pub async fn invalidate_tenant(&self, tenant: &str) {
        for shard in &self.shards {
            shard.write().await.retain(|key, _| key.tenant != tenant);
        }
    }

    async fn check(
        &self,
        tenant: &str,
        topic: &str,
        claims: &Claims,
        write: bool,
    ) -> AuthResult<bool> {
        let key = DecisionKey {
            tenant: tenant.to_string(),
            topic: topic.to_string(),
            role: claims.role.clone(),
            claims_hash: claims_fingerprint(claims),
            write,
        };
        let shard = &self.shards[shard_for(tenant, self.shards.len())];

        {
            let guard = shard.read().await;
            if let Some(decision) = guard.get(&key) {
                if decision.expires_at > Instant::now() {
                    metrics::counter!("sluice_authz_cache_hits_total").increment(1);
                    return Ok(decision.allowed);
                }
            }
        }

        let allowed = if write {
            self.probe_write(tenant, topic, claims).await?
        } else {
            self.probe_read(tenant, topic, claims).await?
        };
        metrics::counter!(
            "sluice_authz_probes_total",
            "kind" => if write { "write" } else { "read" },
            "allowed" => if allowed { "true" } else { "false" },
        )
        .increment(1);

        shard.write().await.insert(
            key,
            Decision {
                allowed,
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
        Ok(allowed)
    }

    async fn probe_read(&self, tenant: &str, topic: &str, claims: &Claims) -> AuthResult<bool> {
        let pool = self.pools.pool(tenant).await?;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        apply_request_context(&mut tx, topic, claims).await?;

        let result = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM realtime.messages \
             WHERE topic = $1 AND extension IN ('broadcast', 'presence'))",
        )
        .bind(topic)
        .fetch_one(&mut *tx)
        .await;
        tx.rollback().await?;

        resolve_probe(result, tenant, topic, "read")
    }

    async fn probe_write(&self, tenant: &str, topic: &str, claims: &Claims) -> AuthResult<bool> {
        let pool = self.pools.pool(tenant).await?;
        let mut tx = pool.begin().await?;
        apply_request_context(&mut tx, topic, claims).await?;

        // The probe row never commits; INSERT policies fire during the
        // attempt, which is all we need.
        let result = sqlx::query(
            "INSERT INTO realtime.messages (topic, extension) VALUES ($1, 'broadcast')",
        )
        .bind(topic)
        .execute(&mut *tx)
        .await
        .map(|_| true);
        tx.rollback().await?;

        resolve_probe(result, tenant, topic, "write")
    }
}

async fn apply_request_context(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    topic: &str,
    claims: &Claims,
) -> AuthResult<()> {
    let claims_json =
        serde_json::to_string(&claims.raw).map_err(|_| AuthError::BadFormat)?;
    sqlx::query(
        "SELECT set_config('role', $1, true), \
                set_config('request.jwt.claims', $2, true), \
                set_config('realtime.topic', $3, true)",
    )
    .bind(&claims.role)
    .bind(claims_json)
    .bind(topic)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn resolve_probe<T>(
    result: Result<T, sqlx::Error>,
    tenant: &str,
    topic: &str,
    kind: &str,
) -> AuthResult<bool>
where
    T: Into<bool>,
{
    match result {
        Ok(value) => Ok(value.into()),
        Err(err) if is_permission_denied(&err) => Ok(false),
        Err(err) if is_missing_relation(&err) => {
            // A tenant without the policies table cannot grant anything.
            tracing::warn!(tenant, topic, kind, error = %err, "policy probe against missing relation");
            Ok(false)
        }
        Err(err) => Err(AuthError::TenantDb(err)),
    }
}

#[async_trait]
impl TopicAuthorizer for AuthorizationStore {
    async fn can_read(&self, tenant: &str, topic: &str, claims: &Claims) -> AuthResult<bool> {
        self.check(tenant, topic, claims, false).await
    }

    async fn can_write(&self, tenant: &str, topic: &str, claims: &Claims) -> AuthResult<bool> {
        self.check(tenant, topic, claims, true).await
    }
}

fn is_permission_denied(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "42501").unwrap_or(false);
    }
    false
}

fn is_missing_relation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err
            .code()
            .map(|code| code == "42P01" || code == "3F000")
            .unwrap_or(false);
    }
    false
}

// The claims map is BTreeMap-backed, so serialization is key-ordered and the
// fingerprint is stable for equal claim sets.
fn claims_fingerprint(claims: &Claims) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(&claims.raw).unwrap_or_default());
    hasher.finalize().into()
}

fn shard_for(tenant: &str, shards: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    tenant.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}
