//! Authoritative tenant lookup: a fetch-through cache over the control
//! database with TTL expiry, a size cap, and per-id single-flight so a miss
//! storm issues one query.
use crate::{RegistryError, RegistryResult};
use async_trait::async_trait;
use serde_json::Value;
use sluice_common::{DbSettings, Extension, IpVersion, Tenant, TenantQuotas};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Result of a tenant lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Found(Arc<Tenant>),
    NotFound,
    Suspended,
}

/// Source of tenant rows. The control database in production; an in-memory
/// map in tests.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn fetch(&self, external_id: &str) -> RegistryResult<Option<Tenant>>;
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            capacity: 1000,
        }
    }
}

struct CacheEntry {
    // None caches a miss; negative entries age out like positive ones.
    tenant: Option<Arc<Tenant>>,
    fetched_at: Instant,
    // Refreshed on every hit so eviction spares hot tenants.
    last_used: Instant,
}

pub struct TenantRegistry {
    store: Arc<dyn TenantStore>,
    config: RegistryConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn TenantStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, external_id: &str) -> RegistryResult<Lookup> {
        if let Some(outcome) = self.cached(external_id).await {
            metrics::counter!("sluice_tenant_cache_hits_total").increment(1);
            return Ok(outcome);
        }

        // Single-flight: one fetch per id, concurrent misses wait on it.
        let flight = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(external_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;
        if let Some(outcome) = self.cached(external_id).await {
            return Ok(outcome);
        }

        metrics::counter!("sluice_tenant_fetches_total").increment(1);
        let fetched = self.store.fetch(external_id).await?.map(Arc::new);
        {
            let mut cache = self.cache.write().await;
            if cache.len() >= self.config.capacity {
                evict_least_recent(&mut cache);
            }
            cache.insert(
                external_id.to_string(),
                CacheEntry {
                    tenant: fetched.clone(),
                    fetched_at: Instant::now(),
                    last_used: Instant::now(),
                },
            );
        }
        self.inflight.lock().await.remove(external_id);
        Ok(to_lookup(fetched))
    }

    /// Drop a cached tenant. Called on control-plane updates arriving over
    /// the cluster channel; the TTL is the safety net when the event is lost.
    pub async fn invalidate(&self, external_id: &str) {
        self.cache.write().await.remove(external_id);
    }

    /// Flush the whole cache; the next lookup per tenant refetches.
    pub async fn refresh_all(&self) {
        self.cache.write().await.clear();
    }

    // Take a write lock so expired entries are dropped and hits refresh the
    // recency stamp.
    async fn cached(&self, external_id: &str) -> Option<Lookup> {
        let mut cache = self.cache.write().await;
        let expired = cache
            .get(external_id)
            .map(|entry| entry.fetched_at.elapsed() >= self.config.ttl)?;
        if expired {
            cache.remove(external_id);
            return None;
        }
        let entry = cache.get_mut(external_id)?;
        entry.last_used = Instant::now();
        Some(to_lookup(entry.tenant.clone()))
    }
}

fn to_lookup(tenant: Option<Arc<Tenant>>) -> Lookup {
    match tenant {
        Some(tenant) if tenant.suspended => Lookup::Suspended,
        Some(tenant) => Lookup::Found(tenant),
        None => Lookup::NotFound,
    }
}

fn evict_least_recent(cache: &mut HashMap<String, CacheEntry>) {
    if let Some(coldest) = cache
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(id, _)| id.clone())
    {
        cache.remove(&coldest);
    }
}

/// Control-database store over the `tenants` and `extensions` tables.
pub struct ControlStore {
    pool: PgPool,
}

impl ControlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct DbTenant {
    external_id: String,
    jwt_secret: String,
    jwt_jwks: Option<Value>,
    jwt_claim_validators: Option<Value>,
    db_host: String,
    db_port: i32,
    db_name: String,
    db_user: String,
    db_password: String,
    db_ip_version: Option<String>,
    max_concurrent_clients: i32,
    max_events_per_sec: i32,
    max_joins_per_sec: i32,
    max_bytes_per_sec: i32,
    max_channels_per_client: i32,
    suspended: bool,
    persist_broadcasts: bool,
}

#[derive(Debug, FromRow)]
struct DbExtension {
    kind: String,
    settings: Value,
}

#[async_trait]
impl TenantStore for ControlStore {
    async fn fetch(&self, external_id: &str) -> RegistryResult<Option<Tenant>> {
        let row = sqlx::query_as::<_, DbTenant>(
            r#"SELECT external_id, jwt_secret, jwt_jwks, jwt_claim_validators,
                      db_host, db_port, db_name, db_user, db_password, db_ip_version,
                      max_concurrent_clients, max_events_per_sec, max_joins_per_sec,
                      max_bytes_per_sec, max_channels_per_client, suspended, persist_broadcasts
               FROM tenants WHERE external_id = $1"#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let extension_rows = sqlx::query_as::<_, DbExtension>(
            "SELECT kind, settings FROM extensions WHERE tenant_external_id = $1",
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;

        let mut extensions = Vec::with_capacity(extension_rows.len());
        for extension in extension_rows {
            match extension.kind.as_str() {
                "postgres_cdc_rls" => {
                    let settings = serde_json::from_value(extension.settings).map_err(|err| {
                        RegistryError::Decode(format!(
                            "tenant {external_id} cdc settings: {err}"
                        ))
                    })?;
                    extensions.push(Extension {
                        kind: sluice_common::ExtensionKind::PostgresCdcRls(settings),
                    });
                }
                other => {
                    tracing::warn!(tenant = external_id, kind = other, "unknown extension kind");
                }
            }
        }

        let jwt_claim_validators = match row.jwt_claim_validators {
            Some(value) => serde_json::from_value(value).map_err(|err| {
                RegistryError::Decode(format!("tenant {external_id} claim validators: {err}"))
            })?,
            None => HashMap::new(),
        };

        let ip_version = match row.db_ip_version.as_deref() {
            Some("v4") => Some(IpVersion::V4),
            Some("v6") => Some(IpVersion::V6),
            Some(other) => {
                tracing::warn!(tenant = external_id, value = other, "unknown db_ip_version");
                None
            }
            None => None,
        };

        Ok(Some(Tenant {
            external_id: row.external_id,
            jwt_secret: row.jwt_secret,
            jwt_jwks: row.jwt_jwks,
            jwt_claim_validators,
            db: DbSettings {
                db_host: row.db_host,
                db_port: row.db_port.clamp(1, u16::MAX as i32) as u16,
                db_name: row.db_name,
                db_user: row.db_user,
                db_password: row.db_password,
                ip_version,
            },
            quotas: TenantQuotas {
                max_concurrent_clients: row.max_concurrent_clients.max(0) as u32,
                max_events_per_sec: row.max_events_per_sec.max(0) as u32,
                max_joins_per_sec: row.max_joins_per_sec.max(0) as u32,
                max_bytes_per_sec: row.max_bytes_per_sec.max(0) as u32,
                max_channels_per_client: row.max_channels_per_client.max(0) as u32,
            },
            suspended: row.suspended,
            persist_broadcasts: row.persist_broadcasts,
            extensions,
        }))
    }
}

/// In-memory store for tests and single-tenant development.
#[derive(Default)]
pub struct MemoryStore {
    tenants: RwLock<HashMap<String, Tenant>>,
    fetch_count: std::sync::atomic::AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, tenant: Tenant) {
        self.tenants
            .write()
            .await
            .insert(tenant.external_id.clone(), tenant);
    }

    pub async fn remove(&self, external_id: &str) {
        self.tenants.write().await.remove(external_id);
    }

    pub fn fetches(&self) -> usize {
        self.fetch_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn fetch(&self, external_id: &str) -> RegistryResult<Option<Tenant>> {
        self.fetch_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(self.tenants.read().await.get(external_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str, suspended: bool) -> Tenant {
        Tenant {
            external_id: id.to_string(),
            jwt_secret: "secret".into(),
            jwt_jwks: None,
            jwt_claim_validators: HashMap::new(),
            db: DbSettings {
                db_host: "db.internal".into(),
                db_port: 5432,
                db_name: "tenant_db".into(),
                db_user: "sluice".into(),
                db_password: "secret".into(),
                ip_version: None,
            },
            quotas: TenantQuotas::default(),
            suspended,
            persist_broadcasts: false,
            extensions: vec![],
        }
    }

    async fn registry_with(tenants: Vec<Tenant>) -> (Arc<MemoryStore>, TenantRegistry) {
        let store = Arc::new(MemoryStore::new());
        for t in tenants {
            store.put(t).await;
        }
        let registry = TenantRegistry::new(store.clone(), RegistryConfig::default());
        (store, registry)
    }

    #[tokio::test]
    async fn lookup_finds_and_caches() {
        let (store, registry) = registry_with(vec![tenant("acme", false)]).await;
        assert!(matches!(
            registry.lookup("acme").await.expect("lookup"),
            Lookup::Found(t) if t.external_id == "acme"
        ));
        registry.lookup("acme").await.expect("lookup");
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn suspended_tenants_are_reported_as_such() {
        let (_store, registry) = registry_with(vec![tenant("frozen", true)]).await;
        assert!(matches!(
            registry.lookup("frozen").await.expect("lookup"),
            Lookup::Suspended
        ));
    }

    #[tokio::test]
    async fn missing_tenants_cache_negatively() {
        let (store, registry) = registry_with(vec![]).await;
        assert!(matches!(
            registry.lookup("ghost").await.expect("lookup"),
            Lookup::NotFound
        ));
        registry.lookup("ghost").await.expect("lookup");
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let (store, registry) = registry_with(vec![tenant("acme", false)]).await;
        registry.lookup("acme").await.expect("lookup");
        registry.invalidate("acme").await;
        registry.lookup("acme").await.expect("lookup");
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn invalidate_observes_store_updates() {
        let (store, registry) = registry_with(vec![tenant("acme", false)]).await;
        registry.lookup("acme").await.expect("lookup");

        store.put(tenant("acme", true)).await;
        registry.invalidate("acme").await;
        assert!(matches!(
            registry.lookup("acme").await.expect("lookup"),
            Lookup::Suspended
        ));
    }

    #[tokio::test]
    async fn concurrent_misses_issue_one_fetch() {
        let (store, registry) = registry_with(vec![tenant("acme", false)]).await;
        let registry = Arc::new(registry);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(
                async move { registry.lookup("acme").await },
            ));
        }
        for task in tasks {
            assert!(matches!(
                task.await.expect("join").expect("lookup"),
                Lookup::Found(_)
            ));
        }
        assert_eq!(store.fetches(), 1);
    }

    #[tokio::test]
    async fn capacity_evicts_the_least_recently_used() {
        let store = Arc::new(MemoryStore::new());
        store.put(tenant("a", false)).await;
        store.put(tenant("b", false)).await;
        store.put(tenant("c", false)).await;
        let registry = TenantRegistry::new(
            store.clone(),
            RegistryConfig {
                ttl: Duration::from_secs(60),
                capacity: 2,
            },
        );
        registry.lookup("a").await.expect("a");
        registry.lookup("b").await.expect("b");
        // Touch "a" so "b" is now the cold entry.
        registry.lookup("a").await.expect("a hit");
        registry.lookup("c").await.expect("c");
        assert!(registry.cache.read().await.len() <= 2);

        // The hot entry survived; the cold one was evicted and refetches.
        registry.lookup("a").await.expect("a hit");
        assert_eq!(store.fetches(), 3);
        registry.lookup("b").await.expect("b refetch");
        assert_eq!(store.fetches(), 4);
    }

    #[tokio::test]
    async fn refresh_all_clears_everything() {
        let (store, registry) = registry_with(vec![tenant("a", false), tenant("b", false)]).await;
        registry.lookup("a").await.expect("a");
        registry.lookup("b").await.expect("b");
        registry.refresh_all().await;
        registry.lookup("a").await.expect("a");
        registry.lookup("b").await.expect("b");
        assert_eq!(store.fetches(), 4);
    }
}
