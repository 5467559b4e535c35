//! Per-tenant token buckets, one per resource class.
//!
//! Refill rates come from the tenant's quota row. Buckets are built lazily on
//! first use and dropped on tenant invalidation so quota changes take effect
//! within one registry TTL.
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use sluice_common::TenantQuotas;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Joins,
    Events,
    BytesIn,
    BytesOut,
    ChannelsOpen,
    ClientsConnected,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Joins => "joins",
            Resource::Events => "events",
            Resource::BytesIn => "bytes_in",
            Resource::BytesOut => "bytes_out",
            Resource::ChannelsOpen => "channels_open",
            Resource::ClientsConnected => "clients_connected",
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("rate limited: {resource}", resource = resource.as_str())]
pub struct LimitExceeded {
    pub resource: Resource,
}

/// Token buckets and concurrency counters for one tenant.
pub struct TenantBuckets {
    joins: Bucket,
    events: Bucket,
    bytes_in: Bucket,
    bytes_out: Bucket,
    channels_open: AtomicU32,
    clients: AtomicU32,
    max_channels: u32,
    max_clients: u32,
}

impl TenantBuckets {
    fn new(quotas: &TenantQuotas) -> Self {
        Self {
            joins: bucket(quotas.max_joins_per_sec),
            events: bucket(quotas.max_events_per_sec),
            bytes_in: bucket(quotas.max_bytes_per_sec),
            bytes_out: bucket(quotas.max_bytes_per_sec),
            channels_open: AtomicU32::new(0),
            clients: AtomicU32::new(0),
            max_channels: quotas.max_channels_per_client,
            max_clients: quotas.max_concurrent_clients,
        }
    }

    pub fn check_join(&self) -> Result<(), LimitExceeded> {
        self.joins.check().map_err(|_| exceeded(Resource::Joins))
    }

    pub fn check_event(&self) -> Result<(), LimitExceeded> {
        self.events.check().map_err(|_| exceeded(Resource::Events))
    }

    pub fn check_bytes_in(&self, bytes: usize) -> Result<(), LimitExceeded> {
        check_bytes(&self.bytes_in, bytes, Resource::BytesIn)
    }

    pub fn check_bytes_out(&self, bytes: usize) -> Result<(), LimitExceeded> {
        check_bytes(&self.bytes_out, bytes, Resource::BytesOut)
    }

    /// Per-client open-channel ceiling; `opened` is that client's count.
    pub fn check_channels(&self, opened: u32) -> Result<(), LimitExceeded> {
        if opened >= self.max_channels {
            return Err(exceeded(Resource::ChannelsOpen));
        }
        self.channels_open.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn channel_closed(&self) {
        decrement(&self.channels_open);
    }

    pub fn client_connected(&self) -> Result<(), LimitExceeded> {
        // Optimistic add; revert when the ceiling was already reached.
        let previous = self.clients.fetch_add(1, Ordering::Relaxed);
        if previous >= self.max_clients {
            decrement(&self.clients);
            return Err(exceeded(Resource::ClientsConnected));
        }
        Ok(())
    }

    pub fn client_disconnected(&self) {
        decrement(&self.clients);
    }

    pub fn channels_open(&self) -> u32 {
        self.channels_open.load(Ordering::Relaxed)
    }
}

fn decrement(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        current.checked_sub(1)
    });
}

fn bucket(per_second: u32) -> Bucket {
    let rate = NonZeroU32::new(per_second.max(1)).expect("nonzero rate");
    RateLimiter::direct(Quota::per_second(rate))
}

fn check_bytes(bucket: &Bucket, bytes: usize, resource: Resource) -> Result<(), LimitExceeded> {
    let Ok(amount) = u32::try_from(bytes.max(1)) else {
        return Err(exceeded(resource));
    };
    let Some(amount) = NonZeroU32::new(amount) else {
        return Ok(());
    };
    match bucket.check_n(amount) {
        Ok(Ok(())) => Ok(()),
        // Either over the current budget or larger than the bucket itself.
        Ok(Err(_)) | Err(_) => Err(exceeded(resource)),
    }
}

fn exceeded(resource: Resource) -> LimitExceeded {
    metrics::counter!("sluice_rate_limited_total", "resource" => resource.as_str()).increment(1);
    LimitExceeded { resource }
}

/// Process-wide bucket registry keyed by tenant.
#[derive(Default)]
pub struct RateLimits {
    tenants: RwLock<HashMap<String, Arc<TenantBuckets>>>,
}

impl RateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn for_tenant(&self, tenant: &str, quotas: &TenantQuotas) -> Arc<TenantBuckets> {
        if let Some(buckets) = self.tenants.read().await.get(tenant) {
            return buckets.clone();
        }
        let mut guard = self.tenants.write().await;
        guard
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(TenantBuckets::new(quotas)))
            .clone()
    }

    /// Existing buckets for a tenant, if any were built.
    pub async fn get(&self, tenant: &str) -> Option<Arc<TenantBuckets>> {
        self.tenants.read().await.get(tenant).cloned()
    }

    /// Drop a tenant's buckets so the next use rebuilds them from fresh
    /// quotas.
    pub async fn invalidate_tenant(&self, tenant: &str) {
        self.tenants.write().await.remove(tenant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quotas() -> TenantQuotas {
        TenantQuotas {
            max_concurrent_clients: 2,
            max_events_per_sec: 5,
            max_joins_per_sec: 2,
            max_bytes_per_sec: 1024,
            max_channels_per_client: 3,
        }
    }

    #[test]
    fn joins_exhaust_at_quota() {
        let buckets = TenantBuckets::new(&quotas());
        assert!(buckets.check_join().is_ok());
        assert!(buckets.check_join().is_ok());
        let err = buckets.check_join().expect_err("limited");
        assert_eq!(err.resource, Resource::Joins);
    }

    #[test]
    fn bytes_larger_than_bucket_are_rejected() {
        let buckets = TenantBuckets::new(&quotas());
        assert!(buckets.check_bytes_in(512).is_ok());
        let err = buckets.check_bytes_in(1_000_000).expect_err("limited");
        assert_eq!(err.resource, Resource::BytesIn);
    }

    #[test]
    fn zero_byte_payload_is_still_metered() {
        let buckets = TenantBuckets::new(&quotas());
        assert!(buckets.check_bytes_out(0).is_ok());
    }

    #[test]
    fn channel_ceiling_is_per_client() {
        let buckets = TenantBuckets::new(&quotas());
        for opened in 0..3 {
            assert!(buckets.check_channels(opened).is_ok());
        }
        let err = buckets.check_channels(3).expect_err("limited");
        assert_eq!(err.resource, Resource::ChannelsOpen);
        assert_eq!(buckets.channels_open(), 3);
        buckets.channel_closed();
        assert_eq!(buckets.channels_open(), 2);
    }

    #[test]
    fn client_ceiling_reverts_on_overflow() {
        let buckets = TenantBuckets::new(&quotas());
        assert!(buckets.client_connected().is_ok());
        assert!(buckets.client_connected().is_ok());
        assert!(buckets.client_connected().is_err());
        buckets.client_disconnected();
        assert!(buckets.client_connected().is_ok());
    }

    #[test]
    fn decrement_never_underflows() {
        let buckets = TenantBuckets::new(&quotas());
        buckets.channel_closed();
        assert_eq!(buckets.channels_open(), 0);
    }

    #[tokio::test]
    async fn registry_reuses_and_invalidates() {
        let limits = RateLimits::new();
        let q = quotas();
        let first = limits.for_tenant("acme", &q).await;
        let again = limits.for_tenant("acme", &q).await;
        assert!(Arc::ptr_eq(&first, &again));

        limits.invalidate_tenant("acme").await;
        let rebuilt = limits.for_tenant("acme", &q).await;
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }
}
