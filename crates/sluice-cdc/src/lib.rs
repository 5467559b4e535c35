// Per-tenant change-data-capture: one logical replication poller per tenant,
// running on the tenant's owner node. The pipeline is decode, transform,
// filter, dispatch, ack; the slot's flush position only advances after every
// matching subscriber enqueue.
use rand::Rng;
use sluice_common::{CdcSettings, DbSettings, IpVersion};
use sluice_hub::{ChannelHub, ColumnGate};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod decode;
pub mod slot;
pub mod transform;

pub use slot::{Lsn, WalEntry};
pub use transform::ColumnVisibility;

pub type CdcResult<T> = std::result::Result<T, CdcError>;

#[derive(thiserror::Error, Debug)]
pub enum CdcError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("bad lsn: {0}")]
    BadLsn(String),
    #[error("invalid identifier: {0}")]
    BadIdentifier(String),
    #[error("bad wal entry: {0}")]
    BadWalEntry(String),
    #[error("replication slot missing: {0}")]
    SlotMissing(String),
    #[error("replication lagged beyond the retained WAL; slot must be recreated")]
    ReplicationLagged,
    #[error("fan-out failed: {0}")]
    Hub(String),
}

/// Jittered exponential backoff for replication connection retries.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Next delay, doubling up to the cap, with up to 50% added jitter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
        delay + Duration::from_millis(jitter_ms)
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub tenant: String,
    pub settings: CdcSettings,
    /// Upper bound on entries per peek; the byte budget applies on top.
    pub batch_limit: i64,
}

impl ReplicatorConfig {
    pub fn new(tenant: impl Into<String>, settings: CdcSettings) -> Self {
        Self {
            tenant: tenant.into(),
            settings,
            batch_limit: 500,
        }
    }
}

/// Build connection options for a tenant database, resolving the host to the
/// requested address family when the settings pin one.
pub async fn connect_options(db: &DbSettings) -> std::io::Result<PgConnectOptions> {
    let mut options = PgConnectOptions::new()
        .host(&db.db_host)
        .port(db.db_port)
        .database(&db.db_name)
        .username(&db.db_user)
        .password(&db.db_password);
    if let Some(ip_version) = db.ip_version {
        let addr = tokio::net::lookup_host((db.db_host.as_str(), db.db_port))
            .await?
            .find(|addr| match ip_version {
                IpVersion::V4 => addr.is_ipv4(),
                IpVersion::V6 => addr.is_ipv6(),
            })
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no {ip_version:?} address for {}", db.db_host),
                )
            })?;
        options = options.host(&addr.ip().to_string());
    }
    Ok(options)
}

/// Connect a small dedicated pool to the tenant's replication database.
pub async fn connect(settings: &CdcSettings) -> CdcResult<PgPool> {
    let options = connect_options(&settings.db)
        .await
        .map_err(|err| CdcError::Db(sqlx::Error::Io(err)))?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Drop and recreate the slot after `ReplicationLagged`. The gap between the
/// old and new positions is lost; the caller logs it.
pub async fn recreate_slot(pool: &PgPool, slot_name: &str) -> CdcResult<()> {
    slot::drop_slot(pool, slot_name).await?;
    slot::ensure_slot(pool, slot_name).await?;
    Ok(())
}

pub struct Replicator {
    config: ReplicatorConfig,
    pool: PgPool,
    hub: Arc<ChannelHub>,
    gate: Arc<dyn ColumnGate>,
    shutdown: CancellationToken,
    ready: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Replicator {
    pub fn new(
        config: ReplicatorConfig,
        pool: PgPool,
        hub: Arc<ChannelHub>,
        gate: Arc<dyn ColumnGate>,
        shutdown: CancellationToken,
        ready: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> Self {
        Self {
            config,
            pool,
            hub,
            gate,
            shutdown,
            ready,
        }
    }

    /// Run until shutdown or an unrecoverable replication gap.
    pub async fn run(mut self) -> CdcResult<()> {
        let tenant = self.config.tenant.clone();
        slot::ensure_publication(&self.pool, &self.config.settings.publication).await?;
        slot::ensure_slot(&self.pool, &self.config.settings.slot_name).await?;
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
        tracing::info!(
            tenant,
            slot = %self.config.settings.slot_name,
            "replicator started"
        );

        let poll_interval = Duration::from_millis(self.config.settings.poll_interval_ms.max(1));
        let mut backoff = Backoff::default();
        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!(tenant, "replicator stopped");
                return Ok(());
            }
            match self.poll_once().await {
                Ok(0) => {
                    if self.wait(poll_interval).await {
                        return Ok(());
                    }
                    backoff.reset();
                }
                Ok(processed) => {
                    metrics::counter!("sluice_cdc_entries_total").increment(processed as u64);
                    backoff.reset();
                }
                Err(CdcError::SlotMissing(slot)) => {
                    tracing::error!(tenant, slot, "replication slot gone");
                    return Err(CdcError::ReplicationLagged);
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(tenant, error = %err, delay_ms = delay.as_millis() as u64, "replication poll failed, backing off");
                    metrics::counter!("sluice_cdc_poll_errors_total").increment(1);
                    if self.wait(delay).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    // True when shutdown fired during the wait.
    async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// One peek/dispatch/ack round. Returns the number of WAL entries
    /// consumed, zero when idle.
    async fn poll_once(&self) -> CdcResult<usize> {
        let entries = slot::peek_changes(
            &self.pool,
            &self.config.settings.slot_name,
            self.batch_limit(),
        )
        .await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let cutoff = budget_cutoff(&entries, self.config.settings.poll_max_record_bytes);
        let mut last_lsn = Lsn::default();
        for entry in &entries[..cutoff] {
            let lsn: Lsn = entry.lsn.parse()?;
            if let Some(change) = decode::decode_entry(lsn.0, &entry.data)? {
                // The enqueue below is the durability boundary; advancing the
                // slot before it would break at-least-once.
                self.hub
                    .emit_cdc(&self.config.tenant, &change, self.gate.as_ref(), true)
                    .await
                    .map_err(|err| CdcError::Hub(err.to_string()))?;
            }
            last_lsn = last_lsn.max(lsn);
        }

        if last_lsn > Lsn::default() {
            slot::advance_slot(&self.pool, &self.config.settings.slot_name, last_lsn).await?;
            metrics::gauge!("sluice_cdc_acked_lsn", "tenant" => self.config.tenant.clone())
                .set(last_lsn.0 as f64);
        }
        Ok(cutoff)
    }

    fn batch_limit(&self) -> i64 {
        self.config.batch_limit.max(1)
    }
}

/// How many leading entries fit the byte budget. Always at least one so a
/// single oversized row cannot wedge the stream.
fn budget_cutoff(entries: &[WalEntry], budget_bytes: u64) -> usize {
    let mut used = 0u64;
    for (index, entry) in entries.iter().enumerate() {
        used += entry.data.len() as u64;
        if used > budget_bytes && index > 0 {
            return index;
        }
    }
    entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: usize) -> WalEntry {
        WalEntry {
            lsn: "0/1".to_string(),
            data: "x".repeat(size),
        }
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(400));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }

    #[test]
    fn budget_cutoff_bounds_batches() {
        let entries = vec![entry(100), entry(100), entry(100)];
        assert_eq!(budget_cutoff(&entries, 1000), 3);
        assert_eq!(budget_cutoff(&entries, 250), 2);
        assert_eq!(budget_cutoff(&entries, 150), 1);
    }

    #[test]
    fn oversized_first_entry_still_passes() {
        let entries = vec![entry(10_000), entry(10)];
        assert_eq!(budget_cutoff(&entries, 100), 1);
    }

    #[test]
    fn empty_batch_has_zero_cutoff() {
        assert_eq!(budget_cutoff(&[], 100), 0);
    }

    fn settings() -> CdcSettings {
        CdcSettings {
            db: DbSettings {
                db_host: "localhost".into(),
                db_port: 5432,
                db_name: "x".into(),
                db_user: "u".into(),
                db_password: "p".into(),
                ip_version: None,
            },
            slot_name: "slot".into(),
            publication: "supabase_realtime".into(),
            poll_interval_ms: 100,
            poll_max_record_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn replicator_config_defaults() {
        let config = ReplicatorConfig::new("acme", settings());
        assert_eq!(config.batch_limit, 500);
        assert_eq!(config.tenant, "acme");
    }

    #[tokio::test]
    async fn connect_options_pin_the_address_family() {
        let mut db = settings().db;
        db.ip_version = Some(IpVersion::V4);
        let options = connect_options(&db).await.expect("resolve");
        assert_eq!(options.get_host(), "127.0.0.1");

        db.ip_version = None;
        let options = connect_options(&db).await.expect("plain");
        assert_eq!(options.get_host(), "localhost");
    }
}
