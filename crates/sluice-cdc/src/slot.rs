//! Replication slot and publication plumbing.
//!
//! The slot is consumed with peek + explicit advance rather than the
//! destructive `get_changes`: the flush position only moves after every
//! matching subscriber enqueue, which is the at-least-once boundary.
use crate::{CdcError, CdcResult};
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;

/// A WAL position. Printed and parsed in the usual `X/Y` hex form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Lsn(pub u64);

impl FromStr for Lsn {
    type Err = CdcError;

    fn from_str(input: &str) -> CdcResult<Self> {
        let (high, low) = input
            .split_once('/')
            .ok_or_else(|| CdcError::BadLsn(input.to_string()))?;
        let high = u64::from_str_radix(high, 16).map_err(|_| CdcError::BadLsn(input.into()))?;
        let low = u64::from_str_radix(low, 16).map_err(|_| CdcError::BadLsn(input.into()))?;
        if high > u32::MAX as u64 || low > u32::MAX as u64 {
            return Err(CdcError::BadLsn(input.to_string()));
        }
        Ok(Lsn((high << 32) | low))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Create the publication if it does not exist yet.
pub async fn ensure_publication(pool: &PgPool, publication: &str) -> CdcResult<()> {
    let name = quoted_identifier(publication)?;
    let result = sqlx::query(&format!("CREATE PUBLICATION {name} FOR ALL TABLES"))
        .execute(pool)
        .await;
    match result {
        Ok(_) => {
            tracing::info!(publication, "created publication");
            Ok(())
        }
        Err(err) if is_duplicate_object(&err) => Ok(()),
        Err(err) => Err(CdcError::Db(err)),
    }
}

/// Create the logical slot if it does not exist yet. Returns true when the
/// slot was newly created.
pub async fn ensure_slot(pool: &PgPool, slot: &str) -> CdcResult<bool> {
    let result = sqlx::query("SELECT pg_create_logical_replication_slot($1, 'wal2json')")
        .bind(slot)
        .execute(pool)
        .await;
    match result {
        Ok(_) => {
            tracing::info!(slot, "created replication slot");
            Ok(true)
        }
        Err(err) if is_duplicate_object(&err) => Ok(false),
        Err(err) => Err(CdcError::Db(err)),
    }
}

pub async fn drop_slot(pool: &PgPool, slot: &str) -> CdcResult<()> {
    let result = sqlx::query("SELECT pg_drop_replication_slot($1)")
        .bind(slot)
        .execute(pool)
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_undefined_object(&err) => Ok(()),
        Err(err) => Err(CdcError::Db(err)),
    }
}

/// One peeked WAL entry: its position and the wal2json payload.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WalEntry {
    pub lsn: String,
    pub data: String,
}

/// Read up to `limit` pending changes without consuming them.
pub async fn peek_changes(pool: &PgPool, slot: &str, limit: i64) -> CdcResult<Vec<WalEntry>> {
    let result = sqlx::query_as::<_, WalEntry>(
        "SELECT lsn::text AS lsn, data \
         FROM pg_logical_slot_peek_changes($1, NULL, $2, \
              'format-version', '2', 'include-timestamp', '1')",
    )
    .bind(slot)
    .bind(limit)
    .fetch_all(pool)
    .await;
    match result {
        Ok(entries) => Ok(entries),
        Err(err) if is_undefined_object(&err) => Err(CdcError::SlotMissing(slot.to_string())),
        Err(err) => Err(CdcError::Db(err)),
    }
}

/// Move the slot's confirmed flush position forward.
pub async fn advance_slot(pool: &PgPool, slot: &str, lsn: Lsn) -> CdcResult<()> {
    let result = sqlx::query("SELECT pg_replication_slot_advance($1, $2::pg_lsn)")
        .bind(slot)
        .bind(lsn.to_string())
        .execute(pool)
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_undefined_object(&err) => Err(CdcError::SlotMissing(slot.to_string())),
        Err(err) => Err(CdcError::Db(err)),
    }
}

pub async fn confirmed_flush_lsn(pool: &PgPool, slot: &str) -> CdcResult<Option<Lsn>> {
    let value: Option<String> = sqlx::query_scalar(
        "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
    )
    .bind(slot)
    .fetch_optional(pool)
    .await?;
    value.map(|text| text.parse()).transpose()
}

// Publication names reach the statement text, so only identifier characters
// are accepted; everything else is a validation failure, not an escape.
fn quoted_identifier(name: &str) -> CdcResult<String> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return Err(CdcError::BadIdentifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

fn is_duplicate_object(err: &sqlx::Error) -> bool {
    has_code(err, &["42710", "42P07"])
}

fn is_undefined_object(err: &sqlx::Error) -> bool {
    has_code(err, &["42704"])
}

fn has_code(err: &sqlx::Error, codes: &[&str]) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err
            .code()
            .map(|code| codes.contains(&code.as_ref()))
            .unwrap_or(false);
    }
    false
}
