//! Tenant record and extension settings shared by the registry, supervisor,
//! and auth layers. Rows live in the control database; these are the validated
//! in-process shapes.
use crate::ValidationErrors;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// An isolated customer namespace: JWT material, quotas, its own database,
/// and extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub external_id: String,
    pub jwt_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_jwks: Option<Value>,
    /// Exact-match claim validators applied after signature checks.
    #[serde(default)]
    pub jwt_claim_validators: HashMap<String, Value>,
    /// Connection settings for the tenant's own database. Every tenant has
    /// one; authorization probes, migrations, and broadcast persistence all
    /// go through it.
    pub db: DbSettings,
    #[serde(default)]
    pub quotas: TenantQuotas,
    #[serde(default)]
    pub suspended: bool,
    /// When set, broadcasts are also appended to the tenant's audit table.
    #[serde(default)]
    pub persist_broadcasts: bool,
    #[serde(default)]
    pub extensions: Vec<Extension>,
}

impl Tenant {
    /// The tenant's CDC settings, if a `postgres_cdc_rls` extension exists.
    pub fn cdc_settings(&self) -> Option<&CdcSettings> {
        self.extensions.iter().find_map(|ext| match &ext.kind {
            ExtensionKind::PostgresCdcRls(settings) => Some(settings),
        })
    }

    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::default();
        if self.external_id.is_empty() {
            errors.push("external_id", "must not be empty");
        }
        if self.external_id.len() > 255 {
            errors.push("external_id", "must be at most 255 characters");
        }
        if self.jwt_secret.is_empty() && self.jwt_jwks.is_none() {
            errors.push("jwt_secret", "either a secret or a JWKS is required");
        }
        self.db.validate_into(&mut errors);
        // At most one CDC extension per tenant.
        let cdc_count = self
            .extensions
            .iter()
            .filter(|ext| matches!(ext.kind, ExtensionKind::PostgresCdcRls(_)))
            .count();
        if cdc_count > 1 {
            errors.push("extensions", "at most one postgres_cdc_rls extension");
        }
        for ext in &self.extensions {
            ext.validate_into(&mut errors);
        }
        self.quotas.validate_into(&mut errors);
        errors
    }
}

/// Address family preference for tenant database connections. Unset lets the
/// system resolver decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

/// Connection settings for a tenant-owned Postgres database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSettings {
    pub db_host: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,
}

impl DbSettings {
    fn validate_into(&self, errors: &mut ValidationErrors) {
        if self.db_host.is_empty() {
            errors.push("db_host", "must not be empty");
        }
        if self.db_name.is_empty() {
            errors.push("db_name", "must not be empty");
        }
        if self.db_user.is_empty() {
            errors.push("db_user", "must not be empty");
        }
    }
}

/// Per-tenant quota configuration with conservative defaults, each field
/// overridable from the tenant row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TenantQuotas {
    pub max_concurrent_clients: u32,
    pub max_events_per_sec: u32,
    pub max_joins_per_sec: u32,
    pub max_bytes_per_sec: u32,
    pub max_channels_per_client: u32,
}

impl Default for TenantQuotas {
    fn default() -> Self {
        Self {
            max_concurrent_clients: 200,
            max_events_per_sec: 500,
            max_joins_per_sec: 100,
            max_bytes_per_sec: 1024 * 1024,
            max_channels_per_client: 100,
        }
    }
}

impl TenantQuotas {
    fn validate_into(&self, errors: &mut ValidationErrors) {
        if self.max_events_per_sec == 0 {
            errors.push("max_events_per_sec", "must be positive");
        }
        if self.max_joins_per_sec == 0 {
            errors.push("max_joins_per_sec", "must be positive");
        }
        if self.max_bytes_per_sec == 0 {
            errors.push("max_bytes_per_sec", "must be positive");
        }
    }
}

/// A tenant extension row. Currently only the CDC extension exists; the enum
/// keeps the decode site explicit about unknown kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionKind {
    PostgresCdcRls(CdcSettings),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    #[serde(flatten)]
    pub kind: ExtensionKind,
}

impl Extension {
    fn validate_into(&self, errors: &mut ValidationErrors) {
        match &self.kind {
            ExtensionKind::PostgresCdcRls(settings) => settings.validate_into(errors),
        }
    }
}

/// Replication settings for a tenant's logical replication feed. The
/// extension carries its own connection block; replication may point at a
/// different host (a replica, a pooler bypass) than the tenant's main
/// database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcSettings {
    #[serde(flatten)]
    pub db: DbSettings,
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    #[serde(default = "default_publication")]
    pub publication: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_max_record_bytes")]
    pub poll_max_record_bytes: u64,
}

fn default_db_port() -> u16 {
    5432
}

fn default_slot_name() -> String {
    "sluice_slot".to_string()
}

fn default_publication() -> String {
    "supabase_realtime".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_poll_max_record_bytes() -> u64 {
    1024 * 1024
}

impl CdcSettings {
    fn validate_into(&self, errors: &mut ValidationErrors) {
        self.db.validate_into(errors);
        if self.poll_interval_ms == 0 {
            errors.push("poll_interval_ms", "must be positive");
        }
        // Slot names double as identifiers in replication SQL.
        if !self
            .slot_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            errors.push("slot_name", "must be lowercase alphanumeric or underscore");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_settings() -> DbSettings {
        DbSettings {
            db_host: "db.internal".into(),
            db_port: 5432,
            db_name: "tenant_db".into(),
            db_user: "sluice".into(),
            db_password: "secret".into(),
            ip_version: None,
        }
    }

    fn cdc_settings() -> CdcSettings {
        CdcSettings {
            db: db_settings(),
            slot_name: "sluice_slot".into(),
            publication: "supabase_realtime".into(),
            poll_interval_ms: 100,
            poll_max_record_bytes: 1024 * 1024,
        }
    }

    fn tenant() -> Tenant {
        Tenant {
            external_id: "acme".into(),
            jwt_secret: "super-secret".into(),
            jwt_jwks: None,
            jwt_claim_validators: HashMap::new(),
            db: db_settings(),
            quotas: TenantQuotas::default(),
            suspended: false,
            persist_broadcasts: false,
            extensions: vec![Extension {
                kind: ExtensionKind::PostgresCdcRls(cdc_settings()),
            }],
        }
    }

    #[test]
    fn valid_tenant_passes() {
        assert!(tenant().validate().is_empty());
    }

    #[test]
    fn tenant_without_extensions_is_valid() {
        let mut t = tenant();
        t.extensions.clear();
        assert!(t.validate().is_empty());
        assert!(t.cdc_settings().is_none());
    }

    #[test]
    fn tenant_requires_id_and_key_material() {
        let mut t = tenant();
        t.external_id.clear();
        t.jwt_secret.clear();
        let errors = tenant_errors(&t);
        assert!(errors.iter().any(|(f, _)| f == "external_id"));
        assert!(errors.iter().any(|(f, _)| f == "jwt_secret"));
    }

    #[test]
    fn tenant_requires_database_settings() {
        let mut t = tenant();
        t.db.db_host.clear();
        t.db.db_user.clear();
        let errors = tenant_errors(&t);
        assert!(errors.iter().any(|(f, _)| f == "db_host"));
        assert!(errors.iter().any(|(f, _)| f == "db_user"));
    }

    #[test]
    fn jwks_substitutes_for_secret() {
        let mut t = tenant();
        t.jwt_secret.clear();
        t.jwt_jwks = Some(json!({"keys": []}));
        assert!(t.validate().is_empty());
    }

    #[test]
    fn at_most_one_cdc_extension() {
        let mut t = tenant();
        t.extensions.push(Extension {
            kind: ExtensionKind::PostgresCdcRls(cdc_settings()),
        });
        let errors = tenant_errors(&t);
        assert!(errors.iter().any(|(f, _)| f == "extensions"));
    }

    #[test]
    fn slot_name_is_restricted() {
        let mut t = tenant();
        if let ExtensionKind::PostgresCdcRls(settings) = &mut t.extensions[0].kind {
            settings.slot_name = "Bad-Name".into();
        }
        let errors = tenant_errors(&t);
        assert!(errors.iter().any(|(f, _)| f == "slot_name"));
    }

    #[test]
    fn cdc_settings_accessor_finds_extension() {
        let t = tenant();
        assert!(t.cdc_settings().is_some());
    }

    #[test]
    fn settings_defaults_apply_on_deserialize() {
        let settings: CdcSettings = serde_json::from_value(json!({
            "db_host": "db",
            "db_name": "x",
            "db_user": "u",
            "db_password": "p"
        }))
        .expect("deserialize");
        assert_eq!(settings.db.db_port, 5432);
        assert!(settings.db.ip_version.is_none());
        assert_eq!(settings.publication, "supabase_realtime");
        assert_eq!(settings.poll_interval_ms, 100);
    }

    #[test]
    fn ip_version_parses_lowercase() {
        let settings: DbSettings = serde_json::from_value(json!({
            "db_host": "db",
            "db_name": "x",
            "db_user": "u",
            "db_password": "p",
            "ip_version": "v6"
        }))
        .expect("deserialize");
        assert_eq!(settings.ip_version, Some(IpVersion::V6));
    }

    fn tenant_errors(t: &Tenant) -> Vec<(String, String)> {
        t.validate().errors
    }
}
