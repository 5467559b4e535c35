//! Gateway configuration sourced from environment variables.
//!
//! Connection material for the control database is mandatory; everything
//! else defaults for local development. A malformed `JWT_CLAIM_VALIDATORS`
//! is a fatal configuration error, not a warning.
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Control database connection pieces.
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    /// Secret backing signed cookies and gateway-minted material.
    pub secret_key_base: String,
    /// Node basename used in logs and discovery.
    pub app_name: String,
    /// DNS name enumerating cluster peers; unset runs single-node.
    pub dns_nodes: Option<String>,
    /// Force every channel private regardless of join config.
    pub secure_channels: bool,
    /// Process-wide claim validators applied to every tenant.
    pub jwt_claim_validators: HashMap<String, Value>,
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub cluster_bind: SocketAddr,
    /// Address peers dial to reach this node; doubles as node identity.
    pub cluster_advertise: String,
    pub heartbeat_interval: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let db_host = required("DB_HOST")?;
        let db_port = std::env::var("DB_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .context("parse DB_PORT")?;
        let db_user = required("DB_USER")?;
        let db_password = required("DB_PASSWORD")?;
        let db_name = required("DB_NAME")?;
        let secret_key_base = required("SECRET_KEY_BASE")?;

        let app_name = std::env::var("APP_NAME").unwrap_or_else(|_| "sluice".to_string());
        let dns_nodes = std::env::var("DNS_NODES").ok().filter(|v| !v.is_empty());
        let secure_channels = flag("SECURE_CHANNELS");

        // Claim validators arrive as a JSON object of claim -> expected value.
        let jwt_claim_validators = match std::env::var("JWT_CLAIM_VALIDATORS") {
            Ok(raw) => {
                let parsed: Value = serde_json::from_str(&raw)
                    .context("JWT_CLAIM_VALIDATORS is not valid JSON")?;
                match parsed {
                    Value::Object(map) => map.into_iter().collect(),
                    _ => bail!("JWT_CLAIM_VALIDATORS must be a JSON object"),
                }
            }
            Err(_) => HashMap::new(),
        };

        let bind_addr = parse_addr("GATEWAY_BIND", "0.0.0.0:4000")?;
        let metrics_bind = parse_addr("METRICS_BIND", "0.0.0.0:9100")?;
        let cluster_bind = parse_addr("CLUSTER_BIND", "0.0.0.0:7000")?;
        let cluster_advertise = std::env::var("CLUSTER_ADVERTISE")
            .unwrap_or_else(|_| format!("127.0.0.1:{}", cluster_bind.port()));

        let heartbeat_interval = Duration::from_secs(
            std::env::var("HEARTBEAT_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("parse HEARTBEAT_INTERVAL_SECS")?,
        );

        Ok(Self {
            db_host,
            db_port,
            db_user,
            db_password,
            db_name,
            secret_key_base,
            app_name,
            dns_nodes,
            secure_channels,
            jwt_claim_validators,
            bind_addr,
            metrics_bind,
            cluster_bind,
            cluster_advertise,
            heartbeat_interval,
        })
    }

    pub fn control_db_options(&self) -> sqlx::postgres::PgConnectOptions {
        sqlx::postgres::PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .database(&self.db_name)
            .username(&self.db_user)
            .password(&self.db_password)
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var {key}"))
}

fn flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

fn parse_addr(key: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("parse {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env() {
        for key in [
            "DB_HOST",
            "DB_PORT",
            "DB_USER",
            "DB_PASSWORD",
            "DB_NAME",
            "SECRET_KEY_BASE",
            "APP_NAME",
            "DNS_NODES",
            "SECURE_CHANNELS",
            "JWT_CLAIM_VALIDATORS",
            "GATEWAY_BIND",
            "METRICS_BIND",
            "CLUSTER_BIND",
            "CLUSTER_ADVERTISE",
            "HEARTBEAT_INTERVAL_SECS",
        ] {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    fn set_required() {
        unsafe {
            env::set_var("DB_HOST", "localhost");
            env::set_var("DB_USER", "postgres");
            env::set_var("DB_PASSWORD", "postgres");
            env::set_var("DB_NAME", "sluice_control");
            env::set_var("SECRET_KEY_BASE", "dev-secret");
        }
    }

    #[serial]
    #[test]
    fn missing_db_host_is_fatal() {
        clear_env();
        let err = GatewayConfig::from_env().expect_err("missing env");
        assert!(err.to_string().contains("DB_HOST"));
    }

    #[serial]
    #[test]
    fn defaults_apply_when_only_required_set() {
        clear_env();
        set_required();
        let config = GatewayConfig::from_env().expect("config");
        assert_eq!(config.db_port, 5432);
        assert_eq!(config.app_name, "sluice");
        assert!(config.dns_nodes.is_none());
        assert!(!config.secure_channels);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:4000");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.cluster_advertise, "127.0.0.1:7000");
        clear_env();
    }

    #[serial]
    #[test]
    fn claim_validators_parse_as_object() {
        clear_env();
        set_required();
        unsafe {
            env::set_var("JWT_CLAIM_VALIDATORS", r#"{"iss": "sluice", "aud": "clients"}"#);
        }
        let config = GatewayConfig::from_env().expect("config");
        assert_eq!(
            config.jwt_claim_validators.get("iss"),
            Some(&Value::String("sluice".into()))
        );
        clear_env();
    }

    #[serial]
    #[test]
    fn invalid_claim_validators_are_fatal() {
        clear_env();
        set_required();
        unsafe {
            env::set_var("JWT_CLAIM_VALIDATORS", "{nope");
        }
        assert!(GatewayConfig::from_env().is_err());
        unsafe {
            env::set_var("JWT_CLAIM_VALIDATORS", "[1, 2]");
        }
        assert!(GatewayConfig::from_env().is_err());
        clear_env();
    }

    #[serial]
    #[test]
    fn secure_channels_flag_variants() {
        clear_env();
        set_required();
        for value in ["1", "true", "yes"] {
            unsafe {
                env::set_var("SECURE_CHANNELS", value);
            }
            assert!(GatewayConfig::from_env().expect("config").secure_channels);
        }
        unsafe {
            env::set_var("SECURE_CHANNELS", "0");
        }
        assert!(!GatewayConfig::from_env().expect("config").secure_channels);
        clear_env();
    }
}
