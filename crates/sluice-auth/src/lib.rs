// Per-tenant authentication and authorization: JWT verification against the
// tenant's stored key material, and topic access policies evaluated on the
// tenant's own database.
use serde_json::Value;

pub mod policies;
pub mod verifier;

pub use policies::{AuthorizationStore, PolicyConfig, TenantPools, TopicAuthorizer};
pub use verifier::{JwtVerifier, VerifierConfig};

pub type AuthResult<T> = std::result::Result<T, AuthError>;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("bad signature")]
    BadSignature,
    #[error("bad token format")]
    BadFormat,
    #[error("claim mismatch: {claim}")]
    ClaimMismatch { claim: String },
    #[error("tenant has no usable key material")]
    MissingKeyMaterial,
    #[error("tenant database error: {0}")]
    TenantDb(#[from] sqlx::Error),
    #[error("tenant pool unavailable: {0}")]
    PoolUnavailable(String),
}

/// Verified claims extracted from a tenant-scoped JWT.
#[derive(Debug, Clone)]
pub struct Claims {
    /// Postgres role the token acts as; `anon` when the claim is absent.
    pub role: String,
    /// Expiry as a unix timestamp.
    pub exp: i64,
    pub raw: serde_json::Map<String, Value>,
}

impl Claims {
    pub fn from_raw(raw: serde_json::Map<String, Value>) -> Self {
        let role = raw
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("anon")
            .to_string();
        let exp = raw.get("exp").and_then(Value::as_i64).unwrap_or(0);
        Self { role, exp, raw }
    }

    pub fn get(&self, claim: &str) -> Option<&Value> {
        self.raw.get(claim)
    }
}
