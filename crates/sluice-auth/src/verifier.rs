//! Tenant-scoped JWT verification.
//!
//! HS256 tokens verify against the tenant's stored secret; asymmetric tokens
//! verify against the tenant's stored JWKS, selected by `kid` when the header
//! carries one. After the signature, expiry, and not-before checks, every
//! configured claim validator must match the decoded claim exactly.
use crate::{AuthError, AuthResult, Claims};
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sluice_common::Tenant;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Clock skew tolerance for exp/nbf, in seconds.
    pub leeway_secs: u64,
    /// Process-wide validators applied to every tenant, parsed at boot.
    pub global_validators: HashMap<String, Value>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            leeway_secs: 5,
            global_validators: HashMap::new(),
        }
    }
}

#[derive(Clone)]
struct CachedToken {
    claims: Arc<Claims>,
    // Unix seconds; mirrors the token's own exp.
    expires_at: i64,
}

type TokenKey = (String, [u8; 32]);

/// Verifies tokens and caches successful results until token expiry.
pub struct JwtVerifier {
    config: VerifierConfig,
    cache: RwLock<HashMap<TokenKey, CachedToken>>,
}

impl JwtVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn verify(&self, tenant: &Tenant, token: &str) -> AuthResult<Arc<Claims>> {
        let key = (tenant.external_id.clone(), token_hash(token));
        let now = now_epoch_seconds();

        // Take a write lock so expired entries can be dropped on read.
        {
            let mut guard = self.cache.write().await;
            if let Some(entry) = guard.get(&key) {
                if entry.expires_at > now {
                    metrics::counter!("sluice_jwt_cache_hits_total").increment(1);
                    return Ok(entry.claims.clone());
                }
                guard.remove(&key);
            }
        }

        let claims = Arc::new(self.verify_uncached(tenant, token)?);
        metrics::counter!("sluice_jwt_verifications_total").increment(1);
        self.cache.write().await.insert(
            key,
            CachedToken {
                claims: claims.clone(),
                expires_at: claims.exp,
            },
        );
        Ok(claims)
    }

    /// Drop every cached token for a tenant. Called on tenant invalidation so
    /// rotated secrets take effect immediately.
    pub async fn invalidate_tenant(&self, external_id: &str) {
        self.cache
            .write()
            .await
            .retain(|(tenant, _), _| tenant != external_id);
    }

    fn verify_uncached(&self, tenant: &Tenant, token: &str) -> AuthResult<Claims> {
        let header = jsonwebtoken::decode_header(token).map_err(|_| AuthError::BadFormat)?;

        let decoding_key = match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                if tenant.jwt_secret.is_empty() {
                    return Err(AuthError::MissingKeyMaterial);
                }
                DecodingKey::from_secret(tenant.jwt_secret.as_bytes())
            }
            _ => decoding_key_from_jwks(tenant, header.kid.as_deref())?,
        };

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.leeway_secs;
        validation.validate_nbf = true;
        validation.validate_aud = false;

        let decoded = jsonwebtoken::decode::<serde_json::Map<String, Value>>(
            token,
            &decoding_key,
            &validation,
        )
        .map_err(map_jwt_error)?;

        let claims = Claims::from_raw(decoded.claims);
        self.check_validators(&self.config.global_validators, &claims)?;
        self.check_validators(&tenant.jwt_claim_validators, &claims)?;
        Ok(claims)
    }

    fn check_validators(
        &self,
        validators: &HashMap<String, Value>,
        claims: &Claims,
    ) -> AuthResult<()> {
        for (claim, expected) in validators {
            if claims.get(claim) != Some(expected) {
                return Err(AuthError::ClaimMismatch {
                    claim: claim.clone(),
                });
            }
        }
        Ok(())
    }
}

// The JWKS is stored as raw JSON on the tenant row; decode per verification.
// Misses are rare because successful verifications are cached by token hash.
fn decoding_key_from_jwks(tenant: &Tenant, kid: Option<&str>) -> AuthResult<DecodingKey> {
    let jwks = tenant.jwt_jwks.as_ref().ok_or(AuthError::MissingKeyMaterial)?;
    let set: JwkSet =
        serde_json::from_value(jwks.clone()).map_err(|_| AuthError::MissingKeyMaterial)?;
    let jwk: &Jwk = match kid {
        Some(kid) => set
            .keys
            .iter()
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid)),
        None => set.keys.first(),
    }
    .ok_or(AuthError::MissingKeyMaterial)?;
    DecodingKey::from_jwk(jwk).map_err(|_| AuthError::MissingKeyMaterial)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::BadSignature,
        ErrorKind::InvalidToken
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthError::BadFormat,
        _ => AuthError::BadSignature,
    }
}

fn token_hash(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
