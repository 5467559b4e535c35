//! HTTP surface: tenant resolution from request metadata and the broadcast
//! fan-in endpoint.
use crate::app::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sluice_hub::{BroadcastRequest, HubError};
use sluice_tenant::Lookup;
use std::sync::Arc;

/// Tenant selection: the first `Host` label, or the tenant reference carried
/// in the `apikey` token when the host is bare.
pub fn resolve_tenant(headers: &HeaderMap, apikey: Option<&str>) -> Option<String> {
    if let Some(host) = headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok()) {
        if let Some(tenant) = tenant_from_host(host) {
            return Some(tenant);
        }
    }
    apikey.and_then(|token| unverified_claim(token, &["ref", "tid"]))
}

/// `acme.realtime.example.com` → `acme`. A bare host has no tenant.
pub fn tenant_from_host(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let (label, rest) = host.split_once('.')?;
    if label.is_empty() || rest.is_empty() {
        return None;
    }
    Some(label.to_string())
}

/// Read a claim from a token without verifying it. Only used to pick the
/// tenant whose key material the real verification then runs against.
pub fn unverified_claim(token: &str, names: &[&str]) -> Option<String> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    let decoded = jsonwebtoken::decode::<serde_json::Map<String, Value>>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(b"unused"),
        &validation,
    )
    .ok()?;
    names
        .iter()
        .find_map(|name| decoded.claims.get(*name).and_then(Value::as_str))
        .map(str::to_string)
}

pub fn apikey_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("apikey")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
pub struct BroadcastBody {
    pub messages: Vec<BroadcastMessage>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub private: bool,
}

impl BroadcastMessage {
    fn validate(&self) -> Result<(), String> {
        if self.topic.is_empty() {
            return Err("topic must not be empty".to_string());
        }
        if self.event.is_empty() {
            return Err("event must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct MessageError {
    index: usize,
    error: String,
}

/// `POST /api/broadcast` — enqueue messages as an anonymous publisher
/// authenticated by the tenant API key.
pub async fn broadcast_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BroadcastBody>,
) -> Response {
    let Some(apikey) = apikey_from(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing apikey header");
    };
    let Some(external_id) = resolve_tenant(&headers, Some(&apikey)) else {
        return error_response(StatusCode::UNAUTHORIZED, "cannot resolve tenant");
    };

    let tenant = match state.registry.lookup(&external_id).await {
        Ok(Lookup::Found(tenant)) => tenant,
        Ok(Lookup::NotFound) => return error_response(StatusCode::NOT_FOUND, "tenant not found"),
        Ok(Lookup::Suspended) => {
            return error_response(StatusCode::FORBIDDEN, "tenant suspended");
        }
        Err(err) => {
            tracing::error!(tenant = %external_id, error = %err, "tenant lookup failed");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "control database unavailable");
        }
    };
    let claims = match state.verifier.verify(&tenant, &apikey).await {
        Ok(claims) => claims,
        Err(err) => {
            return error_response(StatusCode::UNAUTHORIZED, &format!("invalid apikey: {err}"));
        }
    };
    let node = match state.supervisors.start_if_needed(&external_id).await {
        Ok(node) => node,
        Err(err) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
    };

    let mut errors: Vec<MessageError> = Vec::new();
    for (index, message) in body.messages.iter().enumerate() {
        if let Err(reason) = message.validate() {
            errors.push(MessageError {
                index,
                error: reason,
            });
            continue;
        }
        let result = state
            .hub
            .broadcast(BroadcastRequest {
                tenant: external_id.clone(),
                quotas: tenant.quotas,
                topic: message.topic.clone(),
                event: message.event.clone(),
                payload: message.payload.clone(),
                sender: None,
                claims: Some(claims.clone()),
                assume_private: message.private || state.config.secure_channels,
            })
            .await;
        match result {
            Ok(_) => {
                if tenant.persist_broadcasts {
                    if let Err(err) = node
                        .persist_broadcast(
                            &message.topic,
                            &message.event,
                            &message.payload,
                            message.private,
                        )
                        .await
                    {
                        tracing::warn!(tenant = %external_id, error = %err, "broadcast persistence failed");
                    }
                }
            }
            Err(HubError::RateLimited(limit)) => errors.push(MessageError {
                index,
                error: limit.to_string(),
            }),
            Err(err) => errors.push(MessageError {
                index,
                error: err.to_string(),
            }),
        }
    }

    metrics::counter!("sluice_http_broadcasts_total")
        .increment(body.messages.len() as u64);
    if errors.is_empty() {
        (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
    } else {
        (
            StatusCode::ACCEPTED,
            Json(json!({"status": "partial", "errors": errors})),
        )
            .into_response()
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    fn sign(claims: Value) -> String {
        jsonwebtoken::encode(
            &Header::default(),
            claims.as_object().unwrap(),
            &EncodingKey::from_secret(b"secret"),
        )
        .expect("sign")
    }

    #[test]
    fn host_subdomain_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "acme.realtime.example.com".parse().unwrap());
        assert_eq!(resolve_tenant(&headers, None).as_deref(), Some("acme"));
    }

    #[test]
    fn host_port_is_ignored() {
        assert_eq!(
            tenant_from_host("acme.localhost:4000").as_deref(),
            Some("acme")
        );
    }

    #[test]
    fn bare_host_yields_nothing() {
        assert!(tenant_from_host("localhost").is_none());
        assert!(tenant_from_host("localhost:4000").is_none());
    }

    #[test]
    fn apikey_claim_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "localhost".parse().unwrap());
        let token = sign(json!({"ref": "acme", "exp": 2_000_000_000}));
        assert_eq!(
            resolve_tenant(&headers, Some(&token)).as_deref(),
            Some("acme")
        );
    }

    #[test]
    fn tid_claim_is_second_choice() {
        let token = sign(json!({"tid": "acme"}));
        assert_eq!(
            unverified_claim(&token, &["ref", "tid"]).as_deref(),
            Some("acme")
        );
    }

    #[test]
    fn garbage_apikey_resolves_nothing() {
        assert!(unverified_claim("garbage", &["ref"]).is_none());
    }

    #[test]
    fn message_validation() {
        let good = BroadcastMessage {
            topic: "room:1".into(),
            event: "e".into(),
            payload: json!({}),
            private: false,
        };
        assert!(good.validate().is_ok());
        let bad = BroadcastMessage {
            topic: String::new(),
            event: "e".into(),
            payload: json!({}),
            private: false,
        };
        assert!(bad.validate().is_err());
    }
}
