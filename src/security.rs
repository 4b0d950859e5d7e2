use crate::models::{ApiEnvelope, ApiErrorBody};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

/// Per-request correlation id, generated at the edge and echoed in the
/// response envelope and the `X-Request-Id` header.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

pub fn request_id_of(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(new_request_id)
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

pub async fn assign_request_id(mut request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(new_request_id);
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, TenantRecord>>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub tenant_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
struct TenantRecord {
    tenant_id: String,
    api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self {
            records: Arc::new(load_keys_from_env()),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            tenant_id: record.tenant_id.clone(),
            api_key_id: record.api_key_id.clone(),
        })
    }

    /// Tenant ids known to the key table; used to seed tenant rows at boot.
    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .values()
            .map(|record| record.tenant_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let request_id = request_id_of(&request);

    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized(
            "MISSING_API_KEY",
            "Provide X-Dropflow-Key or Bearer token",
            request_id,
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized(
            "INVALID_API_KEY",
            "Key not recognized",
            request_id,
        ));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Dropflow-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized(code: &str, message: &str, request_id: String) -> Response {
    let body = ApiEnvelope::<()>::err(ApiErrorBody::new(code, message), request_id);
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

fn load_keys_from_env() -> HashMap<String, TenantRecord> {
    let raw = env::var("DROPFLOW_API_KEYS").unwrap_or_else(|_| "demo-tenant:demo-key".to_string());
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let tenant_id = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (tenant_id, key) {
            (Some(tenant), Some(secret)) => {
                let record = TenantRecord {
                    tenant_id: tenant.to_string(),
                    api_key_id: format!("key-{:02}", idx + 1),
                };
                entries.insert(secret.to_string(), record);
            }
            _ => warn!(
                target = "dropflow.api",
                "ignored malformed DROPFLOW_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "dropflow.api",
            "DROPFLOW_API_KEYS produced no keys; falling back to demo credentials"
        );
        entries.insert(
            "demo-key".to_string(),
            TenantRecord {
                tenant_id: "demo-tenant".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "dropflow.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_wins_over_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret-a"),
        );
        headers.insert("X-Dropflow-Key", HeaderValue::from_static("secret-b"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("secret-a"));
    }

    #[test]
    fn custom_header_is_accepted() {
        let mut headers = http::HeaderMap::new();
        headers.insert("X-Dropflow-Key", HeaderValue::from_static(" secret "));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("secret"));
    }

    #[test]
    fn missing_credentials_yield_none() {
        let headers = http::HeaderMap::new();
        assert_eq!(extract_api_key(&headers), None);
    }
}
