use crate::guard::{Guard, RateDecision, RateSubject, Verdict};
use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, convert::Infallible, env, net::SocketAddr, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEMO_SELLER_ID: Uuid = Uuid::from_u128(0xa1);
pub const DEMO_ADMIN_ID: Uuid = Uuid::from_u128(0xa2);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Seller,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "USER" => Some(Role::User),
            "SELLER" => Some(Role::Seller),
            "ADMIN" => Some(Role::Admin),
            "SUPER_ADMIN" | "SUPERADMIN" => Some(Role::SuperAdmin),
            _ => None,
        }
    }

    pub fn can_sell(&self) -> bool {
        !matches!(self, Role::User)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }
}

/// The authenticated caller, attached to the request by [`require_principal`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, Principal>>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("MARKET_API_KEYS").unwrap_or_default();
        Self::from_entries(&raw)
    }

    /// Parses `user_uuid:ROLE:secret` entries separated by commas.
    pub fn from_entries(raw: &str) -> Self {
        Self {
            records: Arc::new(load_keys(raw)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<Principal> {
        self.records.get(presented).copied()
    }
}

pub async fn require_principal(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Market-Key or Bearer token",
        ));
    };
    let Some(principal) = state.authenticate(&presented) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Blocker and global rate limit, applied to every request.
pub async fn guard_requests(
    State(guard): State<Guard>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let ip = client_ip(&guard, &request);
    let path = request.uri().path().to_string();
    match guard.admit(&ip, &path).await {
        Verdict::Bypassed => Ok(next.run(request).await),
        Verdict::Allowed(decision) => {
            let mut response = next.run(request).await;
            apply_rate_headers(&decision, response.headers_mut());
            Ok(response)
        }
        Verdict::Limited(decision) => {
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            );
            apply_rate_headers(&decision, response.headers_mut());
            Ok(response)
        }
        Verdict::Blocked { retry_after } => {
            warn!(target = "sokoni.guard", ip = %ip, path = %path, "blocked_request_rejected");
            let mut response = error_response(
                StatusCode::FORBIDDEN,
                "ip_blocked",
                "Too many rate limit violations; try again later",
            );
            if let Some(secs) = retry_after {
                insert_header(response.headers_mut(), http::header::RETRY_AFTER, secs);
            }
            Ok(response)
        }
    }
}

/// Per-seller, per-operation limit on the upload routes. Must run after
/// [`require_principal`].
pub async fn limit_uploads(
    State(guard): State<Guard>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let ip = client_ip(&guard, &request);
    let endpoint = format!(
        "{} {}",
        request.method(),
        request
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str)
            .unwrap_or_else(|| request.uri().path())
    );
    let principal = request.extensions().get::<Principal>().map(|p| p.user_id);
    let decision = guard
        .uploads
        .check(&RateSubject {
            ip: &ip,
            principal,
            endpoint: &endpoint,
        })
        .await;
    if !decision.allowed {
        let mut response = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "upload_rate_limited",
            "Too many upload operations",
        );
        apply_rate_headers(&decision, response.headers_mut());
        return Ok(response);
    }
    Ok(next.run(request).await)
}

/// Socket peer, or the forwarded client when the peer is a trusted proxy.
pub fn client_ip(guard: &Guard, request: &Request<Body>) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let forwarded = request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok());
    guard.client_ip(peer, forwarded)
}

fn apply_rate_headers(decision: &RateDecision, headers: &mut http::HeaderMap) {
    insert_header(headers, "X-RateLimit-Limit", decision.limit);
    insert_header(headers, "X-RateLimit-Remaining", decision.remaining);
    insert_header(headers, "X-RateLimit-Reset", decision.reset_at);
    if let Some(retry) = decision.retry_after {
        insert_header(headers, http::header::RETRY_AFTER, retry);
    }
}

fn insert_header<K: http::header::IntoHeaderName>(headers: &mut http::HeaderMap, name: K, value: u64) {
    headers.insert(
        name,
        HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
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
        .get("X-Market-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

fn load_keys(raw: &str) -> HashMap<String, Principal> {
    let mut entries = HashMap::new();
    for token in raw.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(3, ':');
        let user = parts.next().and_then(|s| Uuid::parse_str(s.trim()).ok());
        let role = parts.next().and_then(Role::parse);
        let secret = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (user, role, secret) {
            (Some(user_id), Some(role), Some(secret)) => {
                entries.insert(secret.to_string(), Principal { user_id, role });
            }
            _ => warn!(
                target = "sokoni.api",
                "ignored malformed MARKET_API_KEYS entry (expected user_uuid:ROLE:secret)"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "sokoni.api",
            "MARKET_API_KEYS produced no keys; falling back to demo credentials"
        );
        entries.insert(
            "demo-seller-key".to_string(),
            Principal {
                user_id: DEMO_SELLER_ID,
                role: Role::Seller,
            },
        );
        entries.insert(
            "demo-admin-key".to_string(),
            Principal {
                user_id: DEMO_ADMIN_ID,
                role: Role::Admin,
            },
        );
    } else {
        info!(
            target = "sokoni.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }
    entries
}
