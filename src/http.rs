//! HTTP surface: shared state, forwarded-request extraction and the router.

use std::sync::Arc;

use axum::{
    Router,
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
    response::IntoResponse,
    routing::get,
};
use tower_cookies::CookieManagerLayer;
use tower_http::trace::TraceLayer;

use crate::{
    auth::{sso, token::TokenCache},
    authz::OverlayCache,
    directory::Directory,
    observability,
    policy::PolicyStore,
    session::SessionStore,
};

// Headers exchanged with the data plane. The compiler's verify subroute is
// the sole setter of the forwarded set; `X-Vigil-Loop` is stamped on every
// request re-entering the verify hop.
pub const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
pub const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
pub const X_FORWARDED_PATH: &str = "X-Forwarded-Path";
pub const X_FORWARDED_QUERY: &str = "X-Forwarded-Query";
pub const X_FORWARDED_METHOD: &str = "X-Forwarded-Method";
pub const X_FORWARDED_URI: &str = "X-Forwarded-Uri";
pub const X_VIGIL_ROUTE_ID: &str = "X-Vigil-Route-Id";
pub const X_VIGIL_USER_ID: &str = "X-Vigil-User-Id";
pub const X_VIGIL_LOOP: &str = "X-Vigil-Loop";
pub const X_VIGIL_DYNAMIC_BACKEND_URL: &str = "X-Vigil-Dynamic-Backend-Url";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<PolicyStore>,
    pub directory: Arc<dyn Directory>,
    pub sessions: Arc<dyn SessionStore>,
    pub http: reqwest::Client,
    pub overlays: Arc<OverlayCache>,
    pub tokens: Arc<TokenCache>,
}

impl AppState {
    pub fn new(
        policy: Arc<PolicyStore>,
        directory: Arc<dyn Directory>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            policy,
            directory,
            sessions,
            http: reqwest::Client::new(),
            overlays: Arc::new(OverlayCache::new()),
            tokens: Arc::new(TokenCache::new()),
        }
    }

    /// Session cookies are marked `Secure` when the control plane itself is
    /// reached over https.
    pub fn secure_cookies(&self) -> bool {
        self.policy
            .snapshot()
            .config
            .service_url
            .starts_with("https://")
    }
}

/// The original request's coordinates as forwarded by the data plane.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardedRequest {
    pub protocol: String,
    pub host: String,
    pub path: String,
    pub query: String,
    pub method: String,
    pub uri: String,
    pub route_id: Option<String>,
}

impl ForwardedRequest {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| -> Option<String> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            protocol: text(X_FORWARDED_PROTO).unwrap_or_else(|| "http".into()),
            host: text(X_FORWARDED_HOST).unwrap_or_default(),
            path: text(X_FORWARDED_PATH).unwrap_or_else(|| "/".into()),
            query: text(X_FORWARDED_QUERY).unwrap_or_default(),
            method: text(X_FORWARDED_METHOD).unwrap_or_else(|| "GET".into()),
            uri: text(X_FORWARDED_URI).unwrap_or_else(|| "/".into()),
            route_id: text(X_VIGIL_ROUTE_ID),
        }
    }

    /// The URL the caller originally requested.
    pub fn original_url(&self) -> String {
        if self.query.is_empty() {
            format!("{}://{}{}", self.protocol, self.host, self.path)
        } else {
            format!("{}://{}{}?{}", self.protocol, self.host, self.path, self.query)
        }
    }
}

impl<S> FromRequestParts<S> for ForwardedRequest
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

/// Build the control plane router. SSO endpoint paths come from the active
/// config; changing `redirect_base_path` or `jwks_path` requires a restart,
/// unlike the policy list which hot-reloads.
pub fn router(state: AppState) -> Router {
    let snapshot = state.policy.snapshot();
    let base = snapshot.base_path().trim_end_matches('/').to_string();
    let jwks_path = snapshot.config.jwks_path.clone();

    Router::new()
        .route("/verify", get(sso::verify))
        .route(&format!("{base}/auth"), get(sso::auth_redirect))
        .route(&format!("{base}/callback"), get(sso::callback))
        .route(&format!("{base}/set"), get(sso::set_session))
        .route(&format!("{base}/logout"), get(sso::logout))
        .route(
            &format!("{base}/external_verify"),
            get(sso::external_verify),
        )
        .route(&jwks_path, get(sso::jwks))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn metrics() -> impl IntoResponse {
    observability::render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_extraction_reads_the_rewritten_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        headers.insert(X_FORWARDED_HOST, HeaderValue::from_static("app.example.com"));
        headers.insert(X_FORWARDED_PATH, HeaderValue::from_static("/dash"));
        headers.insert(X_FORWARDED_QUERY, HeaderValue::from_static("tab=1"));
        headers.insert(X_FORWARDED_METHOD, HeaderValue::from_static("POST"));
        headers.insert(X_VIGIL_ROUTE_ID, HeaderValue::from_static("route-3"));

        let forwarded = ForwardedRequest::from_headers(&headers);
        assert_eq!(forwarded.host, "app.example.com");
        assert_eq!(forwarded.method, "POST");
        assert_eq!(forwarded.route_id.as_deref(), Some("route-3"));
        assert_eq!(
            forwarded.original_url(),
            "https://app.example.com/dash?tab=1"
        );
    }

    #[test]
    fn missing_headers_fall_back_to_defaults() {
        let forwarded = ForwardedRequest::from_headers(&HeaderMap::new());
        assert_eq!(forwarded.protocol, "http");
        assert_eq!(forwarded.path, "/");
        assert_eq!(forwarded.method, "GET");
        assert!(forwarded.route_id.is_none());
    }
}
