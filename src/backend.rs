//! Dynamic backend resolution.
//!
//! Routes whose upstream is resolved externally call a configured HTTP
//! endpoint after authorization has allowed the request. The endpoint
//! receives the caller identity and the original request coordinates and
//! must answer with an upstream URL. A missing URL is a hard failure, never
//! a silent fall-through to some default backend.

use std::{collections::HashMap, time::Duration};

use serde::Deserialize;

use crate::{auth::AuthError, http::ForwardedRequest, policy::Route};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a successful resolution: where to dial, plus headers the
/// resolver wants copied onto the verify response.
#[derive(Debug, Clone)]
pub struct ResolvedBackend {
    pub url: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ResolverResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Call the route's resolver endpoint. Only invoked after an allow verdict.
pub async fn resolve(
    route: &Route,
    user_id: &str,
    forwarded: &ForwardedRequest,
    http: &reqwest::Client,
) -> Result<ResolvedBackend, AuthError> {
    let Some(config) = &route.policy.dynamic_backend_config else {
        return Err(AuthError::DynamicBackendFailed);
    };

    let mut body = serde_json::json!({
        "user": user_id,
        "protocol": forwarded.protocol,
        "host": forwarded.host,
        "path": forwarded.path,
        "query": forwarded.query,
        "method": forwarded.method,
    });
    if let Some(extra) = body.as_object_mut() {
        for (key, value) in &config.request_body {
            extra.insert(key.clone(), value.clone());
        }
    }

    let mut request = http
        .post(&config.url)
        .timeout(RESOLVE_TIMEOUT)
        .json(&body);
    for (name, value) in &config.request_headers {
        request = request.header(name, value);
    }

    let response = request.send().await.map_err(|err| {
        tracing::error!(route = %route.id, error = %err, "dynamic backend resolver unreachable");
        AuthError::DynamicBackendFailed
    })?;

    if !response.status().is_success() {
        tracing::error!(
            route = %route.id,
            status = %response.status(),
            "dynamic backend resolver returned an error status",
        );
        return Err(AuthError::DynamicBackendFailed);
    }

    let resolved: ResolverResponse = response.json().await.map_err(|err| {
        tracing::error!(route = %route.id, error = %err, "dynamic backend resolver returned malformed JSON");
        AuthError::DynamicBackendFailed
    })?;

    let Some(url) = resolved.url else {
        tracing::error!(route = %route.id, "dynamic backend resolver omitted the upstream url");
        return Err(AuthError::DynamicBackendFailed);
    };

    Ok(ResolvedBackend {
        url,
        headers: resolved.headers,
    })
}
