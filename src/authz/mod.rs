//! Authorization engine.
//!
//! `authorize` takes the resolved route, the caller identity (when one is
//! bound) and an optional machine-token record and produces a [`Verdict`]:
//! allow or deny plus the headers to inject on allow. The decision order is
//! strict and short-circuiting: public route, machine token with bypass,
//! group intersection, default deny. Every decision is written to the
//! access log and counted.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use chrono::Utc;
use dashmap::DashMap;

use crate::{
    auth::{
        keys::{IdentityClaims, SigningKeys},
        token::TokenRecord,
    },
    directory::Identity,
    http::{ForwardedRequest, X_VIGIL_USER_ID},
    observability,
    policy::Route,
};

const OVERLAY_CACHE_TTL: Duration = Duration::from_secs(60);

/// Lifetime of a per-request identity assertion minted for a
/// `claims_headers: jwt` entry.
const ASSERTION_TTL_SECONDS: i64 = 300;

/// Sentinel value in `claims_headers` that requests a minted JWT instead of
/// a literal attribute copy.
const JWT_SENTINEL: &str = "jwt";

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub allow: bool,
    pub headers: HashMap<String, String>,
}

impl Verdict {
    fn deny() -> Self {
        Self {
            allow: false,
            headers: HashMap::new(),
        }
    }

    fn allow(headers: HashMap<String, String>) -> Self {
        Self {
            allow: true,
            headers,
        }
    }
}

/// Resolved overlay maps cached per (user, route).
#[derive(Default)]
pub struct OverlayCache {
    entries: DashMap<String, (HashMap<String, String>, Instant)>,
}

impl OverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, user_id: &str, route_id: &str) -> Option<HashMap<String, String>> {
        let entry = self.entries.get(&format!("{user_id}:{route_id}"))?;
        if entry.1 > Instant::now() {
            Some(entry.0.clone())
        } else {
            None
        }
    }

    fn put(&self, user_id: &str, route_id: &str, resolved: HashMap<String, String>) {
        self.entries.insert(
            format!("{user_id}:{route_id}"),
            (resolved, Instant::now() + OVERLAY_CACHE_TTL),
        );
    }
}

/// Evaluate the decision order for one request.
///
/// `identity` is `None` for callers authenticated purely by machine token
/// whose record carries no `user_id`, and for public routes.
pub async fn authorize(
    route: &Route,
    identity: Option<&Identity>,
    token: Option<&TokenRecord>,
    forwarded: &ForwardedRequest,
    keys: &SigningKeys,
    overlays: &OverlayCache,
) -> Verdict {
    // 1. Public route: allow with no identity-derived headers.
    if route.policy.allow_public_unauthenticated_access {
        record("allow", "public_route", route, identity, forwarded);
        return Verdict::allow(HashMap::new());
    }

    // 2. Machine token: all three glob constraints must hold before the
    //    record counts for anything.
    if let Some(record_token) = token {
        if !record_token.matches(route, forwarded) {
            record("deny", "token_constraints", route, identity, forwarded);
            return Verdict::deny();
        }
        if record_token.bypass_authz_check {
            let mut headers = record_token.additional_headers.clone();
            if let Some(user_id) = &record_token.user_id {
                headers.insert(X_VIGIL_USER_ID.to_string(), user_id.clone());
            }
            record("allow", "token_bypass", route, identity, forwarded);
            return Verdict::allow(headers);
        }
    }

    // 3. Group intersection.
    let Some(identity) = identity else {
        record("deny", "no_identity", route, None, forwarded);
        return Verdict::deny();
    };
    let intersection = group_intersection(&route.policy.allowed_groups, &identity.groups);
    if intersection.is_empty() {
        record("deny", "no_group_overlap", route, Some(identity), forwarded);
        return Verdict::deny();
    }

    let mut headers = HashMap::new();
    headers.insert(X_VIGIL_USER_ID.to_string(), identity.id.clone());

    for (header, attribute) in &route.policy.claims_headers {
        if attribute == JWT_SENTINEL {
            match mint_assertion(identity, &intersection, route, keys) {
                Ok(jwt) => {
                    headers.insert(header.clone(), jwt);
                }
                Err(err) => {
                    tracing::error!(
                        route = %route.id,
                        user = %identity.id,
                        error = %err,
                        "failed to mint identity assertion, denying",
                    );
                    record("deny", "assertion_failure", route, Some(identity), forwarded);
                    return Verdict::deny();
                }
            }
        } else if let Some(value) = identity.attribute(attribute) {
            headers.insert(header.clone(), value);
        } else {
            tracing::warn!(
                route = %route.id,
                attribute = %attribute,
                "claims header references an attribute the identity does not carry",
            );
        }
    }

    if !route.policy.request_header_map_headers.is_empty() {
        let overlay = resolve_overlay(route, identity, overlays).await;
        for name in &route.policy.request_header_map_headers {
            if let Some(value) = overlay.get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }

    if let Some(record_token) = token {
        for (name, value) in &record_token.additional_headers {
            headers.insert(name.clone(), value.clone());
        }
    }

    record("allow", "group_match", route, Some(identity), forwarded);
    Verdict::allow(headers)
}

/// Groups both sides share, in the route's declared order.
pub fn group_intersection(allowed: &[String], held: &[String]) -> Vec<String> {
    allowed
        .iter()
        .filter(|g| held.contains(g))
        .cloned()
        .collect()
}

fn mint_assertion(
    identity: &Identity,
    intersection: &[String],
    route: &Route,
    keys: &SigningKeys,
) -> Result<String, crate::auth::keys::KeyError> {
    let now = Utc::now().timestamp();
    keys.sign(&IdentityClaims {
        oid: identity.id.clone(),
        uid: identity.id.clone(),
        sub: identity.upn.clone().unwrap_or_else(|| identity.id.clone()),
        email: identity.mail.clone(),
        groups: intersection.to_vec(),
        aud: route.audience(),
        iss: keys.issuer().to_string(),
        iat: now,
        exp: now + ASSERTION_TTL_SECONDS,
    })
}

/// Resolve the overlay map for this (user, route): group entries in the
/// route's declared group order, then the user-id entry, which always wins.
/// Read failure is logged and treated as "no overlay", never as a deny.
async fn resolve_overlay(
    route: &Route,
    identity: &Identity,
    cache: &OverlayCache,
) -> HashMap<String, String> {
    if let Some(resolved) = cache.get(&identity.id, &route.id) {
        return resolved;
    }

    let source = match load_overlay_source(route).await {
        Ok(source) => source,
        Err(err) => {
            tracing::warn!(
                route = %route.id,
                user = %identity.id,
                error = %err,
                "overlay map unavailable, continuing without overlay headers",
            );
            HashMap::new()
        }
    };

    let mut resolved = HashMap::new();
    for group in &route.policy.allowed_groups {
        if !identity.groups.contains(group) {
            continue;
        }
        if let Some(entries) = source.get(group) {
            resolved.extend(entries.clone());
        }
    }
    if let Some(entries) = source.get(&identity.id) {
        resolved.extend(entries.clone());
    }

    cache.put(&identity.id, &route.id, resolved.clone());
    resolved
}

async fn load_overlay_source(
    route: &Route,
) -> Result<HashMap<String, HashMap<String, String>>, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(inline) = &route.policy.request_header_map_inline {
        return Ok(inline.clone());
    }
    if let Some(path) = &route.policy.request_header_map_file {
        let contents = tokio::fs::read_to_string(path).await?;
        return Ok(serde_json::from_str(&contents)?);
    }
    Ok(HashMap::new())
}

fn record(
    result: &'static str,
    reason: &'static str,
    route: &Route,
    identity: Option<&Identity>,
    forwarded: &ForwardedRequest,
) {
    observability::record_authz_decision(result);
    tracing::info!(
        action = result,
        reason,
        route = %route.id,
        user = identity.map(|i| i.id.as_str()).unwrap_or("-"),
        host = %forwarded.host,
        path = %forwarded.path,
        method = %forwarded.method,
        "authorization decision",
    );
}
