//! Machine-token authentication.
//!
//! Routes may declare a credential header whose value is looked up in a
//! token-to-record map (a local JSON file, a dynamic lookup service, or
//! both). A matched record constrains where the token is valid via glob
//! matchers over domains, paths and methods; all three must match. Records
//! are cached for a bounded TTL so the file or lookup service is not hit on
//! every request.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use axum::http::HeaderMap;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{http::ForwardedRequest, policy::Route};

const RECORD_CACHE_TTL: Duration = Duration::from_secs(60);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Credential record keyed by the caller-supplied token value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Identity the token acts as; optional for bypass-only tokens.
    #[serde(default)]
    pub user_id: Option<String>,

    /// Glob constraints; an absent constraint matches everything.
    #[serde(default)]
    pub valid_domains: Vec<String>,
    #[serde(default)]
    pub valid_paths: Vec<String>,
    #[serde(default)]
    pub valid_methods: Vec<String>,

    /// Allow immediately, skipping group evaluation.
    #[serde(default)]
    pub bypass_authz_check: bool,

    /// Skip dynamic backend resolution for this caller.
    #[serde(default)]
    pub bypass_dynamic_backend: bool,

    /// Extra headers injected on allow.
    #[serde(default)]
    pub additional_headers: HashMap<String, String>,
}

impl TokenRecord {
    /// Evaluate the record's constraints against the route and the
    /// forwarded request. All three matchers must pass.
    pub fn matches(&self, route: &Route, forwarded: &ForwardedRequest) -> bool {
        let domain_ok = glob_match_any(&self.valid_domains, &route.from_host)
            || glob_match_any(&self.valid_domains, &route.audience());
        domain_ok
            && glob_match_any(&self.valid_paths, &forwarded.path)
            && glob_match_any(&self.valid_methods, &forwarded.method)
    }
}

/// `true` when any pattern matches, or when no constraint is configured.
pub fn glob_match_any(patterns: &[String], value: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|p| glob_match(p, value))
}

/// Anchored glob matching: `*` matches any run, `?` a single character.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    match Regex::new(&regex) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// Bounded-TTL cache of token lookups, keyed by token digest and route.
/// Negative results are cached too, so an invalid token cannot hammer the
/// lookup service.
#[derive(Default)]
pub struct TokenCache {
    records: DashMap<String, (Option<TokenRecord>, Instant)>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(token: &str, route_id: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        format!("{}-{route_id}", hex::encode(digest))
    }

    fn get(&self, token: &str, route_id: &str) -> Option<Option<TokenRecord>> {
        let key = Self::key(token, route_id);
        let entry = self.records.get(&key)?;
        if entry.1 > Instant::now() {
            Some(entry.0.clone())
        } else {
            None
        }
    }

    fn put(&self, token: &str, route_id: &str, record: Option<TokenRecord>) {
        self.records.insert(
            Self::key(token, route_id),
            (record, Instant::now() + RECORD_CACHE_TTL),
        );
    }
}

/// Extract and validate the machine credential for `route`, if the request
/// carries one. Every failure path is a `None`: the caller falls through to
/// the normal session flow, never to an implicit allow.
pub async fn check_auth_header(
    headers: &HeaderMap,
    route: &Route,
    http: &reqwest::Client,
    cache: &TokenCache,
) -> Option<TokenRecord> {
    let header_name = route.policy.token_auth_header.as_deref()?;
    let raw = headers.get(header_name)?.to_str().ok()?;

    let mut value = raw.to_string();
    if let Some(prefix) = &route.policy.token_auth_header_prefix {
        if let Some(stripped) = value.strip_prefix(prefix.as_str()) {
            value = stripped.to_string();
        }
    }
    if route.policy.token_auth_is_base64_encoded {
        match BASE64_STANDARD.decode(&value) {
            Ok(decoded) => match String::from_utf8(decoded) {
                Ok(text) => value = text,
                Err(_) => return None,
            },
            Err(_) => {
                tracing::debug!(route = %route.id, "token header is not valid base64");
                return None;
            }
        }
    }

    match lookup_record(&value, route, http, cache).await {
        Some(record) => Some(record),
        None => {
            tracing::info!(route = %route.id, "caller presented an unknown machine token");
            None
        }
    }
}

async fn lookup_record(
    token: &str,
    route: &Route,
    http: &reqwest::Client,
    cache: &TokenCache,
) -> Option<TokenRecord> {
    if let Some(cached) = cache.get(token, &route.id) {
        tracing::trace!(route = %route.id, "token record served from cache");
        return cached;
    }

    let record = fetch_record(token, route, http).await;
    cache.put(token, &route.id, record.clone());
    record
}

async fn fetch_record(
    token: &str,
    route: &Route,
    http: &reqwest::Client,
) -> Option<TokenRecord> {
    if let Some(path) = &route.policy.token_auth_config_file {
        match read_token_file(path).await {
            Ok(mut map) => {
                if let Some(record) = map.remove(token) {
                    return Some(record);
                }
            }
            Err(err) => {
                tracing::error!(error = %err, file = %path, "unable to read token auth config file");
            }
        }
    }

    if let Some(dynamic) = &route.policy.token_auth_dynamic_config {
        let mut request = http
            .post(&dynamic.url)
            .timeout(LOOKUP_TIMEOUT)
            .json(&serde_json::json!({ "token": token }));
        for (name, value) in &dynamic.headers {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<TokenRecord>().await {
                    Ok(record) => return Some(record),
                    Err(err) => {
                        tracing::error!(error = %err, "token lookup service returned a malformed record");
                    }
                }
            }
            Ok(response) => {
                tracing::debug!(status = %response.status(), "token lookup service rejected token");
            }
            Err(err) => {
                tracing::error!(error = %err, "token lookup service unreachable");
            }
        }
    }

    None
}

async fn read_token_file(
    path: &str,
) -> Result<HashMap<String, TokenRecord>, Box<dyn std::error::Error + Send + Sync>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}
