//! The SSO state machine.
//!
//! Every proxied request enters at [`verify`]; unauthenticated callers are
//! bounced through the provider (`auth` → provider → `callback`) and back
//! across domains via short-lived signed redirect tokens consumed by
//! [`set_session`]. Each step validates its inputs before trusting them:
//! the redirect token is attacker-reachable on every endpoint that accepts
//! one, and no failure path ever falls through to an authenticated state.

use std::{collections::HashMap, time::Duration};

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_cookies::Cookies;

use crate::{
    auth::{
        AuthError,
        keys::{self, JwkSet, KeyError, RedirectClaims},
        token as machine_token,
    },
    authz, backend,
    directory::Identity,
    http::{AppState, ForwardedRequest, X_VIGIL_DYNAMIC_BACKEND_URL},
    policy::{Route, Snapshot},
    session::{self, Session},
};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Automatic re-attempts of the callback flow before a hard error page.
const MAX_AUTH_RETRIES: u32 = 3;

const X_ORIGINAL_URL: &str = "X-Original-URL";

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExternalVerifyQuery {
    pub rd: Option<String>,
}

/// `GET /verify` — the state machine entry, called by the data plane for
/// every proxied request. Also accepts a `token` query parameter as the
/// cross-domain hand-off equivalent of `/set`.
pub async fn verify(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<TokenQuery>,
    forwarded: ForwardedRequest,
    headers: axum::http::HeaderMap,
) -> Result<Response, AuthError> {
    if let Some(token) = query.token {
        return consume_handoff_token(&state, &cookies, &token).await;
    }

    let snapshot = state.policy.snapshot();
    let route = forwarded
        .route_id
        .as_deref()
        .and_then(|id| snapshot.route(id))
        .ok_or(AuthError::RouteNotFound)?;

    verify_route(&state, &snapshot, &cookies, &route, &forwarded, &headers).await
}

/// The verify decision tree shared by `/verify` and `/external_verify`.
/// `headers` are the original request headers the data plane passed through;
/// the machine credential, if any, travels in them.
async fn verify_route(
    state: &AppState,
    snapshot: &Snapshot,
    cookies: &Cookies,
    route: &Route,
    forwarded: &ForwardedRequest,
    headers: &axum::http::HeaderMap,
) -> Result<Response, AuthError> {
    if route.policy.allow_public_unauthenticated_access {
        let verdict =
            authz::authorize(route, None, None, forwarded, &snapshot.keys, &state.overlays)
                .await;
        return allow_response(verdict.headers);
    }

    // Machine credential, evaluated without touching session state.
    if let Some(record) =
        machine_token::check_auth_header(headers, route, &state.http, &state.tokens).await
    {
        let identity = match &record.user_id {
            Some(user_id) => lookup_user(state, user_id).await?,
            None => None,
        };
        let verdict = authz::authorize(
            route,
            identity.as_ref(),
            Some(&record),
            forwarded,
            &snapshot.keys,
            &state.overlays,
        )
        .await;
        if verdict.allow {
            let mut headers = verdict.headers;
            if route.uses_dynamic_backend() && !record.bypass_dynamic_backend {
                let user_id = record.user_id.as_deref().unwrap_or("-");
                attach_backend(state, route, user_id, forwarded, &mut headers).await?;
            }
            return allow_response(headers);
        }
        return Err(AuthError::Denied);
    }

    let (session_id, mut session) =
        session::load_or_create(cookies, state.sessions.as_ref(), state.secure_cookies()).await?;

    if session.logged_in {
        if let Some(user_id) = session.user_id.clone() {
            match lookup_user(state, &user_id).await? {
                Some(identity) => {
                    let verdict = authz::authorize(
                        route,
                        Some(&identity),
                        None,
                        forwarded,
                        &snapshot.keys,
                        &state.overlays,
                    )
                    .await;
                    if verdict.allow {
                        let mut headers = verdict.headers;
                        if route.uses_dynamic_backend() {
                            attach_backend(state, route, &identity.id, forwarded, &mut headers)
                                .await?;
                        }
                        return allow_response(headers);
                    }
                    return Err(AuthError::Denied);
                }
                None => {
                    // The user disappeared from the directory; the session
                    // no longer represents anyone. Start over.
                    tracing::warn!(user = %user_id, "session user no longer in directory");
                    session = Session::default();
                }
            }
        }
    }

    if forwarded.method.eq_ignore_ascii_case("OPTIONS") && route.policy.cors_allow_preflight {
        return allow_response(HashMap::new());
    }

    // Unauthenticated: send the caller into the provider flow with the
    // original URL preserved in a signed redirect token.
    let config = &snapshot.config;
    let claims = RedirectClaims {
        protocol: forwarded.protocol.clone(),
        host: forwarded.host.clone(),
        path: forwarded.path.clone(),
        query: forwarded.query.clone(),
        user_id: None,
        cookie_expires: None,
        challenge_hash: None,
        exp: 0,
    };
    let token = snapshot
        .keys
        .mint_redirect_token(claims, config.redirect_token_ttl_seconds)?;

    // Keep whatever retry progress the session holds; everything else is
    // re-established by the flow itself.
    state
        .sessions
        .save(
            &session_id,
            &session,
            session.ttl(Duration::from_secs(config.session_ttl_seconds)),
        )
        .await?;

    let target = format!(
        "{}{}/auth?token={token}",
        config.service_url.trim_end_matches('/'),
        snapshot.base_path(),
    );
    Ok(Redirect::temporary(&target).into_response())
}

/// `GET {base}/auth` — validate the redirect token, then either fast-path an
/// already-authenticated caller to `/set` or bounce to the provider.
pub async fn auth_redirect(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<TokenQuery>,
) -> Result<Response, AuthError> {
    let snapshot = state.policy.snapshot();
    let token = query.token.ok_or(AuthError::MissingToken)?;
    let claims: RedirectClaims = verify_redirect_token(&snapshot, &token)?;

    let (session_id, mut session) =
        session::load_or_create(&cookies, state.sessions.as_ref(), state.secure_cookies()).await?;

    if session.logged_in {
        if let Some(user_id) = session.user_id.clone() {
            if let Some(identity) = lookup_user(&state, &user_id).await? {
                let target = handoff_redirect(&snapshot, &claims, &identity, &session)?;
                return Ok(Redirect::temporary(&target).into_response());
            }
        }
    }

    session.redirect = Some(claims);
    let oauth_state = keys::random_value();
    session.oauth_state = Some(oauth_state.clone());
    let config = &snapshot.config;
    state
        .sessions
        .save(
            &session_id,
            &session,
            session.ttl(Duration::from_secs(config.session_ttl_seconds)),
        )
        .await?;

    let discovery = discover(&state, &config.idp_provider_url).await?;
    let mut authorize_url =
        url::Url::parse(&discovery.authorization_endpoint).map_err(|err| {
            tracing::error!(error = %err, "provider advertised an invalid authorization endpoint");
            AuthError::ProviderUnavailable
        })?;
    authorize_url
        .query_pairs_mut()
        .append_pair("client_id", &config.idp_client_id)
        .append_pair("response_type", "code")
        .append_pair("scope", &config.idp_provider_scope)
        .append_pair("redirect_uri", &callback_url(&snapshot))
        .append_pair("state", &oauth_state);

    Ok(Redirect::temporary(authorize_url.as_str()).into_response())
}

/// `GET {base}/callback` — the OIDC redirect target.
pub async fn callback(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, AuthError> {
    let snapshot = state.policy.snapshot();
    let config = &snapshot.config;
    let (session_id, mut session) =
        session::load_or_create(&cookies, state.sessions.as_ref(), state.secure_cookies()).await?;

    // CSRF defense: the state must match the one stored when the flow
    // started, and it is consumed regardless of outcome.
    let expected = session.oauth_state.take();
    let state_ok = match (&query.state, &expected) {
        (Some(received), Some(stored)) => {
            received.as_bytes().ct_eq(stored.as_bytes()).into()
        }
        _ => false,
    };
    if !state_ok {
        session::destroy(&cookies, state.sessions.as_ref(), &session_id, state.secure_cookies())
            .await?;
        return Err(AuthError::StateMismatch);
    }

    let code = query.code.as_deref().ok_or(AuthError::MissingToken)?;
    let id_token = match exchange_code(&state, &snapshot, code).await {
        Ok(token) => token,
        Err(err) => {
            // Transient provider failure: bounce back through the flow,
            // bounded by the retry counter carried in the session.
            return retry_or_fail(&state, &snapshot, &session_id, session, err).await;
        }
    };

    let provider_claims = decode_id_token(&id_token)?;
    let user_id = provider_claims
        .get(&config.idp_provider_user_id_claim)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AuthError::MissingClaim(config.idp_provider_user_id_claim.clone()))?;

    if let Err(err) = state.directory.add_new_user_from_claims(&provider_claims).await {
        tracing::error!(error = %err, user = %user_id, "claims enrollment failed");
    }

    let Some(identity) = lookup_user(&state, &user_id).await? else {
        session::destroy(&cookies, state.sessions.as_ref(), &session_id, state.secure_cookies())
            .await?;
        return Err(AuthError::UserNotFound);
    };

    session.logged_in = true;
    session.user_id = Some(identity.id.clone());
    session.auth_retry_count = 0;
    session.expires_at =
        Some(Utc::now() + chrono::Duration::seconds(config.session_ttl_seconds as i64));

    // Fixation defense: the authenticated state gets an id nobody saw
    // before the login completed.
    let session_id =
        session::rotate_id(&cookies, state.sessions.as_ref(), &session_id, state.secure_cookies())
            .await?;

    let redirect = session.redirect.take().unwrap_or_else(|| RedirectClaims {
        protocol: (if state.secure_cookies() { "https" } else { "http" }).to_string(),
        host: config.service_host(),
        path: "/".into(),
        query: String::new(),
        user_id: None,
        cookie_expires: None,
        challenge_hash: None,
        exp: 0,
    });

    state
        .sessions
        .save(
            &session_id,
            &session,
            session.ttl(Duration::from_secs(config.session_ttl_seconds)),
        )
        .await?;

    let target = handoff_redirect(&snapshot, &redirect, &identity, &session)?;
    Ok(Redirect::temporary(&target).into_response())
}

/// `GET {base}/set` — cross-domain hand-off: verify the token, check the
/// challenge hash against the directory, bind the domain-local session.
pub async fn set_session(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<TokenQuery>,
) -> Result<Response, AuthError> {
    let token = query.token.ok_or(AuthError::MissingToken)?;
    consume_handoff_token(&state, &cookies, &token).await
}

async fn consume_handoff_token(
    state: &AppState,
    cookies: &Cookies,
    token: &str,
) -> Result<Response, AuthError> {
    let snapshot = state.policy.snapshot();
    let config = &snapshot.config;
    let claims: RedirectClaims = verify_redirect_token(&snapshot, token)?;
    let user_id = claims.user_id.clone().ok_or(AuthError::InvalidToken)?;

    let identity = lookup_user(state, &user_id)
        .await?
        .ok_or(AuthError::UserNotFound)?;

    let (session_id, mut session) =
        session::load_or_create(cookies, state.sessions.as_ref(), state.secure_cookies()).await?;

    // Signing-key compromise defense: a forged token cannot carry a valid
    // slow hash of the directory-stored challenge.
    if let Some(challenge) = &identity.challenge {
        let valid = claims
            .challenge_hash
            .as_deref()
            .map(|hash| keys::verify_challenge(challenge, hash))
            .unwrap_or(false);
        if !valid {
            session::destroy(cookies, state.sessions.as_ref(), &session_id, state.secure_cookies())
                .await?;
            return Err(AuthError::ChallengeMismatch);
        }
    }

    session.logged_in = true;
    session.user_id = Some(identity.id.clone());
    session.auth_retry_count = 0;

    // Cap the local expiry at the origin session's; never extend the grant.
    let local = Utc::now() + chrono::Duration::seconds(config.session_ttl_seconds as i64);
    session.expires_at = Some(match origin_expiry(&claims) {
        Some(origin) if origin < local => origin,
        _ => local,
    });

    // Fixation defense: the authenticated state gets an id nobody saw
    // before the hand-off completed.
    let session_id =
        session::rotate_id(cookies, state.sessions.as_ref(), &session_id, state.secure_cookies())
            .await?;

    state
        .sessions
        .save(
            &session_id,
            &session,
            session.ttl(Duration::from_secs(config.session_ttl_seconds)),
        )
        .await?;

    Ok(Redirect::temporary(&claims.original_url()).into_response())
}

/// `GET {base}/logout` — destroy the domain-local session.
pub async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<Response, AuthError> {
    let (session_id, _) =
        session::load_or_create(&cookies, state.sessions.as_ref(), state.secure_cookies()).await?;
    session::destroy(&cookies, state.sessions.as_ref(), &session_id, state.secure_cookies())
        .await?;
    Ok(Html(logged_out_page()).into_response())
}

/// `GET {base}/external_verify` — ingress-adapted entry: the original URL
/// arrives in a header or query parameter instead of the forwarded set.
pub async fn external_verify(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(query): Query<ExternalVerifyQuery>,
    headers: axum::http::HeaderMap,
) -> Result<Response, AuthError> {
    let original = headers
        .get(X_ORIGINAL_URL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.rd)
        .ok_or(AuthError::MissingToken)?;

    let url = url::Url::parse(&original).map_err(|_| AuthError::InvalidToken)?;
    let host = url.host_str().ok_or(AuthError::InvalidToken)?;

    let snapshot = state.policy.snapshot();
    let route = snapshot
        .external_auth_route(host)
        .ok_or(AuthError::RouteNotFound)?;

    let forwarded = ForwardedRequest {
        protocol: url.scheme().to_string(),
        host: host.to_string(),
        path: url.path().to_string(),
        query: url.query().unwrap_or_default().to_string(),
        method: "GET".into(),
        uri: url[url::Position::BeforePath..].to_string(),
        route_id: Some(route.id.clone()),
    };
    verify_route(&state, &snapshot, &cookies, &route, &forwarded, &headers).await
}

/// `GET {jwks_path}` — the public half of the signing key.
pub async fn jwks(State(state): State<AppState>) -> Json<JwkSet> {
    Json(state.policy.snapshot().keys.jwks())
}

fn verify_redirect_token(snapshot: &Snapshot, token: &str) -> Result<RedirectClaims, AuthError> {
    snapshot.keys.verify(token).map_err(|err| match err {
        KeyError::Expired => AuthError::ExpiredToken,
        _ => AuthError::InvalidToken,
    })
}

/// Build the `/set` redirect carrying a freshly minted hand-off token bound
/// to this user's challenge.
fn handoff_redirect(
    snapshot: &Snapshot,
    target: &RedirectClaims,
    identity: &Identity,
    session: &Session,
) -> Result<String, AuthError> {
    let challenge_hash = match &identity.challenge {
        Some(challenge) => Some(keys::hash_challenge(challenge)?),
        None => None,
    };
    let claims = RedirectClaims {
        protocol: target.protocol.clone(),
        host: target.host.clone(),
        path: target.path.clone(),
        query: target.query.clone(),
        user_id: Some(identity.id.clone()),
        cookie_expires: session.expires_at.map(|at| at.timestamp()),
        challenge_hash,
        exp: 0,
    };
    let token = snapshot
        .keys
        .mint_redirect_token(claims, snapshot.config.redirect_token_ttl_seconds)?;
    Ok(format!(
        "{}://{}{}/set?token={token}",
        target.protocol,
        target.host,
        snapshot.base_path(),
    ))
}

async fn retry_or_fail(
    state: &AppState,
    snapshot: &Snapshot,
    session_id: &str,
    mut session: Session,
    err: AuthError,
) -> Result<Response, AuthError> {
    let Some(redirect) = session.redirect.clone() else {
        return Err(err);
    };
    if session.auth_retry_count >= MAX_AUTH_RETRIES {
        return Err(err);
    }
    session.auth_retry_count += 1;
    let config = &snapshot.config;
    state
        .sessions
        .save(
            session_id,
            &session,
            session.ttl(Duration::from_secs(config.session_ttl_seconds)),
        )
        .await?;

    tracing::warn!(
        attempt = session.auth_retry_count,
        error = %err,
        "provider exchange failed, retrying the flow",
    );
    let token = snapshot
        .keys
        .mint_redirect_token(redirect, config.redirect_token_ttl_seconds)?;
    let target = format!(
        "{}{}/auth?token={token}",
        config.service_url.trim_end_matches('/'),
        snapshot.base_path(),
    );
    Ok(Redirect::temporary(&target).into_response())
}

#[derive(Debug, Deserialize)]
struct ProviderDiscovery {
    authorization_endpoint: String,
    token_endpoint: String,
}

async fn discover(state: &AppState, provider_url: &str) -> Result<ProviderDiscovery, AuthError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        provider_url.trim_end_matches('/')
    );
    let response = state
        .http
        .get(&url)
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "OIDC discovery failed");
            AuthError::ProviderUnavailable
        })?;
    if !response.status().is_success() {
        tracing::error!(status = %response.status(), "OIDC discovery returned an error status");
        return Err(AuthError::ProviderUnavailable);
    }
    response.json().await.map_err(|err| {
        tracing::error!(error = %err, "OIDC discovery document is malformed");
        AuthError::ProviderUnavailable
    })
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    id_token: Option<String>,
}

async fn exchange_code(
    state: &AppState,
    snapshot: &Snapshot,
    code: &str,
) -> Result<String, AuthError> {
    let config = &snapshot.config;
    let discovery = discover(state, &config.idp_provider_url).await?;

    let response = state
        .http
        .post(&discovery.token_endpoint)
        .timeout(EXCHANGE_TIMEOUT)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &callback_url(snapshot)),
            ("client_id", &config.idp_client_id),
            ("client_secret", &config.idp_client_secret),
        ])
        .send()
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "token exchange request failed");
            AuthError::ProviderUnavailable
        })?;

    if !response.status().is_success() {
        tracing::error!(status = %response.status(), "token exchange rejected");
        return Err(AuthError::ProviderUnavailable);
    }

    let exchange: TokenExchangeResponse = response.json().await.map_err(|err| {
        tracing::error!(error = %err, "token exchange response is malformed");
        AuthError::ProviderUnavailable
    })?;
    exchange.id_token.ok_or_else(|| {
        tracing::error!("token exchange response carries no id_token");
        AuthError::ProviderUnavailable
    })
}

/// Decode the provider's ID token without signature verification: it was
/// obtained over the direct TLS code exchange, so its provenance is the
/// exchange itself rather than its signature.
fn decode_id_token(id_token: &str) -> Result<serde_json::Value, AuthError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = jsonwebtoken::decode::<serde_json::Value>(
        id_token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )
    .map_err(|err| {
        tracing::error!(error = %err, "id_token could not be decoded");
        AuthError::ProviderUnavailable
    })?;
    Ok(data.claims)
}

async fn lookup_user(state: &AppState, user_id: &str) -> Result<Option<Identity>, AuthError> {
    state
        .directory
        .get_user_by_id(user_id)
        .await
        .map_err(|err| AuthError::Internal(err.to_string()))
}

async fn attach_backend(
    state: &AppState,
    route: &Route,
    user_id: &str,
    forwarded: &ForwardedRequest,
    headers: &mut HashMap<String, String>,
) -> Result<(), AuthError> {
    let resolved = backend::resolve(route, user_id, forwarded, &state.http).await?;
    headers.insert(X_VIGIL_DYNAMIC_BACKEND_URL.to_string(), resolved.url);
    headers.extend(resolved.headers);
    Ok(())
}

/// 200 with the verdict headers; the compiler's verify subroute copies the
/// allow-listed ones onto the upstream request.
fn allow_response(headers: HashMap<String, String>) -> Result<Response, AuthError> {
    let mut response = StatusCode::OK.into_response();
    for (name, value) in headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|e| AuthError::Internal(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| AuthError::Internal(format!("invalid header value: {e}")))?;
        response.headers_mut().insert(name, value);
    }
    Ok(response)
}

fn callback_url(snapshot: &Snapshot) -> String {
    format!(
        "{}{}/callback",
        snapshot.config.service_url.trim_end_matches('/'),
        snapshot.base_path(),
    )
}

fn origin_expiry(claims: &RedirectClaims) -> Option<DateTime<Utc>> {
    claims
        .cookie_expires
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

fn logged_out_page() -> String {
    r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Logged out</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; align-items: center;
           justify-content: center; min-height: 100vh; margin: 0; background: #f5f6f8; }
    main { text-align: center; padding: 2rem; }
  </style>
</head>
<body>
  <main>
    <h1>Logged out</h1>
    <p>Your session has ended. Close this tab or sign in again.</p>
  </main>
</body>
</html>
"#
    .to_string()
}
