//! End-to-end walks of the SSO state machine against the real router, with
//! an in-memory session store and a local-file directory.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::json;
use tower::ServiceExt;
use vigil::auth::keys::{RedirectClaims, hash_challenge};
use vigil::session::SessionStore;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

const ROUTE_POLICY: &str = "  - from: https://app.example.com\n    to: https://backend:8080\n    allowed_groups: [eng]\n";

fn verify_request(route_id: &str, fwd_path: &str) -> Request<Body> {
    Request::builder()
        .uri("/verify")
        .header("X-Forwarded-Proto", "https")
        .header("X-Forwarded-Host", "app.example.com")
        .header("X-Forwarded-Path", fwd_path)
        .header("X-Forwarded-Method", "GET")
        .header("X-Vigil-Route-Id", route_id)
        .body(Body::empty())
        .unwrap()
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("redirect location")
        .to_str()
        .unwrap()
        .to_string()
}

fn session_cookie(response: &axum::response::Response) -> String {
    let raw = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("set-cookie")
        .to_str()
        .unwrap();
    raw.split(';').next().unwrap().to_string()
}

fn handoff_token(path_value: &str, query: &str, user_id: &str, challenge: &str) -> String {
    let keys = common::signing_keys();
    let claims = RedirectClaims {
        protocol: "https".into(),
        host: "app.example.com".into(),
        path: path_value.into(),
        query: query.into(),
        user_id: Some(user_id.into()),
        cookie_expires: None,
        challenge_hash: Some(hash_challenge(challenge).unwrap()),
        exp: 0,
    };
    keys.mint_redirect_token(claims, 30).unwrap()
}

#[tokio::test]
async fn unauthenticated_verify_redirects_with_signed_token() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    let response = app.oneshot(verify_request("route-0", "/dash")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = location(&response);
    assert!(location.starts_with("https://vigil.example.com/.vigil/auth?token="));

    let token = common::query_param(&location, "token").unwrap();
    let claims: RedirectClaims = common::signing_keys().verify(&token).unwrap();
    assert_eq!(claims.host, "app.example.com");
    assert_eq!(claims.path, "/dash");
    assert!(claims.user_id.is_none());
}

#[tokio::test]
async fn verify_without_route_is_not_found() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    let response = app
        .oneshot(Request::builder().uri("/verify").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn auth_endpoint_bounces_to_the_provider_with_state() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authorization_endpoint": format!("{}/authorize", provider.uri()),
            "token_endpoint": format!("{}/token", provider.uri()),
        })))
        .mount(&provider)
        .await;

    let (state, _guard) = common::app_state(&provider.uri(), ROUTE_POLICY);
    let app = vigil::http::router(state);

    let keys = common::signing_keys();
    let token = keys
        .mint_redirect_token(
            RedirectClaims {
                protocol: "https".into(),
                host: "app.example.com".into(),
                path: "/dash".into(),
                query: String::new(),
                user_id: None,
                cookie_expires: None,
                challenge_hash: None,
                exp: 0,
            },
            30,
        )
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/auth?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = location(&response);
    assert!(location.starts_with(&format!("{}/authorize", provider.uri())));
    assert_eq!(common::query_param(&location, "client_id").as_deref(), Some("vigil"));
    assert_eq!(
        common::query_param(&location, "redirect_uri").as_deref(),
        Some("https://vigil.example.com/.vigil/callback")
    );
    assert!(common::query_param(&location, "state").is_some());
}

#[tokio::test]
async fn auth_endpoint_requires_a_valid_token() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/.vigil/auth")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.vigil/auth?token=not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn handoff_binds_the_session_and_replays_the_query() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    let token = handoff_token("/dash", "tab=1", "u1", common::TEST_CHALLENGE);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/set?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), "https://app.example.com/dash?tab=1");

    // The bound session now clears verify for the eng-gated route.
    let cookie = session_cookie(&response);
    let mut request = verify_request("route-0", "/dash");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-Vigil-User-Id").unwrap(),
        "u1"
    );
}

#[tokio::test]
async fn wrong_group_is_denied_even_with_a_session() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    // u2 is in ops, the route wants eng.
    let token = handoff_token("/", "", "u2", common::TEST_CHALLENGE);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/set?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let cookie = session_cookie(&response);
    let mut request = verify_request("route-0", "/");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn challenge_mismatch_destroys_the_handoff() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    let token = handoff_token("/", "", "u1", "some-other-challenge");
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/set?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("ERR_CHALLENGE_MISMATCH"));
}

#[tokio::test]
async fn tampered_handoff_token_is_rejected() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    // Corrupt the signature segment.
    let mut token = handoff_token("/", "", "u1", common::TEST_CHALLENGE);
    token.push('A');
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/set?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_rejects_a_state_mismatch() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.vigil/callback?code=abc&state=forged")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("ERR_STATE_MISMATCH"));
}

#[tokio::test]
async fn public_route_allows_without_a_session() {
    let policy = "  - from: https://app.example.com\n    to: https://backend:8080\n    allow_public_unauthenticated_access: true\n";
    let (state, _guard) = common::app_state("https://login.example.com", policy);
    let app = vigil::http::router(state);

    let response = app.oneshot(verify_request("route-0", "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("X-Vigil-User-Id").is_none());
}

#[tokio::test]
async fn jwks_publishes_the_rsa_public_key() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.well-known/jwks.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let jwks: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let key = &jwks["keys"][0];
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["alg"], "RS256");
    assert_eq!(key["kid"], "vigil-signing-key");
    assert!(key["n"].as_str().is_some_and(|n| !n.is_empty()));
}

#[tokio::test]
async fn full_login_round_trip_ends_at_the_original_url() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authorization_endpoint": format!("{}/authorize", provider.uri()),
            "token_endpoint": format!("{}/token", provider.uri()),
        })))
        .mount(&provider)
        .await;

    // The exchange hands back an ID token whose email claim is the
    // directory id of u1.
    let now = chrono::Utc::now().timestamp();
    let id_token = common::signing_keys()
        .sign(&json!({ "email": "u1", "iat": now, "exp": now + 300 }))
        .unwrap();
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id_token": id_token })),
        )
        .mount(&provider)
        .await;

    let (state, _guard) = common::app_state(&provider.uri(), ROUTE_POLICY);
    let app = vigil::http::router(state);

    // Step 1: verify redirects into the flow.
    let response = app.clone().oneshot(verify_request("route-0", "/dash")).await.unwrap();
    let token = common::query_param(&location(&response), "token").unwrap();

    // Step 2: auth stores the target and bounces to the provider.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/auth?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let cookie = session_cookie(&response);
    let state_value = common::query_param(&location(&response), "state").unwrap();

    // Step 3: the provider calls back with the code and the same state.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/callback?code=authcode&state={state_value}"))
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let handoff = location(&response);
    assert!(handoff.starts_with("https://app.example.com/.vigil/set?token="));

    let handoff_claims: RedirectClaims = common::signing_keys()
        .verify(&common::query_param(&handoff, "token").unwrap())
        .unwrap();
    assert_eq!(handoff_claims.user_id.as_deref(), Some("u1"));
    assert_eq!(handoff_claims.path, "/dash");
    assert!(handoff_claims.challenge_hash.is_some());
    assert!(handoff_claims.cookie_expires.is_some());

    // Step 4: the target domain consumes the hand-off and lands on the
    // originally requested URL.
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/.vigil/set?token={}",
                    common::query_param(&handoff, "token").unwrap()
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), "https://app.example.com/dash");
}

#[tokio::test]
async fn login_binds_a_session_id_the_browser_never_presented() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let sessions = state.sessions.clone();
    let app = vigil::http::router(state);

    // A planted cookie whose id the attacker knows.
    let planted = "_vigil_sid=attacker-chosen-sid";
    let token = handoff_token("/", "", "u1", common::TEST_CHALLENGE);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/set?token={token}"))
                .header(header::COOKIE, planted)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    // The login bound a freshly minted id, not the planted one.
    let cookie = session_cookie(&response);
    assert_ne!(cookie, planted);
    assert!(sessions.load("attacker-chosen-sid").await.unwrap().is_none());

    // Verifying with the planted id goes back through the provider flow.
    let mut request = verify_request("route-0", "/");
    request
        .headers_mut()
        .insert(header::COOKIE, planted.parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    // The rotated cookie is the one that clears verify.
    let mut request = verify_request("route-0", "/");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn provider_exchange_failures_retry_then_fail_then_reset() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "authorization_endpoint": format!("{}/authorize", provider.uri()),
            "token_endpoint": format!("{}/token", provider.uri()),
        })))
        .mount(&provider)
        .await;

    // The exchange fails four times, then recovers.
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(4)
        .mount(&provider)
        .await;
    let now = chrono::Utc::now().timestamp();
    let id_token = common::signing_keys()
        .sign(&json!({ "email": "u1", "iat": now, "exp": now + 300 }))
        .unwrap();
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id_token": id_token })),
        )
        .mount(&provider)
        .await;

    let (state, _guard) = common::app_state(&provider.uri(), ROUTE_POLICY);
    let sessions = state.sessions.clone();
    let app = vigil::http::router(state);

    let response = app.clone().oneshot(verify_request("route-0", "/dash")).await.unwrap();
    let mut token = common::query_param(&location(&response), "token").unwrap();
    let mut cookie: Option<String> = None;

    let run_callback = |token: String, cookie: Option<String>| {
        let app = app.clone();
        async move {
            let mut builder = Request::builder().uri(format!("/.vigil/auth?token={token}"));
            if let Some(c) = &cookie {
                builder = builder.header(header::COOKIE, c.clone());
            }
            let response = app
                .clone()
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
            let cookie = cookie.unwrap_or_else(|| session_cookie(&response));
            let state_value = common::query_param(&location(&response), "state").unwrap();

            let response = app
                .oneshot(
                    Request::builder()
                        .uri(format!("/.vigil/callback?code=authcode&state={state_value}"))
                        .header(header::COOKIE, &cookie)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            (response, cookie)
        }
    };

    // Three transient failures bounce back through the flow, each carrying
    // a freshly minted redirect token.
    for attempt in 1..=3u32 {
        let (response, used_cookie) = run_callback(token.clone(), cookie.clone()).await;
        cookie = Some(used_cookie);
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let bounce = location(&response);
        assert!(bounce.starts_with("https://vigil.example.com/.vigil/auth?token="));
        token = common::query_param(&bounce, "token").unwrap();

        let sid = cookie.as_deref().unwrap().split('=').nth(1).unwrap();
        let session = sessions.load(sid).await.unwrap().unwrap();
        assert_eq!(session.auth_retry_count, attempt);
    }

    // The fourth failure exhausts the cap.
    let (response, _) = run_callback(token, cookie.clone()).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("ERR_PROVIDER_UNAVAILABLE"));

    // The provider recovers; a fresh pass logs in and zeroes the counter.
    let response = app.clone().oneshot(verify_request("route-0", "/dash")).await.unwrap();
    let token = common::query_param(&location(&response), "token").unwrap();
    let (response, _) = run_callback(token, cookie).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert!(location(&response).starts_with("https://app.example.com/.vigil/set?token="));

    let rotated = session_cookie(&response);
    let sid = rotated.split('=').nth(1).unwrap();
    let session = sessions.load(sid).await.unwrap().unwrap();
    assert!(session.logged_in);
    assert_eq!(session.auth_retry_count, 0);
}

#[tokio::test]
async fn logout_expires_the_session() {
    let (state, _guard) = common::app_state("https://login.example.com", ROUTE_POLICY);
    let app = vigil::http::router(state);

    let token = handoff_token("/", "", "u1", common::TEST_CHALLENGE);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/.vigil/set?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let cookie = session_cookie(&response);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/.vigil/logout")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A verify with the same cookie goes back through the provider flow.
    let mut request = verify_request("route-0", "/");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
}
