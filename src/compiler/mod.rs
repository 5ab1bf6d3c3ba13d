//! Route/policy compiler.
//!
//! `compile` is a pure function from a policy snapshot to the full Caddy
//! configuration: identical input produces byte-identical JSON. `apply`
//! carries the side effects — push to the admin API and persist to disk —
//! and both are attempted even when one fails; a push failure is logged and
//! counted, never fatal.

pub mod model;

use std::collections::BTreeMap;

use model::*;

use crate::{
    http::{
        X_FORWARDED_HOST, X_FORWARDED_METHOD, X_FORWARDED_PATH, X_FORWARDED_PROTO,
        X_FORWARDED_QUERY, X_FORWARDED_URI, X_VIGIL_DYNAMIC_BACKEND_URL, X_VIGIL_LOOP,
        X_VIGIL_ROUTE_ID, X_VIGIL_USER_ID,
    },
    observability,
    policy::{Route, Snapshot, Upstream},
};

#[derive(Debug, thiserror::Error)]
pub enum CompilerError {
    #[error("failed to serialize caddy config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to push caddy config: {0}")]
    Push(String),

    #[error("failed to persist caddy config to {1}: {0}")]
    Persist(std::io::Error, String),
}

/// Compile the snapshot into a complete, fully-replaced Caddy config.
pub fn compile(snapshot: &Snapshot) -> CaddyConfig {
    let config = &snapshot.config;
    let control_plane = format!("localhost:{}", config.auth_listen_port);
    let base = snapshot.base_path().trim_end_matches('/').to_string();

    let mut routes = Vec::with_capacity(snapshot.routes.len() + 3);
    routes.push(loop_detection_route());
    for route in &snapshot.routes {
        routes.push(policy_route(route, &control_plane, &base));
    }
    routes.push(control_plane_route(&config.service_host(), &control_plane));
    routes.push(default_not_found_route());

    let mut logs = BTreeMap::new();
    logs.insert(
        "default".to_string(),
        LogConfig {
            writer: LogWriter {
                output: "stdout".into(),
            },
            encoder: LogEncoder {
                format: "json".into(),
            },
        },
    );

    let mut servers = BTreeMap::new();
    servers.insert(
        "srv0".to_string(),
        Server {
            listen: vec![format!(":{}", config.caddy_http_port)],
            routes,
        },
    );

    CaddyConfig {
        logging: Logging { logs },
        apps: Apps {
            http: HttpApp {
                http_port: config.caddy_http_port,
                https_port: config.caddy_https_port,
                servers,
            },
        },
    }
}

/// Requests already stamped by a terminal proxy hop must not recurse: a
/// destination pointing back at the proxy terminates here with a 503.
fn loop_detection_route() -> CaddyRoute {
    let mut header = BTreeMap::new();
    header.insert(X_VIGIL_LOOP.to_string(), vec!["*".to_string()]);
    CaddyRoute {
        matchers: Some(vec![Matcher {
            header: Some(header),
            ..Matcher::default()
        }]),
        handle: vec![Handler::StaticResponse {
            status_code: Some("503".into()),
            body: Some("loop detected".into()),
            close: true,
        }],
        terminal: true,
    }
}

fn policy_route(route: &Route, control_plane: &str, base: &str) -> CaddyRoute {
    CaddyRoute {
        matchers: Some(vec![Matcher {
            host: Some(vec![route.from_host.clone()]),
            ..Matcher::default()
        }]),
        handle: vec![Handler::Subroute {
            routes: vec![
                handoff_subroute(control_plane, base),
                verify_subroute(route, control_plane),
                terminal_proxy(route),
            ],
        }],
        terminal: true,
    }
}

/// The per-domain session endpoints bypass verification and go straight to
/// the control plane.
fn handoff_subroute(control_plane: &str, base: &str) -> CaddyRoute {
    CaddyRoute {
        matchers: Some(vec![Matcher {
            path: Some(vec![format!("{base}/set"), format!("{base}/logout")]),
            ..Matcher::default()
        }]),
        handle: vec![Handler::ReverseProxy {
            handle_response: None,
            headers: None,
            rewrite: None,
            transport: None,
            upstreams: Some(vec![UpstreamDial {
                dial: control_plane.to_string(),
            }]),
            dynamic_upstreams: None,
        }],
        terminal: false,
    }
}

/// The verify hop: every request is rewritten to `GET /verify` against the
/// control plane with the original coordinates as headers; only on a 2xx
/// are the allow-listed response headers copied onto the upstream request.
fn verify_subroute(route: &Route, control_plane: &str) -> CaddyRoute {
    let mut forward = BTreeMap::new();
    forward.insert(
        X_FORWARDED_METHOD.to_string(),
        vec!["{http.request.method}".to_string()],
    );
    forward.insert(
        X_FORWARDED_PATH.to_string(),
        vec!["{http.request.orig_uri.path}".to_string()],
    );
    forward.insert(
        X_FORWARDED_PROTO.to_string(),
        vec!["{http.request.scheme}".to_string()],
    );
    forward.insert(
        X_FORWARDED_HOST.to_string(),
        vec!["{http.request.host}".to_string()],
    );
    forward.insert(
        X_FORWARDED_QUERY.to_string(),
        vec!["{http.request.orig_uri.query}".to_string()],
    );
    forward.insert(
        X_FORWARDED_URI.to_string(),
        vec!["{http.request.uri}".to_string()],
    );
    forward.insert(X_VIGIL_ROUTE_ID.to_string(), vec![route.id.clone()]);

    let mut copy = BTreeMap::new();
    for name in copy_header_allow_list(route) {
        copy.insert(
            name.clone(),
            vec![format!("{{http.reverse_proxy.header.{name}}}")],
        );
    }

    CaddyRoute {
        matchers: None,
        handle: vec![Handler::ReverseProxy {
            handle_response: Some(vec![ResponseHandler {
                matcher: Some(ResponseMatcher {
                    status_code: vec![2],
                }),
                routes: vec![CaddyRoute {
                    matchers: None,
                    handle: vec![Handler::Headers {
                        request: Some(HeaderOps {
                            set: Some(copy),
                            delete: None,
                        }),
                        response: None,
                    }],
                    terminal: false,
                }],
            }]),
            headers: Some(ProxyHeaders {
                request: Some(HeaderOps {
                    set: Some(forward),
                    delete: None,
                }),
            }),
            rewrite: Some(Rewrite {
                method: "GET".into(),
                uri: "/verify".into(),
            }),
            transport: None,
            upstreams: Some(vec![UpstreamDial {
                dial: control_plane.to_string(),
            }]),
            dynamic_upstreams: None,
        }],
        terminal: false,
    }
}

/// Headers the verify subroute is allowed to copy from the verify response
/// onto the upstream request. Sorted for deterministic output.
fn copy_header_allow_list(route: &Route) -> Vec<String> {
    let mut names = vec![X_VIGIL_USER_ID.to_string()];
    names.extend(route.policy.claims_headers.keys().cloned());
    names.extend(route.policy.request_header_map_headers.iter().cloned());
    if route.uses_dynamic_backend() {
        names.push(X_VIGIL_DYNAMIC_BACKEND_URL.to_string());
    }
    names.sort();
    names.dedup();
    names
}

fn terminal_proxy(route: &Route) -> CaddyRoute {
    let policy = &route.policy;

    let mut set = BTreeMap::new();
    set.insert(
        "Host".to_string(),
        vec!["{http.reverse_proxy.upstream.hostport}".to_string()],
    );
    // The loop stamp: a destination pointing back at the proxy re-enters
    // carrying it and is cut off by the loop-detection route.
    set.insert(X_VIGIL_LOOP.to_string(), vec!["1".to_string()]);
    for (name, value) in &policy.set_request_headers {
        set.insert(name.clone(), vec![value.clone()]);
    }

    let delete = if policy.remove_request_headers.is_empty() {
        None
    } else {
        let mut names = policy.remove_request_headers.clone();
        names.sort();
        Some(names)
    };

    let (upstreams, dynamic_upstreams) = match &route.upstream {
        Upstream::Static { .. } => {
            let dial = route.dial().unwrap_or_default();
            (Some(vec![UpstreamDial { dial }]), None)
        }
        Upstream::DnsA { name, port } => (
            None,
            Some(DynamicUpstreams {
                source: "a".into(),
                name: name.clone(),
                port: Some(port.to_string()),
            }),
        ),
        Upstream::DnsSrv { name } => (
            None,
            Some(DynamicUpstreams {
                source: "srv".into(),
                name: name.clone(),
                port: None,
            }),
        ),
        Upstream::External => (
            Some(vec![UpstreamDial {
                dial: format!("{{http.request.header.{X_VIGIL_DYNAMIC_BACKEND_URL}}}"),
            }]),
            None,
        ),
    };

    CaddyRoute {
        matchers: None,
        handle: vec![Handler::ReverseProxy {
            handle_response: None,
            headers: Some(ProxyHeaders {
                request: Some(HeaderOps {
                    set: Some(set),
                    delete,
                }),
            }),
            rewrite: None,
            transport: transport_for(route),
            upstreams,
            dynamic_upstreams,
        }],
        terminal: false,
    }
}

fn transport_for(route: &Route) -> Option<Transport> {
    let policy = &route.policy;
    let wants_tls = matches!(&route.upstream, Upstream::Static { url } if url.scheme() == "https")
        || policy.tls_insecure_skip_verify
        || policy.tls_server_name.is_some();
    if !wants_tls {
        return None;
    }
    Some(Transport {
        protocol: "http".into(),
        tls: Some(TransportTls {
            insecure_skip_verify: policy.tls_insecure_skip_verify,
            server_name: policy.tls_server_name.clone(),
        }),
    })
}

/// The control plane's own hostname: SSO endpoints, JWKS, health, metrics.
fn control_plane_route(service_host: &str, control_plane: &str) -> CaddyRoute {
    CaddyRoute {
        matchers: Some(vec![Matcher {
            host: Some(vec![service_host.to_string()]),
            ..Matcher::default()
        }]),
        handle: vec![Handler::ReverseProxy {
            handle_response: None,
            headers: None,
            rewrite: None,
            transport: None,
            upstreams: Some(vec![UpstreamDial {
                dial: control_plane.to_string(),
            }]),
            dynamic_upstreams: None,
        }],
        terminal: true,
    }
}

fn default_not_found_route() -> CaddyRoute {
    CaddyRoute {
        matchers: None,
        handle: vec![Handler::StaticResponse {
            status_code: Some("404".into()),
            body: None,
            close: false,
        }],
        terminal: true,
    }
}

/// Push the compiled config to the admin API and persist it to disk. Both
/// side effects are attempted regardless of the other's outcome.
pub async fn apply(
    config: &CaddyConfig,
    admin_url: &str,
    persist_path: &str,
    http: &reqwest::Client,
) -> Result<(), CompilerError> {
    let body = serde_json::to_string(config)?;

    let push_result = push(&body, admin_url, http).await;
    observability::record_caddy_push(push_result.is_ok());
    if let Err(err) = &push_result {
        tracing::error!(error = %err, "caddy config push failed, previous config stays active");
    }

    let persist_result = tokio::fs::write(persist_path, &body)
        .await
        .map_err(|e| CompilerError::Persist(e, persist_path.to_string()));
    if let Err(err) = &persist_result {
        tracing::error!(error = %err, "caddy config persist failed");
    }

    push_result.and(persist_result)
}

async fn push(body: &str, admin_url: &str, http: &reqwest::Client) -> Result<(), CompilerError> {
    let url = format!("{}/load", admin_url.trim_end_matches('/'));
    let response = http
        .post(&url)
        .header("Content-Type", "application/json")
        .body(body.to_string())
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| CompilerError::Push(e.to_string()))?;
    if !response.status().is_success() {
        return Err(CompilerError::Push(format!(
            "admin API returned {}",
            response.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::VigilConfig, test_support::test_config_yaml};

    fn snapshot(policy_yaml: &str) -> Snapshot {
        let config = VigilConfig::from_yaml(&test_config_yaml(policy_yaml)).unwrap();
        Snapshot::build(config).unwrap()
    }

    #[test]
    fn identical_input_compiles_byte_identical() {
        let snapshot = snapshot(
            "  - from: https://app.example.com\n    to: https://backend:8080\n    allowed_groups: [eng]\n",
        );
        let one = serde_json::to_string(&compile(&snapshot)).unwrap();
        let two = serde_json::to_string(&compile(&snapshot)).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn loop_route_first_and_not_found_last() {
        let snapshot = snapshot(
            "  - from: https://app.example.com\n    to: https://backend:8080\n",
        );
        let compiled = compile(&snapshot);
        let routes = &compiled.apps.http.servers["srv0"].routes;

        let first = routes.first().unwrap();
        let header = first.matchers.as_ref().unwrap()[0].header.as_ref().unwrap();
        assert!(header.contains_key(X_VIGIL_LOOP));
        assert!(matches!(
            first.handle[0],
            Handler::StaticResponse { ref status_code, .. } if status_code.as_deref() == Some("503")
        ));

        let last = routes.last().unwrap();
        assert!(matches!(
            last.handle[0],
            Handler::StaticResponse { ref status_code, .. } if status_code.as_deref() == Some("404")
        ));
    }

    #[test]
    fn static_upstream_dials_host_and_port() {
        let snapshot = snapshot(
            "  - from: https://app.example.com\n    to: https://backend:8080\n",
        );
        let compiled = compile(&snapshot);
        let json = serde_json::to_value(&compiled).unwrap();
        let text = json.to_string();
        assert!(text.contains("backend:8080"));
        assert!(text.contains("insecure_skip_verify") || text.contains("\"tls\":{}"));
    }

    #[test]
    fn dns_srv_upstream_uses_dynamic_source() {
        let snapshot = snapshot(
            "  - from: https://app.example.com\n    to:\n      source: dns_srv\n      name: _web._tcp.backend.local\n",
        );
        let compiled = compile(&snapshot);
        let text = serde_json::to_value(&compiled).unwrap().to_string();
        assert!(text.contains("\"source\":\"srv\""));
        assert!(text.contains("_web._tcp.backend.local"));
    }

    #[test]
    fn copy_allow_list_covers_identity_claims_and_overlay_headers() {
        let snapshot = snapshot(
            "  - from: https://app.example.com\n    to: https://backend:8080\n    claims_headers:\n      X-User-Jwt: jwt\n    request_header_map_headers: [X-Team]\n    request_header_map_inline:\n      eng:\n        X-Team: engineering\n",
        );
        let route = snapshot.routes[0].as_ref();
        let names = copy_header_allow_list(route);
        assert!(names.contains(&X_VIGIL_USER_ID.to_string()));
        assert!(names.contains(&"X-User-Jwt".to_string()));
        assert!(names.contains(&"X-Team".to_string()));
        assert!(!names.contains(&X_VIGIL_DYNAMIC_BACKEND_URL.to_string()));
    }

    #[test]
    fn absent_optional_keys_are_stripped_not_null() {
        let snapshot = snapshot(
            "  - from: https://app.example.com\n    to: http://backend:8080\n",
        );
        let text = serde_json::to_string(&compile(&snapshot)).unwrap();
        assert!(!text.contains("null"));
    }
}
