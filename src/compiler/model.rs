//! Typed model of the Caddy JSON configuration we emit.
//!
//! Only the subset of Caddy's schema the compiler produces is modelled.
//! Optional keys are skipped entirely when absent (Caddy rejects explicit
//! nulls for several of them), and values Caddy wants as strings are typed
//! as strings here even when they are numeric in our own config. Ordered
//! maps keep serialization deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaddyConfig {
    pub logging: Logging,
    pub apps: Apps,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Logging {
    pub logs: BTreeMap<String, LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    pub writer: LogWriter,
    pub encoder: LogEncoder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogWriter {
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEncoder {
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Apps {
    pub http: HttpApp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpApp {
    pub http_port: u16,
    pub https_port: u16,
    pub servers: BTreeMap<String, Server>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub listen: Vec<String>,
    pub routes: Vec<CaddyRoute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaddyRoute {
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matchers: Option<Vec<Matcher>>,
    pub handle: Vec<Handler>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Matcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Handler {
    Subroute {
        routes: Vec<CaddyRoute>,
    },
    StaticResponse {
        // Caddy accepts either form but rejects null; always a string.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        close: bool,
    },
    Headers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<HeaderOps>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<HeaderOps>,
    },
    ReverseProxy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle_response: Option<Vec<ResponseHandler>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<ProxyHeaders>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rewrite: Option<Rewrite>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<Transport>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upstreams: Option<Vec<UpstreamDial>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic_upstreams: Option<DynamicUpstreams>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeaderOps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProxyHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOps>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rewrite {
    pub method: String,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transport {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TransportTls>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransportTls {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamDial {
    pub dial: String,
}

/// DNS-driven upstream resolution (`a` or `srv` source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DynamicUpstreams {
    pub source: String,
    pub name: String,
    // Caddy's `a` source wants the port as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseHandler {
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<ResponseMatcher>,
    pub routes: Vec<CaddyRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMatcher {
    /// Status class matcher: `[2]` matches every 2xx response.
    pub status_code: Vec<u16>,
}
