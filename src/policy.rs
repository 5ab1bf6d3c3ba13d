//! Parsed route table with atomic snapshot swap.
//!
//! The store owns everything derived from the config file: the validated
//! route table indexed by opaque route id, the external-auth hostname index,
//! and the signing key parsed from the configured PEM. Reload builds a whole
//! new [`Snapshot`] and swaps the inner `Arc` in one pointer store, so
//! concurrent readers never observe a half-updated table; a reload that
//! fails to parse or validate keeps the previous good snapshot.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use url::Url;

use crate::{
    auth::keys::{KeyError, SigningKeys},
    config::{ConfigError, RoutePolicy, UpstreamSource, UpstreamSpec, VigilConfig},
    observability,
};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// A validated route, immutable once compiled into a snapshot.
#[derive(Debug, Clone)]
pub struct Route {
    /// Opaque identifier carried by the proxy in `X-Vigil-Route-Id`.
    pub id: String,
    pub from_host: String,
    pub upstream: Upstream,
    pub policy: RoutePolicy,
}

/// Normalized destination, dispatched on by tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    Static { url: Url },
    DnsA { name: String, port: u16 },
    DnsSrv { name: String },
    External,
}

impl Route {
    fn build(index: usize, policy: RoutePolicy) -> Result<Self, ConfigError> {
        let from = crate::config::from_url(&policy.from)
            .map_err(|e| ConfigError::Validation(format!("policy[{index}].from: {e}")))?;
        let from_host = from
            .host_str()
            .ok_or_else(|| {
                ConfigError::Validation(format!("policy[{index}].from has no hostname"))
            })?
            .to_string();

        let upstream = match &policy.to {
            UpstreamSpec::Url(raw) => {
                let url = crate::config::parse_upstream_url(raw)
                    .map_err(|e| ConfigError::Validation(format!("policy[{index}].to: {e}")))?;
                Upstream::Static { url }
            }
            UpstreamSpec::Dynamic(spec) => match spec.source {
                UpstreamSource::Static => {
                    let name = spec.name.clone().unwrap_or_default();
                    let url = crate::config::parse_upstream_url(&name)
                        .map_err(|e| ConfigError::Validation(format!("policy[{index}].to: {e}")))?;
                    Upstream::Static { url }
                }
                UpstreamSource::DnsA => Upstream::DnsA {
                    name: spec.name.clone().unwrap_or_default(),
                    port: spec.port.unwrap_or(80),
                },
                UpstreamSource::DnsSrv => Upstream::DnsSrv {
                    name: spec.name.clone().unwrap_or_default(),
                },
                UpstreamSource::External => Upstream::External,
            },
        };

        Ok(Self {
            id: format!("route-{index}"),
            from_host,
            upstream,
            policy,
        })
    }

    /// Audience for minted identity JWTs: explicit override, else the
    /// destination hostname.
    pub fn audience(&self) -> String {
        if let Some(aud) = &self.policy.jwt_override_audience {
            return aud.clone();
        }
        match &self.upstream {
            Upstream::Static { url } => url.host_str().unwrap_or("unknown_aud").to_string(),
            Upstream::DnsA { name, .. } | Upstream::DnsSrv { name } => name.clone(),
            Upstream::External => "unknown_aud".to_string(),
        }
    }

    /// `host:port` dial target for a static upstream.
    pub fn dial(&self) -> Option<String> {
        match &self.upstream {
            Upstream::Static { url } => {
                let host = url.host_str()?;
                let port = url
                    .port()
                    .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
                Some(format!("{host}:{port}"))
            }
            _ => None,
        }
    }

    /// Whether the compiled verify subroute must copy the dynamic backend
    /// URL header, and verify must resolve it.
    pub fn uses_dynamic_backend(&self) -> bool {
        self.policy.dynamic_backend_config.is_some()
    }
}

/// Immutable view of one loaded configuration.
pub struct Snapshot {
    pub config: VigilConfig,
    pub keys: Arc<SigningKeys>,
    pub routes: Vec<Arc<Route>>,
    by_id: HashMap<String, Arc<Route>>,
    external_auth: HashMap<String, Arc<Route>>,
}

impl Snapshot {
    pub fn build(config: VigilConfig) -> Result<Self, PolicyError> {
        let keys = Arc::new(SigningKeys::from_pem(
            &config.signing_key,
            &config.jwks_key_id,
            &config.service_url,
        )?);

        let mut routes = Vec::with_capacity(config.policy.len());
        let mut by_id = HashMap::new();
        let mut external_auth = HashMap::new();
        for (index, policy) in config.policy.iter().cloned().enumerate() {
            let route = Arc::new(Route::build(index, policy)?);
            by_id.insert(route.id.clone(), route.clone());
            if route.policy.allow_external_auth {
                external_auth.insert(route.from_host.clone(), route.clone());
            }
            routes.push(route);
        }

        Ok(Self {
            config,
            keys,
            routes,
            by_id,
            external_auth,
        })
    }

    /// Route lookup by the opaque identifier the proxy attached.
    pub fn route(&self, route_id: &str) -> Option<Arc<Route>> {
        self.by_id.get(route_id).cloned()
    }

    /// Lookup over the index of routes flagged for external-auth
    /// integration, built once per reload.
    pub fn external_auth_route(&self, hostname: &str) -> Option<Arc<Route>> {
        self.external_auth.get(hostname).cloned()
    }

    pub fn base_path(&self) -> &str {
        &self.config.redirect_base_path
    }
}

/// Process-wide holder of the current snapshot.
pub struct PolicyStore {
    path: PathBuf,
    current: RwLock<Arc<Snapshot>>,
}

impl PolicyStore {
    /// Load the initial configuration. Startup fails hard on a bad file;
    /// only reloads fall back to the previous snapshot.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let config = VigilConfig::from_file(path.as_ref())?;
        let snapshot = Snapshot::build(config)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Build a store directly from a parsed config (tests, embedding).
    pub fn from_config(config: VigilConfig) -> Result<Self, PolicyError> {
        let snapshot = Snapshot::build(config)?;
        Ok(Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// The current snapshot. Cheap: one lock acquisition and an `Arc` clone.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().expect("policy lock poisoned").clone()
    }

    /// Re-read the config file and swap the table atomically. On any
    /// failure the previous good snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<Snapshot>, PolicyError> {
        let result = VigilConfig::from_file(&self.path)
            .map_err(PolicyError::from)
            .and_then(|config| Snapshot::build(config));

        match result {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.current.write().expect("policy lock poisoned") = snapshot.clone();
                observability::record_config_reload(true);
                tracing::info!(routes = snapshot.routes.len(), "configuration reloaded");
                Ok(snapshot)
            }
            Err(err) => {
                observability::record_config_reload(false);
                tracing::error!(error = %err, "configuration reload failed, keeping previous policy");
                Err(err)
            }
        }
    }
}
