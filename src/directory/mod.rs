//! User directory: identities, group membership and per-user challenges.
//!
//! The directory is an external collaborator behind a uniform capability
//! interface. A provider is selected by the `idp_provider` config
//! discriminator at startup; requests always read through a bounded-TTL
//! cache and treat "adapter unreachable" as "use the last good entry",
//! never as request failure. A scheduled task refreshes the provider on an
//! interval, fully decoupled from request handling.

mod claims;
mod local_file;

use std::{sync::Arc, time::{Duration, Instant}};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub use claims::ClaimsDirectory;
pub use local_file::LocalFileDirectory;

use crate::{config::VigilConfig, observability};

/// How long a directory lookup is served from cache.
const LOOKUP_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory record is malformed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("directory store unavailable: {0}")]
    Store(String),

    #[error("unknown idp_provider: {0}")]
    UnknownProvider(String),
}

impl From<redis::RedisError> for DirectoryError {
    fn from(err: redis::RedisError) -> Self {
        DirectoryError::Store(err.to_string())
    }
}

/// A resolved user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Backfilled from the map key by the local_file provider when absent.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default, alias = "displayName")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Provider-specific principal name.
    #[serde(default)]
    pub upn: Option<String>,
    /// Random per-user value established at registration; the hand-off
    /// token carries a slow hash of it. Never sent to clients in clear.
    #[serde(default)]
    pub challenge: Option<String>,
}

impl Identity {
    /// Literal attribute lookup for `claims_headers` copies.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "mail" | "email" => self.mail.clone(),
            "displayName" | "display_name" => self.display_name.clone(),
            "upn" => self.upn.clone(),
            "groups" => Some(self.groups.join(",")),
            _ => None,
        }
    }
}

/// Capability interface every directory provider implements.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Full resynchronization from the provider's source of truth.
    async fn run_update(&self) -> Result<(), DirectoryError>;

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<Identity>, DirectoryError>;

    async fn get_all_users(&self) -> Result<Vec<Identity>, DirectoryError>;

    /// Just-in-time enrollment from OIDC claims. Providers without the
    /// capability leave the default no-op in place.
    async fn add_new_user_from_claims(
        &self,
        _claims: &serde_json::Value,
    ) -> Result<(), DirectoryError> {
        tracing::debug!("directory provider does not support claims enrollment, skipping");
        Ok(())
    }
}

/// Read-through cache in front of a provider. Lookup failures fall back to
/// the last good entry so a flapping adapter never fails requests.
pub struct CachedDirectory {
    inner: Arc<dyn Directory>,
    lookups: DashMap<String, (Option<Identity>, Instant)>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn Directory>) -> Self {
        Self {
            inner,
            lookups: DashMap::new(),
        }
    }
}

#[async_trait]
impl Directory for CachedDirectory {
    async fn run_update(&self) -> Result<(), DirectoryError> {
        self.inner.run_update().await
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<Identity>, DirectoryError> {
        if let Some(entry) = self.lookups.get(user_id) {
            if entry.1 > Instant::now() {
                return Ok(entry.0.clone());
            }
        }

        match self.inner.get_user_by_id(user_id).await {
            Ok(found) => {
                self.lookups.insert(
                    user_id.to_string(),
                    (found.clone(), Instant::now() + LOOKUP_CACHE_TTL),
                );
                Ok(found)
            }
            Err(err) => {
                // Stale-but-available beats unavailable.
                if let Some(entry) = self.lookups.get(user_id) {
                    tracing::warn!(error = %err, user = user_id, "directory lookup failed, serving last good entry");
                    return Ok(entry.0.clone());
                }
                Err(err)
            }
        }
    }

    async fn get_all_users(&self) -> Result<Vec<Identity>, DirectoryError> {
        self.inner.get_all_users().await
    }

    async fn add_new_user_from_claims(
        &self,
        claims: &serde_json::Value,
    ) -> Result<(), DirectoryError> {
        self.inner.add_new_user_from_claims(claims).await?;
        // Enrollment may change records; the claim key naming the user is
        // provider-specific, so drop the whole (small) lookup cache.
        self.lookups.clear();
        Ok(())
    }
}

/// Build the configured provider wrapped in the lookup cache.
pub async fn from_config(config: &VigilConfig) -> Result<Arc<dyn Directory>, DirectoryError> {
    let provider: Arc<dyn Directory> = match config.idp_provider.as_str() {
        "local_file" => Arc::new(LocalFileDirectory::new(
            config
                .idp_provider_localfile_location
                .clone()
                .unwrap_or_default(),
        )),
        "claims" => Arc::new(
            ClaimsDirectory::connect(&config.redis_url, &config.idp_provider_user_id_claim)
                .await?,
        ),
        other => return Err(DirectoryError::UnknownProvider(other.to_string())),
    };
    Ok(Arc::new(CachedDirectory::new(provider)))
}

/// Periodic directory synchronization, independent of request handling.
pub fn spawn_update_task(
    directory: Arc<dyn Directory>,
    interval: Duration,
    refresh_at_start: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if refresh_at_start {
            run_update_once(directory.as_ref()).await;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            run_update_once(directory.as_ref()).await;
        }
    })
}

async fn run_update_once(directory: &dyn Directory) {
    let started = Instant::now();
    match directory.run_update().await {
        Ok(()) => {
            let duration = started.elapsed();
            observability::record_idp_update(true, duration);
            tracing::info!(duration_secs = duration.as_secs_f64(), "directory updated");
        }
        Err(err) => {
            observability::record_idp_update(false, started.elapsed());
            tracing::error!(error = %err, "failed to update users and groups from directory");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_directory {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Fixed-map directory that can be flipped into a failing state, for
    /// exercising the cache fallback.
    #[derive(Default)]
    pub struct StaticDirectory {
        pub users: std::collections::HashMap<String, Identity>,
        pub failing: AtomicBool,
    }

    impl StaticDirectory {
        pub fn with_users(users: Vec<Identity>) -> Self {
            Self {
                users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Directory for StaticDirectory {
        async fn run_update(&self) -> Result<(), DirectoryError> {
            Ok(())
        }

        async fn get_user_by_id(
            &self,
            user_id: &str,
        ) -> Result<Option<Identity>, DirectoryError> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(DirectoryError::Store("adapter unreachable".into()));
            }
            Ok(self.users.get(user_id).cloned())
        }

        async fn get_all_users(&self) -> Result<Vec<Identity>, DirectoryError> {
            Ok(self.users.values().cloned().collect())
        }
    }

    pub fn identity(id: &str, groups: &[&str]) -> Identity {
        Identity {
            id: id.to_string(),
            mail: Some(format!("{id}@example.com")),
            display_name: Some(id.to_string()),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            upn: None,
            challenge: Some(crate::auth::keys::random_value()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_directory::{StaticDirectory, identity};
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn cached_directory_serves_last_good_on_failure() {
        let inner = Arc::new(StaticDirectory::with_users(vec![identity("u1", &["eng"])]));
        let cached = CachedDirectory::new(inner.clone());

        let first = cached.get_user_by_id("u1").await.unwrap().unwrap();
        assert_eq!(first.groups, vec!["eng"]);

        inner.failing.store(true, Ordering::Relaxed);
        let second = cached.get_user_by_id("u1").await.unwrap().unwrap();
        assert_eq!(second.id, "u1");

        // Never-seen users still surface the adapter error.
        assert!(cached.get_user_by_id("u2").await.is_err());
    }

    #[test]
    fn attribute_lookup_covers_the_literal_claim_names() {
        let user = identity("u1", &["eng", "ops"]);
        assert_eq!(user.attribute("id").as_deref(), Some("u1"));
        assert_eq!(user.attribute("mail").as_deref(), Some("u1@example.com"));
        assert_eq!(user.attribute("groups").as_deref(), Some("eng,ops"));
        assert!(user.attribute("does_not_exist").is_none());
    }
}
