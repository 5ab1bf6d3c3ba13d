//! Directory provider that enrolls users just-in-time from OIDC claims.
//!
//! Records live in the shared Redis store with a 24h expiry, so identity
//! survives across control plane instances without a separate sync source.
//! The per-user challenge is generated on first enrollment and preserved on
//! re-enrollment: rotating it would invalidate hand-off tokens already in
//! flight for that user.

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{Directory, DirectoryError, Identity};
use crate::auth::keys::random_value;

const USER_KEY_PREFIX: &str = "vigil:users:";
const USER_TTL_SECONDS: u64 = 86_400;

pub struct ClaimsDirectory {
    connection: redis::aio::MultiplexedConnection,
    user_id_claim: String,
}

impl ClaimsDirectory {
    pub async fn connect(redis_url: &str, user_id_claim: &str) -> Result<Self, DirectoryError> {
        let client = redis::Client::open(redis_url).map_err(DirectoryError::from)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(DirectoryError::from)?;
        Ok(Self {
            connection,
            user_id_claim: user_id_claim.to_string(),
        })
    }

    async fn read_user(&self, user_id: &str) -> Result<Option<Identity>, DirectoryError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(format!("{USER_KEY_PREFIX}{user_id}")).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Directory for ClaimsDirectory {
    /// Enrollment happens at login; there is no upstream to resync from.
    async fn run_update(&self) -> Result<(), DirectoryError> {
        Ok(())
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<Identity>, DirectoryError> {
        self.read_user(user_id).await
    }

    async fn get_all_users(&self) -> Result<Vec<Identity>, DirectoryError> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(format!("{USER_KEY_PREFIX}*")).await?;
        let mut users = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(json) = raw {
                users.push(serde_json::from_str(&json)?);
            }
        }
        Ok(users)
    }

    async fn add_new_user_from_claims(
        &self,
        claims: &serde_json::Value,
    ) -> Result<(), DirectoryError> {
        let Some(user_id) = claims
            .get(&self.user_id_claim)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
        else {
            tracing::warn!(
                claim = %self.user_id_claim,
                "claims enrollment skipped, user id claim absent"
            );
            return Ok(());
        };

        let existing = self.read_user(&user_id).await?;
        let challenge = existing
            .and_then(|u| u.challenge)
            .unwrap_or_else(random_value);

        let groups = claims
            .get("groups")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|g| g.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        let user = Identity {
            id: user_id.clone(),
            mail: claims
                .get("email")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            display_name: claims
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            groups,
            upn: claims
                .get("preferred_username")
                .and_then(|v| v.as_str())
                .map(str::to_owned),
            challenge: Some(challenge),
        };

        let mut conn = self.connection.clone();
        let json = serde_json::to_string(&user)?;
        let _: () = conn
            .set_ex(format!("{USER_KEY_PREFIX}{user_id}"), json, USER_TTL_SECONDS)
            .await?;
        tracing::debug!(user = %user_id, "enrolled user from claims");
        Ok(())
    }
}
