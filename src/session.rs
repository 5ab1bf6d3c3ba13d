//! Server-side session state.
//!
//! Sessions live in a shared external store (Redis) so multiple control
//! plane instances can serve the same browser; each domain only ever holds
//! a cookie scoped to itself, and cross-domain identity transfer happens via
//! signed tokens, never by sharing this store's cookie. A `MemorySessionStore`
//! backs the test suite.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tower_cookies::{Cookie, Cookies, cookie::SameSite};
use uuid::Uuid;

use crate::auth::keys::RedirectClaims;

/// Name of the per-domain session cookie.
pub const SESSION_COOKIE: &str = "_vigil_sid";

const REDIS_KEY_PREFIX: &str = "vigil:session:";

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session store unavailable: {0}")]
    Store(String),

    #[error("session serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        SessionError::Store(err.to_string())
    }
}

impl From<SessionError> for crate::auth::AuthError {
    fn from(err: SessionError) -> Self {
        crate::auth::AuthError::SessionStore(err.to_string())
    }
}

/// Per-browser state keyed by the opaque session id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub logged_in: bool,

    #[serde(default)]
    pub user_id: Option<String>,

    /// Decoded redirect target preserved across the provider round-trip.
    #[serde(default)]
    pub redirect: Option<RedirectClaims>,

    /// OIDC anti-replay state value; checked then consumed by the callback.
    #[serde(default)]
    pub oauth_state: Option<String>,

    /// Bounded automatic re-attempts of the callback flow. Reset to zero
    /// once a flow succeeds.
    #[serde(default)]
    pub auth_retry_count: u32,

    /// Absolute expiry of this session. Hand-off caps it at the origin
    /// session's expiry, never extending the original grant.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Remaining lifetime used as the store TTL.
    pub fn ttl(&self, default_ttl: Duration) -> Duration {
        match self.expires_at {
            Some(at) => {
                let remaining = at.signed_duration_since(Utc::now()).num_seconds();
                if remaining <= 0 {
                    Duration::from_secs(1)
                } else {
                    Duration::from_secs(remaining as u64)
                }
            }
            None => default_ttl,
        }
    }
}

/// Read/write contract of the external session store. All mutations are
/// idempotent whole-record writes; no in-process locking spans an await.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> SessionResult<Option<Session>>;
    async fn save(&self, session_id: &str, session: &Session, ttl: Duration) -> SessionResult<()>;
    async fn destroy(&self, session_id: &str) -> SessionResult<()>;
}

/// Redis-backed store shared by all control plane instances.
pub struct RedisSessionStore {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisSessionStore {
    pub async fn connect(url: &str) -> SessionResult<Self> {
        let client = redis::Client::open(url).map_err(SessionError::from)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(SessionError::from)?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn load(&self, session_id: &str) -> SessionResult<Option<Session>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(format!("{REDIS_KEY_PREFIX}{session_id}")).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session_id: &str, session: &Session, ttl: Duration) -> SessionResult<()> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(session)?;
        let _: () = conn
            .set_ex(
                format!("{REDIS_KEY_PREFIX}{session_id}"),
                json,
                ttl.as_secs().max(1),
            )
            .await?;
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> SessionResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(format!("{REDIS_KEY_PREFIX}{session_id}")).await?;
        Ok(())
    }
}

/// In-memory store for tests and single-node development.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, (Session, Instant)>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> SessionResult<Option<Session>> {
        // The read guard must be released before removing the entry.
        let live = self
            .sessions
            .get(session_id)
            .map(|entry| (entry.0.clone(), entry.1));
        match live {
            Some((session, deadline)) if deadline > Instant::now() => Ok(Some(session)),
            Some(_) => {
                self.sessions.remove(session_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session_id: &str, session: &Session, ttl: Duration) -> SessionResult<()> {
        self.sessions
            .insert(session_id.to_string(), (session.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> SessionResult<()> {
        self.sessions.remove(session_id);
        Ok(())
    }
}

/// Resolve the caller's session from the cookie jar, creating a fresh empty
/// session (and cookie) when none exists.
pub async fn load_or_create(
    cookies: &Cookies,
    store: &dyn SessionStore,
    secure: bool,
) -> SessionResult<(String, Session)> {
    if let Some(cookie) = cookies.get(SESSION_COOKIE) {
        let session_id = cookie.value().to_string();
        if let Some(session) = store.load(&session_id).await? {
            return Ok((session_id, session));
        }
        // A presented id with no backing state is untrusted: fall through
        // and mint a fresh one, so a planted cookie never picks the id.
    }

    let session_id = Uuid::new_v4().to_string();
    cookies.add(build_session_cookie(&session_id, secure));
    Ok((session_id, Session::default()))
}

/// Swap the session id for a fresh one, dropping state stored under the old
/// id. Called at the moment a session gains authentication: the id a login
/// binds to must never be one the browser carried while unauthenticated.
pub async fn rotate_id(
    cookies: &Cookies,
    store: &dyn SessionStore,
    old_session_id: &str,
    secure: bool,
) -> SessionResult<String> {
    store.destroy(old_session_id).await?;
    let session_id = Uuid::new_v4().to_string();
    cookies.add(build_session_cookie(&session_id, secure));
    Ok(session_id)
}

/// Destroy the server-side state and expire the cookie.
pub async fn destroy(
    cookies: &Cookies,
    store: &dyn SessionStore,
    session_id: &str,
    secure: bool,
) -> SessionResult<()> {
    store.destroy(session_id).await?;
    let mut cookie = build_session_cookie(session_id, secure);
    cookie.set_max_age(tower_cookies::cookie::time::Duration::ZERO);
    cookies.add(cookie);
    Ok(())
}

fn build_session_cookie(session_id: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session_id.to_string()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .build()
}
