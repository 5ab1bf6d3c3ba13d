//! Signing key material and token minting.
//!
//! Every token Vigil mints — ephemeral redirect tokens, cross-domain
//! hand-off tokens and per-route identity assertions — is signed RS256 with
//! the single configured RSA key. The public half is published as a JWKS
//! document so backends can verify injected identity JWTs. The key is parsed
//! once per config load and is immutable between reloads.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::DecodePrivateKey,
    traits::PublicKeyParts,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("failed to sign token: {0}")]
    Sign(jsonwebtoken::errors::Error),

    #[error("token has expired")]
    Expired,

    #[error("token verification failed: {0}")]
    Verify(jsonwebtoken::errors::Error),

    #[error("challenge hash error: {0}")]
    Challenge(String),
}

/// Claims of an ephemeral redirect token.
///
/// These tokens ferry authentication state across the redirect chain between
/// domains that cannot share cookies. They are attacker-reachable input on
/// every endpoint that accepts them and are only ever trusted after
/// signature and expiry verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedirectClaims {
    pub protocol: String,
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    /// Set on hand-off tokens once the origin session is authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Expiry of the origin session; the receiving domain caps its own
    /// cookie at this instant and never extends trust beyond it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_expires: Option<i64>,
    /// Slow hash of the per-user challenge value, verified by `/set`
    /// against the directory to detect signing-key compromise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_hash: Option<String>,
    pub exp: i64,
}

impl RedirectClaims {
    /// Reassemble the originally requested URL, replaying the query string.
    pub fn original_url(&self) -> String {
        if self.query.is_empty() {
            format!("{}://{}{}", self.protocol, self.host, self.path)
        } else {
            format!("{}://{}{}?{}", self.protocol, self.host, self.path, self.query)
        }
    }
}

/// Claims of a minted per-route identity assertion (`claims_headers: jwt`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub oid: String,
    pub uid: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Intersection of the user's groups with the route's allowed groups,
    /// never the full group set.
    pub groups: Vec<String>,
    pub aud: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// One JWKS member, RSA signature key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// The process-wide signing key pair plus its published JWK.
pub struct SigningKeys {
    kid: String,
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Jwk,
}

impl SigningKeys {
    /// Parse an RSA private key PEM (PKCS#8 or PKCS#1) and derive the
    /// verification key and JWKS member from it.
    pub fn from_pem(pem: &str, kid: &str, issuer: &str) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let public = private.to_public_key();

        let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());

        let encoding =
            EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let decoding = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        let jwk = Jwk {
            kty: "RSA".into(),
            use_: "sig".into(),
            alg: "RS256".into(),
            kid: kid.to_string(),
            n,
            e,
        };

        Ok(Self {
            kid: kid.to_string(),
            issuer: issuer.to_string(),
            encoding,
            decoding,
            jwk,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign arbitrary claims RS256 with the published kid.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, KeyError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding).map_err(KeyError::Sign)
    }

    /// Verify signature and expiry, without audience checking (redirect
    /// tokens carry no audience).
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, KeyError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 5;
        validation.validate_aud = false;
        jsonwebtoken::decode::<T>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => KeyError::Expired,
                _ => KeyError::Verify(e),
            })
    }

    /// Mint a redirect token valid for `ttl_seconds`.
    pub fn mint_redirect_token(
        &self,
        mut claims: RedirectClaims,
        ttl_seconds: u64,
    ) -> Result<String, KeyError> {
        claims.exp = Utc::now().timestamp() + ttl_seconds as i64;
        self.sign(&claims)
    }

    /// The published key set.
    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: vec![self.jwk.clone()],
        }
    }
}

impl std::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeys")
            .field("kid", &self.kid)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// Argon2id-hash a per-user challenge value for embedding in a hand-off
/// token. The hash is slow by construction so a compromised signing key
/// alone is not enough to forge hand-off tokens at scale.
pub fn hash_challenge(challenge: &str) -> Result<String, KeyError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(challenge.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| KeyError::Challenge(e.to_string()))
}

/// Check a hand-off token's challenge hash against the directory-stored
/// challenge value.
pub fn verify_challenge(challenge: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(challenge.as_bytes(), &parsed)
        .is_ok()
}

/// Generate a random value for OIDC anti-replay state and user challenges.
pub fn random_value() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
