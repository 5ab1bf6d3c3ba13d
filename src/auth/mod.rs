//! Authentication building blocks: error taxonomy, signing keys, machine
//! tokens and the SSO state machine.

pub mod keys;
pub mod sso;
pub mod token;

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

/// User-facing authentication/authorization failures.
///
/// Every variant maps to a status code, a stable error code rendered on the
/// error page, and a generic description. No variant ever falls through to
/// an authenticated state: each one terminates the request with an explicit
/// deny.
#[derive(Debug)]
pub enum AuthError {
    /// No route matches the supplied route identifier.
    RouteNotFound,

    /// An endpoint that requires a redirect token was called without one.
    MissingToken,

    /// Redirect-token signature or shape validation failed.
    InvalidToken,

    /// Redirect token was valid once but is past its expiry.
    ExpiredToken,

    /// OIDC callback state did not match the session (CSRF defense).
    StateMismatch,

    /// Hand-off token challenge hash did not match the directory value.
    ChallengeMismatch,

    /// The provider's ID token is missing the configured user-id claim.
    MissingClaim(String),

    /// Authenticated user does not exist in the directory.
    UserNotFound,

    /// Authorization denied (group or machine-token evaluation failed).
    Denied,

    /// The OIDC provider could not be reached or rejected the exchange,
    /// and the bounded retry budget is exhausted.
    ProviderUnavailable,

    /// Dynamic backend resolution failed after authorization allowed the
    /// request. Hard failure, never a silent pass-through.
    DynamicBackendFailed,

    /// Session store I/O failure.
    SessionStore(String),

    Internal(String),
}

impl AuthError {
    fn parts(&self) -> (StatusCode, &'static str, &'static str, String) {
        match self {
            AuthError::RouteNotFound => (
                StatusCode::NOT_FOUND,
                "ERR_NOT_FOUND",
                "Resource Not Found",
                "The requested resource cannot be found. Please check and try again.".into(),
            ),
            AuthError::MissingToken => (
                StatusCode::BAD_REQUEST,
                "ERR_MISSING_TOKEN",
                "Bad Request",
                "Request must include a token.".into(),
            ),
            AuthError::InvalidToken => (
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_TOKEN",
                "Bad Request",
                "The supplied token could not be verified.".into(),
            ),
            AuthError::ExpiredToken => (
                StatusCode::BAD_REQUEST,
                "ERR_EXPIRED_TOKEN",
                "Bad Request",
                "The supplied token has expired. Please retry the request.".into(),
            ),
            AuthError::StateMismatch => (
                StatusCode::FORBIDDEN,
                "ERR_STATE_MISMATCH",
                "Unauthorized",
                "Login state could not be validated. Please retry the request.".into(),
            ),
            AuthError::ChallengeMismatch => (
                StatusCode::FORBIDDEN,
                "ERR_CHALLENGE_MISMATCH",
                "Unauthorized",
                "Session hand-off could not be validated.".into(),
            ),
            AuthError::MissingClaim(claim) => (
                StatusCode::BAD_REQUEST,
                "ERR_MISSING_CLAIM",
                "Bad Request",
                format!("The identity provider response is missing the '{claim}' claim."),
            ),
            AuthError::UserNotFound => (
                StatusCode::FORBIDDEN,
                "ERR_NOT_AUTHORIZED",
                "Unauthorized",
                "You are not authorized to access the requested resource.".into(),
            ),
            AuthError::Denied => (
                StatusCode::FORBIDDEN,
                "ERR_NOT_AUTHORIZED",
                "Unauthorized",
                "You are not authorized to access the requested resource.".into(),
            ),
            AuthError::ProviderUnavailable => (
                StatusCode::BAD_GATEWAY,
                "ERR_PROVIDER_UNAVAILABLE",
                "Service Unavailable",
                "The identity provider is currently not available. Please try again later."
                    .into(),
            ),
            AuthError::DynamicBackendFailed => (
                StatusCode::BAD_GATEWAY,
                "ERR_DYNAMIC_BACKEND",
                "Service Unavailable",
                "The requested resource is currently not available. Please try again later."
                    .into(),
            ),
            AuthError::SessionStore(_) | AuthError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_INTERNAL_ERROR",
                "Internal Server Error",
                "An internal server error occurred. Please try again.".into(),
            ),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::SessionStore(msg) => write!(f, "session store error: {msg}"),
            AuthError::Internal(msg) => write!(f, "internal error: {msg}"),
            AuthError::MissingClaim(claim) => write!(f, "missing claim: {claim}"),
            other => write!(f, "{}", other.parts().1),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<keys::KeyError> for AuthError {
    fn from(err: keys::KeyError) -> Self {
        match err {
            keys::KeyError::Expired => AuthError::ExpiredToken,
            keys::KeyError::Verify(_) => AuthError::InvalidToken,
            other => AuthError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, header, description) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        } else {
            tracing::info!(error = %self, code, "request denied");
        }
        (status, Html(render_error_page(status, header, &description, code))).into_response()
    }
}

/// Render the full-page HTML error document with its stable error code.
pub fn render_error_page(
    status: StatusCode,
    header: &str,
    description: &str,
    error_code: &str,
) -> String {
    let status_code = status.as_u16();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{status_code} {header}</title>
  <style>
    body {{ font-family: system-ui, sans-serif; display: flex; align-items: center;
           justify-content: center; min-height: 100vh; margin: 0; background: #f5f6f8; }}
    main {{ text-align: center; padding: 2rem; }}
    h1 {{ font-size: 3rem; margin: 0; color: #1f2937; }}
    p {{ color: #4b5563; }}
    code {{ color: #9ca3af; font-size: 0.8rem; }}
  </style>
</head>
<body>
  <main>
    <h1>{status_code}</h1>
    <h2>{header}</h2>
    <p>{description}</p>
    <code>{error_code}</code>
  </main>
</body>
</html>
"#
    )
}
