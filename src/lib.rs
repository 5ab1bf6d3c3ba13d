//! Vigil — identity-aware forward-authentication control plane for Caddy.
//!
//! Caddy delegates every inbound request to Vigil's `/verify` endpoint for an
//! authentication/authorization verdict before forwarding to a backend. Vigil
//! establishes identity through an upstream OIDC provider, propagates the
//! session across unrelated domains using short-lived signed tokens, and
//! compiles its declarative route policy into Caddy's JSON config.

pub mod auth;
pub mod authz;
pub mod backend;
pub mod compiler;
pub mod config;
pub mod directory;
pub mod http;
pub mod observability;
pub mod policy;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use http::AppState;
