//! Sandbox preview proxy authentication.
//!
//! Maps an untrusted path token (a sandbox id or a signed preview URL
//! token) plus a client credential into a validated sandbox id, issues a
//! short-lived authenticated cookie after a token exchange, and redirects
//! unauthenticated clients to the upstream auth URL.
//!
//! The validators and the exchanger are capability traits so the handler
//! depends only on behavior; the Admin API client implements all of them.

pub mod cookie;
pub mod exchange;
pub mod resolver;
pub mod server;

use anyhow::Result;
use async_trait::async_trait;

/// Checks whether a bearer token is authorized for a sandbox.
#[async_trait]
pub trait BearerValidator: Send + Sync {
    async fn validate_bearer(&self, sandbox_id: &str, token: &str) -> Result<bool>;
}

/// Checks whether a per-sandbox auth key is valid.
#[async_trait]
pub trait AuthKeyValidator: Send + Sync {
    async fn validate_auth_key(&self, sandbox_id: &str, auth_key: &str) -> Result<bool>;
}

/// Trades a signed preview URL token for the sandbox id it grants.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange_token(&self, token: &str, port: u16) -> Result<String>;
}

/// Produces the auth URL unauthenticated clients are redirected to.
#[async_trait]
pub trait AuthUrlProvider: Send + Sync {
    async fn auth_url(&self, id_or_token: &str, original_uri: &str) -> Result<String>;
}

pub use server::run;
