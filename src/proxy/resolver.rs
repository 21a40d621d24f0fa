//! Ordered credential resolution.
//!
//! Attempts run strictly in order: bearer token, auth-key header, auth-key
//! query parameter, auth cookie, signed token exchange. Each attempt is
//! independent and non-fatal; the first success wins and the failures
//! accumulate reasons for the redirect log line. The auth-key header is
//! stripped before forwarding no matter which attempt settles the request.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Uri, header};
use log::{error, info, warn};

use crate::proxy::exchange::CookieMinter;
use crate::proxy::{AuthKeyValidator, BearerValidator, TokenExchanger};

/// Reason recorded when a request carried no credentials at all.
pub const MISSING_CREDENTIALS: &str = "missing authentication credentials";

/// Outcome of a single credential attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success {
        sandbox_id: String,
        set_cookie: Option<String>,
    },
    /// The credential was not presented; contributes nothing.
    Skipped,
    /// Presented but rejected.
    Invalid(String),
    /// The validator itself failed.
    Error(String),
}

/// Where a request ends up after the attempt chain.
#[derive(Debug)]
pub enum Resolution {
    Authenticated {
        sandbox_id: String,
        set_cookie: Option<String>,
    },
    Denied {
        reasons: Vec<String>,
    },
}

pub struct CredentialResolver {
    bearer: Arc<dyn BearerValidator>,
    auth_key: Arc<dyn AuthKeyValidator>,
    exchanger: Arc<dyn TokenExchanger>,
    minter: CookieMinter,
    auth_key_header: HeaderName,
    auth_key_query_param: String,
}

impl CredentialResolver {
    pub fn new(
        bearer: Arc<dyn BearerValidator>,
        auth_key: Arc<dyn AuthKeyValidator>,
        exchanger: Arc<dyn TokenExchanger>,
        minter: CookieMinter,
        auth_key_header: &str,
        auth_key_query_param: &str,
    ) -> Result<Self> {
        let auth_key_header = HeaderName::from_bytes(auth_key_header.as_bytes())
            .with_context(|| format!("invalid auth key header name '{auth_key_header}'"))?;
        Ok(Self {
            bearer,
            auth_key,
            exchanger,
            minter,
            auth_key_header,
            auth_key_query_param: auth_key_query_param.to_string(),
        })
    }

    /// Resolve the path token plus whatever credentials the request carries
    /// into a validated sandbox id. Mutates the request: the auth-key header
    /// is always removed, and the auth-key query parameter is removed after
    /// it validates.
    pub async fn resolve<B>(
        &self,
        req: &mut Request<B>,
        id_or_token: &str,
        port: u16,
    ) -> Resolution {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let mut reasons: Vec<String> = Vec::new();

        // Stripped up front so the upstream never sees it, even when an
        // earlier attempt settles the request.
        let held_auth_key = req.headers_mut().remove(&self.auth_key_header);

        let started = Instant::now();
        let outcome = self.try_bearer(req, id_or_token).await;
        if let Some(done) = settle("bearer token", &request_id, started, outcome, &mut reasons) {
            return done;
        }

        let started = Instant::now();
        let outcome = self.try_auth_key_header(held_auth_key, id_or_token).await;
        if let Some(done) = settle(
            "auth key header",
            &request_id,
            started,
            outcome,
            &mut reasons,
        ) {
            return done;
        }

        let started = Instant::now();
        let outcome = self.try_auth_key_query(req, id_or_token).await;
        if let Some(done) = settle(
            "auth key query parameter",
            &request_id,
            started,
            outcome,
            &mut reasons,
        ) {
            return done;
        }

        let started = Instant::now();
        let outcome = self.try_cookie(req, id_or_token);
        if let Some(done) = settle("auth cookie", &request_id, started, outcome, &mut reasons) {
            return done;
        }

        let started = Instant::now();
        let outcome = self.try_signed_token(req, id_or_token, port).await;
        if let Some(done) = settle("signed token", &request_id, started, outcome, &mut reasons) {
            return done;
        }

        if reasons.is_empty() {
            reasons.push(MISSING_CREDENTIALS.to_string());
        }
        Resolution::Denied { reasons }
    }

    async fn try_bearer<B>(&self, req: &Request<B>, sandbox_id: &str) -> AttemptOutcome {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let Some(token) = token else {
            return AttemptOutcome::Skipped;
        };
        match self.bearer.validate_bearer(sandbox_id, token).await {
            Ok(true) => AttemptOutcome::Success {
                sandbox_id: sandbox_id.to_string(),
                set_cookie: None,
            },
            Ok(false) => AttemptOutcome::Invalid("bearer not authorized for sandbox".to_string()),
            Err(err) => AttemptOutcome::Error(format!("bearer validation failed: {err:#}")),
        }
    }

    async fn try_auth_key_header(
        &self,
        held: Option<HeaderValue>,
        sandbox_id: &str,
    ) -> AttemptOutcome {
        let Some(value) = held else {
            return AttemptOutcome::Skipped;
        };
        let Ok(auth_key) = value.to_str() else {
            return AttemptOutcome::Invalid("auth key header is not valid ASCII".to_string());
        };
        match self.auth_key.validate_auth_key(sandbox_id, auth_key).await {
            Ok(true) => AttemptOutcome::Success {
                sandbox_id: sandbox_id.to_string(),
                set_cookie: None,
            },
            Ok(false) => AttemptOutcome::Invalid("auth key not valid for sandbox".to_string()),
            Err(err) => AttemptOutcome::Error(format!("auth key validation failed: {err:#}")),
        }
    }

    async fn try_auth_key_query<B>(
        &self,
        req: &mut Request<B>,
        sandbox_id: &str,
    ) -> AttemptOutcome {
        let auth_key = req
            .uri()
            .query()
            .and_then(|q| find_query_param(q, &self.auth_key_query_param));
        let Some(auth_key) = auth_key else {
            return AttemptOutcome::Skipped;
        };
        match self.auth_key.validate_auth_key(sandbox_id, &auth_key).await {
            Ok(true) => {
                // The upstream must not see the key once it has served its
                // purpose.
                strip_query_param(req, &self.auth_key_query_param);
                AttemptOutcome::Success {
                    sandbox_id: sandbox_id.to_string(),
                    set_cookie: None,
                }
            }
            Ok(false) => AttemptOutcome::Invalid("auth key not valid for sandbox".to_string()),
            Err(err) => AttemptOutcome::Error(format!("auth key validation failed: {err:#}")),
        }
    }

    fn try_cookie<B>(&self, req: &Request<B>, sandbox_id: &str) -> AttemptOutcome {
        let name = self.minter.cookie_name(sandbox_id);
        let Some(raw) = cookie_value(req, &name) else {
            return AttemptOutcome::Skipped;
        };
        match self.minter.codec.decode(&name, &raw) {
            Ok(decoded) if decoded == sandbox_id => AttemptOutcome::Success {
                sandbox_id: decoded,
                set_cookie: None,
            },
            Ok(_) => AttemptOutcome::Invalid("auth cookie bound to a different sandbox".to_string()),
            Err(err) => AttemptOutcome::Invalid(format!("auth cookie rejected: {err}")),
        }
    }

    async fn try_signed_token<B>(
        &self,
        req: &Request<B>,
        id_or_token: &str,
        port: u16,
    ) -> AttemptOutcome {
        // A path token that parses as a sandbox id cannot be a signed
        // preview token; there is nothing to exchange.
        if uuid::Uuid::parse_str(id_or_token).is_ok() {
            return AttemptOutcome::Skipped;
        }
        match self.exchanger.exchange_token(id_or_token, port).await {
            Ok(sandbox_id) => {
                let host = req
                    .headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                let set_cookie = self.minter.set_cookie_value(&sandbox_id, host);
                AttemptOutcome::Success {
                    sandbox_id,
                    set_cookie: Some(set_cookie),
                }
            }
            Err(err) => AttemptOutcome::Error(format!("token exchange failed: {err:#}")),
        }
    }
}

fn settle(
    method: &str,
    request_id: &str,
    started: Instant,
    outcome: AttemptOutcome,
    reasons: &mut Vec<String>,
) -> Option<Resolution> {
    let elapsed = started.elapsed();
    match outcome {
        AttemptOutcome::Success {
            sandbox_id,
            set_cookie,
        } => {
            info!("[{request_id}] {method} accepted for sandbox {sandbox_id} ({elapsed:?})");
            Some(Resolution::Authenticated {
                sandbox_id,
                set_cookie,
            })
        }
        AttemptOutcome::Skipped => None,
        AttemptOutcome::Invalid(reason) => {
            warn!("[{request_id}] {method} rejected ({elapsed:?}): {reason}");
            reasons.push(format!("{method}: {reason}"));
            None
        }
        AttemptOutcome::Error(reason) => {
            error!("[{request_id}] {method} errored ({elapsed:?}): {reason}");
            reasons.push(format!("{method}: {reason}"));
            None
        }
    }
}

fn find_query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn strip_query_param<B>(req: &mut Request<B>, name: &str) {
    let uri = req.uri();
    let Some(query) = uri.query() else {
        return;
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| pair.split_once('=').map_or(*pair, |(key, _)| key) != name)
        .collect();
    let path_and_query = if kept.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), kept.join("&"))
    };

    let mut parts = uri.clone().into_parts();
    match path_and_query.parse() {
        Ok(paq) => {
            parts.path_and_query = Some(paq);
            match Uri::from_parts(parts) {
                Ok(new_uri) => *req.uri_mut() = new_uri,
                Err(err) => warn!("failed to rebuild request URI: {err}"),
            }
        }
        Err(err) => warn!("failed to rebuild request query: {err}"),
    }
}

fn cookie_value<B>(req: &Request<B>, name: &str) -> Option<String> {
    for header_value in req.headers().get_all(header::COOKIE) {
        let Ok(raw) = header_value.to_str() else {
            continue;
        };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=')
                && key == name
            {
                return Some(value.to_string());
            }
        }
    }
    None
}
