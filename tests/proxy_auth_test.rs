//! Credential resolution tests with instrumented validator doubles.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use hyper::{Request, header};

use sandboxd::proxy::cookie::CookieCodec;
use sandboxd::proxy::exchange::CookieMinter;
use sandboxd::proxy::resolver::{CredentialResolver, MISSING_CREDENTIALS, Resolution};
use sandboxd::proxy::{AuthKeyValidator, BearerValidator, TokenExchanger};

const SANDBOX: &str = "6b3f4f0e-2a2a-4e1c-9c40-1f2ab3cd4e5f";
const TOKEN: &str = "signed-preview-token-abc123";
const PREFIX: &str = "daytona-sandbox-auth-";
const KEY_HEADER: &str = "X-Daytona-Preview-Key";
const KEY_PARAM: &str = "DAYTONA_SANDBOX_AUTH_KEY";

struct MockBearer {
    accept: Option<&'static str>,
    calls: AtomicUsize,
}

#[async_trait]
impl BearerValidator for MockBearer {
    async fn validate_bearer(&self, _sandbox_id: &str, token: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.accept == Some(token))
    }
}

struct MockAuthKey {
    accept: Option<&'static str>,
    calls: AtomicUsize,
}

#[async_trait]
impl AuthKeyValidator for MockAuthKey {
    async fn validate_auth_key(&self, _sandbox_id: &str, auth_key: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.accept == Some(auth_key))
    }
}

struct MockExchanger {
    grants: Option<(&'static str, &'static str)>,
    calls: AtomicUsize,
}

#[async_trait]
impl TokenExchanger for MockExchanger {
    async fn exchange_token(&self, token: &str, _port: u16) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.grants {
            Some((expected, sandbox_id)) if expected == token => Ok(sandbox_id.to_string()),
            _ => bail!("unknown preview token"),
        }
    }
}

struct Fixture {
    bearer: Arc<MockBearer>,
    auth_key: Arc<MockAuthKey>,
    exchanger: Arc<MockExchanger>,
    resolver: CredentialResolver,
}

fn fixture(
    bearer_accept: Option<&'static str>,
    key_accept: Option<&'static str>,
    grants: Option<(&'static str, &'static str)>,
) -> Fixture {
    let bearer = Arc::new(MockBearer {
        accept: bearer_accept,
        calls: AtomicUsize::new(0),
    });
    let auth_key = Arc::new(MockAuthKey {
        accept: key_accept,
        calls: AtomicUsize::new(0),
    });
    let exchanger = Arc::new(MockExchanger {
        grants,
        calls: AtomicUsize::new(0),
    });
    let resolver = CredentialResolver::new(
        bearer.clone(),
        auth_key.clone(),
        exchanger.clone(),
        CookieMinter {
            codec: CookieCodec::new("test-secret"),
            prefix: PREFIX.to_string(),
            secure: false,
        },
        KEY_HEADER,
        KEY_PARAM,
    )
    .unwrap();
    Fixture {
        bearer,
        auth_key,
        exchanger,
        resolver,
    }
}

fn authenticated(resolution: Resolution) -> (String, Option<String>) {
    match resolution {
        Resolution::Authenticated {
            sandbox_id,
            set_cookie,
        } => (sandbox_id, set_cookie),
        Resolution::Denied { reasons } => panic!("expected success, denied: {reasons:?}"),
    }
}

fn denied(resolution: Resolution) -> Vec<String> {
    match resolution {
        Resolution::Denied { reasons } => reasons,
        Resolution::Authenticated { sandbox_id, .. } => {
            panic!("expected denial, authenticated as {sandbox_id}")
        }
    }
}

// A valid bearer settles the request before the auth-key validator runs,
// and the auth-key header is stripped from the forwarded request anyway.
#[tokio::test]
async fn bearer_wins_and_auth_key_header_is_stripped() {
    let fx = fixture(Some("good-bearer"), Some("good-key"), None);
    let mut req = Request::builder()
        .uri(format!("/{SANDBOX}/3000/app"))
        .header(header::AUTHORIZATION, "Bearer good-bearer")
        .header(KEY_HEADER, "good-key")
        .body(())
        .unwrap();

    let (sandbox_id, set_cookie) = authenticated(fx.resolver.resolve(&mut req, SANDBOX, 3000).await);
    assert_eq!(sandbox_id, SANDBOX);
    assert!(set_cookie.is_none());
    assert_eq!(fx.bearer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.auth_key.calls.load(Ordering::SeqCst), 0);
    assert!(req.headers().get(KEY_HEADER).is_none());
}

// A rejected bearer is non-fatal; the chain moves on to the auth key.
#[tokio::test]
async fn invalid_bearer_falls_through_to_auth_key() {
    let fx = fixture(Some("other-bearer"), Some("good-key"), None);
    let mut req = Request::builder()
        .uri(format!("/{SANDBOX}/3000/app"))
        .header(header::AUTHORIZATION, "Bearer bad-bearer")
        .header(KEY_HEADER, "good-key")
        .body(())
        .unwrap();

    let (sandbox_id, _) = authenticated(fx.resolver.resolve(&mut req, SANDBOX, 3000).await);
    assert_eq!(sandbox_id, SANDBOX);
    assert_eq!(fx.bearer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.auth_key.calls.load(Ordering::SeqCst), 1);
}

// A validated query key is removed from the forwarded query string.
#[tokio::test]
async fn validated_query_key_is_removed() {
    let fx = fixture(None, Some("good-key"), None);
    let mut req = Request::builder()
        .uri(format!("/{SANDBOX}/3000/app?x=1&{KEY_PARAM}=good-key"))
        .body(())
        .unwrap();

    let (sandbox_id, set_cookie) = authenticated(fx.resolver.resolve(&mut req, SANDBOX, 3000).await);
    assert_eq!(sandbox_id, SANDBOX);
    assert!(set_cookie.is_none());
    assert_eq!(req.uri().query(), Some("x=1"));
}

// A rejected query key stays in place and the request is denied with the
// attempt's reason on record.
#[tokio::test]
async fn rejected_query_key_is_kept_and_reported() {
    let fx = fixture(None, Some("other-key"), None);
    let mut req = Request::builder()
        .uri(format!("/{SANDBOX}/3000/app?{KEY_PARAM}=bad-key"))
        .body(())
        .unwrap();

    let reasons = denied(fx.resolver.resolve(&mut req, SANDBOX, 3000).await);
    assert!(reasons.iter().any(|r| r.contains("auth key")));
    assert!(req.uri().query().unwrap().contains(KEY_PARAM));
}

// A token exchange authenticates the request and mints the sandbox cookie
// with the required attributes.
#[tokio::test]
async fn token_exchange_sets_cookie() {
    let fx = fixture(None, None, Some((TOKEN, SANDBOX)));
    let mut req = Request::builder()
        .uri(format!("/{TOKEN}/3000/app"))
        .header(header::HOST, "3000-sb.proxy.example.com")
        .body(())
        .unwrap();

    let (sandbox_id, set_cookie) = authenticated(fx.resolver.resolve(&mut req, TOKEN, 3000).await);
    assert_eq!(sandbox_id, SANDBOX);
    assert_eq!(fx.exchanger.calls.load(Ordering::SeqCst), 1);

    let cookie = set_cookie.expect("exchange must mint a cookie");
    let name = format!("{PREFIX}{SANDBOX}");
    assert!(cookie.starts_with(&format!("{name}=")));
    assert!(cookie.contains("Max-Age=3600"));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Path=/"));

    let value = cookie.split_once('=').unwrap().1.split(';').next().unwrap();
    let codec = CookieCodec::new("test-secret");
    assert_eq!(codec.decode(&name, value).unwrap(), SANDBOX);
}

// The minted cookie authenticates the follow-up request through the cookie
// attempt, without touching the exchanger again.
#[tokio::test]
async fn minted_cookie_round_trips() {
    let fx = fixture(None, None, Some((TOKEN, SANDBOX)));
    let mut first = Request::builder()
        .uri(format!("/{TOKEN}/3000/app"))
        .header(header::HOST, "3000-sb.proxy.example.com")
        .body(())
        .unwrap();
    let (_, set_cookie) = authenticated(fx.resolver.resolve(&mut first, TOKEN, 3000).await);
    let cookie = set_cookie.unwrap();
    let cookie_pair = cookie.split(';').next().unwrap().to_string();

    let fresh = fixture(None, None, None);
    let mut second = Request::builder()
        .uri(format!("/{SANDBOX}/3000/app"))
        .header(header::COOKIE, cookie_pair)
        .body(())
        .unwrap();
    let (sandbox_id, set_cookie) =
        authenticated(fresh.resolver.resolve(&mut second, SANDBOX, 3000).await);
    assert_eq!(sandbox_id, SANDBOX);
    assert!(set_cookie.is_none(), "cookie auth must not mint again");
    assert_eq!(fresh.exchanger.calls.load(Ordering::SeqCst), 0);
}

// A cookie minted for one sandbox never authenticates another.
#[tokio::test]
async fn cookie_for_other_sandbox_is_rejected() {
    let fx = fixture(None, None, None);
    let name = format!("{PREFIX}{SANDBOX}");
    let codec = CookieCodec::new("test-secret");
    let forged = codec.encode(&name, "other-sandbox");
    let mut req = Request::builder()
        .uri(format!("/{SANDBOX}/3000/app"))
        .header(header::COOKIE, format!("{name}={forged}"))
        .body(())
        .unwrap();

    let reasons = denied(fx.resolver.resolve(&mut req, SANDBOX, 3000).await);
    assert!(reasons.iter().any(|r| r.contains("different sandbox")));
}

// Decoding under a different cookie name fails outright.
#[test]
fn cookie_name_binding_holds() {
    let codec = CookieCodec::new("test-secret");
    let encoded = codec.encode("b", "payload");
    assert!(codec.decode("a", &encoded).is_err());
}

// A bare request for a plain sandbox id carries nothing to validate and is
// denied with the canonical reason.
#[tokio::test]
async fn no_credentials_yields_canonical_reason() {
    let fx = fixture(None, None, None);
    let mut req = Request::builder()
        .uri(format!("/{SANDBOX}/3000/app"))
        .body(())
        .unwrap();

    let reasons = denied(fx.resolver.resolve(&mut req, SANDBOX, 3000).await);
    assert_eq!(reasons, vec![MISSING_CREDENTIALS.to_string()]);
    assert_eq!(fx.bearer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.auth_key.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.exchanger.calls.load(Ordering::SeqCst), 0);
}

// A failed exchange for a token-shaped path is recorded, not swallowed.
#[tokio::test]
async fn failed_exchange_is_reported() {
    let fx = fixture(None, None, None);
    let mut req = Request::builder()
        .uri(format!("/{TOKEN}/3000/app"))
        .body(())
        .unwrap();

    let reasons = denied(fx.resolver.resolve(&mut req, TOKEN, 3000).await);
    assert!(reasons.iter().any(|r| r.contains("token exchange failed")));
    assert_eq!(fx.exchanger.calls.load(Ordering::SeqCst), 1);
}
