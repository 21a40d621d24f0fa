//! Auth cookie minting for signed-token exchanges.
//!
//! When a signed preview URL token is successfully traded for a sandbox id,
//! the response carries a short-lived cookie so the browser's follow-up
//! requests authenticate without the token. The cookie value encodes the
//! sandbox id only; the token itself is never stored.

use crate::proxy::cookie::CookieCodec;

/// Cookie lifetime in seconds.
pub const COOKIE_MAX_AGE_SECS: u32 = 3600;

/// Builds Set-Cookie values for authenticated sandboxes.
#[derive(Clone)]
pub struct CookieMinter {
    pub codec: CookieCodec,
    pub prefix: String,
    /// Set the Secure attribute; true when the listener terminates TLS.
    pub secure: bool,
}

impl CookieMinter {
    /// Full name of the cookie bound to a sandbox.
    pub fn cookie_name(&self, sandbox_id: &str) -> String {
        format!("{}{}", self.prefix, sandbox_id)
    }

    /// Build the complete Set-Cookie header value for a sandbox, scoped to
    /// the domain derived from the request Host.
    pub fn set_cookie_value(&self, sandbox_id: &str, host: &str) -> String {
        let name = self.cookie_name(sandbox_id);
        let value = self.codec.encode(&name, sandbox_id);
        let mut cookie =
            format!("{name}={value}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}; HttpOnly");
        let domain = derive_cookie_domain(host);
        if !domain.is_empty() {
            cookie.push_str("; Domain=");
            cookie.push_str(&domain);
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Derive the cookie domain from a request Host header. The port is dropped,
/// and the first DNS label is stripped when three or more remain so sibling
/// preview hosts under the same proxy domain share the cookie.
pub fn derive_cookie_domain(host: &str) -> String {
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 {
        labels[1..].join(".")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minter(secure: bool) -> CookieMinter {
        CookieMinter {
            codec: CookieCodec::new("test-secret"),
            prefix: "daytona-sandbox-auth-".to_string(),
            secure,
        }
    }

    #[test]
    fn set_cookie_carries_required_attributes() {
        let cookie = minter(false).set_cookie_value("sb-1", "8080-sb-1.proxy.example.com");
        assert!(cookie.starts_with("daytona-sandbox-auth-sb-1="));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Domain=proxy.example.com"));
        assert!(!cookie.contains("Secure"));
    }

    #[test]
    fn secure_attribute_follows_tls() {
        let cookie = minter(true).set_cookie_value("sb-1", "proxy.example.com");
        assert!(cookie.contains("; Secure"));
    }

    #[test]
    fn minted_value_decodes_to_the_sandbox_id() {
        let minter = minter(false);
        let cookie = minter.set_cookie_value("sb-1", "proxy.example.com");
        let value = cookie
            .split_once('=')
            .unwrap()
            .1
            .split(';')
            .next()
            .unwrap();
        let name = minter.cookie_name("sb-1");
        assert_eq!(minter.codec.decode(&name, value).unwrap(), "sb-1");
    }

    #[test]
    fn domain_derivation() {
        assert_eq!(
            derive_cookie_domain("8080-sb-1.proxy.example.com:443"),
            "proxy.example.com"
        );
        assert_eq!(derive_cookie_domain("example.com"), "example.com");
        assert_eq!(derive_cookie_domain("localhost:4000"), "localhost");
        assert_eq!(derive_cookie_domain("10.0.0.4:4000"), "10.0.0.4");
    }
}
