//! Environment-driven configuration for the scaler and proxy services.
//!
//! Both services read their entire configuration from the environment at
//! startup. A missing or malformed variable aborts startup with a message
//! naming the variable and the expected form. Parsing is factored over a
//! lookup function so tests can feed maps instead of process environment.

use anyhow::{Result, bail};
use std::time::Duration;

/// Label value carried by placeholder pods (`app=<this>`).
pub const PLACEHOLDER_APP_LABEL: &str = "runner-placeholder";

/// Node label selecting runner-capable nodes (`<this>=true`).
pub const RUNNER_NODE_LABEL: &str = "sandboxd.io/runner";

/// Taint key tolerated by placeholder pods.
pub const RUNNER_TAINT_KEY: &str = "sandboxd.io/runner";

/// Configuration for the runner fleet autoscaler.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    /// Health-check listen port.
    pub api_port: u16,
    /// Base URL of the Daytona Admin API.
    pub daytona_api_url: String,
    /// Bearer key added to every outbound Admin API call.
    pub daytona_api_key: String,
    /// Kubernetes namespace holding placeholder pods.
    pub provider_namespace: String,
    /// Region the runner listing is scoped to.
    pub region_id: String,
    /// Scale-up fires above this utilization, in percent.
    pub max_resource_utilization_percent: f32,
    /// Minimum count of idle runners plus nascent nodes.
    pub min_idle_runners: usize,
    /// Minimum available CPU headroom, in cores.
    pub min_idle_cpu: f32,
    /// Minimum available memory headroom, in GiB.
    pub min_idle_memory: f32,
    /// Reconcile period.
    pub tick_interval: Duration,
}

impl ScalerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let max_utilization: u32 = parse_required(
            lookup,
            "MAX_RESOURCE_UTILIZATION_PERCENT",
            "an integer in [0, 100]",
        )?;
        if max_utilization > 100 {
            bail!(
                "MAX_RESOURCE_UTILIZATION_PERCENT must be in [0, 100], got {max_utilization}"
            );
        }

        let min_idle_runners: usize =
            parse_required(lookup, "MIN_IDLE_RUNNERS", "a non-negative integer")?;
        let min_idle_cpu: u32 =
            parse_required(lookup, "MIN_IDLE_CPU", "a non-negative integer of cores")?;
        let min_idle_memory: u32 =
            parse_required(lookup, "MIN_IDLE_MEMORY", "a non-negative integer of GiB")?;

        let tick_seconds: u64 = match lookup("SCALER_TICK_SECONDS") {
            Some(raw) => parse_value("SCALER_TICK_SECONDS", &raw, "a positive integer of seconds")?,
            None => 30,
        };
        if tick_seconds == 0 {
            bail!("SCALER_TICK_SECONDS must be a positive integer of seconds, got 0");
        }

        Ok(Self {
            api_port: parse_required(lookup, "API_PORT", "a TCP port number")?,
            daytona_api_url: required(lookup, "DAYTONA_API_URL")?,
            daytona_api_key: required(lookup, "DAYTONA_API_KEY")?,
            provider_namespace: required(lookup, "PROVIDER_NAMESPACE")?,
            region_id: required(lookup, "REGION_ID")?,
            max_resource_utilization_percent: max_utilization as f32,
            min_idle_runners,
            min_idle_cpu: min_idle_cpu as f32,
            min_idle_memory: min_idle_memory as f32,
            tick_interval: Duration::from_secs(tick_seconds),
        })
    }
}

/// Configuration for the preview proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy listen port.
    pub port: u16,
    /// Base URL of the Daytona Admin API.
    pub daytona_api_url: String,
    /// Bearer key added to every outbound Admin API call.
    pub daytona_api_key: String,
    /// HMAC key material for the auth cookie codec.
    pub auth_cookie_secret: String,
    /// Upstream address template with `{sandbox}` and `{port}` placeholders.
    pub upstream_template: String,
    /// Header carrying the per-sandbox auth key.
    pub auth_key_header: String,
    /// Query parameter carrying the per-sandbox auth key.
    pub auth_key_query_param: String,
    /// Cookie name prefix; the sandbox id is appended.
    pub auth_cookie_prefix: String,
    /// Whether the listener terminates TLS; controls the Secure cookie attribute.
    pub tls_enabled: bool,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let upstream_template = required(lookup, "PROXY_UPSTREAM_TEMPLATE")?;
        if !upstream_template.contains("{sandbox}") || !upstream_template.contains("{port}") {
            bail!(
                "PROXY_UPSTREAM_TEMPLATE must contain {{sandbox}} and {{port}} placeholders, got '{upstream_template}'"
            );
        }

        let tls_enabled = match lookup("PROXY_TLS_ENABLED").as_deref() {
            None => false,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => bail!("PROXY_TLS_ENABLED must be true or false, got '{other}'"),
        };

        Ok(Self {
            port: parse_required(lookup, "PROXY_PORT", "a TCP port number")?,
            daytona_api_url: required(lookup, "DAYTONA_API_URL")?,
            daytona_api_key: required(lookup, "DAYTONA_API_KEY")?,
            auth_cookie_secret: required(lookup, "PROXY_AUTH_COOKIE_SECRET")?,
            upstream_template,
            auth_key_header: lookup("PROXY_AUTH_KEY_HEADER")
                .unwrap_or_else(|| "X-Daytona-Preview-Key".to_string()),
            auth_key_query_param: lookup("PROXY_AUTH_KEY_QUERY_PARAM")
                .unwrap_or_else(|| "DAYTONA_SANDBOX_AUTH_KEY".to_string()),
            auth_cookie_prefix: lookup("PROXY_AUTH_COOKIE_PREFIX")
                .unwrap_or_else(|| "daytona-sandbox-auth-".to_string()),
            tls_enabled,
        })
    }
}

fn required(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        Some(_) => bail!("{name} is set but empty"),
        None => bail!("{name} is required but not set"),
    }
}

fn parse_required<T>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &str,
    expected: &str,
) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = required(lookup, name)?;
    parse_value(name, &raw, expected)
}

fn parse_value<T>(name: &str, raw: &str, expected: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw.trim().parse() {
        Ok(value) => Ok(value),
        Err(err) => bail!("{name} must be {expected}, got '{raw}': {err}"),
    }
}
