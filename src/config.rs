use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;

use crate::api::transport::Method;
use crate::queue::pump::DEFAULT_MIN_DELAY;

/// Site the client talks to when `BOARDAPI_ORIGIN` is unset.
pub const DEFAULT_ORIGIN: &str = "https://e621.net";

/// Header used to identify this client to the site.
pub const DEFAULT_CLIENT_HEADER: &str = "X-User-Agent";

/// Central configuration loaded from environment variables.
///
/// Secrets (the session cookie, a pinned token) only ever come from the
/// environment. The .env file is loaded at startup via dotenvy.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheme and host every request path is resolved against.
    pub origin: Url,
    /// Minimum spacing between queued dispatches.
    pub min_delay: Duration,
    /// Abandon a dispatched call after this long. None waits forever.
    pub request_timeout: Option<Duration>,
    /// HTTP method used for mutating (form) calls.
    ///
    /// Defaults to GET, which is what the site's own scripts have always sent
    /// for form submissions. Set BOARDAPI_MUTATING_METHOD=post to switch.
    pub mutating_method: Method,
    pub client_header: String,
    pub client_name: String,
    /// Pinned anti-forgery token; when unset it is captured from the site.
    pub csrf_token: Option<String>,
    /// `name=value` session cookie seeded into the client's cookie store.
    pub session_cookie: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL"),
            min_delay: DEFAULT_MIN_DELAY,
            request_timeout: None,
            mutating_method: Method::Get,
            client_header: DEFAULT_CLIENT_HEADER.to_string(),
            client_name: default_client_name(),
            csrf_token: None,
            session_cookie: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Everything has a default; only malformed values are errors.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let origin = match get("BOARDAPI_ORIGIN") {
            Some(raw) => parse_origin(&raw)?,
            None => defaults.origin,
        };

        let min_delay = match get("BOARDAPI_MIN_DELAY_MS") {
            Some(raw) => Duration::from_millis(
                raw.trim()
                    .parse()
                    .with_context(|| format!("BOARDAPI_MIN_DELAY_MS is not a number: {raw}"))?,
            ),
            None => defaults.min_delay,
        };

        let request_timeout = match get("BOARDAPI_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(
                raw.trim()
                    .parse()
                    .with_context(|| format!("BOARDAPI_TIMEOUT_SECS is not a number: {raw}"))?,
            )),
            None => None,
        };

        let mutating_method = match get("BOARDAPI_MUTATING_METHOD").as_deref().map(str::trim) {
            None => defaults.mutating_method,
            Some(m) if m.eq_ignore_ascii_case("get") => Method::Get,
            Some(m) if m.eq_ignore_ascii_case("post") => Method::Post,
            Some(other) => anyhow::bail!(
                "BOARDAPI_MUTATING_METHOD must be `get` or `post`, got `{other}`"
            ),
        };

        Ok(Self {
            origin,
            min_delay,
            request_timeout,
            mutating_method,
            client_header: get("BOARDAPI_CLIENT_HEADER").unwrap_or(defaults.client_header),
            client_name: get("BOARDAPI_CLIENT_NAME").unwrap_or(defaults.client_name),
            csrf_token: get("BOARDAPI_CSRF_TOKEN"),
            session_cookie: get("BOARDAPI_SESSION_COOKIE"),
        })
    }

    /// Check that a session cookie is configured.
    /// Call this before any operation that only makes sense while logged in.
    pub fn require_session(&self) -> Result<()> {
        if self.session_cookie.is_none() {
            anyhow::bail!(
                "BOARDAPI_SESSION_COOKIE not set. Mutating calls need a logged-in session.\n\
                 Add it to your .env file."
            );
        }
        Ok(())
    }
}

fn default_client_name() -> String {
    format!("boardapi/{}", env!("CARGO_PKG_VERSION"))
}

/// Parse an origin and strip any path, query or fragment from it.
fn parse_origin(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("Invalid BOARDAPI_ORIGIN: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        anyhow::bail!("BOARDAPI_ORIGIN must be an http(s) URL with a host, got {raw}");
    }
    Url::parse(&url.origin().ascii_serialization())
        .with_context(|| format!("Invalid BOARDAPI_ORIGIN: {raw}"))
}
