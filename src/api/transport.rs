// HTTP transport: the seam between the facade and the network.
//
// The facade builds fully formed `HttpRequest` values and hands them to an
// `HttpTransport`. The production implementation is a thin reqwest wrapper
// with a cookie store so the site session rides along on every call; tests
// swap in an in-memory transport.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::Url;
use tracing::debug;

use crate::error::RequestError;

/// HTTP methods the facade issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        }
    }
}

/// A fully built outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body text of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// Whether the status falls in the accepted range [200, 400).
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Sends a request and returns the raw response, whatever its status.
///
/// Only transport-level problems are errors here; status interpretation is
/// left to the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RequestError>;
}

/// reqwest-backed transport that keeps cookies between calls.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client identifying itself as `user_agent`.
    ///
    /// `session_cookie` (a `name=value` string) is seeded into the cookie
    /// store for `origin`, so calls carry the user's logged-in session.
    pub fn new(user_agent: &str, origin: &Url, session_cookie: Option<&str>) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        if let Some(cookie) = session_cookie {
            jar.add_cookie_str(cookie, origin);
        }

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .cookie_provider(jar)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RequestError> {
        debug!(method = %request.method, url = %request.url, "HTTP request");

        let mut builder = self.client.request(request.method.into(), request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(HttpResponse { status, body })
    }
}
