// Api facade: turns "fetch this" / "submit this" into queued HTTP calls.
//
// One Api owns one RequestQueue, and every call it makes (reads and writes
// alike) goes through that queue, so ordering and rate limiting apply
// uniformly. Construct it once per session and pass it to whatever needs the
// site; there is no global instance.

use std::sync::Arc;

use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::form::{encode_form, FORM_CONTENT_TYPE};
use super::token::AuthenticityToken;
use super::transport::{HttpRequest, HttpTransport, Method};
use crate::config::Config;
use crate::error::RequestError;
use crate::queue::{Action, RequestId, RequestQueue};

pub struct Api {
    origin: Url,
    client_header: (String, String),
    mutating_method: Method,
    token: Option<AuthenticityToken>,
    transport: Arc<dyn HttpTransport>,
    queue: RequestQueue<String>,
}

impl Api {
    /// Create a facade with an already-known token (or none, for read-only use).
    pub fn new(
        config: &Config,
        transport: Arc<dyn HttpTransport>,
        token: Option<AuthenticityToken>,
    ) -> Self {
        Self {
            origin: config.origin.clone(),
            client_header: (config.client_header.clone(), config.client_name.clone()),
            mutating_method: config.mutating_method,
            token,
            transport,
            queue: RequestQueue::with_timeout(config.min_delay, config.request_timeout),
        }
    }

    /// Create a facade and capture the anti-forgery token.
    ///
    /// Uses the configured token if there is one; otherwise fetches the
    /// site's landing page through the queue and reads it from the page
    /// metadata. A page without a token leaves the facade read-only.
    pub async fn bootstrap(
        config: &Config,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, RequestError> {
        let pinned = config.csrf_token.clone().map(AuthenticityToken::new);
        let mut api = Self::new(config, transport, pinned);

        if api.token.is_none() {
            let page = api.get_url("/").await?;
            api.token = AuthenticityToken::from_page(&page);
            match &api.token {
                Some(_) => info!(origin = %api.origin, "Captured authenticity token"),
                None => warn!(
                    origin = %api.origin,
                    "No authenticity token on landing page; mutating calls will fail"
                ),
            }
        }

        Ok(api)
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn token(&self) -> Option<&AuthenticityToken> {
        self.token.as_ref()
    }

    pub fn mutating_method(&self) -> Method {
        self.mutating_method
    }

    /// The queue every call is funnelled through.
    pub fn queue(&self) -> &RequestQueue<String> {
        &self.queue
    }

    /// Fetch `path` and return the response body as text.
    ///
    /// Fails with `RequestError::Http` if the status is outside [200, 400).
    /// Dropping the returned future before dispatch withdraws the request.
    pub async fn get_url(&self, path: &str) -> Result<String, RequestError> {
        let request = self.build(Method::Get, path, None)?;
        self.enqueue(request).await
    }

    /// Fetch `path` and parse the body as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        let body = self.get_url(path).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Submit `data` as a URL-encoded form, with the authenticity token appended.
    pub async fn post_url(&self, path: &str, data: &[(&str, &str)]) -> Result<String, RequestError> {
        let token = self.token.as_ref().ok_or(RequestError::MissingToken)?;
        let body = encode_form(data, token);
        let request = self.build(self.mutating_method, path, Some(body))?;
        self.enqueue(request).await
    }

    /// Build a request for `path` on the configured origin.
    pub fn build(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<HttpRequest, RequestError> {
        let url = self.resolve(path)?;

        let mut headers = vec![self.client_header.clone()];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), FORM_CONTENT_TYPE.to_string()));
        }

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
        })
    }

    /// Resolve `path` against the origin, refusing anything that leaves it.
    fn resolve(&self, path: &str) -> Result<Url, RequestError> {
        let url = self
            .origin
            .join(path)
            .map_err(|_| RequestError::InvalidPath(path.to_string()))?;

        if url.origin() != self.origin.origin() {
            return Err(RequestError::CrossOrigin(url.to_string()));
        }
        Ok(url)
    }

    async fn enqueue(&self, request: HttpRequest) -> Result<String, RequestError> {
        let transport = Arc::clone(&self.transport);
        let method = request.method;
        let path = request.url.path().to_string();

        let handle = self.queue.submit(Action::new(move || async move {
            let response = transport.send(request).await?;
            if !response.is_success() {
                // TODO: surface the error body once the site's JSON error shape is mapped
                return Err(RequestError::Http {
                    status: response.status,
                });
            }
            Ok(response.body)
        }))?;

        debug!(id = %handle.id(), method = %method, path = %path, "Request submitted");
        let _withdraw = WithdrawOnDrop {
            queue: &self.queue,
            id: handle.id(),
        };
        handle.wait().await
    }
}

/// Withdraws a still-pending request when the caller's future is dropped.
///
/// `cancel` is a no-op once the request has been dispatched, so the guard
/// fires on every drop.
struct WithdrawOnDrop<'a> {
    queue: &'a RequestQueue<String>,
    id: RequestId,
}

impl Drop for WithdrawOnDrop<'_> {
    fn drop(&mut self) {
        if self.queue.cancel(self.id) {
            debug!(id = %self.id, "Caller went away, request withdrawn");
        }
    }
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("origin", &self.origin.as_str())
            .field("mutating_method", &self.mutating_method)
            .field("token", &self.token)
            .field("queue", &self.queue)
            .finish()
    }
}
