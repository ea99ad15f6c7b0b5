// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The job runtime: typed HTTP requests against a homeserver, with retry,
//! rate-limit handling and cancellation.

use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use http::{HeaderValue, Method, Response as HttpResponse};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, HttpError, Result};

/// Whether a request competes for foreground resources or runs best-effort
/// in the background. Background requests don't surface retry
/// notifications.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunningPolicy {
    #[default]
    Foreground,
    Background,
}

/// The body of an outgoing request.
pub enum RequestBody {
    None,
    Json(Value),
    Bytes { data: Vec<u8>, content_type: String },
}

/// A typed request against a Matrix endpoint: a verb, a path, optional
/// query parameters and body, and whether the access token is attached.
pub trait MatrixRequest: Send + Sync {
    /// The typed response the endpoint produces.
    type Response: DeserializeOwned + Send + 'static;

    /// Whether the endpoint needs the access token.
    const AUTHENTICATION: bool = true;

    fn method(&self) -> Method;

    /// The path below the homeserver base URL.
    fn path(&self) -> String;

    fn query(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn body(&self) -> RequestBody {
        RequestBody::None
    }
}

/// Per-request configuration: timeout and retry policy.
#[derive(Clone, Copy, Debug)]
pub struct RequestConfig {
    pub(crate) timeout: Duration,
    pub(crate) retry_limit: Option<u64>,
    pub(crate) retry_timeout: Option<Duration>,
    pub(crate) policy: RunningPolicy,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_limit: None,
            retry_timeout: Some(Duration::from_secs(180)),
            policy: RunningPolicy::Foreground,
        }
    }
}

impl RequestConfig {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stop retrying transient failures after this many attempts.
    pub fn retry_limit(mut self, limit: u64) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    /// Stop retrying transient failures after this much elapsed time.
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    pub fn background(mut self) -> Self {
        self.policy = RunningPolicy::Background;
        self
    }

    /// Give up after the first failure.
    pub fn disable_retry(mut self) -> Self {
        self.retry_limit = Some(1);
        self
    }
}

/// Configuration for the underlying HTTP client.
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub(crate) proxy: Option<reqwest::Proxy>,
    pub(crate) user_agent: Option<HeaderValue>,
    pub(crate) disable_ssl_verification: bool,
    pub(crate) request_config: RequestConfig,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route all requests through the given HTTP proxy.
    pub fn proxy(mut self, proxy: &str) -> Result<Self> {
        self.proxy = Some(
            reqwest::Proxy::all(proxy)
                .map_err(|e| Error::IncorrectRequest(format!("invalid proxy URL: {e}")))?,
        );
        Ok(self)
    }

    pub fn user_agent(mut self, user_agent: &str) -> Result<Self> {
        self.user_agent = Some(
            HeaderValue::from_str(user_agent)
                .map_err(|e| Error::IncorrectRequest(format!("invalid user agent: {e}")))?,
        );
        Ok(self)
    }

    pub fn disable_ssl_verification(mut self) -> Self {
        self.disable_ssl_verification = true;
        self
    }

    pub fn request_config(mut self, config: RequestConfig) -> Self {
        self.request_config = config;
        self
    }
}

/// Abstraction around the HTTP layer, allowing embedders to swap in their
/// own transport.
#[async_trait]
pub trait HttpSend: Send + Sync + Debug {
    /// Send a single, converted HTTP request and return the raw response.
    /// Retrying is the caller's concern, not the transport's.
    async fn send_request(
        &self,
        request: http::Request<Vec<u8>>,
        config: RequestConfig,
    ) -> std::result::Result<http::Response<Vec<u8>>, HttpError>;
}

type RetryCallback = Arc<dyn Fn(u32, Duration, String) + Send + Sync>;

/// The shared request dispatcher of a connection.
#[derive(Clone)]
pub(crate) struct HttpClient {
    inner: Arc<dyn HttpSend>,
    homeserver: Arc<RwLock<Option<Url>>>,
    access_token: Arc<RwLock<Option<String>>>,
    pub(crate) request_config: RequestConfig,
    on_retry: Arc<RwLock<Option<RetryCallback>>>,
}

impl Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").field("homeserver", &self.homeserver).finish()
    }
}

impl HttpClient {
    pub(crate) fn new(
        inner: Arc<dyn HttpSend>,
        homeserver: Option<Url>,
        request_config: RequestConfig,
    ) -> Self {
        HttpClient {
            inner,
            homeserver: Arc::new(RwLock::new(homeserver)),
            access_token: Arc::new(RwLock::new(None)),
            request_config,
            on_retry: Arc::new(RwLock::new(None)),
        }
    }

    pub(crate) fn homeserver(&self) -> Option<Url> {
        self.homeserver.read().unwrap().clone()
    }

    pub(crate) fn set_homeserver(&self, url: Option<Url>) {
        *self.homeserver.write().unwrap() = url;
    }

    pub(crate) fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().unwrap() = token;
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.access_token.read().unwrap().clone()
    }

    /// Install the observer for scheduled retries of foreground requests.
    pub(crate) fn set_retry_callback(&self, callback: RetryCallback) {
        *self.on_retry.write().unwrap() = Some(callback);
    }

    /// Temporarily override the homeserver base URL; the previous value is
    /// restored when the returned guard drops, on every exit path.
    pub(crate) fn override_homeserver(&self, url: Url) -> HomeserverGuard {
        let previous = self.homeserver.write().unwrap().replace(url);
        HomeserverGuard { homeserver: self.homeserver.clone(), previous }
    }

    fn build_request<R: MatrixRequest>(
        &self,
        request: &R,
    ) -> std::result::Result<http::Request<Vec<u8>>, HttpError> {
        let base = self.homeserver().ok_or(HttpError::NoHomeserver)?;
        let mut url = base.join(&request.path()).map_err(|_| HttpError::NoHomeserver)?;
        let query = request.query();
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(&name, &value);
            }
        }

        let mut builder = http::Request::builder().method(request.method()).uri(url.as_str());
        if R::AUTHENTICATION {
            let token = self.access_token().ok_or(HttpError::AuthenticationRequired)?;
            builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let (builder, body) = match request.body() {
            RequestBody::None => (builder, Vec::new()),
            RequestBody::Json(json) => (
                builder.header(http::header::CONTENT_TYPE, "application/json"),
                serde_json::to_vec(&json)?,
            ),
            RequestBody::Bytes { data, content_type } => {
                (builder.header(http::header::CONTENT_TYPE, content_type), data)
            }
        };

        Ok(builder.body(body).expect("Can't construct an http request"))
    }

    /// Send a typed request, retrying transient failures with exponential
    /// backoff and honouring rate-limit hints from the server.
    pub(crate) async fn send<R>(
        &self,
        request: R,
        config: Option<RequestConfig>,
    ) -> std::result::Result<R::Response, HttpError>
    where
        R: MatrixRequest,
    {
        let body = self.send_raw(&request, config).await?;
        trace!(endpoint = %request.path(), "got a response");
        Ok(serde_json::from_slice(&body)?)
    }

    /// Like [`send`](Self::send), but returns the raw response body. Used
    /// for media downloads.
    pub(crate) async fn send_raw<R>(
        &self,
        request: &R,
        config: Option<RequestConfig>,
    ) -> std::result::Result<Vec<u8>, HttpError>
    where
        R: MatrixRequest,
    {
        let config = config.unwrap_or(self.request_config);
        let http_request = self.build_request(request)?;

        let backoff = ExponentialBackoff {
            max_elapsed_time: config.retry_timeout,
            ..Default::default()
        };
        let retries = std::sync::atomic::AtomicU64::new(0);

        let operation = || async {
            // Turn errors into permanent errors when the retry limit is
            // reached.
            let stop = config
                .retry_limit
                .is_some_and(|limit| retries.load(std::sync::atomic::Ordering::Relaxed) >= limit);
            let as_transient = |e: HttpError| {
                if stop {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            };

            let request = clone_request(&http_request)?;
            let response = match self.inner.send_request(request, config).await {
                Ok(r) => r,
                Err(e) if e.is_transient() => return Err(as_transient(e)),
                Err(e) => return Err(backoff::Error::permanent(e)),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response.into_body());
            }

            let error = HttpError::api(status, response.body());
            if let Some(delay) = error.retry_after() {
                if !stop {
                    // The server told us when to come back; honour the
                    // hint before backoff adds its own delay on top.
                    debug!(?delay, "rate limited, honouring the server's retry hint");
                    tokio::time::sleep(delay).await;
                }
                return Err(as_transient(error));
            }
            if error.is_transient() {
                Err(as_transient(error))
            } else {
                Err(backoff::Error::permanent(error))
            }
        };

        let notify = |error: HttpError, delay: Duration| {
            let taken = retries.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            warn!(retries = taken, ?delay, "transient request failure, will retry: {error}");
            if config.policy == RunningPolicy::Foreground {
                if let Some(callback) = self.on_retry.read().unwrap().clone() {
                    callback(taken as u32, delay, error.to_string());
                }
            }
        };

        backoff::future::retry_notify(backoff, operation, notify).await
    }
}

/// Restores the previous homeserver URL when dropped.
pub(crate) struct HomeserverGuard {
    homeserver: Arc<RwLock<Option<Url>>>,
    previous: Option<Url>,
}

impl Drop for HomeserverGuard {
    fn drop(&mut self) {
        *self.homeserver.write().unwrap() = self.previous.take();
    }
}

fn clone_request(
    request: &http::Request<Vec<u8>>,
) -> std::result::Result<http::Request<Vec<u8>>, backoff::Error<HttpError>> {
    let mut builder = http::Request::builder().method(request.method()).uri(request.uri());
    for (name, value) in request.headers() {
        builder = builder.header(name, value);
    }
    builder
        .body(request.body().clone())
        .map_err(|_| backoff::Error::permanent(HttpError::UnableToCloneRequest))
}

/// A handle to a job running on the I/O runtime: a future producing the
/// typed result, plus the ability to abandon the job quietly.
#[derive(Debug)]
pub struct JobHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        JobHandle { inner: tokio::spawn(future) }
    }

    /// Cancels the in-flight request without surfacing a success or
    /// failure; awaiting the handle afterwards yields
    /// [`Error::Abandoned`].
    pub fn abandon(&self) {
        self.inner.abort();
    }

    /// Whether the job has produced its result (or was abandoned).
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub(crate) fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.inner.abort_handle()
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_join_error)) => Poll::Ready(Err(Error::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Build a reqwest client with the given configuration.
pub(crate) fn client_with_config(config: &ClientConfig) -> Result<Client> {
    let http_client = reqwest::Client::builder();

    let http_client = if config.disable_ssl_verification {
        http_client.danger_accept_invalid_certs(true)
    } else {
        http_client
    };

    let http_client = match &config.proxy {
        Some(p) => http_client.proxy(p.clone()),
        None => http_client,
    };

    let mut headers = reqwest::header::HeaderMap::new();
    let user_agent = match &config.user_agent {
        Some(a) => a.clone(),
        None => HeaderValue::from_str(&format!("matrix-client {}", crate::VERSION))
            .expect("Can't construct the version header"),
    };
    headers.insert(reqwest::header::USER_AGENT, user_agent);

    http_client
        .default_headers(headers)
        .build()
        .map_err(|e| Error::Http(HttpError::Reqwest(e)))
}

async fn response_to_http_response(
    mut response: Response,
) -> std::result::Result<http::Response<Vec<u8>>, reqwest::Error> {
    let status = response.status();

    let mut http_builder = HttpResponse::builder().status(status);
    let headers = http_builder.headers_mut().expect("Can't get the response builder headers");

    for (k, v) in response.headers_mut().drain() {
        if let Some(key) = k {
            headers.insert(key, v);
        }
    }

    let body = response.bytes().await?.as_ref().to_owned();

    Ok(http_builder.body(body).expect("Can't construct a response using the given body"))
}

#[async_trait]
impl HttpSend for Client {
    async fn send_request(
        &self,
        request: http::Request<Vec<u8>>,
        config: RequestConfig,
    ) -> std::result::Result<http::Response<Vec<u8>>, HttpError> {
        let mut request = reqwest::Request::try_from(request)?;
        *request.timeout_mut() = Some(config.timeout);

        let response = self.execute(request).await?;
        Ok(response_to_http_response(response).await?)
    }
}
