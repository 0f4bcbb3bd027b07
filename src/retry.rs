use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Body, Method, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, event, warn, Level};

use crate::auth::Auth;
use crate::context::Context;
use crate::digest::{Digest, Digester};
use crate::error::{Error, ErrorKind};

/// First backoff delay after a failure, doubles per consecutive failure,
///
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Ceiling on the backoff delay,
///
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Attempts before a request gives up across all mirrors,
///
const DEFAULT_MAX_RETRIES: usize = 5;

/// Redirects followed within a single attempt,
///
const MAX_REDIRECTS: usize = 5;

/// Tuning for the retry engine,
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Backoff bookkeeping for one endpoint, shared process-wide,
///
#[derive(Debug, Default, Clone)]
struct HostState {
    failed_at: Option<Instant>,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

/// One logical request, addressed to a priority-ordered list of endpoints,
///
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    scheme: String,
    endpoints: Vec<String>,
    path_and_query: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    scope: String,
    concurrency: usize,
    expect_digest: Option<Digest>,
    expect_length: Option<u64>,
}

impl RequestSpec {
    /// Returns a new spec for a path served by every endpoint of a host,
    ///
    pub fn new(
        method: Method,
        scheme: impl Into<String>,
        endpoints: Vec<String>,
        path_and_query: impl Into<String>,
    ) -> Self {
        RequestSpec {
            method,
            scheme: scheme.into(),
            endpoints,
            path_and_query: path_and_query.into(),
            headers: vec![],
            body: None,
            scope: String::new(),
            concurrency: 3,
            expect_digest: None,
            expect_length: None,
        }
    }

    /// Returns a new spec addressed to one absolute url, as upload sessions hand back,
    ///
    pub fn from_url(method: Method, url: impl AsRef<str>) -> Result<Self, Error> {
        let uri = url.as_ref().parse::<Uri>()?;
        let authority = uri
            .authority()
            .ok_or_else(|| Error::parse_failure(format!("url without authority, {}", url.as_ref())))?
            .to_string();
        let scheme = uri.scheme_str().unwrap_or("https").to_string();
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        Ok(RequestSpec::new(method, scheme, vec![authority], path_and_query))
    }

    /// Adds a header, chainable
    ///
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a retryable body, chainable
    ///
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the auth scope requests present when challenged, chainable
    ///
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Sets the per-host in-flight limit, chainable
    ///
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Requires the response body to hash to the digest, chainable
    ///
    pub fn with_expect_digest(mut self, digest: Digest) -> Self {
        self.expect_digest = Some(digest);
        self
    }

    /// Requires the response body to be exactly this long, chainable
    ///
    pub fn with_expect_length(mut self, length: u64) -> Self {
        self.expect_length = Some(length);
        self
    }

    fn uri_for(&self, endpoint: &str) -> Result<Uri, Error> {
        format!("{}://{}{}", self.scheme, endpoint, self.path_and_query)
            .parse::<Uri>()
            .map_err(Error::from)
    }
}

struct RetryInner {
    client: hyper::Client<HttpsConnector<HttpConnector>>,
    auth: Arc<Auth>,
    config: RetryConfig,
    states: Mutex<HashMap<String, HostState>>,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Retryable http engine,
///
/// Turns one logical request into one successful exchange by rotating
/// mirrors, backing off transient failures, answering auth challenges, and
/// verifying response bodies against an expected digest and length.
///
#[derive(Clone)]
pub struct Retryable {
    inner: Arc<RetryInner>,
}

impl Retryable {
    /// Returns a new engine sharing the auth engine's token cache,
    ///
    pub fn new(auth: Arc<Auth>, config: RetryConfig) -> Self {
        Retryable {
            inner: Arc::new(RetryInner {
                client: hyper::Client::builder().build(HttpsConnector::new()),
                auth,
                config,
                states: Mutex::new(HashMap::new()),
                limits: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Runs the request until success, a terminal status, or exhaustion,
    ///
    pub async fn do_request(&self, ctx: &Context, spec: RequestSpec) -> Result<Response, Error> {
        let mut attempts = 0usize;
        loop {
            ctx.err()?;
            let endpoint = match self.eligible_endpoint(&spec.endpoints) {
                Some(endpoint) => endpoint,
                None => {
                    if attempts >= self.inner.config.max_retries {
                        return Err(Error::all_requests_failed());
                    }
                    match self.earliest_backoff(&spec.endpoints) {
                        Some(until) => {
                            let wait = until.saturating_duration_since(Instant::now());
                            debug!("All mirrors backing off, waiting {wait:?}");
                            ctx.sleep(wait).await?;
                            continue;
                        }
                        None => return Err(Error::all_requests_failed()),
                    }
                }
            };

            let permit = self.acquire(&endpoint, spec.concurrency).await?;
            attempts += 1;

            match self.attempt(ctx, &endpoint, &spec).await {
                Ok(response) => {
                    self.mark_success(&endpoint);
                    return Ok(Response::new(
                        self.clone(),
                        ctx.clone(),
                        spec,
                        endpoint,
                        response,
                        permit,
                    ));
                }
                Err(AttemptError::Retriable(err)) => {
                    drop(permit);
                    self.mark_failure(&endpoint);
                    if attempts > self.inner.config.max_retries {
                        event!(Level::ERROR, "Retries exhausted, last error: {err}");
                        return Err(Error::all_requests_failed().with_source(err));
                    }
                    debug!("Retriable failure from {endpoint}, {err}");
                }
                Err(AttemptError::Terminal(err)) => return Err(err),
            }
        }
    }

    /// One attempt against one endpoint, following redirects and answering 401s,
    ///
    async fn attempt(
        &self,
        ctx: &Context,
        endpoint: &str,
        spec: &RequestSpec,
    ) -> Result<hyper::Response<Body>, AttemptError> {
        let mut uri = spec.uri_for(endpoint).map_err(AttemptError::Terminal)?;
        let mut authorization = self.inner.auth.authorization(endpoint, &spec.scope).await;
        let mut redirects = 0usize;

        loop {
            ctx.err().map_err(AttemptError::Terminal)?;

            let mut request = Request::builder().method(spec.method.clone()).uri(uri.clone());
            for (name, value) in spec.headers.iter() {
                request = request.header(name.as_str(), value.as_str());
            }
            // tokens never travel to a host other than the one they were minted for
            let same_host = uri.authority().map(|a| a.as_str() == endpoint).unwrap_or(false);
            if same_host {
                if let Some(authorization) = authorization.as_ref() {
                    request = request.header("Authorization", authorization.as_str());
                }
            }
            let body = match spec.body.as_ref() {
                Some(bytes) => Body::from(bytes.clone()),
                None => Body::empty(),
            };
            let request = request.body(body).map_err(|e| AttemptError::Terminal(e.into()))?;

            let response = match ctx.run(self.inner.client.request(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return Err(AttemptError::Retriable(err.into())),
                Err(err) => return Err(AttemptError::Terminal(err)),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status.is_redirection() {
                if redirects >= MAX_REDIRECTS {
                    return Err(AttemptError::Terminal(Error::transport(
                        "too many redirects",
                    )));
                }
                redirects += 1;
                uri = redirect_uri(&uri, &response).map_err(AttemptError::Terminal)?;
                debug!("Following redirect to {uri}");
                continue;
            }

            if status == StatusCode::UNAUTHORIZED {
                let challenge = response
                    .headers()
                    .get("WWW-Authenticate")
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string);
                let challenge = match challenge {
                    Some(challenge) => challenge,
                    None => {
                        return Err(AttemptError::Terminal(
                            Error::unauthorized().with_message("401 without a challenge header"),
                        ))
                    }
                };
                match self
                    .inner
                    .auth
                    .handle_challenge(
                        ctx,
                        endpoint,
                        &spec.scope,
                        &challenge,
                        authorization.as_deref(),
                    )
                    .await
                {
                    Ok(acquired) => {
                        debug!("Acquired authorization for {endpoint}, retrying once");
                        authorization = Some(acquired);
                        continue;
                    }
                    Err(err) if err.is(ErrorKind::NoNewChallenge) => {
                        return Err(AttemptError::Terminal(
                            Error::unauthorized().with_source(err),
                        ))
                    }
                    Err(err) => return Err(AttemptError::Terminal(err)),
                }
            }

            if matches!(status.as_u16(), 429 | 502 | 503 | 504) {
                return Err(AttemptError::Retriable(Error::status_code(
                    status,
                    "retriable status",
                )));
            }

            let body = ctx
                .run(hyper::body::to_bytes(response.into_body()))
                .await
                .map_err(AttemptError::Terminal)?
                .unwrap_or_default();
            return Err(AttemptError::Terminal(terminal_error(status, &body)));
        }
    }

    fn eligible_endpoint(&self, endpoints: &[String]) -> Option<String> {
        let states = self.inner.states.lock().expect("host states poisoned");
        let now = Instant::now();
        endpoints
            .iter()
            .find(|endpoint| {
                states
                    .get(endpoint.as_str())
                    .and_then(|s| s.backoff_until)
                    .map(|until| now >= until)
                    .unwrap_or(true)
            })
            .cloned()
    }

    fn earliest_backoff(&self, endpoints: &[String]) -> Option<Instant> {
        let states = self.inner.states.lock().expect("host states poisoned");
        endpoints
            .iter()
            .filter_map(|endpoint| states.get(endpoint.as_str()).and_then(|s| s.backoff_until))
            .min()
    }

    fn mark_failure(&self, endpoint: &str) {
        let mut states = self.inner.states.lock().expect("host states poisoned");
        let state = states.entry(endpoint.to_string()).or_default();
        state.consecutive_failures += 1;
        state.failed_at = Some(Instant::now());
        let exponent = state.consecutive_failures.saturating_sub(1).min(16);
        let delay = self
            .inner
            .config
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.inner.config.max_delay);
        state.backoff_until = Some(Instant::now() + delay);
        warn!(
            "Backing off {endpoint} for {delay:?} after {} consecutive failures",
            state.consecutive_failures
        );
    }

    fn mark_success(&self, endpoint: &str) {
        let mut states = self.inner.states.lock().expect("host states poisoned");
        states.remove(endpoint);
    }

    async fn acquire(&self, endpoint: &str, limit: usize) -> Result<OwnedSemaphorePermit, Error> {
        let semaphore = {
            let mut limits = self.inner.limits.lock().expect("host limits poisoned");
            limits
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::canceled())
    }
}

enum AttemptError {
    Retriable(Error),
    Terminal(Error),
}

fn redirect_uri(current: &Uri, response: &hyper::Response<Body>) -> Result<Uri, Error> {
    let location = response
        .headers()
        .get("Location")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| Error::transport("redirect without a location header"))?;
    if location.starts_with('/') {
        let scheme = current.scheme_str().unwrap_or("https");
        let authority = current
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();
        format!("{scheme}://{authority}{location}").parse().map_err(Error::from)
    } else {
        location.parse().map_err(Error::from)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

#[derive(Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Folds a terminal status and its registry error body into an error,
///
fn terminal_error(status: StatusCode, body: &[u8]) -> Error {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(|parsed| {
            parsed
                .errors
                .iter()
                .map(|e| {
                    if e.message.is_empty() {
                        e.code.clone()
                    } else {
                        e.message.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| String::from_utf8_lossy(&body[..body.len().min(256)]).to_string());

    match status {
        StatusCode::NOT_FOUND => Error::not_found(message),
        StatusCode::UNAUTHORIZED => Error::unauthorized().with_message(message),
        StatusCode::FORBIDDEN => Error::new(ErrorKind::Forbidden).with_message(message),
        status => Error::status_code(status, message),
    }
}

/// A successful exchange, its body still streaming,
///
pub struct Response {
    status: StatusCode,
    headers: HeaderMap<HeaderValue>,
    reader: BodyReader,
}

impl Response {
    fn new(
        engine: Retryable,
        ctx: Context,
        mut spec: RequestSpec,
        endpoint: String,
        response: hyper::Response<Body>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let accept_ranges = headers
            .get("Accept-Ranges")
            .and_then(|h| h.to_str().ok())
            .map(|v| v == "bytes")
            .unwrap_or(false);
        // a body shorter than the advertised length must not pass as EOF
        if spec.expect_length.is_none() && spec.method != Method::HEAD {
            spec.expect_length = headers
                .get("Content-Length")
                .and_then(|h| h.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
        }
        let digester = spec
            .expect_digest
            .as_ref()
            .map(|d| Digester::new(d.algorithm()));
        Response {
            status,
            headers,
            reader: BodyReader {
                engine,
                ctx,
                spec,
                endpoint,
                body: response.into_body(),
                digester,
                received: 0,
                accept_ranges,
                resumes: 0,
                done: false,
                permit: Some(permit),
            },
        }
    }

    /// Returns the response status,
    ///
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns a response header as a string,
    ///
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|h| h.to_str().ok())
    }

    /// Returns all response headers,
    ///
    pub fn headers(&self) -> &HeaderMap<HeaderValue> {
        &self.headers
    }

    /// Consumes the response, returning the streaming reader,
    ///
    pub fn into_reader(self) -> BodyReader {
        self.reader
    }

    /// Drains the body into memory, verifying digest and length,
    ///
    pub async fn read_to_end(self) -> Result<Vec<u8>, Error> {
        self.into_reader().read_to_end().await
    }
}

/// Streaming body whose chunks are verified against the expected digest,
///
/// The reader may only be consumed once. A body that ends short of the
/// expected length resumes with a range request when the response advertised
/// `Accept-Ranges: bytes`, otherwise the transfer restarts from zero and
/// counts against the retry budget.
///
pub struct BodyReader {
    engine: Retryable,
    ctx: Context,
    spec: RequestSpec,
    endpoint: String,
    body: Body,
    digester: Option<Digester>,
    received: u64,
    accept_ranges: bool,
    resumes: usize,
    done: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl BodyReader {
    /// Returns the next chunk, or None at a verified end of stream,
    ///
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if self.done {
                return Ok(None);
            }
            self.ctx.err()?;

            match self.ctx.run(self.body.next()).await? {
                Some(Ok(bytes)) => {
                    self.received += bytes.len() as u64;
                    if let Some(digester) = self.digester.as_mut() {
                        digester.update(&bytes);
                    }
                    if let Some(expected) = self.spec.expect_length {
                        if self.received > expected {
                            self.done = true;
                            return Err(Error::size_mismatch(expected, self.received));
                        }
                    }
                    return Ok(Some(bytes));
                }
                Some(Err(err)) => {
                    self.recover(Error::from(err)).await?;
                }
                None => {
                    let expected = self.spec.expect_length;
                    match expected {
                        Some(expected) if self.received < expected => {
                            self.recover(Error::size_mismatch(expected, self.received))
                                .await?;
                        }
                        _ => {
                            self.done = true;
                            self.verify()?;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Drains the remaining chunks into memory,
    ///
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, Error> {
        let mut out = match self.spec.expect_length {
            Some(len) => Vec::with_capacity(len as usize),
            None => Vec::new(),
        };
        while let Some(bytes) = self.chunk().await? {
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Number of body bytes returned so far,
    ///
    pub fn received(&self) -> u64 {
        self.received
    }

    fn verify(&mut self) -> Result<(), Error> {
        if let Some(expected) = self.spec.expect_digest.as_ref() {
            let computed = self
                .digester
                .take()
                .expect("digester is set whenever a digest is expected")
                .finalize();
            if &computed != expected {
                return Err(Error::digest_mismatch(expected, computed));
            }
        }
        Ok(())
    }

    /// Reissues the request after a truncated body,
    ///
    /// With `Accept-Ranges: bytes` the transfer continues from the bytes
    /// already received and feeds the same running digester; without it the
    /// digester resets and the transfer restarts from zero.
    ///
    async fn recover(&mut self, cause: Error) -> Result<(), Error> {
        if self.resumes >= self.engine.inner.config.max_retries {
            self.done = true;
            return Err(Error::all_requests_failed().with_source(cause));
        }
        self.resumes += 1;
        self.engine.mark_failure(&self.endpoint);

        let mut spec = self.spec.clone();
        spec.expect_digest = None;
        spec.expect_length = None;
        if self.accept_ranges && self.received > 0 {
            event!(
                Level::DEBUG,
                "Body ended early, resuming from byte {}",
                self.received
            );
            spec = spec.with_header("Range", format!("bytes={}-", self.received));
        } else {
            debug!("Body ended early and ranges are unsupported, restarting from zero");
            self.received = 0;
            if let Some(expected) = self.spec.expect_digest.as_ref() {
                self.digester = Some(Digester::new(expected.algorithm()));
            }
        }

        // release our slot before requesting another, a per-host limit of one
        // would otherwise deadlock against ourselves
        self.permit = None;
        let response = self.engine.do_request(&self.ctx, spec).await?;
        self.endpoint = response.reader.endpoint.clone();
        self.body = response.reader.body;
        self.permit = response.reader.permit;
        Ok(())
    }
}
