//! Request/response transport over HTTPS.
//!
//! Each call registers in the correlation table, runs on its own task behind
//! a concurrency limiter, and retries transient failures until the retry
//! budget or the request deadline runs out.

use std::{fmt, sync::Arc, time::Duration};

use collector_link_core::{
    ConnectionConfig, CorrelationId, CorrelationTable, Credential, ErrorEnvelope, LinkError,
    RetryPolicy,
};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, warn};
use uuid::Uuid;

use crate::tls;

/// Header carrying the correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    const fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_reqwest().as_str())
    }
}

/// One request/response call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Unique per in-flight call.
    pub correlation_id: CorrelationId,
    pub method: Method,
    /// Path appended to the base address; must start with `/`.
    pub path: String,
    /// Optional JSON body.
    pub body: Option<Value>,
    /// Deadline relative to submission; the connection default when `None`.
    pub deadline: Option<Duration>,
}

impl Request {
    /// Create a request with a fresh correlation id.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            method,
            path: path.into(),
            body: None,
            deadline: None,
        }
    }

    /// GET request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// POST request with a JSON body.
    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    /// PUT request with a JSON body.
    #[must_use]
    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    /// DELETE request.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Attach a JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Use a caller-supplied correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }

    /// Check required fields.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` for an empty path or zero deadline.
    pub fn validate(&self) -> Result<(), LinkError> {
        if !self.path.starts_with('/') {
            return Err(LinkError::Configuration(format!(
                "request path must start with '/': {:?}",
                self.path
            )));
        }
        if self.deadline.is_some_and(|d| d.is_zero()) {
            return Err(LinkError::Configuration(
                "request deadline must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    /// Eligible for retry.
    Transient(String),
    /// Surface immediately.
    Fatal(LinkError),
}

struct Inner {
    http: reqwest::Client,
    base_address: String,
    credential: Credential,
    retry: RetryPolicy,
}

impl Inner {
    fn endpoint(&self, path: &str) -> Result<Url, LinkError> {
        Url::parse(&format!("{}{path}", self.base_address))
            .map_err(|e| LinkError::Configuration(format!("invalid request URL for {path:?}: {e}")))
    }

    fn authenticate(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential {
            Credential::ApiKey(key) => builder.bearer_auth(key.expose()),
            Credential::Basic { user, secret } => builder.basic_auth(user, Some(secret.expose())),
            // Client identity is presented during the TLS handshake.
            Credential::MutualTls { .. } => builder,
        }
    }

    async fn run(
        &self,
        request: &Request,
        url: Url,
        deadline: Instant,
        budget: Duration,
    ) -> Result<Value, LinkError> {
        let mut backoff = self.retry.backoff.start();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = tokio::time::timeout_at(deadline, self.attempt(request, url.clone()))
                .await
                .map_err(|_| LinkError::Timeout(budget))?;

            match outcome {
                Ok(value) => {
                    debug!(attempt, "Request succeeded");
                    return Ok(value);
                }
                Err(AttemptError::Fatal(err)) => {
                    debug!(attempt, error = %err, "Request failed permanently");
                    return Err(err);
                }
                Err(AttemptError::Transient(message)) => {
                    if attempt >= self.retry.max_attempts {
                        error!(attempt, error = %message, "Request failed after max retries");
                        return Err(LinkError::Network {
                            attempts: attempt,
                            message,
                        });
                    }

                    let delay = backoff.next_delay();
                    if Instant::now() + delay >= deadline {
                        warn!(
                            attempt,
                            error = %message,
                            "Deadline leaves no room for another attempt"
                        );
                        return Err(LinkError::Timeout(budget));
                    }

                    warn!(
                        attempt,
                        error = %message,
                        delay_ms = delay.as_millis(),
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(&self, request: &Request, url: Url) -> Result<Value, AttemptError> {
        let mut builder = self
            .http
            .request(request.method.as_reqwest(), url)
            .header(CORRELATION_HEADER, request.correlation_id.to_string());
        builder = self.authenticate(builder);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_send_error)?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Transient(format!("reading response body: {e}")))?;

        classify_response(status, &body)
    }
}

fn classify_send_error(err: reqwest::Error) -> AttemptError {
    if tls::is_certificate_rejection(&err) {
        return AttemptError::Fatal(LinkError::Authentication(format!(
            "TLS certificate rejected: {err}"
        )));
    }
    if err.is_builder() {
        return AttemptError::Fatal(LinkError::Configuration(err.to_string()));
    }
    AttemptError::Transient(err.to_string())
}

fn classify_response(status: StatusCode, body: &[u8]) -> Result<Value, AttemptError> {
    if status.is_success() {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        return serde_json::from_slice(body).map_err(|e| {
            AttemptError::Fatal(LinkError::Protocol(format!(
                "response body is not JSON: {e}"
            )))
        });
    }

    if status.is_server_error() {
        return Err(AttemptError::Transient(format!("server returned {status}")));
    }

    let envelope = ErrorEnvelope::parse(body);
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        let reason = envelope.map_or_else(|| status.to_string(), |e| e.message);
        return Err(AttemptError::Fatal(LinkError::Authentication(reason)));
    }

    Err(AttemptError::Fatal(envelope.map_or_else(
        || LinkError::Protocol(format!("{status} response does not carry an error envelope")),
        |envelope| LinkError::Remote {
            status: status.as_u16(),
            envelope,
        },
    )))
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// HTTPS request client.
pub struct RequestClient {
    inner: Arc<Inner>,
    table: Arc<CorrelationTable<Value>>,
    limiter: Arc<Semaphore>,
    default_deadline: Duration,
    shutdown: CancellationToken,
}

impl RequestClient {
    /// Build a client and start the correlation sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the TLS material or HTTP client
    /// cannot be built.
    pub fn new(config: &ConnectionConfig) -> Result<Self, LinkError> {
        let builder = reqwest::Client::builder()
            .connect_timeout(config.timeouts().connect)
            .user_agent(concat!("collector-link/", env!("CARGO_PKG_VERSION")));
        let http = tls::configure_reqwest(builder, config.credential())?
            .build()
            .map_err(|e| LinkError::Configuration(format!("building HTTP client: {e}")))?;

        let table = CorrelationTable::new();
        let shutdown = CancellationToken::new();
        table.spawn_sweeper(config.timeouts().sweep_interval, shutdown.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_address: config.base_address().to_string(),
                credential: config.credential().clone(),
                retry: config.retry().clone(),
            }),
            table,
            limiter: Arc::new(Semaphore::new(config.max_in_flight())),
            default_deadline: config.timeouts().request,
            shutdown,
        })
    }

    /// Execute a request.
    ///
    /// # Errors
    /// See [`LinkError`]; exactly one result is produced per request.
    pub async fn execute(&self, request: Request) -> Result<Value, LinkError> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Execute a request that aborts when `cancel` fires.
    ///
    /// # Errors
    /// Returns `LinkError::Cancelled` if cancelled first, otherwise see
    /// [`execute`](Self::execute).
    pub async fn execute_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Value, LinkError> {
        request.validate()?;
        let url = self.inner.endpoint(&request.path)?;
        let budget = request.deadline.unwrap_or(self.default_deadline);
        let id = request.correlation_id;
        let pending = self.table.register(id, budget)?;
        let deadline = pending.deadline();

        let span = tracing::debug_span!(
            "request",
            correlation_id = %id,
            method = %request.method,
            path = %request.path,
        );
        let inner = Arc::clone(&self.inner);
        let table = Arc::clone(&self.table);
        let limiter = Arc::clone(&self.limiter);
        let task = tokio::spawn(
            async move {
                let result = match limiter.acquire_owned().await {
                    Ok(permit) => {
                        let result = inner.run(&request, url, deadline, budget).await;
                        drop(permit);
                        result
                    }
                    Err(_) => Err(LinkError::Cancelled),
                };
                table.complete(id, result);
            }
            .instrument(span),
        );
        let _task = AbortOnDrop(task);

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.table.cancel(id);
                debug!(correlation_id = %id, "Request cancelled by caller");
                Err(LinkError::Cancelled)
            }
            result = pending.wait() => result,
        }
    }

    /// Number of requests awaiting a result.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Stop the correlation sweeper and reject queued requests.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.limiter.close();
    }
}

impl Drop for RequestClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(Request::get("/api/v1/hunts").validate().is_ok());
        assert!(Request::get("api/v1/hunts").validate().is_err());
        assert!(Request::get("").validate().is_err());
        assert!(
            Request::get("/x")
                .with_deadline(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(
            Request::get("/a").correlation_id,
            Request::get("/a").correlation_id
        );
    }

    #[test]
    fn test_classify_success() {
        assert_eq!(
            classify_response(StatusCode::OK, br#"{"ok":true}"#).unwrap(),
            serde_json::json!({"ok": true})
        );
        assert_eq!(
            classify_response(StatusCode::NO_CONTENT, b"").unwrap(),
            Value::Null
        );
        assert!(matches!(
            classify_response(StatusCode::OK, b"<html>"),
            Err(AttemptError::Fatal(LinkError::Protocol(_)))
        ));
    }

    #[test]
    fn test_classify_failures() {
        assert!(matches!(
            classify_response(StatusCode::SERVICE_UNAVAILABLE, b""),
            Err(AttemptError::Transient(_))
        ));
        assert!(matches!(
            classify_response(StatusCode::UNAUTHORIZED, b""),
            Err(AttemptError::Fatal(LinkError::Authentication(_)))
        ));
        let envelope = br#"{"error":"not_found","code":404,"message":"no such hunt"}"#;
        assert!(matches!(
            classify_response(StatusCode::NOT_FOUND, envelope),
            Err(AttemptError::Fatal(LinkError::Remote { status: 404, .. }))
        ));
        assert!(matches!(
            classify_response(StatusCode::BAD_REQUEST, b"oops"),
            Err(AttemptError::Fatal(LinkError::Protocol(_)))
        ));
    }
}
