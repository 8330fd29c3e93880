use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default per-backend request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default response size cap (10MB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

fn default_content_field() -> String {
    "contents".to_string()
}

/// How a proxy backend returns the fetched document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ResponseShape {
    /// JSON object carrying the document as a string in `field`.
    Envelope {
        #[serde(default = "default_content_field")]
        field: String,
    },
    /// The response body is the document itself.
    Raw,
}

/// One proxy endpoint. The target feed URL is URL-encoded and appended to
/// `endpoint`, e.g. `https://api.allorigins.win/get?url=`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyBackend {
    pub name: String,
    pub endpoint: String,
    #[serde(flatten)]
    pub shape: ResponseShape,
}

impl ProxyBackend {
    pub fn envelope(name: &str, endpoint: &str, field: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            shape: ResponseShape::Envelope {
                field: field.to_string(),
            },
        }
    }

    pub fn raw(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            shape: ResponseShape::Raw,
        }
    }

    fn request_url(&self, feed_url: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(feed_url.as_bytes()).collect();
        format!("{}{}", self.endpoint, encoded)
    }
}

/// The built-in proxy list, tried in this order.
pub fn default_backends() -> Vec<ProxyBackend> {
    vec![
        ProxyBackend::envelope("allorigins", "https://api.allorigins.win/get?url=", "contents"),
        ProxyBackend::envelope("whateverorigin", "https://whateverorigin.org/get?url=", "contents"),
        ProxyBackend::raw("allorigins-raw", "https://api.allorigins.win/raw?url="),
        ProxyBackend::raw("corsproxy", "https://corsproxy.io/?url="),
    ]
}

/// HTTP client for proxy requests.
///
/// Follows at most 3 redirects and rejects redirect loops. Request timeouts
/// are applied per backend attempt by [`Transport`], not here.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    use reqwest::redirect::Policy;

    let redirect = Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    });

    reqwest::Client::builder()
        .user_agent(concat!("feedsentry/", env!("CARGO_PKG_VERSION")))
        .redirect(redirect)
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// Failure of a single backend attempt. Recorded, then the next backend is tried.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the per-backend timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Envelope body was not JSON or lacked a non-empty content field
    #[error("Invalid response from proxy service: {0}")]
    InvalidEnvelope(String),
}

/// Errors returned by [`Transport::fetch_raw`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No proxy backends configured")]
    NoBackends,
    /// Every backend failed; carries the last recorded failure.
    #[error("All {attempts} proxy backends failed; last error from {backend}: {source}")]
    AllBackendsFailed {
        attempts: usize,
        backend: String,
        source: BackendError,
    },
}

/// Fetches feed documents through an ordered list of proxy backends.
///
/// Cheap to clone; clones share the HTTP client and backend list.
#[derive(Debug, Clone)]
pub struct Transport {
    client: reqwest::Client,
    backends: Arc<[ProxyBackend]>,
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl Transport {
    pub fn new(client: reqwest::Client, backends: Vec<ProxyBackend>) -> Self {
        Self {
            client,
            backends: backends.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn backends(&self) -> &[ProxyBackend] {
        &self.backends
    }

    /// Fetches the raw document text for `feed_url`.
    ///
    /// Backends are tried in order and each at most once. The first success
    /// wins; a failure (network error, timeout, non-2xx status, oversize body,
    /// bad envelope) is logged and the next backend is tried.
    ///
    /// Each backend attempt is bounded by the request timeout (30 s unless
    /// set with [`with_request_timeout`](Self::with_request_timeout)). A hung
    /// backend counts as failed, so the call as a whole cannot hang.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NoBackends`] if the backend list is empty
    /// - [`TransportError::AllBackendsFailed`] with the last backend's error
    ///   once every backend has failed
    pub async fn fetch_raw(&self, feed_url: &str) -> Result<String, TransportError> {
        let mut last_failure: Option<(String, BackendError)> = None;

        for backend in self.backends.iter() {
            match self.fetch_via(backend, feed_url).await {
                Ok(document) => {
                    tracing::debug!(
                        feed = %feed_url,
                        backend = %backend.name,
                        bytes = document.len(),
                        "Fetched feed document"
                    );
                    return Ok(document);
                }
                Err(e) => {
                    tracing::warn!(
                        feed = %feed_url,
                        backend = %backend.name,
                        error = %e,
                        "Proxy backend failed, trying next"
                    );
                    last_failure = Some((backend.name.clone(), e));
                }
            }
        }

        match last_failure {
            Some((backend, source)) => Err(TransportError::AllBackendsFailed {
                attempts: self.backends.len(),
                backend,
                source,
            }),
            None => Err(TransportError::NoBackends),
        }
    }

    async fn fetch_via(
        &self,
        backend: &ProxyBackend,
        feed_url: &str,
    ) -> Result<String, BackendError> {
        let request = self
            .client
            .get(backend.request_url(feed_url))
            .header(reqwest::header::ACCEPT, "*/*")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");

        let response = tokio::time::timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| BackendError::Timeout)?
            .map_err(BackendError::Network)?;

        if !response.status().is_success() {
            return Err(BackendError::HttpStatus(response.status().as_u16()));
        }

        let bytes = tokio::time::timeout(
            self.request_timeout,
            read_limited_bytes(response, self.max_body_bytes),
        )
        .await
        .map_err(|_| BackendError::Timeout)??;

        match &backend.shape {
            ResponseShape::Raw => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            ResponseShape::Envelope { field } => extract_envelope(&bytes, field),
        }
    }
}

fn extract_envelope(bytes: &[u8], field: &str) -> Result<String, BackendError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| BackendError::InvalidEnvelope(e.to_string()))?;

    match value.get(field).and_then(serde_json::Value::as_str) {
        Some(contents) if !contents.is_empty() => Ok(contents.to_string()),
        _ => Err(BackendError::InvalidEnvelope(format!(
            "missing or empty `{}` field",
            field
        ))),
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, BackendError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(BackendError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BackendError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(BackendError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(BackendError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
