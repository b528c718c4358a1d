//! # Offkit Net
//!
//! Network transport for the Offkit offline engine.
//!
//! The engine never talks to `reqwest` directly. Every outbound call goes
//! through the [`Transport`] trait so strategies can be exercised against a
//! scripted network in tests and against [`HttpTransport`] in production.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod pattern;

pub use pattern::{HostPattern, PatternType};

/// Errors that can occur on the network.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Network offline")]
    Offline,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl NetError {
    /// Whether the failure means the network could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        match self {
            NetError::Offline | NetError::Connect(_) | NetError::Timeout(_) => true,
            NetError::Http(e) => e.is_connect() || e.is_timeout(),
            NetError::InvalidUrl(_) | NetError::RequestFailed(_) => false,
        }
    }

    /// Whether the request certainly never reached the server. A timeout
    /// does not qualify: the server may have applied it.
    pub fn is_unreachable(&self) -> bool {
        match self {
            NetError::Offline | NetError::Connect(_) => true,
            NetError::Http(e) => e.is_connect(),
            NetError::Timeout(_) | NetError::InvalidUrl(_) | NetError::RequestFailed(_) => false,
        }
    }
}

/// Outbound HTTP request.
#[derive(Debug, Clone)]
pub struct NetRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl NetRequest {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replace all headers.
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct NetResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl NetResponse {
    /// Create a response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Look up a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The single outbound call the engine makes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a request. Non-2xx statuses are responses, not errors.
    async fn fetch(&self, request: NetRequest) -> Result<NetResponse, NetError>;
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Timeout applied when a request does not carry its own.
    pub default_timeout: Duration,
    /// Timeout for establishing connections.
    pub connect_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Offkit/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_redirects: 10,
        }
    }
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: Client,
    config: LoaderConfig,
}

impl HttpTransport {
    /// Create a new transport.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpTransport initialized");

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: NetRequest) -> Result<NetResponse, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .timeout(timeout);

        for (name, value) in &request.headers {
            req_builder = req_builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(timeout)
            } else if e.is_connect() {
                NetError::Connect(e.to_string())
            } else {
                NetError::Http(e)
            }
        })?;

        let status = response.status();
        let url = response.url().clone();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect::<HashMap<_, _>>();

        let body = response.bytes().await?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(NetResponse {
            url,
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/api/cart").unwrap();
        let request = NetRequest::new(Method::POST, url.clone())
            .header("content-type", "application/json")
            .body("{}")
            .timeout(Duration::from_secs(3));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
        assert_eq!(request.timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(NetError::Offline.is_connectivity());
        assert!(NetError::Timeout(Duration::from_secs(1)).is_connectivity());
        assert!(!NetError::InvalidUrl("x".into()).is_connectivity());
    }

    #[test]
    fn test_timeout_is_not_unreachable() {
        assert!(NetError::Offline.is_unreachable());
        assert!(NetError::Connect("refused".into()).is_unreachable());
        assert!(!NetError::Timeout(Duration::from_secs(1)).is_unreachable());
    }

    #[test]
    fn test_response_header_is_case_insensitive() {
        let url = Url::parse("https://example.com/").unwrap();
        let mut response = NetResponse::new(url, StatusCode::OK, "");
        response
            .headers
            .insert("Content-Type".to_string(), "text/html".to_string());
        assert_eq!(response.header("content-type"), Some("text/html"));
    }

    #[tokio::test]
    async fn test_http_transport_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<h1>shop</h1>", "text/html"),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/index.html", server.uri())).unwrap();
        let response = transport.fetch(NetRequest::get(url)).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(&response.body[..], b"<h1>shop</h1>");
    }

    #[tokio::test]
    async fn test_http_transport_non_success_is_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/api/products", server.uri())).unwrap();
        let response = transport.fetch(NetRequest::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_http_transport_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let err = transport
            .fetch(NetRequest::get(url).timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(err.is_connectivity(), "unexpected error: {err}");
    }
}
