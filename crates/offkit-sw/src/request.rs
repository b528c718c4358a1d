//! Intercepted request model.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EngineError, EngineResult};

/// What the request is for, as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    Document,
    Image,
    Script,
    Style,
    Font,
    Api,
    #[default]
    Other,
}

/// Request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

/// Immutable description of an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    url: Url,
    method: String,
    destination: DestinationType,
    mode: RequestMode,
}

impl RequestDescriptor {
    /// Create a descriptor. The method is upper-cased and the fragment dropped.
    pub fn new(mut url: Url, method: &str, destination: DestinationType, mode: RequestMode) -> Self {
        url.set_fragment(None);
        Self {
            url,
            method: method.trim().to_ascii_uppercase(),
            destination,
            mode,
        }
    }

    /// Create a descriptor from a possibly relative URL string.
    pub fn resolve(
        raw_url: &str,
        base: &Url,
        method: &str,
        destination: DestinationType,
        mode: RequestMode,
    ) -> EngineResult<Self> {
        let url = base
            .join(raw_url)
            .map_err(|e| EngineError::InvalidRequest(format!("{raw_url}: {e}")))?;
        Ok(Self::new(url, method, destination, mode))
    }

    /// A plain GET.
    pub fn get(url: Url, destination: DestinationType) -> Self {
        Self::new(url, "GET", destination, RequestMode::Cors)
    }

    /// A top-level navigation.
    pub fn navigate(url: Url) -> Self {
        Self::new(url, "GET", DestinationType::Document, RequestMode::Navigate)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn destination(&self) -> DestinationType {
        self.destination
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// URL path, always starting with `/` for hierarchical URLs.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Lower-cased extension of the last path segment, if any.
    pub fn extension(&self) -> Option<String> {
        let last = self.url.path_segments()?.next_back()?;
        let (stem, ext) = last.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Store identity of this request.
    pub fn cache_key(&self) -> String {
        self.url.to_string()
    }

    /// Store identity of the root document of this request's origin.
    pub fn root_key(&self) -> Option<String> {
        self.url.join("/").ok().map(|u| u.to_string())
    }
}

/// An intercepted request as handed to the engine by the host.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: RequestDescriptor,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub client_id: Option<String>,
}

impl FetchEvent {
    /// Wrap a descriptor with no headers, body or client.
    pub fn new(request: RequestDescriptor) -> Self {
        Self {
            request,
            headers: HashMap::new(),
            body: None,
            client_id: None,
        }
    }

    /// Attach a body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach the originating client.
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://shop.test/").unwrap()
    }

    #[test]
    fn test_resolve_relative_url() {
        let req = RequestDescriptor::resolve(
            "/logo.png#top",
            &base(),
            "get",
            DestinationType::Image,
            RequestMode::NoCors,
        )
        .unwrap();

        assert_eq!(req.url().as_str(), "https://shop.test/logo.png");
        assert_eq!(req.method(), "GET");
        assert!(req.is_get());
        assert_eq!(req.extension().as_deref(), Some("png"));
    }

    #[test]
    fn test_extension_edge_cases() {
        let dotfile = RequestDescriptor::get(base().join("/.well-known").unwrap(), DestinationType::Other);
        assert_eq!(dotfile.extension(), None);

        let dir = RequestDescriptor::get(base().join("/static/").unwrap(), DestinationType::Other);
        assert_eq!(dir.extension(), None);

        let upper = RequestDescriptor::get(base().join("/A/B.CSS?v=2").unwrap(), DestinationType::Style);
        assert_eq!(upper.extension().as_deref(), Some("css"));
    }

    #[test]
    fn test_root_key() {
        let req = RequestDescriptor::navigate(base().join("/products/42?ref=x").unwrap());
        assert_eq!(req.root_key().as_deref(), Some("https://shop.test/"));
        assert!(req.is_navigation());
    }

    #[test]
    fn test_descriptor_serde_names() {
        let req = RequestDescriptor::new(base(), "GET", DestinationType::Document, RequestMode::SameOrigin);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["destination"], "document");
        assert_eq!(json["mode"], "same-origin");
    }
}
