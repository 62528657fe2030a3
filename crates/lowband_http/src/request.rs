//! Request/response descriptors shared by every layer.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header::{CACHE_CONTROL, PRAGMA},
};
use url::Url;

/// Kind of resource a request targets, as a browser would declare it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Document,
    Image,
    Stylesheet,
    Media,
    Font,
    Script,
    Xhr,
    Other,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Document => "document",
            ResourceType::Image => "image",
            ResourceType::Stylesheet => "stylesheet",
            ResourceType::Media => "media",
            ResourceType::Font => "font",
            ResourceType::Script => "script",
            ResourceType::Xhr => "xhr",
            ResourceType::Other => "other",
        }
    }

    /// Guess the resource type from the URL path extension.
    ///
    /// Paths without an extension are treated as documents.
    pub fn infer_from_url(url: &Url) -> Self {
        let Some(mime) = mime_guess::from_path(url.path()).first() else {
            return ResourceType::Document;
        };

        match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("image", _) => ResourceType::Image,
            ("audio", _) | ("video", _) => ResourceType::Media,
            ("font", _) => ResourceType::Font,
            ("text", "css") => ResourceType::Stylesheet,
            ("text", "html") => ResourceType::Document,
            ("text", "javascript") | ("application", "javascript") => ResourceType::Script,
            ("application", "json") | ("application", "xml") | ("text", "xml") => {
                ResourceType::Xhr
            }
            ("application", sub) if sub.contains("font") || sub == "vnd.ms-fontobject" => {
                ResourceType::Font
            }
            _ => ResourceType::Other,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" => Ok(ResourceType::Document),
            "image" => Ok(ResourceType::Image),
            "stylesheet" => Ok(ResourceType::Stylesheet),
            "media" => Ok(ResourceType::Media),
            "font" => Ok(ResourceType::Font),
            "script" => Ok(ResourceType::Script),
            "xhr" | "fetch" => Ok(ResourceType::Xhr),
            "other" => Ok(ResourceType::Other),
            other => Err(format!("unknown resource type '{other}'")),
        }
    }
}

/// What a caller hands to the pipeline.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Declared type; inferred from the URL when absent.
    pub resource_type: Option<ResourceType>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            resource_type: None,
        }
    }

    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = Some(resource_type);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
            .unwrap_or_else(|| ResourceType::infer_from_url(&self.url))
    }

    /// `Cache-Control: no-cache`, `max-age=0` or `Pragma: no-cache`.
    pub fn wants_revalidation(&self) -> bool {
        let cache_control = self
            .headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|token| token.trim().to_ascii_lowercase())
            .any(|token| token == "no-cache" || token == "max-age=0");

        cache_control
            || self
                .headers
                .get(PRAGMA)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_ascii_lowercase().contains("no-cache"))
                .unwrap_or(false)
    }
}

/// An egress proxy the request leaves through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub id: String,
    pub url: String,
}

impl ProxyEndpoint {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    /// `host:port` of the proxy itself, used for liveness checks.
    pub fn socket_addr(&self) -> Option<String> {
        let parsed = Url::parse(&self.url).ok()?;
        let host = parsed.host_str()?;
        let port = parsed.port_or_known_default().unwrap_or(1080);
        Some(format!("{host}:{port}"))
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// The request as it is sent upstream (after negotiation headers are added).
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn from_descriptor(req: &RequestDescriptor) -> Self {
        Self {
            method: req.method.clone(),
            url: req.url.clone(),
            headers: req.headers.clone(),
            body: req.body.clone(),
        }
    }

    /// Approximate bytes this request puts on the wire.
    pub fn wire_len(&self) -> u64 {
        let line = self.method.as_str().len() + self.url.as_str().len() + 12;
        (line + header_len(&self.headers) + self.body.len()) as u64
    }
}

/// What the transport hands back, body still encoded.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Approximate bytes received on the wire (status line, headers, encoded body).
    pub fn wire_len(&self) -> u64 {
        (17 + header_len(&self.headers) + self.body.len()) as u64
    }
}

fn header_len(headers: &HeaderMap) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::{ProxyEndpoint, RequestDescriptor, ResourceType};
    use http::{HeaderValue, header::CACHE_CONTROL};

    fn infer(url: &str) -> ResourceType {
        RequestDescriptor::get(url).expect("valid url").resource_type()
    }

    #[test]
    fn infer_resource_type_from_extension() {
        assert_eq!(infer("https://example.com/logo.png"), ResourceType::Image);
        assert_eq!(infer("https://example.com/site.css"), ResourceType::Stylesheet);
        assert_eq!(infer("https://example.com/clip.mp4"), ResourceType::Media);
        assert_eq!(infer("https://example.com/app.js"), ResourceType::Script);
        assert_eq!(infer("https://example.com/f.woff2"), ResourceType::Font);
        assert_eq!(infer("https://example.com/data.json"), ResourceType::Xhr);
        assert_eq!(infer("https://example.com/about"), ResourceType::Document);
        assert_eq!(infer("https://example.com/index.html"), ResourceType::Document);
    }

    #[test]
    fn declared_resource_type_wins_over_inference() {
        let req = RequestDescriptor::get("https://example.com/logo.png")
            .expect("valid url")
            .with_resource_type(ResourceType::Xhr);
        assert_eq!(req.resource_type(), ResourceType::Xhr);
    }

    #[test]
    fn revalidation_directive_detection() {
        let plain = RequestDescriptor::get("https://example.com/").expect("valid url");
        assert!(!plain.wants_revalidation());

        let no_cache = plain
            .clone()
            .with_header(CACHE_CONTROL, HeaderValue::from_static("public, No-Cache"));
        assert!(no_cache.wants_revalidation());

        let max_age_zero = plain.with_header(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        assert!(max_age_zero.wants_revalidation());
    }

    #[test]
    fn resource_type_round_trips_through_str() {
        assert_eq!("Image".parse::<ResourceType>(), Ok(ResourceType::Image));
        assert_eq!("fetch".parse::<ResourceType>(), Ok(ResourceType::Xhr));
        assert!("hologram".parse::<ResourceType>().is_err());
    }

    #[test]
    fn proxy_socket_addr_uses_scheme_default_port() {
        let with_port = ProxyEndpoint::new("p1", "http://10.0.0.1:3128");
        assert_eq!(with_port.socket_addr().as_deref(), Some("10.0.0.1:3128"));

        let default_port = ProxyEndpoint::new("p2", "http://proxy.local");
        assert_eq!(default_port.socket_addr().as_deref(), Some("proxy.local:80"));
    }
}
