//! On-demand preview route for server output and the dev server
//!
//! Requests look like `/_link-preview/<base64 url>`. The encoded path segment
//! is the cache key: a hit is answered from memory, a miss drives one browser
//! capture through the configured [`BrowserSource`].
//!
//! | outcome                    | status | body                                   |
//! |----------------------------|--------|----------------------------------------|
//! | capture succeeded          | 200    | image bytes, cached                    |
//! | capture came back empty    | 404    | empty                                  |
//! | navigation failed          | 503    | `{"error":"Failed to goto url: <url>"}`|
//! | screenshot failed          | 503    | `{"error":"Failed to take screenshot"}`|
//! | same path already rendering| 503    | `{"error":"..."}`                      |
//! | anything else              | 503    | `{"error":"<message>"}`                |

use crate::{BrowserSource, ImageFormat, LinkPreviewError, ServiceConfig};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub const PREVIEW_ROUTE_PREFIX: &str = "/_link-preview/";

/// `Cache-Control` sent with freshly rendered previews.
pub const PREVIEW_CACHE_CONTROL: &str = "public, max-age=31536000";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub cache_control: Option<&'static str>,
    pub body: Bytes,
}

impl PreviewResponse {
    fn image(format: ImageFormat, body: Bytes, cache_control: Option<&'static str>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: format.content_type(),
            cache_control,
            body,
        }
    }

    fn not_found(format: ImageFormat) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            content_type: format.content_type(),
            cache_control: None,
            body: Bytes::new(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        let body = serde_json::to_vec(&ErrorResponse {
            error: message.into(),
        })
        .unwrap_or_default();

        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            content_type: "application/json",
            cache_control: None,
            body: Bytes::from(body),
        }
    }

    /// Body as text, mostly useful for JSON error responses.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl IntoResponse for PreviewResponse {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            [(header::CONTENT_TYPE, self.content_type)],
            self.body,
        )
            .into_response();

        if let Some(cache_control) = self.cache_control {
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                header::HeaderValue::from_static(cache_control),
            );
        }
        response
    }
}

/// Decodes the URL carried by a preview path segment.
///
/// Accepts the standard and URL-safe base64 alphabets, padded or not, and
/// percent-encoded `+`, `/` and `=`.
pub fn decode_preview_path(encoded: &str) -> Result<String, LinkPreviewError> {
    let normalized = unescape_base64(encoded);
    if normalized.is_empty() {
        return Err(LinkPreviewError::InvalidPreviewPath(
            "missing encoded url".to_string(),
        ));
    }

    let bytes = [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(normalized.as_bytes()).ok())
        .ok_or_else(|| LinkPreviewError::InvalidPreviewPath(encoded.to_string()))?;

    String::from_utf8(bytes).map_err(|e| LinkPreviewError::InvalidPreviewPath(e.to_string()))
}

/// Builds the route path for `url` (standard alphabet, padded).
pub fn encode_preview_path(url: &str) -> String {
    format!("{}{}", PREVIEW_ROUTE_PREFIX, STANDARD.encode(url))
}

fn unescape_base64(encoded: &str) -> String {
    if !encoded.contains('%') {
        return encoded.to_string();
    }

    let mut out = String::with_capacity(encoded.len());
    let mut rest = encoded;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos + 1..pos + 3).map(|s| s.to_ascii_uppercase());
        match escape.as_deref() {
            Some("2B") => out.push('+'),
            Some("2F") => out.push('/'),
            Some("3D") => out.push('='),
            _ => {
                out.push('%');
                rest = &rest[pos + 1..];
                continue;
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    out
}

/// Marks an encoded path as rendering until dropped.
struct InFlight<'a> {
    paths: &'a DashSet<String>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.paths.remove(&self.key);
    }
}

enum Claim<'a> {
    Render(InFlight<'a>),
    Cached(Bytes),
    Busy,
}

pub struct PreviewRoute {
    config: Arc<ServiceConfig>,
    browsers: Arc<dyn BrowserSource>,
    cache: DashMap<String, Bytes>,
    in_flight: DashSet<String>,
}

impl PreviewRoute {
    pub fn new(config: Arc<ServiceConfig>, browsers: Arc<dyn BrowserSource>) -> Self {
        Self {
            config,
            browsers,
            cache: DashMap::new(),
            in_flight: DashSet::new(),
        }
    }

    /// Answers `path`, or returns `None` when it is not a preview request.
    pub async fn handle(&self, path: &str) -> Option<PreviewResponse> {
        let path = path.split('?').next().unwrap_or(path);
        let encoded = path.strip_prefix(PREVIEW_ROUTE_PREFIX)?;
        Some(self.serve(encoded).await)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub async fn shutdown(&self) {
        self.browsers.shutdown().await;
    }

    async fn serve(&self, encoded: &str) -> PreviewResponse {
        let format = self.config.preview_image_format;

        if let Some(body) = self.cache.get(encoded) {
            debug!("Serving cached preview for {}", encoded);
            return PreviewResponse::image(format, body.clone(), None);
        }

        let _in_flight = match self.claim(encoded) {
            Claim::Render(guard) => guard,
            Claim::Cached(body) => return PreviewResponse::image(format, body, None),
            Claim::Busy => {
                debug!("Preview for {} is already being rendered", encoded);
                return PreviewResponse::unavailable("Preview is already being generated");
            }
        };

        match self.render(encoded, format).await {
            Ok(response) => response,
            Err(e) => {
                error!("Preview request {} failed: {}", encoded, e);
                PreviewResponse::unavailable(e.to_string())
            }
        }
    }

    /// Marks `encoded` as rendering, unless another request holds it or
    /// already finished it.
    fn claim(&self, encoded: &str) -> Claim<'_> {
        if !self.in_flight.insert(encoded.to_string()) {
            return Claim::Busy;
        }
        let guard = InFlight {
            paths: &self.in_flight,
            key: encoded.to_string(),
        };

        // A render may have finished between the caller's lookup and the insert
        match self.cache.get(encoded) {
            Some(body) => Claim::Cached(body.clone()),
            None => Claim::Render(guard),
        }
    }

    async fn render(
        &self,
        encoded: &str,
        format: ImageFormat,
    ) -> Result<PreviewResponse, LinkPreviewError> {
        let url = decode_preview_path(encoded)?;

        let backend = self.browsers.acquire().await?;
        let captured = backend.capture(&url, format).await;
        self.browsers.release(backend).await;

        match captured {
            Ok(data) if data.is_empty() => {
                info!("Empty screenshot for {}", url);
                Ok(PreviewResponse::not_found(format))
            }
            Ok(data) => {
                let body = Bytes::from(data);
                self.cache.insert(encoded.to_string(), body.clone());
                info!("Rendered preview for {} ({} bytes)", url, body.len());
                Ok(PreviewResponse::image(format, body, Some(PREVIEW_CACHE_CONTROL)))
            }
            Err(LinkPreviewError::NavigationFailed { reason, .. }) => {
                error!("Failed to goto url {}: {}", url, reason);
                Ok(PreviewResponse::unavailable(format!("Failed to goto url: {url}")))
            }
            Err(LinkPreviewError::CaptureFailed(reason)) => {
                error!("Failed to take screenshot of {}: {}", url, reason);
                Ok(PreviewResponse::unavailable("Failed to take screenshot"))
            }
            Err(e) => Err(e),
        }
    }
}

/// HTTP router serving the preview route; every other path is a 404.
pub fn router(route: Arc<PreviewRoute>) -> Router {
    Router::new()
        .fallback(preview_handler)
        .with_state(route)
        .layer(TraceLayer::new_for_http())
}

async fn preview_handler(State(route): State<Arc<PreviewRoute>>, uri: Uri) -> Response {
    match route.handle(uri.path()).await {
        Some(response) => response.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_accepts_all_alphabets() {
        let url = "https://example.com/?q=a~b>c";
        let standard = STANDARD.encode(url);
        let url_safe = URL_SAFE_NO_PAD.encode(url);

        assert_eq!(decode_preview_path(&standard).unwrap(), url);
        assert_eq!(decode_preview_path(standard.trim_end_matches('=')).unwrap(), url);
        assert_eq!(decode_preview_path(&url_safe).unwrap(), url);
    }

    #[test]
    fn test_decode_percent_escaped_segment() {
        let url = "https://example.com/?q=a~b>c";
        let escaped = STANDARD
            .encode(url)
            .replace('+', "%2B")
            .replace('/', "%2f")
            .replace('=', "%3D");
        assert_eq!(decode_preview_path(&escaped).unwrap(), url);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_preview_path("!!!not base64!!!"),
            Err(LinkPreviewError::InvalidPreviewPath(_))
        ));
        assert!(decode_preview_path("").is_err());
        // 0xff 0xfe is not UTF-8
        assert!(decode_preview_path(&STANDARD.encode([0xffu8, 0xfe])).is_err());
    }

    #[test]
    fn test_encode_preview_path() {
        let path = encode_preview_path("https://example.com");
        assert!(path.starts_with(PREVIEW_ROUTE_PREFIX));
        assert_eq!(
            decode_preview_path(&path[PREVIEW_ROUTE_PREFIX.len()..]).unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn test_claim_rechecks_cache() {
        let mut source = crate::MockBrowserSource::new();
        source.expect_acquire().never();
        let route = PreviewRoute::new(Arc::new(ServiceConfig::default()), Arc::new(source));
        let encoded = STANDARD.encode("https://example.com");

        // Render finished after this request missed the cache
        route.cache.insert(encoded.clone(), Bytes::from_static(b"jpg"));
        match route.claim(&encoded) {
            Claim::Cached(body) => assert_eq!(body, Bytes::from_static(b"jpg")),
            _ => panic!("expected cached body"),
        }
        assert!(route.in_flight.is_empty());
    }

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let route = PreviewRoute::new(
            Arc::new(ServiceConfig::default()),
            Arc::new(crate::MockBrowserSource::new()),
        );

        let first = route.claim("a");
        assert!(matches!(first, Claim::Render(_)));
        assert!(matches!(route.claim("a"), Claim::Busy));
        drop(first);
        assert!(matches!(route.claim("a"), Claim::Render(_)));
    }

    #[test]
    fn test_error_response_shape() {
        let response = PreviewResponse::unavailable("Failed to take screenshot");
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.content_type, "application/json");
        assert_eq!(response.text(), r#"{"error":"Failed to take screenshot"}"#);
    }

    #[test]
    fn test_into_response_headers() {
        let response = PreviewResponse::image(
            ImageFormat::Png,
            Bytes::from_static(b"png"),
            Some(PREVIEW_CACHE_CONTROL),
        )
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[header::CACHE_CONTROL], PREVIEW_CACHE_CONTROL);
    }
}
