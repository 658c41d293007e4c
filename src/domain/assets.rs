//! Subresources observed while the engine renders one operation:
//! classification, operation-scoped buffering, and data-URI encoding.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use url::Url;

/// Role the engine assigned to a response, when it knows one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRole {
    Document,
    Stylesheet,
    Image,
    Script,
    Font,
    Other,
}

/// One response from the page's subresource stream, as surfaced by the
/// rendering engine.
#[derive(Debug, Clone)]
pub struct SubresourceResponse {
    /// Absolute URL the response was served from.
    pub url: String,
    pub role: ResourceRole,
    /// Content-type header, if the response carried one.
    pub content_type: Option<String>,
    pub body: Bytes,
    pub ok: bool,
}

/// A stylesheet captured during one operation. `base_url` is the URL the
/// sheet itself was served from; `url(...)` references inside it resolve
/// against that, not against the page URL.
#[derive(Debug, Clone)]
pub struct CapturedStylesheet {
    pub base_url: String,
    pub text: String,
}

/// An image captured during one operation, ready to be embedded.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub content_type: String,
    pub bytes: Bytes,
}

impl CapturedImage {
    pub fn data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            BASE64.encode(&self.bytes)
        )
    }
}

/// Everything captured around a single navigate/submit operation.
///
/// Built fresh per operation and discarded after inlining, so resources
/// from a previous page can never leak into a new snapshot.
#[derive(Debug, Default)]
pub struct AssetBuffers {
    pub stylesheets: Vec<CapturedStylesheet>,
    images: HashMap<String, CapturedImage>,
}

impl AssetBuffers {
    /// Classify one response and buffer it if it is a stylesheet or image.
    /// Failed responses and blank stylesheets are dropped.
    pub fn absorb(&mut self, response: SubresourceResponse) {
        if !response.ok {
            return;
        }

        let content_type = response.content_type.as_deref().unwrap_or("");
        if response.role == ResourceRole::Stylesheet || content_type.contains("text/css") {
            let text = String::from_utf8_lossy(&response.body);
            if !text.trim().is_empty() {
                self.stylesheets.push(CapturedStylesheet {
                    base_url: response.url,
                    text: text.into_owned(),
                });
            }
            return;
        }

        if response.role == ResourceRole::Image || content_type.starts_with("image/") {
            let content_type = image_content_type(&response.url, response.content_type.as_deref());
            self.images.insert(
                response.url,
                CapturedImage {
                    content_type,
                    bytes: response.body,
                },
            );
        }
    }

    pub fn image_for(&self, url: &Url) -> Option<&CapturedImage> {
        self.images.get(url.as_str())
    }

    pub fn stylesheet_count(&self) -> usize {
        self.stylesheets.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stylesheets.is_empty() && self.images.is_empty()
    }

    #[cfg(test)]
    pub fn insert_image(&mut self, url: &str, image: CapturedImage) {
        self.images.insert(url.to_string(), image);
    }
}

/// Content type for a captured image: the response header when present,
/// otherwise inferred from the URL's extension.
fn image_content_type(url: &str, header: Option<&str>) -> String {
    if let Some(header) = header {
        let essence = header.split(';').next().unwrap_or(header).trim();
        if !essence.is_empty() {
            return essence.to_ascii_lowercase();
        }
    }

    let path = Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
