use url::Url;

/// The self-contained result of one navigate/submit operation: the final
/// URL after redirects and the inlined document.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub url: Url,
    pub html: String,
}
