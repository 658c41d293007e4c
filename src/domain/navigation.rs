//! URL handling for the relay protocol: relay-relative derivation, target
//! resolution, and GET-form query merging.

use std::collections::BTreeMap;

use url::Url;

use crate::domain::error::DomainError;

/// Reduce an absolute URL to its relay-relative form: path + query +
/// fragment, never scheme or host.
///
/// This is the only shape of target the client interceptor may echo back,
/// which keeps the upstream origin out of everything the delivered document
/// can observe.
pub fn relay_relative(url: &Url) -> String {
    let mut out = String::from(url.path());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// Resolve a navigation target against a base URL (the session's last URL,
/// or the configured start target before any navigation happened).
pub fn resolve_href(href: &str, base: &Url) -> Result<Url, DomainError> {
    base.join(href)
        .map_err(|err| DomainError::validation(format!("cannot resolve `{href}`: {err}")))
}

/// Merge submitted form fields into a URL's query string.
///
/// The last value per field name wins: a submitted field replaces every
/// existing pair of the same name, and within the submission itself the map
/// has already collapsed repeats.
pub fn merge_query_fields(url: &Url, fields: &BTreeMap<String, String>) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !fields.contains_key(name.as_ref()))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    let mut merged = url.clone();
    merged.set_query(None);
    if !kept.is_empty() || !fields.is_empty() {
        let mut pairs = merged.query_pairs_mut();
        for (name, value) in &kept {
            pairs.append_pair(name, value);
        }
        for (name, value) in fields {
            pairs.append_pair(name, value);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(value: &str) -> Url {
        Url::parse(value).expect("test url")
    }

    #[test]
    fn relay_relative_strips_scheme_and_host() {
        let derived = relay_relative(&url("https://upstream.example/a/b?x=1&y=2#frag"));
        assert_eq!(derived, "/a/b?x=1&y=2#frag");
        assert!(!derived.contains("upstream.example"));
        assert!(!derived.contains("https"));
    }

    #[test]
    fn relay_relative_of_bare_origin_is_root() {
        assert_eq!(relay_relative(&url("http://host.example")), "/");
    }

    #[test]
    fn resolve_href_is_relative_to_base() {
        let base = url("https://upstream.example/articles/index.html");
        let resolved = resolve_href("detail.html?id=4", &base).expect("resolved");
        assert_eq!(
            resolved.as_str(),
            "https://upstream.example/articles/detail.html?id=4"
        );
    }

    #[test]
    fn resolve_href_keeps_absolute_targets() {
        let base = url("https://upstream.example/");
        let resolved = resolve_href("https://other.example/x", &base).expect("resolved");
        assert_eq!(resolved.as_str(), "https://other.example/x");
    }

    #[test]
    fn merge_query_fields_appends_submitted_pairs() {
        let fields = BTreeMap::from([
            ("q".to_string(), "cats".to_string()),
            ("page".to_string(), "2".to_string()),
        ]);
        let merged = merge_query_fields(&url("https://upstream.example/search"), &fields);

        let pairs: BTreeMap<String, String> = merged
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs, fields);
        assert_eq!(merged.query_pairs().count(), 2);
    }

    #[test]
    fn merge_query_fields_last_value_wins() {
        let fields = BTreeMap::from([("page".to_string(), "3".to_string())]);
        let merged = merge_query_fields(
            &url("https://upstream.example/search?q=cats&page=1"),
            &fields,
        );

        assert_eq!(merged.query(), Some("q=cats&page=3"));
    }
}
