//! Fold captured assets back into a snapshot so the delivered document
//! needs no further network access to display.
//!
//! Stylesheets are rewritten (url() references against each sheet's own
//! origin) and concatenated into one style block inside the head; image
//! elements get their best source candidate swapped for a data URI.
//! References that were never captured stay untouched — partial inlining
//! is an accepted degradation, not a failure.

use std::cell::Cell;
use std::rc::Rc;

use lol_html::html_content::ContentType;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use metrics::counter;
use tracing::warn;
use url::Url;

use crate::domain::assets::AssetBuffers;

/// Source attributes tried on `<img>`, most specific first: lazy-load
/// source, lazy-load alternate, then the direct source.
const IMG_SOURCE_ATTRIBUTES: &[&str] = &["data-src", "data-lazy-src", "src"];

pub(crate) fn inline_document(html: &str, page_url: &Url, assets: &AssetBuffers) -> String {
    if assets.is_empty() {
        return html.to_string();
    }

    let style_block = build_style_block(page_url, assets);
    let head_seen = Rc::new(Cell::new(false));
    let hits = Rc::new(Cell::new(0u64));
    let misses = Rc::new(Cell::new(0u64));
    let style_for_head = style_block.clone();

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("head", {
                    let head_seen = Rc::clone(&head_seen);
                    let mut style_for_head = style_for_head.clone();
                    move |el| {
                        head_seen.set(true);
                        if let Some(style) = style_for_head.take() {
                            el.append(&style, ContentType::Html);
                        }
                        Ok(())
                    }
                }),
                element!("img", {
                    let hits = Rc::clone(&hits);
                    let misses = Rc::clone(&misses);
                    let page_url = page_url.clone();
                    move |el| {
                        let mut candidate = None;
                        for attribute in IMG_SOURCE_ATTRIBUTES {
                            if let Some(value) = el.get_attribute(attribute) {
                                let value = value.trim().to_string();
                                if !value.is_empty() && !value.starts_with("data:") {
                                    candidate = Some(value);
                                    break;
                                }
                            }
                        }
                        if candidate.is_none()
                            && let Some(srcset) = el.get_attribute("srcset")
                        {
                            candidate = first_srcset_candidate(&srcset);
                        }

                        let Some(candidate) = candidate else {
                            return Ok(());
                        };
                        let Ok(resolved) = page_url.join(&candidate) else {
                            return Ok(());
                        };

                        match assets.image_for(&resolved) {
                            Some(image) => {
                                el.set_attribute("src", &image.data_uri())?;
                                // The lazy-load attributes still point at the
                                // network and would re-trigger a fetch.
                                el.remove_attribute("data-src");
                                el.remove_attribute("data-lazy-src");
                                hits.set(hits.get() + 1);
                            }
                            None => misses.set(misses.get() + 1),
                        }
                        Ok(())
                    }
                }),
                element!("source", {
                    let hits = Rc::clone(&hits);
                    let misses = Rc::clone(&misses);
                    let page_url = page_url.clone();
                    move |el| {
                        let Some(srcset) = el.get_attribute("srcset") else {
                            return Ok(());
                        };
                        let Some(candidate) = first_srcset_candidate(&srcset) else {
                            return Ok(());
                        };
                        let Ok(resolved) = page_url.join(&candidate) else {
                            return Ok(());
                        };

                        match assets.image_for(&resolved) {
                            Some(image) => {
                                el.set_attribute("srcset", &image.data_uri())?;
                                hits.set(hits.get() + 1);
                            }
                            None => misses.set(misses.get() + 1),
                        }
                        Ok(())
                    }
                }),
            ],
            ..RewriteStrSettings::default()
        },
    );

    counter!("specchio_inline_hits_total").increment(hits.get());
    counter!("specchio_inline_misses_total").increment(misses.get());

    match rewritten {
        Ok(mut rewritten) => {
            if !head_seen.get()
                && let Some(style) = style_block
            {
                // No head element: lead with the styles instead.
                rewritten = format!("{style}{rewritten}");
            }
            rewritten
        }
        Err(err) => {
            warn!(
                target = "specchio::renderer::inline",
                error = %err,
                "inline rewrite failed; serving snapshot without embedded assets"
            );
            html.to_string()
        }
    }
}

/// Concatenate every rewritten stylesheet into one style block, or `None`
/// when nothing was captured.
fn build_style_block(page_url: &Url, assets: &AssetBuffers) -> Option<String> {
    if assets.stylesheets.is_empty() {
        return None;
    }

    let mut combined = String::from("\n/* styles captured and inlined by specchio */\n");
    for sheet in &assets.stylesheets {
        let base = Url::parse(&sheet.base_url).unwrap_or_else(|_| page_url.clone());
        combined.push_str(&rewrite_css_urls(&sheet.text, &base, assets));
        combined.push('\n');
    }
    Some(format!("<style>{combined}</style>"))
}

/// Rewrite `url(...)` references in one stylesheet. Each reference resolves
/// against the sheet's own URL; captured images become data URIs, anything
/// else is copied through untouched.
fn rewrite_css_urls(css: &str, base: &Url, assets: &AssetBuffers) -> String {
    let lower = css.to_ascii_lowercase();
    let mut out = String::with_capacity(css.len());
    let mut cursor = 0;

    while let Some(found) = lower[cursor..].find("url(") {
        let open = cursor + found + 4;
        out.push_str(&css[cursor..open]);

        let Some(close_offset) = css[open..].find(')') else {
            out.push_str(&css[open..]);
            return out;
        };
        let close = open + close_offset;
        let raw = &css[open..close];
        let trimmed = raw.trim();
        let (quote, reference) = match trimmed.chars().next() {
            Some('"') => ("\"", trimmed.trim_matches('"')),
            Some('\'') => ("'", trimmed.trim_matches('\'')),
            _ => ("", trimmed),
        };

        match resolve_css_reference(reference, base, assets) {
            Some(data_uri) => {
                out.push_str(quote);
                out.push_str(&data_uri);
                out.push_str(quote);
            }
            None => out.push_str(raw),
        }
        out.push(')');
        cursor = close + 1;
    }

    out.push_str(&css[cursor..]);
    out
}

fn resolve_css_reference(reference: &str, base: &Url, assets: &AssetBuffers) -> Option<String> {
    if reference.is_empty() || reference.starts_with("data:") || reference.starts_with('#') {
        return None;
    }
    let resolved = base.join(reference).ok()?;
    assets.image_for(&resolved).map(|image| image.data_uri())
}

/// URL of the first candidate in a srcset listing.
fn first_srcset_candidate(srcset: &str) -> Option<String> {
    let first = srcset.split(',').next()?;
    let url = first.split_whitespace().next()?;
    (!url.is_empty() && !url.starts_with("data:")).then(|| url.to_string())
}
