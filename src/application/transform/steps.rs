//! The static transform registry and its built-in steps.

use lol_html::html_content::ContentType;
use lol_html::{RewriteStrSettings, element, rewrite_str, text};
use serde::Deserialize;
use serde_json::Value;

use crate::config::TransformSettings;

use super::{Transform, TransformBuildError, TransformContext, TransformError, TransformPipeline};

/// Build the configured pipeline. Order in configuration is execution
/// order; disabled entries are dropped, unknown names are a startup error.
pub fn build_pipeline(specs: &[TransformSettings]) -> Result<TransformPipeline, TransformBuildError> {
    let mut steps: Vec<Box<dyn Transform>> = Vec::new();
    for spec in specs {
        if !spec.enabled {
            continue;
        }
        steps.push(build_step(&spec.name, &spec.options)?);
    }
    Ok(TransformPipeline::new(steps))
}

fn build_step(name: &str, options: &Value) -> Result<Box<dyn Transform>, TransformBuildError> {
    match name {
        AppendTitleSuffix::NAME => Ok(Box::new(AppendTitleSuffix::from_options(options)?)),
        DropBaseTags::NAME => Ok(Box::new(DropBaseTags)),
        _ => Err(TransformBuildError::Unknown(name.to_string())),
    }
}

/// Append a fixed suffix to the document title so relayed pages are
/// recognizable in tabs and history.
pub struct AppendTitleSuffix {
    suffix: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppendTitleSuffixOptions {
    suffix: Option<String>,
}

impl AppendTitleSuffix {
    pub const NAME: &'static str = "append-title-suffix";
    const DEFAULT_SUFFIX: &'static str = " [via specchio]";

    fn from_options(options: &Value) -> Result<Self, TransformBuildError> {
        let options: AppendTitleSuffixOptions =
            serde_json::from_value(options.clone()).map_err(|err| {
                TransformBuildError::InvalidOptions {
                    name: Self::NAME,
                    reason: err.to_string(),
                }
            })?;
        Ok(Self {
            suffix: options
                .suffix
                .unwrap_or_else(|| Self::DEFAULT_SUFFIX.to_string()),
        })
    }
}

impl Transform for AppendTitleSuffix {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, html: &str, _ctx: &TransformContext<'_>) -> Result<String, TransformError> {
        rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![text!("title", |chunk| {
                    if chunk.last_in_text_node() {
                        chunk.after(&self.suffix, ContentType::Text);
                    }
                    Ok(())
                })],
                ..RewriteStrSettings::default()
            },
        )
        .map_err(|err| TransformError::Rewrite(err.to_string()))
    }
}

/// Remove `<base>` elements. An upstream base href would re-anchor every
/// remaining relative reference at the upstream origin, bypassing the
/// relay-relative contract.
pub struct DropBaseTags;

impl DropBaseTags {
    pub const NAME: &'static str = "drop-base-tags";
}

impl Transform for DropBaseTags {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, html: &str, _ctx: &TransformContext<'_>) -> Result<String, TransformError> {
        rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![element!("base", |el| {
                    el.remove();
                    Ok(())
                })],
                ..RewriteStrSettings::default()
            },
        )
        .map_err(|err| TransformError::Rewrite(err.to_string()))
    }
}
