//! Ordered, failure-isolated snapshot transforms.
//!
//! Steps are registered statically and selected (with their options and
//! order) by configuration — there is no runtime discovery or code loading.
//! A step that fails is logged, counted, and skipped; the document as
//! mutated so far flows on to the remaining steps.

pub mod steps;

use metrics::counter;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("rewrite failed: {0}")]
    Rewrite(String),
}

#[derive(Debug, Error)]
pub enum TransformBuildError {
    #[error("unknown transform `{0}`")]
    Unknown(String),
    #[error("invalid options for `{name}`: {reason}")]
    InvalidOptions { name: &'static str, reason: String },
}

/// Read-only request/session context handed to every step.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub path: &'a str,
    pub method: &'a str,
    /// Upstream URL of the snapshot being delivered, when known.
    pub page_url: Option<&'a str>,
}

pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, html: &str, ctx: &TransformContext<'_>) -> Result<String, TransformError>;
}

pub struct TransformPipeline {
    steps: Vec<Box<dyn Transform>>,
}

impl TransformPipeline {
    pub fn new(steps: Vec<Box<dyn Transform>>) -> Self {
        Self { steps }
    }

    pub fn empty() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order. A failing step contributes nothing but
    /// never discards what earlier steps produced.
    pub fn apply(&self, html: &str, ctx: &TransformContext<'_>) -> String {
        let mut current = html.to_string();
        for step in &self.steps {
            match step.apply(&current, ctx) {
                Ok(next) => current = next,
                Err(err) => {
                    counter!("specchio_transform_failures_total").increment(1);
                    warn!(
                        target = "specchio::transform",
                        step = step.name(),
                        path = ctx.path,
                        error = %err,
                        "transform step failed; skipping"
                    );
                }
            }
        }
        current
    }
}
