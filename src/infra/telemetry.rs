use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "specchio_relay_sessions_total",
            Unit::Count,
            "Total number of client sessions minted by the relay."
        );
        describe_counter!(
            "specchio_render_sessions_started_total",
            Unit::Count,
            "Total number of renderer sessions started on behalf of clients."
        );
        describe_counter!(
            "specchio_relay_rebootstraps_total",
            Unit::Count,
            "Total number of re-bootstraps after the renderer lost a session."
        );
        describe_counter!(
            "specchio_renderer_sessions_total",
            Unit::Count,
            "Total number of sessions registered by the renderer."
        );
        describe_counter!(
            "specchio_capture_stylesheets_total",
            Unit::Count,
            "Total number of stylesheets captured across operations."
        );
        describe_counter!(
            "specchio_capture_images_total",
            Unit::Count,
            "Total number of images captured across operations."
        );
        describe_counter!(
            "specchio_inline_hits_total",
            Unit::Count,
            "Total number of references rewritten to embedded data URIs."
        );
        describe_counter!(
            "specchio_inline_misses_total",
            Unit::Count,
            "Total number of references that stayed remote (never captured)."
        );
        describe_counter!(
            "specchio_transform_failures_total",
            Unit::Count,
            "Total number of transform steps skipped after an error."
        );
    });
}
