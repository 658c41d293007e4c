//! Bounded-lifetime capture of one operation's subresource responses.
//!
//! A capture is attached before the action starts and finished right after
//! it completes; whatever arrives in between (plus a short trailing grace
//! window) ends up in the returned buffers. The capture owns its
//! subscription, so nothing outlives the operation that created it.

use std::time::Duration;

use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::assets::AssetBuffers;
use crate::infra::engine::{PageHandle, ResponseSubscription};

pub(crate) struct ResponseCapture {
    collector: JoinHandle<AssetBuffers>,
    stop: oneshot::Sender<Duration>,
}

impl ResponseCapture {
    /// Subscribe to the page's response stream. Must happen before the
    /// action is triggered, or early responses are lost.
    pub(crate) async fn attach(page: &dyn PageHandle) -> Self {
        let subscription = page.subscribe_responses().await;
        let (stop, stop_rx) = oneshot::channel();
        let collector = tokio::spawn(collect(subscription, stop_rx));
        Self { collector, stop }
    }

    /// End the capture: drain trailing responses until the grace period
    /// runs out, then return the buffers. An exhausted grace period is not
    /// a failure — it just means fewer captured assets.
    pub(crate) async fn finish(self, grace: Duration) -> AssetBuffers {
        let _ = self.stop.send(grace);
        match self.collector.await {
            Ok(buffers) => {
                counter!("specchio_capture_stylesheets_total")
                    .increment(buffers.stylesheet_count() as u64);
                counter!("specchio_capture_images_total").increment(buffers.image_count() as u64);
                buffers
            }
            Err(err) => {
                debug!(
                    target = "specchio::renderer::capture",
                    error = %err,
                    "capture collector died; continuing without assets"
                );
                AssetBuffers::default()
            }
        }
    }
}

async fn collect(
    mut subscription: ResponseSubscription,
    mut stop: oneshot::Receiver<Duration>,
) -> AssetBuffers {
    let mut buffers = AssetBuffers::default();

    let grace = loop {
        tokio::select! {
            response = subscription.recv() => {
                match response {
                    Some(response) => buffers.absorb(response),
                    None => return buffers,
                }
            }
            grace = &mut stop => {
                break grace.unwrap_or_default();
            }
        }
    };

    // Trailing drain for responses that were still in flight when the
    // action completed.
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match tokio::time::timeout_at(deadline, subscription.recv()).await {
            Ok(Some(response)) => buffers.absorb(response),
            Ok(None) | Err(_) => break,
        }
    }

    buffers
}
