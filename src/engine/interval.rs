//! Cancellable fixed-cadence scheduler.
//!
//! The runner sleeps one full period before the first run, then loops:
//! optionally wait for a render frame, run the effect, and sleep for whatever
//! is left of the period. A slow effect therefore shortens (or skips) the next
//! sleep instead of pushing the schedule back. Effect errors are logged and the
//! loop continues; only cancellation ends it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::page::Page;

pub struct IntervalRunner {
    period: Duration,
    token: CancellationToken,
    frame: Option<Arc<dyn Page>>,
}

impl IntervalRunner {
    pub fn new(period: Duration, token: CancellationToken) -> Self {
        Self {
            period,
            token,
            frame: None,
        }
    }

    /// Wait for a render frame of `page` before each run.
    #[must_use]
    pub fn yield_to_frame(mut self, page: Arc<dyn Page>) -> Self {
        self.frame = Some(page);
        self
    }

    /// Run `effect` every period until the token is cancelled.
    pub async fn run<F, Fut>(self, mut effect: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if !self.pause(self.period).await {
            return;
        }

        loop {
            if let Some(page) = &self.frame {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => break,
                    _ = page.next_frame() => {}
                }
            }
            if self.token.is_cancelled() {
                break;
            }

            let started = Instant::now();
            if let Err(e) = effect().await {
                warn!(target: "pagetrigger::interval", error = format!("{e:#}"), "Interval effect failed");
            }
            let rest = self.period.saturating_sub(started.elapsed());
            trace!(target: "pagetrigger::interval", ?rest, "Interval tick done");

            if !self.pause(rest).await {
                break;
            }
        }
        trace!(target: "pagetrigger::interval", "Interval cancelled");
    }

    /// Sleep for `duration`; `false` if cancelled first.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}
