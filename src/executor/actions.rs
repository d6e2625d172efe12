use anyhow::{Result, anyhow};
use rand::random_range;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::models::LogLevel;
use crate::page::{ElementId, NativeEvent, Root, VirtualPage};

/// Executes low-level page actions (attributes/classes/text/events/sleep/log)
/// with optional dry-run mode. In dry-run mode, page mutations are only logged.
pub struct PageActions {
    page: Arc<VirtualPage>,
    dry_run: bool,
}

impl PageActions {
    /// Create a new executor.
    /// - dry_run: when true, only logs instead of touching the page.
    pub fn new(page: Arc<VirtualPage>, dry_run: bool) -> Self {
        Self { page, dry_run }
    }

    /// Returns whether the executor is currently in dry-run mode.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Enable or disable dry-run mode dynamically.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn set_attribute(&self, root: Root, name: &str, value: &str) -> Result<()> {
        let element = element_of(root, "set_attribute")?;
        if self.dry_run {
            info!(target: "pagetrigger::actions", %element, %name, %value, "DRY-RUN set_attribute");
            return Ok(());
        }
        trace!(target: "pagetrigger::actions", %element, %name, "set_attribute");
        still_present(element, self.page.set_attribute(element, name, value))
    }

    pub fn toggle_class(&self, root: Root, class: &str, present: bool) -> Result<()> {
        let element = element_of(root, if present { "add_class" } else { "remove_class" })?;
        if self.dry_run {
            info!(target: "pagetrigger::actions", %element, %class, present, "DRY-RUN toggle_class");
            return Ok(());
        }
        trace!(target: "pagetrigger::actions", %element, %class, present, "toggle_class");
        still_present(element, self.page.toggle_class(element, class, present))
    }

    pub fn set_text(&self, root: Root, text: &str) -> Result<()> {
        let element = element_of(root, "set_text")?;
        if self.dry_run {
            info!(target: "pagetrigger::actions", %element, %text, "DRY-RUN set_text");
            return Ok(());
        }
        trace!(target: "pagetrigger::actions", %element, "set_text");
        still_present(element, self.page.set_text(element, text))
    }

    /// Dispatch a custom event at `root`. Returns the number of listeners reached.
    pub fn emit(&self, root: Root, event: &str, detail: Option<Value>) -> usize {
        if self.dry_run {
            info!(target: "pagetrigger::actions", %root, %event, ?detail, "DRY-RUN emit");
            return 0;
        }
        let mut native = NativeEvent::new(event, root);
        if let Some(detail) = detail {
            native = native.with_detail(detail);
        }
        let reached = self.page.dispatch(native);
        debug!(target: "pagetrigger::actions", %root, %event, reached, "emit");
        reached
    }

    /// Sleep for a fixed duration in milliseconds.
    pub async fn sleep_ms(&self, ms: u64) {
        if self.dry_run {
            info!(target: "pagetrigger::actions", ms, "DRY-RUN sleep_ms");
            return;
        }
        trace!(target: "pagetrigger::actions", ms, "sleep_ms");
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Sleep for a random duration in milliseconds within [min, max] inclusive.
    pub async fn sleep_rand_ms(&self, min: u64, max: u64) {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let delay = if lo == hi { lo } else { random_range(lo..=hi) };
        if self.dry_run {
            info!(target: "pagetrigger::actions", min = lo, max = hi, delay, "DRY-RUN sleep_rand_ms");
            return;
        }
        trace!(target: "pagetrigger::actions", min = lo, max = hi, delay, "sleep_rand_ms");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Log a message with a given level, useful within pipelines.
    pub fn log_message(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => trace!(target: "pagetrigger", "{message}"),
            LogLevel::Debug => debug!(target: "pagetrigger", "{message}"),
            LogLevel::Info => info!(target: "pagetrigger", "{message}"),
            LogLevel::Warn => warn!(target: "pagetrigger", "{message}"),
            LogLevel::Error => tracing::error!(target: "pagetrigger", "{message}"),
        }
    }
}

fn still_present(element: ElementId, applied: bool) -> Result<()> {
    if applied {
        Ok(())
    } else {
        Err(anyhow!("Element {element} is no longer on the page"))
    }
}

fn element_of(root: Root, action: &str) -> Result<ElementId> {
    root.element()
        .ok_or_else(|| anyhow!("`{action}` needs an element root, got the document"))
}
