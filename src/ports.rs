//! Collaborators the trigger engine calls but does not own.
//!
//! The engine only sees these narrow contracts:
//! - [`PipelineExecutor`]: runs an automation's action pipeline
//! - [`ContextReader`]: extracts a key/value record from a root
//! - [`AvailabilityChecker`]: gates whether a trigger is armed at all
//! - [`Telemetry`] / [`Notifier`]: fire-and-forget reporting sinks
//!
//! [`Services`] bundles them together with the [`Page`] for a trigger instance.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::page::{Page, Root};

/// Input handed to a pipeline for one automation run.
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    /// Read context shared by every automation of the firing.
    pub context: Value,
    pub root: Root,
    /// Resolved service bindings keyed `@<outputKey>`.
    pub service_context: Map<String, Value>,
    pub options_args: Map<String, Value>,
}

/// Per-run execution options.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub automation_id: String,
    pub api_version: String,
    /// Span the pipeline should log under.
    pub span: tracing::Span,
}

#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    async fn execute(
        &self,
        pipeline: &Value,
        input: ExecutionInput,
        options: ExecutionOptions,
    ) -> anyhow::Result<Value>;
}

#[async_trait]
pub trait ContextReader: Send + Sync {
    async fn read(&self, root: Root) -> anyhow::Result<Map<String, Value>>;
}

#[async_trait]
pub trait AvailabilityChecker: Send + Sync {
    async fn is_available(&self) -> anyhow::Result<bool>;
}

/// Telemetry sink. Calls must not block.
pub trait Telemetry: Send + Sync {
    fn record_event(&self, event: &str, automation_id: &str);
    fn report_error(&self, automation_id: Option<&str>, error: &anyhow::Error);
}

/// User-facing notification sink.
pub trait Notifier: Send + Sync {
    fn notify_error(&self, message: &str);
}

/// Availability checker that always answers yes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAvailable;

#[async_trait]
impl AvailabilityChecker for AlwaysAvailable {
    async fn is_available(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Telemetry emitted as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record_event(&self, event: &str, automation_id: &str) {
        info!(target: "pagetrigger::telemetry", %event, %automation_id, "Telemetry event");
    }

    fn report_error(&self, automation_id: Option<&str>, error: &anyhow::Error) {
        error!(
            target: "pagetrigger::telemetry",
            automation_id = automation_id.unwrap_or("-"),
            error = format!("{error:#}"),
            "Reported error"
        );
    }
}

/// Notifier that logs instead of showing a toast.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_error(&self, message: &str) {
        error!(target: "pagetrigger::notify", "{message}");
    }
}

/// Everything a trigger instance needs from its host.
#[derive(Clone)]
pub struct Services {
    pub page: Arc<dyn Page>,
    pub executor: Arc<dyn PipelineExecutor>,
    pub reader: Arc<dyn ContextReader>,
    pub availability: Arc<dyn AvailabilityChecker>,
    pub telemetry: Arc<dyn Telemetry>,
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    /// Services with tracing-backed telemetry/notifications and no availability gate.
    pub fn new(
        page: Arc<dyn Page>,
        executor: Arc<dyn PipelineExecutor>,
        reader: Arc<dyn ContextReader>,
    ) -> Self {
        Self {
            page,
            executor,
            reader,
            availability: Arc::new(AlwaysAvailable),
            telemetry: Arc::new(TracingTelemetry),
            notifier: Arc::new(LogNotifier),
        }
    }

    #[must_use]
    pub fn with_availability(mut self, availability: Arc<dyn AvailabilityChecker>) -> Self {
        self.availability = availability;
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}
