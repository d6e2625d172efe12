//! Recording fakes for engine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::config::TriggerDefinition;
use crate::engine::TriggerInstance;
use crate::page::{ElementSeed, Root, VirtualPage};
use crate::ports::{
    AvailabilityChecker, ContextReader, ExecutionInput, ExecutionOptions, Notifier,
    PipelineExecutor, Services, Telemetry,
};

#[derive(Debug, Clone)]
pub(crate) struct Run {
    pub automation_id: String,
    pub root: Root,
    pub context: Value,
    pub service_context: Map<String, Value>,
}

#[derive(Default)]
pub(crate) struct RecordingExecutor {
    runs: Mutex<Vec<Run>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingExecutor {
    pub fn fail(&self, automation_id: &str) {
        self.failing.lock().unwrap().insert(automation_id.to_string());
    }

    pub fn runs(&self) -> Vec<Run> {
        self.runs.lock().unwrap().clone()
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.runs().into_iter().map(|r| r.automation_id).collect()
    }

    pub fn roots(&self) -> Vec<Root> {
        self.runs().into_iter().map(|r| r.root).collect()
    }
}

#[async_trait]
impl PipelineExecutor for RecordingExecutor {
    async fn execute(
        &self,
        _pipeline: &Value,
        input: ExecutionInput,
        options: ExecutionOptions,
    ) -> anyhow::Result<Value> {
        self.runs.lock().unwrap().push(Run {
            automation_id: options.automation_id.clone(),
            root: input.root,
            context: input.context,
            service_context: input.service_context,
        });
        if self.failing.lock().unwrap().contains(&options.automation_id) {
            bail!("pipeline of {} exploded", options.automation_id);
        }
        Ok(Value::Null)
    }
}

#[derive(Default)]
pub(crate) struct RecordingReader {
    reads: AtomicUsize,
    failing: Mutex<HashSet<Root>>,
}

impl RecordingReader {
    pub fn fail_on(&self, root: Root) {
        self.failing.lock().unwrap().insert(root);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextReader for RecordingReader {
    async fn read(&self, root: Root) -> anyhow::Result<Map<String, Value>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&root) {
            bail!("cannot read {root}");
        }
        let Value::Object(map) = json!({
            "text": "from reader",
            "event": "reader value",
            "root": root.to_string(),
        }) else {
            unreachable!()
        };
        Ok(map)
    }
}

#[derive(Default)]
pub(crate) struct RecordingTelemetry {
    events: Mutex<Vec<(String, String)>>,
    errors: Mutex<Vec<Option<String>>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<Option<String>> {
        self.errors.lock().unwrap().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn record_event(&self, event: &str, automation_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), automation_id.to_string()));
    }

    fn report_error(&self, automation_id: Option<&str>, _error: &anyhow::Error) {
        self.errors
            .lock()
            .unwrap()
            .push(automation_id.map(str::to_string));
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_error(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// Availability answering a fixed value (or failing).
pub(crate) struct FixedAvailability(pub Option<bool>);

#[async_trait]
impl AvailabilityChecker for FixedAvailability {
    async fn is_available(&self) -> anyhow::Result<bool> {
        match self.0 {
            Some(available) => Ok(available),
            None => bail!("availability probe crashed"),
        }
    }
}

pub(crate) struct Harness {
    pub page: Arc<VirtualPage>,
    pub executor: Arc<RecordingExecutor>,
    pub reader: Arc<RecordingReader>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_elements(&[])
    }

    pub fn with_elements(seeds: &[ElementSeed]) -> Self {
        Self {
            page: Arc::new(VirtualPage::with_elements("https://shop.example.com/", seeds)),
            executor: Arc::default(),
            reader: Arc::default(),
            telemetry: Arc::default(),
            notifier: Arc::default(),
        }
    }

    pub fn services(&self) -> Services {
        Services::new(self.page.clone(), self.executor.clone(), self.reader.clone())
            .with_telemetry(self.telemetry.clone())
            .with_notifier(self.notifier.clone())
    }

    /// An installed trigger instance for `definition`.
    pub async fn installed(&self, definition: TriggerDefinition) -> TriggerInstance {
        let trigger = TriggerInstance::new(definition, self.services());
        assert!(trigger.install().await.unwrap());
        trigger
    }
}

/// Let spawned work finish. Needs a paused clock to be deterministic.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
