//! One firing: read context per root, run eligible automations, report.
//!
//! Roots are processed concurrently and independently: a reader failure on
//! one root never stops the others. Within a root every eligible automation
//! runs concurrently against the same read context. Failures are collected
//! once everything settled and summarized in a single notification.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info_span, trace, warn};

use super::{read, write};
use crate::config::{AutomationDef, ServiceBinding};
use crate::engine::report::{ReportGate, ReportKind};
use crate::error::TriggerError;
use crate::page::{NativeEvent, Root};
use crate::ports::{ExecutionInput, ExecutionOptions, Services};

/// Telemetry event recorded for a successful automation run.
pub const RUN_EVENT: &str = "TriggerRun";

/// Which automations a firing applies to.
pub type Eligibility = Arc<dyn Fn(&AutomationDef) -> bool + Send + Sync>;

pub fn every_automation() -> Eligibility {
    Arc::new(|_: &AutomationDef| true)
}

/// A request to fire a trigger.
#[derive(Clone)]
pub struct Firing {
    pub roots: Vec<Root>,
    pub event: Option<NativeEvent>,
    pub eligible: Eligibility,
}

impl Firing {
    pub fn new(roots: Vec<Root>) -> Self {
        Self {
            roots,
            event: None,
            eligible: every_automation(),
        }
    }

    #[must_use]
    pub fn with_event(mut self, event: NativeEvent) -> Self {
        self.event = Some(event);
        self
    }

    #[must_use]
    pub fn with_eligibility(mut self, eligible: Eligibility) -> Self {
        self.eligible = eligible;
        self
    }
}

impl fmt::Debug for Firing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firing")
            .field("roots", &self.roots)
            .field("event", &self.event.as_ref().map(|e| e.name.as_str()))
            .finish()
    }
}

/// Outcome of a settled firing.
#[derive(Debug, Default)]
pub struct FiringReport {
    pub roots: usize,
    pub runs: usize,
    pub failures: Vec<TriggerError>,
}

/// Runs firings for one trigger instance.
#[derive(Clone)]
pub struct FiringPipeline {
    trigger_id: Arc<str>,
    show_errors: bool,
    services: Services,
    gate: Arc<ReportGate>,
    automations: Arc<RwLock<Vec<Arc<AutomationDef>>>>,
}

impl FiringPipeline {
    pub fn new(
        trigger_id: &str,
        show_errors: bool,
        services: Services,
        gate: ReportGate,
        automations: Vec<AutomationDef>,
    ) -> Self {
        Self {
            trigger_id: Arc::from(trigger_id),
            show_errors,
            services,
            gate: Arc::new(gate),
            automations: Arc::new(RwLock::new(
                automations.into_iter().map(Arc::new).collect(),
            )),
        }
    }

    pub fn gate(&self) -> &ReportGate {
        &self.gate
    }

    /// Add an automation, replacing one with the same id.
    pub fn register(&self, automation: AutomationDef) {
        let mut automations = write(&self.automations);
        let automation = Arc::new(automation);
        match automations.iter_mut().find(|a| a.id == automation.id) {
            Some(slot) => *slot = automation,
            None => automations.push(automation),
        }
    }

    pub fn automation_count(&self) -> usize {
        read(&self.automations).len()
    }

    /// Fire for every root, wait for everything to settle and notify once.
    pub async fn run_triggers_and_notify(&self, firing: Firing) -> FiringReport {
        let Firing {
            roots,
            event,
            eligible,
        } = firing;
        let mut report = FiringReport {
            roots: roots.len(),
            ..FiringReport::default()
        };

        let mut tasks = JoinSet::new();
        for root in roots {
            let this = self.clone();
            let event = event.clone();
            let eligible = eligible.clone();
            tasks.spawn(async move { this.run_trigger(root, event.as_ref(), &eligible).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((runs, failures))) => {
                    report.runs += runs;
                    report.failures.extend(failures);
                }
                Ok(Err(reader_error)) => report.failures.push(reader_error),
                Err(join_error) => report.failures.push(TriggerError::Aborted(join_error.to_string())),
            }
        }

        let failed = report.failures.len();
        debug!(
            target: "pagetrigger::firing",
            trigger = %self.trigger_id,
            roots = report.roots,
            runs = report.runs,
            failed,
            "Firing settled"
        );
        if failed > 0 && self.show_errors {
            let noun = if failed == 1 { "trigger" } else { "triggers" };
            self.services
                .notifier
                .notify_error(&format!("An error occurred running {failed} {noun}"));
        }
        report
    }

    /// Run every eligible automation against one root.
    ///
    /// `Err` means the context could not be read and nothing ran. Otherwise
    /// the number of runs and the automations that failed are returned.
    pub async fn run_trigger(
        &self,
        root: Root,
        event: Option<&NativeEvent>,
        eligible: &Eligibility,
    ) -> Result<(usize, Vec<TriggerError>), TriggerError> {
        let automations: Vec<Arc<AutomationDef>> = read(&self.automations)
            .iter()
            .filter(|automation| eligible(automation.as_ref()))
            .cloned()
            .collect();
        if automations.is_empty() {
            trace!(target: "pagetrigger::firing", trigger = %self.trigger_id, %root, "No eligible automations");
            return Ok((0, Vec::new()));
        }

        let mut context = match self.services.reader.read(root).await {
            Ok(context) => context,
            Err(error) => {
                warn!(target: "pagetrigger::firing", trigger = %self.trigger_id, %root, error = format!("{error:#}"), "Reader failed");
                self.services.telemetry.report_error(None, &error);
                return Err(TriggerError::Reader { root, error });
            }
        };
        if let Some(event) = event {
            context.insert("event".to_string(), event.project());
        }
        let context = Value::Object(context);

        let runs = automations.len();
        let mut tasks = JoinSet::new();
        for automation in automations {
            let this = self.clone();
            let context = context.clone();
            tasks.spawn(async move { this.run_automation(&automation, root, context).await });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(join_error) => failures.push(TriggerError::Aborted(join_error.to_string())),
            }
        }
        Ok((runs, failures))
    }

    async fn run_automation(
        &self,
        automation: &AutomationDef,
        root: Root,
        context: Value,
    ) -> Result<(), TriggerError> {
        let span = info_span!(
            target: "pagetrigger::firing",
            "automation",
            trigger = %self.trigger_id,
            automation = %automation.id,
            %root
        );
        let input = ExecutionInput {
            context,
            root,
            service_context: service_context(&automation.services),
            options_args: automation.options.clone(),
        };
        let options = ExecutionOptions {
            automation_id: automation.id.clone(),
            api_version: automation.api_version.clone(),
            span: span.clone(),
        };

        let outcome = self
            .services
            .executor
            .execute(&automation.pipeline, input, options)
            .instrument(span)
            .await;

        match outcome {
            Ok(_) => {
                if self.gate.should_report(ReportKind::Success, &automation.id) {
                    self.services.telemetry.record_event(RUN_EVENT, &automation.id);
                }
                Ok(())
            }
            Err(error) => {
                warn!(
                    target: "pagetrigger::firing",
                    trigger = %self.trigger_id,
                    automation = %automation.id,
                    error = format!("{error:#}"),
                    "Automation failed"
                );
                if self.gate.should_report(ReportKind::Error, &automation.id) {
                    self.services
                        .telemetry
                        .report_error(Some(&automation.id), &error);
                }
                Err(TriggerError::Automation {
                    automation_id: automation.id.clone(),
                    error,
                })
            }
        }
    }
}

/// Service bindings as the pipeline sees them: `@<outputKey>` entries.
pub fn service_context(bindings: &[ServiceBinding]) -> Map<String, Value> {
    bindings
        .iter()
        .map(|binding| {
            (
                format!("@{}", binding.output_key),
                json!({ "id": binding.id, "config": binding.config }),
            )
        })
        .collect()
}
