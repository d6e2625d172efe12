use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::config::{ActionDef, Config, GlobalsMap, NamedActions, parse_pipeline};
use crate::executor::actions::PageActions;
use crate::page::{Root, VirtualPage};
use crate::ports::{ExecutionInput, ExecutionOptions, PipelineExecutor};
use crate::utils::interpolation;

/// Maximum nesting depth for action execution (to protect against cycles).
const MAX_DEPTH: usize = 64;

/// Pipeline API versions this interpreter understands.
const SUPPORTED_API_VERSIONS: &[&str] = &["v1", "v2", "v3"];

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Reference pipeline interpreter. It is responsible for:
/// - building the pipeline scope from the read context, options and services
/// - interpolating strings using the scope and globals
/// - dispatching steps to the low-level `PageActions`
pub struct PipelineRuntime {
    actions: NamedActions,
    globals: GlobalsMap,
    executor: PageActions,
}

impl PipelineRuntime {
    pub fn new(
        page: Arc<VirtualPage>,
        actions: NamedActions,
        globals: GlobalsMap,
        dry_run: bool,
    ) -> Self {
        Self {
            actions,
            globals,
            executor: PageActions::new(page, dry_run),
        }
    }

    /// Runtime using the named actions and globals of `config`.
    pub fn from_config(page: Arc<VirtualPage>, config: &Config, dry_run: bool) -> Self {
        Self::new(page, config.actions.clone(), config.globals.clone(), dry_run)
    }

    /// Enable or disable dry-run mode at runtime.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.executor.set_dry_run(dry_run);
    }

    /// Is dry-run currently enabled?
    pub fn is_dry_run(&self) -> bool {
        self.executor.is_dry_run()
    }

    /// Execute a single step with recursion/sequence support.
    fn execute_action<'a>(
        &'a self,
        action: &'a ActionDef,
        root: Root,
        scope: &'a mut Map<String, Value>,
        depth: usize,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            if depth > MAX_DEPTH {
                bail!("Maximum action nesting depth ({MAX_DEPTH}) exceeded (possible cycle)");
            }

            match action {
                ActionDef::Sequence { steps } => {
                    for (i, step) in steps.iter().enumerate() {
                        trace!(target: "pagetrigger::runtime", depth, step_index = i, "Sequence step");
                        self.execute_action(step, root, scope, depth + 1).await?;
                    }
                    Ok(())
                }

                ActionDef::Ref { name } => {
                    let referenced = self
                        .actions
                        .get(name)
                        .ok_or_else(|| anyhow::anyhow!("Referenced action '{}' not found", name))?;
                    trace!(target: "pagetrigger::runtime", %name, depth, "Resolving Ref action");
                    self.execute_action(referenced, root, scope, depth + 1).await
                }

                // Timing
                ActionDef::SleepMs { ms } => {
                    self.executor.sleep_ms(*ms).await;
                    Ok(())
                }
                ActionDef::SleepRandMs { min, max } => {
                    self.executor.sleep_rand_ms(*min, *max).await;
                    Ok(())
                }

                // Logic & State
                ActionDef::SetVar { name, value } => {
                    let k = self.interp(name, scope);
                    let v = self.interp(value, scope);
                    trace!(target: "pagetrigger::runtime", key = %k, value = %v, "SetVar");
                    scope.insert(k, Value::String(v));
                    Ok(())
                }
                ActionDef::Conditional {
                    when,
                    equals,
                    then,
                    else_,
                } => {
                    let lhs = self.interp(when, scope);
                    let rhs = self.interp(equals, scope);
                    debug!(
                        target: "pagetrigger::runtime",
                        when = %lhs, equals = %rhs, depth,
                        "Conditional evaluation"
                    );
                    if lhs == rhs {
                        self.execute_action(then, root, scope, depth + 1).await
                    } else if let Some(else_action) = else_ {
                        self.execute_action(else_action, root, scope, depth + 1)
                            .await
                    } else {
                        Ok(())
                    }
                }

                // Logging
                ActionDef::Log { level, message } => {
                    let msg = self.interp(message, scope);
                    self.executor.log_message(*level, &msg);
                    Ok(())
                }

                // Page
                ActionDef::SetAttribute { name, value } => {
                    let name = self.interp(name, scope);
                    let value = self.interp(value, scope);
                    self.executor.set_attribute(root, &name, &value)
                }
                ActionDef::AddClass { class } => {
                    let class = self.interp(class, scope);
                    self.executor.toggle_class(root, &class, true)
                }
                ActionDef::RemoveClass { class } => {
                    let class = self.interp(class, scope);
                    self.executor.toggle_class(root, &class, false)
                }
                ActionDef::SetText { text } => {
                    let text = self.interp(text, scope);
                    self.executor.set_text(root, &text)
                }
                ActionDef::Emit { event, detail } => {
                    let event = self.interp(event, scope);
                    let detail = detail
                        .as_ref()
                        .map(|d| interpolation::interpolate_json(d, scope, &self.globals));
                    self.executor.emit(root, &event, detail);
                    Ok(())
                }

                ActionDef::Fail { message } => bail!("{}", self.interp(message, scope)),
            }
        })
    }

    /// Interpolate a string with the current scope and config globals.
    fn interp(&self, s: &str, scope: &Map<String, Value>) -> String {
        interpolation::interpolate_string(s, scope, &self.globals)
    }
}

#[async_trait]
impl PipelineExecutor for PipelineRuntime {
    async fn execute(
        &self,
        pipeline: &Value,
        input: ExecutionInput,
        options: ExecutionOptions,
    ) -> Result<Value> {
        if !SUPPORTED_API_VERSIONS.contains(&options.api_version.as_str()) {
            bail!(
                "Unsupported apiVersion '{}' (expected one of {:?})",
                options.api_version,
                SUPPORTED_API_VERSIONS
            );
        }
        let steps = parse_pipeline(pipeline)?;
        let root = input.root;
        let mut scope = build_scope(input);

        info!(
            target: "pagetrigger::runtime",
            parent: &options.span,
            automation = %options.automation_id,
            steps = steps.len(),
            "Starting pipeline"
        );
        for (idx, step) in steps.iter().enumerate() {
            trace!(target: "pagetrigger::runtime", step_index = idx, "Executing step");
            self.execute_action(step, root, &mut scope, 0)
                .await
                .with_context(|| {
                    format!(
                        "Automation '{}' failed at step {}",
                        options.automation_id, idx
                    )
                })?;
        }
        info!(
            target: "pagetrigger::runtime",
            parent: &options.span,
            automation = %options.automation_id,
            "Pipeline completed"
        );
        Ok(Value::Object(scope))
    }
}

/// Scope a pipeline interpolates from: the read context plus `root`,
/// `options` and `services`.
fn build_scope(input: ExecutionInput) -> Map<String, Value> {
    let mut scope = match input.context {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => Map::from_iter([("input".to_string(), other)]),
    };
    scope.insert("root".into(), Value::String(input.root.to_string()));
    scope.insert("options".into(), Value::Object(input.options_args));
    scope.insert("services".into(), Value::Object(input.service_context));
    scope
}
