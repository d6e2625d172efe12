use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_valid::Validate;
use std::collections::BTreeMap;
use std::fmt;

use crate::page::ElementSeed;

/// Root configuration.
///
/// Deserialized from a JSON file. It describes:
/// - the `page` the triggers attach to (URL + seed element tree)
/// - the `triggers`, each carrying the automations ("extensions") it fires
/// - reusable named pipeline steps (`actions`) and `globals` for the
///   reference pipeline interpreter
/// - where scripted page commands come from (`sources`)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Config {
    /// Page command sources (file, stdin).
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Initial page state.
    #[serde(default)]
    pub page: PageSeed,

    /// Trigger definitions, one trigger instance each.
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,

    /// Reusable named pipeline steps, referenced with `{ "type": "ref", "name": "..." }`.
    #[serde(default)]
    pub actions: NamedActions,

    /// Global values available to pipelines as `{{@key}}`.
    #[serde(default)]
    pub globals: GlobalsMap,
}

/// A convenient alias for the named action map.
pub type NamedActions = BTreeMap<String, ActionDef>;

/// Global variables.
pub type GlobalsMap = BTreeMap<String, Value>;

/// Page command source configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Poll a single file for newline-delimited JSON commands.
    File {
        path: String,
        /// Poll interval in milliseconds (default: 100).
        #[serde(default)]
        poll_ms: Option<u64>,
        /// Delete the file after a successful read (default: false).
        #[serde(default)]
        delete_on_success: Option<bool>,
    },

    /// Read newline-delimited JSON commands from standard input.
    Stdin,
}

/// Initial page: URL and top-level elements.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PageSeed {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub elements: Vec<ElementSeed>,
}

impl Default for PageSeed {
    fn default() -> Self {
        Self {
            url: default_url(),
            elements: Vec::new(),
        }
    }
}

fn default_url() -> String {
    "about:blank".to_string()
}

/// The logical event an automation listens for.
///
/// Serialized as a plain string; anything that is not one of the built-in
/// kinds is treated as a native DOM event name (`click`, `change`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TriggerKind {
    Load,
    Interval,
    Appear,
    Initialize,
    Custom,
    StateChange,
    SelectionChange,
    Dom(String),
}

impl TriggerKind {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerKind::Load => "load",
            TriggerKind::Interval => "interval",
            TriggerKind::Appear => "appear",
            TriggerKind::Initialize => "initialize",
            TriggerKind::Custom => "custom",
            TriggerKind::StateChange => "statechange",
            TriggerKind::SelectionChange => "selectionchange",
            TriggerKind::Dom(name) => name,
        }
    }

    /// Kinds whose listener is bound once on the document.
    pub fn is_document_scoped(&self) -> bool {
        matches!(self, TriggerKind::StateChange | TriggerKind::SelectionChange)
    }

    /// Kinds fired by something the user did, as opposed to page lifecycle.
    pub fn is_user_action(&self) -> bool {
        matches!(
            self,
            TriggerKind::Dom(_)
                | TriggerKind::Custom
                | TriggerKind::StateChange
                | TriggerKind::SelectionChange
        )
    }

    pub fn default_report_mode(&self) -> ReportMode {
        if self.is_user_action() {
            ReportMode::All
        } else {
            ReportMode::Once
        }
    }
}

impl From<String> for TriggerKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "load" => TriggerKind::Load,
            "interval" => TriggerKind::Interval,
            "appear" => TriggerKind::Appear,
            "initialize" => TriggerKind::Initialize,
            "custom" => TriggerKind::Custom,
            "statechange" => TriggerKind::StateChange,
            "selectionchange" => TriggerKind::SelectionChange,
            _ => TriggerKind::Dom(value),
        }
    }
}

impl From<&str> for TriggerKind {
    fn from(value: &str) -> Self {
        TriggerKind::from(value.to_string())
    }
}

impl From<TriggerKind> for String {
    fn from(value: TriggerKind) -> Self {
        match value {
            TriggerKind::Dom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether elements appearing after the trigger is armed get wired up too.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AttachMode {
    #[default]
    Once,
    Watch,
}

/// Which element a DOM-event firing runs against.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TargetMode {
    /// The element the event was dispatched on.
    #[default]
    EventTarget,
    /// The closest ancestor of the event target matching `rootSelector`.
    Root,
}

/// Whether repeated runs of the same automation are re-reported.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReportMode {
    Once,
    All,
}

/// Debounce settings, same semantics as a leading/trailing debounce.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DebounceOptions {
    pub wait_millis: u64,
    #[serde(default)]
    pub leading: bool,
    #[serde(default = "default_true")]
    pub trailing: bool,
}

/// Where a trigger may run at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    /// URL globs (`*` wildcard). Empty means any URL.
    #[serde(default)]
    pub match_patterns: Vec<String>,
    /// Selectors that must each match at least one element.
    #[serde(default)]
    pub selectors: Vec<String>,
}

/// A configured trigger (one extension point on the page).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    #[validate(min_length = 1)]
    pub id: String,

    /// `load`, `interval`, `appear`, `initialize`, `custom`, `statechange`,
    /// `selectionchange` or any native DOM event name.
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub trigger: Option<TriggerKind>,

    /// CSS selector scoping the watched elements. Absent means the document.
    #[serde(default)]
    pub root_selector: Option<String>,

    #[serde(default)]
    pub attach_mode: AttachMode,

    #[serde(default)]
    pub target_mode: TargetMode,

    /// Defaults to `all` for user-action kinds and `once` otherwise.
    #[serde(default)]
    pub report_mode: Option<ReportMode>,

    /// Period of `interval` triggers.
    #[serde(default)]
    #[validate(minimum = 1)]
    pub interval_millis: Option<u64>,

    /// Keep running `interval` effects while the page is not rendered.
    #[serde(default)]
    pub background: bool,

    #[serde(default)]
    pub debounce: Option<DebounceOptions>,

    /// Event name for `custom` triggers.
    #[serde(default)]
    pub custom_event: Option<String>,

    /// Give up waiting for `rootSelector` on `load` after this long.
    #[serde(default)]
    pub wait_timeout_millis: Option<u64>,

    /// Show an aggregated error notification when automations fail.
    #[serde(default = "default_true")]
    pub show_errors: bool,

    #[serde(default)]
    pub availability: Availability,

    /// Automations fired by this trigger.
    #[serde(default)]
    pub extensions: Vec<AutomationDef>,
}

impl TriggerDefinition {
    pub fn new(id: impl Into<String>, trigger: impl Into<TriggerKind>) -> Self {
        Self {
            trigger: Some(trigger.into()),
            ..Self::unconfigured(id)
        }
    }

    /// A definition without a trigger kind.
    pub fn unconfigured(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: None,
            root_selector: None,
            attach_mode: AttachMode::Once,
            target_mode: TargetMode::EventTarget,
            report_mode: None,
            interval_millis: None,
            background: false,
            debounce: None,
            custom_event: None,
            wait_timeout_millis: None,
            show_errors: true,
            availability: Availability::default(),
            extensions: Vec::new(),
        }
    }

    /// The configured report mode, or the kind-dependent default.
    pub fn effective_report_mode(&self) -> ReportMode {
        self.report_mode.unwrap_or_else(|| {
            self.trigger
                .as_ref()
                .map_or(ReportMode::Once, TriggerKind::default_report_mode)
        })
    }
}

/// An automation bound to a trigger.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AutomationDef {
    #[validate(min_length = 1)]
    pub id: String,

    #[serde(default)]
    pub label: Option<String>,

    /// Action pipeline: a list of steps or a single step.
    pub pipeline: Value,

    #[serde(default)]
    pub services: Vec<ServiceBinding>,

    /// Option arguments handed to the pipeline.
    #[serde(default)]
    pub options: Map<String, Value>,

    /// For `statechange` triggers: only run for changes of this state key.
    #[serde(default)]
    pub state_key: Option<String>,

    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl AutomationDef {
    pub fn new(id: impl Into<String>, pipeline: Value) -> Self {
        Self {
            id: id.into(),
            label: None,
            pipeline,
            services: Vec::new(),
            options: Map::new(),
            state_key: None,
            api_version: default_api_version(),
        }
    }

    #[must_use]
    pub fn with_state_key(mut self, key: impl Into<String>) -> Self {
        self.state_key = Some(key.into());
        self
    }
}

/// A declared service dependency of an automation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBinding {
    /// Service identifier, e.g. `acme/crm`.
    pub id: String,
    /// Name the pipeline sees the service under (`@<outputKey>`).
    pub output_key: String,
    /// Configured integration to use, if any.
    #[serde(default)]
    pub config: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_api_version() -> String {
    "v3".to_string()
}

/// A pipeline step understood by the reference pipeline interpreter.
///
/// String fields support interpolation with:
/// - context values: `{{text}}`, `{{event.key}}`, `{{options.name}}`
/// - globals: `{{@global_key}}`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDef {
    /// A sequence of steps executed in order.
    Sequence { steps: Vec<ActionDef> },

    /// Reference a named action from the `actions` map.
    Ref { name: String },

    /// Log a message with a chosen level.
    Log { level: LogLevel, message: String },

    /// Sleep for a fixed duration in milliseconds.
    SleepMs { ms: u64 },

    /// Sleep for a random duration in milliseconds within [min, max].
    SleepRandMs { min: u64, max: u64 },

    /// Set (or override) a pipeline-scoped variable.
    SetVar { name: String, value: String },

    /// Run `then` if interpolate(when) == interpolate(equals), `else` otherwise.
    Conditional {
        when: String,
        equals: String,
        then: Box<ActionDef>,
        #[serde(rename = "else")]
        #[serde(default)]
        else_: Option<Box<ActionDef>>,
    },

    /// Set an attribute on the root element.
    SetAttribute { name: String, value: String },

    /// Add a class to the root element.
    AddClass { class: String },

    /// Remove a class from the root element.
    RemoveClass { class: String },

    /// Replace the text of the root element.
    SetText { text: String },

    /// Dispatch a custom event at the root.
    Emit {
        event: String,
        #[serde(default)]
        detail: Option<Value>,
    },

    /// Fail the pipeline with a message.
    Fail { message: String },
}

/// Logging level enumeration.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_kind_round_trips_as_string() {
        let kinds: Vec<TriggerKind> =
            serde_json::from_value(json!(["load", "click", "statechange", "custom"])).unwrap();
        assert_eq!(
            kinds,
            vec![
                TriggerKind::Load,
                TriggerKind::Dom("click".into()),
                TriggerKind::StateChange,
                TriggerKind::Custom
            ]
        );
        assert_eq!(serde_json::to_value(&kinds[1]).unwrap(), json!("click"));
    }

    #[test]
    fn test_default_report_modes() {
        let load = TriggerDefinition::new("t", "load");
        assert_eq!(load.effective_report_mode(), ReportMode::Once);
        let click = TriggerDefinition::new("t", "click");
        assert_eq!(click.effective_report_mode(), ReportMode::All);
        let mut pinned = TriggerDefinition::new("t", "appear");
        pinned.report_mode = Some(ReportMode::All);
        assert_eq!(pinned.effective_report_mode(), ReportMode::All);
        assert_eq!(
            TriggerDefinition::unconfigured("t").effective_report_mode(),
            ReportMode::Once
        );
    }

    #[test]
    fn test_trigger_definition_defaults() {
        let def: TriggerDefinition = serde_json::from_value(json!({
            "id": "buy",
            "trigger": "click",
            "rootSelector": ".buy",
            "debounce": {"waitMillis": 250}
        }))
        .unwrap();
        assert_eq!(def.attach_mode, AttachMode::Once);
        assert_eq!(def.target_mode, TargetMode::EventTarget);
        assert!(def.show_errors);
        assert_eq!(
            def.debounce,
            Some(DebounceOptions {
                wait_millis: 250,
                leading: false,
                trailing: true
            })
        );
    }

    #[test]
    fn test_interval_must_be_positive() {
        let mut def = TriggerDefinition::new("tick", "interval");
        def.interval_millis = Some(0);
        assert!(def.validate().is_err());
        def.interval_millis = Some(500);
        assert!(def.validate().is_ok());
    }
}
