use anyhow::{Context, Result, anyhow, bail};
use schemars::{Schema, schema_for};
use serde_json::Value;
use serde_valid::Validate;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

use super::models::{ActionDef, Config};

/// Load configuration from a string slice.
pub fn load_from_str(s: &str) -> Result<Config> {
    let cfg: Config =
        serde_json::from_str(s).context("Failed to parse JSON config string into Config")?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Load configuration from any reader (e.g., a file).
pub fn load_from_reader<R: Read>(reader: R) -> Result<Config> {
    let cfg: Config =
        serde_json::from_reader(reader).context("Failed to parse JSON config from reader")?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Load configuration from a file path synchronously.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref)
        .with_context(|| format!("Failed to open config file {}", path_ref.display()))?;
    let cfg = load_from_reader(file)?;
    debug!("Loaded config from {}", path_ref.display());
    Ok(cfg)
}

/// Load configuration from a file path asynchronously (Tokio).
pub async fn load_from_path_async<P: AsRef<Path>>(path: P) -> Result<Config> {
    use tokio::fs;
    let path_ref = path.as_ref();
    let bytes = fs::read(path_ref)
        .await
        .with_context(|| format!("Failed to read config file {}", path_ref.display()))?;
    let cfg: Config = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse JSON config from {}", path_ref.display()))?;
    validate_config(&cfg)?;
    debug!("Loaded config from {}", path_ref.display());
    Ok(cfg)
}

/// Generate the JSON Schema for the Config model (for external validation or tooling).
pub fn generate_schema() -> Schema {
    schema_for!(Config)
}

/// Write the JSON Schema for the Config model to any writer (pretty-printed).
pub fn write_schema_to_writer<W: Write>(mut writer: W) -> Result<()> {
    let schema = generate_schema();
    let json = serde_json::to_string_pretty(&schema).context("Failed to serialize schema")?;
    writer
        .write_all(json.as_bytes())
        .context("Failed to write schema to writer")?;
    Ok(())
}

/// Parse an automation pipeline: either a list of steps or a single step.
pub fn parse_pipeline(pipeline: &Value) -> Result<Vec<ActionDef>> {
    match pipeline {
        Value::Array(_) => {
            serde_json::from_value(pipeline.clone()).context("Invalid pipeline step list")
        }
        Value::Object(_) => serde_json::from_value(pipeline.clone())
            .map(|step| vec![step])
            .context("Invalid pipeline step"),
        other => Err(anyhow!(
            "Pipeline must be a step or a list of steps, got {other}"
        )),
    }
}

/// Perform sanity checks and internal reference validation.
/// - Trigger ids are unique, automation ids are unique within a trigger.
/// - Field constraints (`serde_valid`) hold.
/// - Every pipeline parses and its `ref` steps name existing actions.
pub fn validate_config(cfg: &Config) -> Result<()> {
    let named_action_names = cfg.actions.keys().cloned().collect::<BTreeSet<_>>();

    for (name, action) in &cfg.actions {
        validate_action_refs(action, &named_action_names)
            .with_context(|| format!("Invalid reference in named action '{}'", name))?;
    }

    let mut trigger_ids = BTreeSet::new();
    for trigger in &cfg.triggers {
        if !trigger_ids.insert(trigger.id.as_str()) {
            bail!("Duplicate trigger id '{}'", trigger.id);
        }
        trigger
            .validate()
            .map_err(|e| anyhow!("Invalid trigger '{}': {}", trigger.id, e))?;

        let mut automation_ids = BTreeSet::new();
        for automation in &trigger.extensions {
            if !automation_ids.insert(automation.id.as_str()) {
                bail!(
                    "Duplicate automation id '{}' in trigger '{}'",
                    automation.id,
                    trigger.id
                );
            }
            automation.validate().map_err(|e| {
                anyhow!(
                    "Invalid automation '{}' in trigger '{}': {}",
                    automation.id,
                    trigger.id,
                    e
                )
            })?;

            let steps = parse_pipeline(&automation.pipeline).with_context(|| {
                format!(
                    "Invalid pipeline for automation '{}' in trigger '{}'",
                    automation.id, trigger.id
                )
            })?;
            for (idx, step) in steps.iter().enumerate() {
                validate_action_refs(step, &named_action_names).with_context(|| {
                    format!(
                        "Invalid reference in automation '{}' at step {}",
                        automation.id, idx
                    )
                })?;
            }
        }
    }

    Ok(())
}

fn validate_action_refs(action: &ActionDef, named_action_names: &BTreeSet<String>) -> Result<()> {
    match action {
        ActionDef::Ref { name } => {
            if !named_action_names.contains(name) {
                bail!("Referenced action '{}' was not found in `actions`", name);
            }
        }
        ActionDef::Sequence { steps } => {
            for (i, step) in steps.iter().enumerate() {
                validate_action_refs(step, named_action_names)
                    .with_context(|| format!("Invalid reference in sequence at index {}", i))?;
            }
        }
        ActionDef::Conditional { then, else_, .. } => {
            validate_action_refs(then, named_action_names)
                .context("Invalid reference in conditional `then` branch")?;
            if let Some(else_action) = else_ {
                validate_action_refs(else_action, named_action_names)
                    .context("Invalid reference in conditional `else` branch")?;
            }
        }
        ActionDef::Log { .. }
        | ActionDef::SleepMs { .. }
        | ActionDef::SleepRandMs { .. }
        | ActionDef::SetVar { .. }
        | ActionDef::SetAttribute { .. }
        | ActionDef::AddClass { .. }
        | ActionDef::RemoveClass { .. }
        | ActionDef::SetText { .. }
        | ActionDef::Emit { .. }
        | ActionDef::Fail { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(triggers: Value) -> String {
        json!({
            "actions": {
                "mark": {"type": "add_class", "class": "seen"}
            },
            "triggers": triggers
        })
        .to_string()
    }

    #[test]
    fn test_loads_valid_config() {
        let cfg = load_from_str(&config(json!([{
            "id": "buy",
            "trigger": "click",
            "rootSelector": ".buy",
            "extensions": [{
                "id": "track",
                "pipeline": [{"type": "ref", "name": "mark"}]
            }]
        }])))
        .unwrap();
        assert_eq!(cfg.triggers.len(), 1);
        assert_eq!(cfg.triggers[0].extensions[0].api_version, "v3");
        assert_eq!(cfg.page.url, "about:blank");
    }

    #[test]
    fn test_rejects_unknown_ref() {
        let err = load_from_str(&config(json!([{
            "id": "buy",
            "trigger": "click",
            "extensions": [{"id": "a", "pipeline": {"type": "ref", "name": "nope"}}]
        }])))
        .unwrap_err();
        assert!(format!("{err:#}").contains("nope"));
    }

    #[test]
    fn test_rejects_duplicates() {
        let dup_trigger = load_from_str(&config(json!([
            {"id": "t", "trigger": "load"},
            {"id": "t", "trigger": "load"}
        ])));
        assert!(dup_trigger.is_err());

        let dup_automation = load_from_str(&config(json!([{
            "id": "t",
            "trigger": "load",
            "extensions": [
                {"id": "a", "pipeline": []},
                {"id": "a", "pipeline": []}
            ]
        }])));
        assert!(dup_automation.is_err());
    }

    #[test]
    fn test_rejects_invalid_fields() {
        let zero_interval = load_from_str(&config(json!([{
            "id": "tick", "trigger": "interval", "intervalMillis": 0
        }])));
        assert!(zero_interval.is_err());

        let bad_pipeline = load_from_str(&config(json!([{
            "id": "t", "trigger": "load",
            "extensions": [{"id": "a", "pipeline": "log something"}]
        }])));
        assert!(bad_pipeline.is_err());
    }

    #[test]
    fn test_schema_mentions_triggers() {
        let mut out = Vec::new();
        write_schema_to_writer(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("triggers"));
        assert!(text.contains("rootSelector"));
    }

    #[test]
    fn test_bundled_default_config_loads() {
        let cfg = load_from_path(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.json"))
            .unwrap();
        assert_eq!(cfg.triggers.len(), 4);
        assert_eq!(cfg.page.elements.len(), 1);
        assert!(cfg.actions.contains_key("mark_seen"));
    }
}
