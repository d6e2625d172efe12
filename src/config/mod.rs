//! Configuration: the JSON model of pages, triggers and automations, plus
//! loading, validation and schema generation.
//!
//! ```no_run
//! use pagetrigger::config::load_from_path;
//!
//! let cfg = load_from_path("config/default.json")?;
//! println!("{} trigger(s)", cfg.triggers.len());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod loader;
pub mod models;

// Re-export core data models
pub use models::{
    ActionDef, AttachMode, AutomationDef, Availability, Config, DebounceOptions, GlobalsMap,
    LogLevel, NamedActions, PageSeed, ReportMode, ServiceBinding, SourceConfig, TargetMode,
    TriggerDefinition, TriggerKind,
};

// Re-export loader utilities
pub use loader::{
    generate_schema, load_from_path, load_from_path_async, load_from_reader, load_from_str,
    parse_pipeline, validate_config, write_schema_to_writer,
};
