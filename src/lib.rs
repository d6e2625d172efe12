#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! pagetrigger: a trigger lifecycle engine for declarative page automations.
//!
//! A trigger watches a page for a condition (load, an interval, an element
//! appearing, a user or custom event, an application state change) and, when
//! it fires, reads a context from each matching root and runs the trigger's
//! automations against it.
//!
//! Modules:
//! - `config`: Configuration models, loader, and schema helpers.
//! - `engine`: Trigger instances, debouncing, observer bookkeeping and the firing pipeline.
//! - `page`: The host page abstraction and its in-memory implementation.
//! - `ports`: Collaborator contracts (executor, reader, availability, telemetry, notifier).
//! - `executor`: The reference pipeline interpreter and its page actions.
//! - `sources`: Page command sources (file, stdin).
//! - `utils`: Interpolation helpers.
//!
//! Use `pagetrigger::prelude::*` to bring commonly used items into scope quickly.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod page;
pub mod ports;
pub mod sources;
pub mod utils;

pub use error::TriggerError;

/// Crate-level constants for consumers that want to inspect package metadata at runtime.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version (e.g., "0.1.0").
#[inline]
pub const fn version() -> &'static str {
    PKG_VERSION
}

/// Parse a level name (trace|debug|info|warn|error).
pub fn parse_level(name: &str) -> Option<tracing::Level> {
    use tracing::Level;
    match name.trim().to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Initialize tracing (logging).
/// - `level` wins when given and valid.
/// - Otherwise honors the `RUST_LOG` environment variable as a plain level.
/// - Falls back to `info`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_tracing(level: Option<&str>) {
    let level = level
        .and_then(parse_level)
        .or_else(|| std::env::var("RUST_LOG").ok().as_deref().and_then(parse_level))
        .unwrap_or(tracing::Level::INFO);

    // Ignore the error if the global subscriber was already set.
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}

/// A convenient set of exports for most consumers.
///
/// Bring this into scope with:
/// `use pagetrigger::prelude::*;`
pub mod prelude {
    // Common result/error handling
    pub use anyhow::{Context, Error, Result, anyhow, bail, ensure};

    // Serialization
    pub use serde::{Deserialize, Serialize};

    // Tracing macros
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use std::time::Duration;

    pub use crate::config::{AutomationDef, Config, TriggerDefinition, TriggerKind};
    pub use crate::engine::{LifecycleState, TriggerInstance};
    pub use crate::error::TriggerError;
    pub use crate::page::{Page, PageCommand, Root, VirtualPage};
    pub use crate::ports::Services;

    // Frequently used internal modules
    pub use crate::{config, engine, executor, page, ports, sources, utils};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARNING"), Some(tracing::Level::WARN));
        assert_eq!(parse_level(" debug "), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }
}
