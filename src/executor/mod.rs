#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

/*!
Executor module for pagetrigger.

This module wires together:
- `actions`: low-level page actions (attributes, classes, text, custom events, sleep, logging)
- `runtime`: the reference pipeline interpreter with interpolation and named actions

Typical usage:
- Construct a `PipelineRuntime` over the page with the config's named actions and globals.
- Hand it to the trigger engine as its `PipelineExecutor`.

Example:
```no_run
use std::sync::Arc;
use pagetrigger::config::Config;
use pagetrigger::executor::PipelineRuntime;
use pagetrigger::page::VirtualPage;

let cfg = Config::default();
let page = Arc::new(VirtualPage::new("about:blank"));
let rt = PipelineRuntime::from_config(page, &cfg, true); // dry-run mode
```

Public re-exports:
- `PageActions`: performs low-level page actions (respecting dry-run).
- `PipelineRuntime`: interprets automation pipelines.
*/

pub mod actions;
pub mod runtime;

// Re-exports for convenient access from `pagetrigger::executor::*`
pub use actions::PageActions;
pub use runtime::PipelineRuntime;
