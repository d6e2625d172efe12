//! Utilities for pagetrigger.
//!
//! Submodules:
//! - `interpolation`: Templating helpers for scope paths like `{{event.key}}` and globals `{{@key}}`.

pub mod interpolation;
