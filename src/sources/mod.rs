/*!
Page command sources (orchestration layer).

This module defines the `CommandSource` trait and the orchestration helpers
(`build_sources_from_config`, `spawn_all_sources`). Concrete implementations
live in their own files:

- `file.rs`         -> `FileSource`  (poll a single file of newline-delimited commands)
- `stdin_source.rs` -> `StdinSource` (newline-delimited commands from standard input)

Each source implementation is responsible for:
- Parsing raw lines into `PageCommand`s (see `parse_line`)
- Pushing commands via `Sender<PageCommand>` while respecting backpressure (`send().await`)
- Logging errors and continuing (never panicking inside tasks)
- Ending cleanly when the channel closes or the cancellation token fires
*/

use serde_json::Value;
use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, SourceConfig};
use crate::page::PageCommand;

pub mod file;
pub mod stdin_source;

pub use file::FileSource;
pub use stdin_source::StdinSource;

/// Trait implemented by all command sources.
///
/// A source spawns an asynchronous task that produces page commands and sends
/// them into the provided channel. Tasks should never panic; log and continue
/// or exit gracefully on unrecoverable errors.
pub trait CommandSource: Send + Sync {
    /// Static human-readable identifier (used in logs).
    fn name(&self) -> &'static str;

    /// Start the source in the background. The task ends when `token` is
    /// cancelled, the channel is closed or the input is exhausted.
    fn start(&self, sender: Sender<PageCommand>, token: CancellationToken) -> JoinHandle<()>;
}

/// Construct all configured sources, in config order.
pub fn build_sources_from_config(cfg: &Config) -> Vec<Box<dyn CommandSource>> {
    cfg.sources
        .iter()
        .map(|sc| -> Box<dyn CommandSource> {
            match sc {
                SourceConfig::File {
                    path,
                    poll_ms,
                    delete_on_success,
                } => Box::new(FileSource::new(path.clone(), *poll_ms, *delete_on_success)),
                SourceConfig::Stdin => Box::new(StdinSource::new()),
            }
        })
        .collect()
}

/// Spawn every source, returning their `JoinHandle`s.
pub fn spawn_all_sources(
    sources: &[Box<dyn CommandSource>],
    sender: Sender<PageCommand>,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    sources
        .iter()
        .map(|src| {
            info!(
                target: "pagetrigger::sources",
                source = %src.name(),
                "Starting source task"
            );
            src.start(sender.clone(), token.child_token())
        })
        .collect()
}

/// Parse one input line. Blank lines yield `None`; so do malformed ones,
/// after a warning.
///
/// A line may hold a single command object or an array of commands.
pub fn parse_line(source: &str, line: &str) -> Option<Vec<PageCommand>> {
    let raw = line.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = serde_json::from_str::<Value>(raw).and_then(|value| match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value::<PageCommand>)
            .collect::<Result<Vec<_>, _>>(),
        other => serde_json::from_value::<PageCommand>(other).map(|cmd| vec![cmd]),
    });
    match parsed {
        Ok(commands) => Some(commands),
        Err(e) => {
            warn!(
                target: "pagetrigger::sources",
                %source, error = %e, line = raw,
                "Failed to parse page command"
            );
            None
        }
    }
}

/// Send every command, returning `false` once the receiver is gone.
pub(crate) async fn forward(
    source: &str,
    sender: &Sender<PageCommand>,
    commands: Vec<PageCommand>,
) -> bool {
    for command in commands {
        if sender.send(command).await.is_err() {
            info!(
                target: "pagetrigger::sources",
                %source,
                "Channel closed; source terminating"
            );
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;

    #[test]
    fn test_parse_single_and_batched_commands() {
        let one = parse_line("test", r##"{"op":"select","selector":"#a"}"##).unwrap();
        assert_eq!(
            one,
            vec![PageCommand::Select {
                selector: "#a".into()
            }]
        );

        let many = parse_line(
            "test",
            r#"[{"op":"visibility","hidden":true},{"op":"navigate"}]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1], PageCommand::Navigate { url: None });
    }

    #[test]
    fn test_parse_skips_blank_and_malformed_lines() {
        assert!(parse_line("test", "   ").is_none());
        assert!(parse_line("test", "{not json").is_none());
        assert!(parse_line("test", r#"{"op":"teleport"}"#).is_none());
        assert!(parse_line("test", r#"[{"op":"navigate"}, 3]"#).is_none());
    }

    #[test]
    fn test_build_sources_in_config_order() {
        let cfg = load_from_str(
            r#"{
                "sources": [
                    {"type": "stdin"},
                    {"type": "file", "path": "/tmp/commands.ndjson"}
                ]
            }"#,
        )
        .unwrap();
        let names: Vec<_> = build_sources_from_config(&cfg)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, vec!["stdin", "file"]);
    }
}
