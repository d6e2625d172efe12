//! Stdin command source.
//!
//! Reads newline-delimited page commands from standard input, e.g.:
//!
//! ```text
//! echo '{"op":"event","name":"click","selector":".buy"}' | pagetrigger --config config/default.json
//! ```
//!
//! Each non-empty line holds one command or an array of commands. Malformed
//! lines are logged and skipped. EOF, a closed channel or cancellation ends
//! the task.

use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::mpsc::Sender,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use super::{CommandSource, forward, parse_line};
use crate::page::PageCommand;

/// Source that reads newline-delimited page commands from stdin.
#[derive(Debug, Clone, Default)]
pub struct StdinSource;

impl StdinSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl CommandSource for StdinSource {
    fn name(&self) -> &'static str {
        "stdin"
    }

    fn start(&self, sender: Sender<PageCommand>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(target: "pagetrigger::sources", "StdinSource task started (reading lines)");
            pump_lines(BufReader::new(io::stdin()), &sender, &token).await;
            trace!(target: "pagetrigger::sources", "StdinSource task ended");
        })
    }
}

/// Forward every command read from `reader` until EOF, cancellation or a
/// closed channel.
async fn pump_lines<R>(mut reader: R, sender: &Sender<PageCommand>, token: &CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            () = token.cancelled() => break,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => {
                info!(target: "pagetrigger::sources", "EOF on stdin; StdinSource exiting");
                break;
            }
            Ok(_) => {
                let Some(commands) = parse_line("stdin", &line) else {
                    continue;
                };
                if !forward("stdin", sender, commands).await {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    target: "pagetrigger::sources",
                    error = %e,
                    "Error reading from stdin; terminating task"
                );
                break;
            }
        }
    }
}
