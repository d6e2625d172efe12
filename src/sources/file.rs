//! File command source.
//!
//! Polls a single file path for newline-delimited page commands at a fixed interval.
//!
//! Behavior:
//! - If `delete_on_success = true`: every non-empty read dispatches its commands
//!   and the file is deleted (so the next batch requires recreating the file).
//! - If `delete_on_success = false`: the file is dispatched only when its
//!   (length, mtime_seconds) signature changes to avoid replaying commands.
//! - Empty / whitespace-only files are ignored.
//! - Malformed lines are logged (warn) and skipped; the rest of the file is dispatched.
//! - A missing file is silent until it appears.
//!
//! The task ends when the cancellation token fires or the receiver side of the
//! channel is closed.

use std::fs;
use std::time::{Duration, SystemTime};

use tokio::{
    fs as afs,
    sync::mpsc::Sender,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use super::{CommandSource, forward, parse_line};
use crate::page::PageCommand;

/// Source that polls a single file for page commands.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: String,
    poll_ms: u64,
    delete_on_success: bool,
}

impl FileSource {
    /// Create a new `FileSource`.
    ///
    /// Arguments:
    /// - `path`: target file path (absolute or relative).
    /// - `poll_ms`: optional polling interval (defaults to 100ms; minimum 10ms).
    /// - `delete_on_success`: whether to delete the file after a successful dispatch.
    pub fn new(path: String, poll_ms: Option<u64>, delete_on_success: Option<bool>) -> Self {
        Self {
            path,
            poll_ms: poll_ms.unwrap_or(100).max(10),
            delete_on_success: delete_on_success.unwrap_or(false),
        }
    }

    /// Coarse change signature (length, mtime seconds).
    fn file_signature(meta: &fs::Metadata) -> (u64, u64) {
        let len = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        (len, mtime)
    }
}

impl CommandSource for FileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn start(&self, sender: Sender<PageCommand>, token: CancellationToken) -> JoinHandle<()> {
        let path = self.path.clone();
        let poll_ms = self.poll_ms;
        let delete_on_success = self.delete_on_success;

        tokio::spawn(async move {
            info!(
                target: "pagetrigger::sources",
                %path, poll_ms, delete_on_success,
                "FileSource task started"
            );

            let mut last_sig: Option<(u64, u64)> = None;
            let interval = Duration::from_millis(poll_ms);
            let mut next_tick = Instant::now();

            loop {
                // Manual schedule instead of an interval for drift control
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = sleep_until(next_tick) => {}
                }
                next_tick += interval;

                let meta = match fs::metadata(&path) {
                    Ok(m) if m.is_file() => m,
                    Ok(_) => {
                        warn!(
                            target: "pagetrigger::sources",
                            %path,
                            "Path exists but is not a regular file"
                        );
                        continue;
                    }
                    Err(_) => continue,
                };

                let sig = Self::file_signature(&meta);
                if !delete_on_success && last_sig == Some(sig) {
                    trace!(target: "pagetrigger::sources", %path, "File unchanged; skipping");
                    continue;
                }

                let content = match afs::read_to_string(&path).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(
                            target: "pagetrigger::sources",
                            %path, error = %e,
                            "Failed to read file"
                        );
                        continue;
                    }
                };
                if content.trim().is_empty() {
                    trace!(target: "pagetrigger::sources", %path, "File is empty; ignoring");
                    continue;
                }

                let commands: Vec<PageCommand> = content
                    .lines()
                    .filter_map(|line| parse_line("file", line))
                    .flatten()
                    .collect();
                let count = commands.len();
                if !forward("file", &sender, commands).await {
                    break;
                }
                info!(
                    target: "pagetrigger::sources",
                    %path, count, delete_on_success,
                    "Dispatched page commands from file"
                );

                if delete_on_success {
                    if let Err(e) = afs::remove_file(&path).await {
                        warn!(
                            target: "pagetrigger::sources",
                            %path, error = %e,
                            "Failed to delete file after dispatch"
                        );
                    }
                } else {
                    last_sig = Some(sig);
                }
            }

            info!(target: "pagetrigger::sources", %path, "FileSource task ended");
        })
    }
}
