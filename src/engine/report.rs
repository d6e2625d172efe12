//! Per-automation dedup of success/error reporting.

use std::collections::HashSet;
use std::sync::Mutex;

use super::lock;
use crate::config::ReportMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Success,
    Error,
}

/// Decides whether an outcome for an automation is reported.
///
/// Every call records the automation as seen for that outcome kind. Under
/// `ReportMode::Once` only the first call per (kind, automation) answers
/// `true`; under `ReportMode::All` every call does. Successes and errors are
/// tracked separately. The sets only grow for the lifetime of the gate.
#[derive(Debug)]
pub struct ReportGate {
    mode: ReportMode,
    successes: Mutex<HashSet<String>>,
    errors: Mutex<HashSet<String>>,
}

impl ReportGate {
    pub fn new(mode: ReportMode) -> Self {
        Self {
            mode,
            successes: Mutex::new(HashSet::new()),
            errors: Mutex::new(HashSet::new()),
        }
    }

    pub fn mode(&self) -> ReportMode {
        self.mode
    }

    fn set(&self, kind: ReportKind) -> &Mutex<HashSet<String>> {
        match kind {
            ReportKind::Success => &self.successes,
            ReportKind::Error => &self.errors,
        }
    }

    pub fn should_report(&self, kind: ReportKind, automation_id: &str) -> bool {
        // Test and insert under one lock so concurrent firings agree on "first".
        let first = lock(self.set(kind)).insert(automation_id.to_string());
        match self.mode {
            ReportMode::All => true,
            ReportMode::Once => first,
        }
    }

    /// Whether an outcome of `kind` was ever seen for `automation_id`.
    pub fn has_seen(&self, kind: ReportKind, automation_id: &str) -> bool {
        lock(self.set(kind)).contains(automation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_reports_first_time_only() {
        let gate = ReportGate::new(ReportMode::Once);
        let answers: Vec<bool> = (0..5)
            .map(|_| gate.should_report(ReportKind::Success, "a"))
            .collect();
        assert_eq!(answers, vec![true, false, false, false, false]);
        assert!(gate.should_report(ReportKind::Success, "b"));
    }

    #[test]
    fn test_all_reports_every_time_but_still_records() {
        let gate = ReportGate::new(ReportMode::All);
        assert!(!gate.has_seen(ReportKind::Error, "a"));
        for _ in 0..3 {
            assert!(gate.should_report(ReportKind::Error, "a"));
        }
        assert!(gate.has_seen(ReportKind::Error, "a"));
    }

    #[test]
    fn test_success_and_error_are_independent() {
        let gate = ReportGate::new(ReportMode::Once);
        assert!(gate.should_report(ReportKind::Error, "a"));
        assert!(gate.should_report(ReportKind::Success, "a"));
        assert!(!gate.should_report(ReportKind::Error, "a"));
        assert!(!gate.should_report(ReportKind::Success, "a"));
    }

    #[test]
    fn test_concurrent_first_time_is_exact_once() {
        use std::sync::Arc;
        let gate = Arc::new(ReportGate::new(ReportMode::Once));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.should_report(ReportKind::Success, "shared"))
            })
            .collect();
        let firsts = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|first| *first)
            .count();
        assert_eq!(firsts, 1);
    }
}
