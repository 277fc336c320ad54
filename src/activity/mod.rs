//! Narrative events for the activity log panel.

use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

const MAX_ENTRIES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityOutcome {
    Info,
    Success,
    Error,
}

impl fmt::Display for ActivityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActivityOutcome::Info => "INFO",
            ActivityOutcome::Success => "SUCCESS",
            ActivityOutcome::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub outcome: ActivityOutcome,
    pub detail: String,
}

impl ActivityEvent {
    pub fn new(action: impl Into<String>, outcome: ActivityOutcome, detail: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), action: action.into(), outcome, detail: detail.into() }
    }

    pub fn info(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(action, ActivityOutcome::Info, detail)
    }

    pub fn success(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(action, ActivityOutcome::Success, detail)
    }

    pub fn error(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(action, ActivityOutcome::Error, detail)
    }

    /// "Action: detail", or just the action when there is no detail.
    pub fn message(&self) -> String {
        if self.detail.is_empty() {
            self.action.clone()
        } else {
            format!("{}: {}", self.action, self.detail)
        }
    }
}

/// Receiver of controller narrative events. Injected into both controllers.
pub trait ActivitySink: Send + Sync {
    fn emit(&self, event: ActivityEvent);
}

/// Bounded in-memory log, newest entry first, mirrored to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct ActivityLog {
    entries: Arc<Mutex<Vec<ActivityEvent>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActivityEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Action names, oldest first.
    pub fn actions(&self) -> Vec<String> {
        self.lock().iter().rev().map(|event| event.action.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ActivityEvent>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ActivitySink for ActivityLog {
    fn emit(&self, event: ActivityEvent) {
        match event.outcome {
            ActivityOutcome::Error => tracing::warn!(target: "activity", "{}", event.message()),
            _ => tracing::info!(target: "activity", outcome = %event.outcome, "{}", event.message()),
        }

        let mut entries = self.lock();
        entries.insert(0, event);
        entries.truncate(MAX_ENTRIES);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_entry_comes_first() {
        let log = ActivityLog::new();
        log.emit(ActivityEvent::info("Auto-training started", "max 3 rounds"));
        log.emit(ActivityEvent::success("Round 1 complete", ""));

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message(), "Round 1 complete");
        assert_eq!(entries[1].message(), "Auto-training started: max 3 rounds");
        assert_eq!(log.actions(), vec!["Auto-training started", "Round 1 complete"]);
    }

    #[test]
    fn log_is_bounded() {
        let log = ActivityLog::new();
        for i in 0..(MAX_ENTRIES + 10) {
            log.emit(ActivityEvent::info(format!("event {i}"), ""));
        }
        assert_eq!(log.len(), MAX_ENTRIES);
        assert_eq!(log.entries()[0].action, format!("event {}", MAX_ENTRIES + 9));

        log.clear();
        assert!(log.is_empty());
    }
}
