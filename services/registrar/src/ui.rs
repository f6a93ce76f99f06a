//! User-facing progress sink.
//!
//! Pipeline steps report progress as short human-readable lines. The sink is
//! separate from structured logging so the lines can be shown to whoever runs
//! the build, while `tracing` carries the machine-readable detail.

use std::sync::{Mutex, PoisonError};

use tracing::{error, info};

/// Progress sink for a pipeline run.
pub trait Ui: Send + Sync {
    /// Report progress.
    fn say(&self, message: &str);

    /// Report a failure or warning.
    fn error(&self, message: &str);
}

/// Forwards progress lines to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUi;

impl Ui for TracingUi {
    fn say(&self, message: &str) {
        info!(target: "amiforge::ui", "{message}");
    }

    fn error(&self, message: &str) {
        error!(target: "amiforge::ui", "{message}");
    }
}

/// A line captured by [`RecordingUi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiLine {
    Say(String),
    Error(String),
}

/// Captures progress lines in memory.
#[derive(Debug, Default)]
pub struct RecordingUi {
    lines: Mutex<Vec<UiLine>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line so far, in order.
    pub fn lines(&self) -> Vec<UiLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only the error lines.
    pub fn errors(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter_map(|line| match line {
                UiLine::Error(message) => Some(message),
                UiLine::Say(_) => None,
            })
            .collect()
    }

    /// Only the progress lines.
    pub fn said(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter_map(|line| match line {
                UiLine::Say(message) => Some(message),
                UiLine::Error(_) => None,
            })
            .collect()
    }

    fn push(&self, line: UiLine) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.push(UiLine::Say(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.push(UiLine::Error(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_ui_keeps_order() {
        let ui = RecordingUi::new();
        ui.say("one");
        ui.error("two");
        ui.say("three");

        assert_eq!(
            ui.lines(),
            vec![
                UiLine::Say("one".to_string()),
                UiLine::Error("two".to_string()),
                UiLine::Say("three".to_string()),
            ]
        );
        assert_eq!(ui.errors(), vec!["two".to_string()]);
        assert_eq!(ui.said(), vec!["one".to_string(), "three".to_string()]);
    }
}
