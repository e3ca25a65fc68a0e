//! Progress and status reporting.
//!
//! The collection loop reports through this seam instead of printing:
//! status lines describe what the worker is doing, progress is a fraction
//! of entities completed. Both calls are fire-and-forget; reporters must
//! never block the worker.

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// Receiver for collection status and progress updates.
pub trait StatusReporter: Send + Sync {
    /// Report a human-readable status line. `is_final` marks the message
    /// that should remain visible after the run ends.
    fn update_status(&self, text: &str, is_final: bool);

    /// Report overall progress as a fraction in `0..=1`.
    fn update_progress(&self, fraction: f64);
}

/// Reporter that forwards everything to the tracing log.
#[derive(Debug, Default)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn update_status(&self, text: &str, _is_final: bool) {
        info!("{}", text);
    }

    fn update_progress(&self, _fraction: f64) {}
}

/// Terminal reporter backed by an indicatif progress bar.
pub struct ProgressBarReporter {
    bar: ProgressBar,
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("█▓░"),
        );
        Self { bar }
    }

    /// Finish the bar, leaving the last message on screen.
    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl Default for ProgressBarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter for ProgressBarReporter {
    fn update_status(&self, text: &str, is_final: bool) {
        self.bar.set_message(text.to_string());
        if is_final {
            self.bar.println(text);
        }
    }

    fn update_progress(&self, fraction: f64) {
        self.bar
            .set_position((fraction.clamp(0.0, 1.0) * 100.0) as u64);
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::StatusReporter;

    /// Reporter collecting everything it receives, for assertions.
    #[derive(Debug, Default)]
    pub struct CollectingReporter {
        pub statuses: Mutex<Vec<(String, bool)>>,
        pub progress: Mutex<Vec<f64>>,
    }

    impl CollectingReporter {
        pub fn status_lines(&self) -> Vec<String> {
            self.statuses
                .lock()
                .unwrap()
                .iter()
                .map(|(text, _)| text.clone())
                .collect()
        }
    }

    impl StatusReporter for CollectingReporter {
        fn update_status(&self, text: &str, is_final: bool) {
            self.statuses
                .lock()
                .unwrap()
                .push((text.to_string(), is_final));
        }

        fn update_progress(&self, fraction: f64) {
            self.progress.lock().unwrap().push(fraction);
        }
    }
}
