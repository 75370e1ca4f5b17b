//! Conversion progress reporting.
//!
//! The dispatcher emits one [`JobFinished`] event per completed job. The
//! default reporter logs a running tally line through `tracing`:
//!
//! ```text
//! 0:12:03: 4/10 done (Successful: 3, Timeout: 0, Error: 1); BED1-1000 completed in 0:02:41
//! ```

use std::time::Duration;
use tracing::{info, warn};

use crate::models::JobOutcome;

/// Running counts of terminal job outcomes within one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub total: usize,
    pub succeeded: usize,
    pub timed_out: usize,
    pub errored: usize,
}

impl Tally {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Succeeded(_) => self.succeeded += 1,
            JobOutcome::TimedOut => self.timed_out += 1,
            JobOutcome::Errored(_) => self.errored += 1,
        }
    }

    /// Jobs that reached a terminal state.
    pub fn done(&self) -> usize {
        self.succeeded + self.timed_out + self.errored
    }
}

/// One job reached a terminal state.
#[derive(Debug, Clone)]
pub struct JobFinished<'a> {
    pub basename: &'a str,
    pub outcome: &'a JobOutcome,
    /// Tally after this job was counted.
    pub tally: Tally,
    /// Time since the dispatch started.
    pub elapsed: Duration,
}

/// Receives a progress event after every completed job.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &JobFinished<'_>);
}

/// Logs the running tally line at info (or warn for failed jobs).
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, event: &JobFinished<'_>) {
        let line = progress_line(event);
        match event.outcome {
            JobOutcome::Succeeded(_) => info!(
                file = event.basename,
                done = event.tally.done(),
                total = event.tally.total,
                "{}",
                line
            ),
            _ => warn!(
                file = event.basename,
                done = event.tally.done(),
                total = event.tally.total,
                "{}",
                line
            ),
        }
    }
}

/// Discards events.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &JobFinished<'_>) {}
}

/// Render the tally line for one event.
pub fn progress_line(event: &JobFinished<'_>) -> String {
    let t = &event.tally;
    let detail = match event.outcome {
        JobOutcome::Succeeded(took) => format!("completed in {}", format_elapsed(*took)),
        JobOutcome::TimedOut => "timed out".to_string(),
        JobOutcome::Errored(msg) => format!("errored: {}", msg),
    };
    format!(
        "{}: {}/{} done (Successful: {}, Timeout: {}, Error: {}); {} {}",
        format_elapsed(event.elapsed),
        t.done(),
        t.total,
        t.succeeded,
        t.timed_out,
        t.errored,
        event.basename,
        detail
    )
}

/// `H:MM:SS`, hours unbounded.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
