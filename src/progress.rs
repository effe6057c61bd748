//! Running totals of submitted and completed work.

use crate::error::{HmullError, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Snapshot of the running totals, in records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub submitted_total: u64,
    pub completed_total: u64,
}

impl ProgressState {
    /// Whether all submitted work has completed.
    pub fn is_complete(&self) -> bool {
        self.completed_total == self.submitted_total
    }
}

/// Aggregates per-job completion counts.
///
/// Safe to update from several collector threads; `completed_total` can never
/// pass `submitted_total`.
pub struct ProgressReporter {
    submitted: AtomicU64,
    completed: AtomicU64,
    bar: ProgressBar,
}

impl ProgressReporter {
    /// A reporter without a visible display.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    /// A reporter that draws a progress bar on stderr.
    pub fn visible() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("█▓▒░  "));
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(bar)
    }

    /// Visible when `show` is true, hidden otherwise.
    pub fn new(show: bool) -> Self {
        if show { Self::visible() } else { Self::hidden() }
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            bar,
        }
    }

    /// Announce `records` more records of submitted work.
    pub fn submit(&self, records: u64) -> ProgressState {
        let submitted = self
            .submitted
            .fetch_add(records, Ordering::SeqCst)
            .saturating_add(records);
        self.bar.set_length(submitted);
        ProgressState {
            submitted_total: submitted,
            completed_total: self.completed.load(Ordering::SeqCst),
        }
    }

    /// Add `delta` completed records to the running total.
    ///
    /// Fails without changing anything if the total would exceed what has
    /// been submitted.
    pub fn update(&self, delta: u64) -> Result<ProgressState> {
        let submitted = self.submitted.load(Ordering::SeqCst);
        let previous = self
            .completed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |done| {
                done.checked_add(delta).filter(|&next| next <= submitted)
            })
            .map_err(|done| HmullError::ProgressOverflow {
                completed: done.saturating_add(delta),
                submitted,
            })?;

        let completed = previous + delta;
        self.bar.set_position(completed);
        Ok(ProgressState {
            submitted_total: submitted,
            completed_total: completed,
        })
    }

    /// Handle to the drawn bar, for writers that must clear it first.
    pub fn bar(&self) -> ProgressBar {
        self.bar.clone()
    }

    /// Set the message shown next to the bar.
    pub fn set_message(&self, message: impl Into<String>) {
        self.bar.set_message(message.into());
    }

    /// Current totals.
    pub fn snapshot(&self) -> ProgressState {
        ProgressState {
            submitted_total: self.submitted.load(Ordering::SeqCst),
            completed_total: self.completed.load(Ordering::SeqCst),
        }
    }

    /// Stop drawing and return the final totals.
    pub fn finish(&self) -> ProgressState {
        let state = self.snapshot();
        self.bar.finish_and_clear();
        state
    }
}
