//! Progress reporter implementation
//!
//! Uses indicatif for progress bars with:
//! - Tile count progress
//! - Tile rate and ETA display
//! - A status line for job state changes

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Progress reporter for tile computations
pub struct ProgressReporter {
    /// Multi-progress container
    multi: MultiProgress,
    /// Tile progress bar
    tiles_bar: ProgressBar,
    /// Current status message
    status: ProgressBar,
    /// Start time
    start_time: Instant,
    /// Total tiles to compute
    total_tiles: AtomicU64,
    /// Tiles merged so far
    tiles_done: AtomicU64,
    /// Is progress enabled
    enabled: AtomicBool,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            status.set_style(style);
        }

        let tiles_bar = multi.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} tiles ({per_sec}, ETA {eta})")
        {
            tiles_bar.set_style(style.progress_chars("=> "));
        }
        tiles_bar.set_prefix("Tiles");

        Self {
            multi,
            tiles_bar,
            status,
            start_time: Instant::now(),
            total_tiles: AtomicU64::new(0),
            tiles_done: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a disabled progress reporter (for silent mode)
    pub fn disabled() -> Self {
        let reporter = Self::new();
        reporter.enabled.store(false, Ordering::SeqCst);
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Set total tiles; resets the completed count
    pub fn set_total_tiles(&self, total: u64) {
        self.total_tiles.store(total, Ordering::Relaxed);
        self.tiles_done.store(0, Ordering::Relaxed);
        self.tiles_bar.set_length(total);
        self.tiles_bar.set_position(0);
    }

    /// Record one merged tile
    pub fn tile_done(&self) {
        self.tiles_done.fetch_add(1, Ordering::Relaxed);
        self.tiles_bar.inc(1);
    }

    /// Set current status message
    pub fn set_status(&self, msg: &str) {
        self.status.set_message(msg.to_string());
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Tiles merged per second
    pub fn tile_rate(&self) -> f64 {
        let done = self.tiles_done.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Finish progress with success message
    pub fn finish_success(&self, message: &str) {
        self.status.finish_with_message(format!("✓ {}", message));
        self.tiles_bar.finish();
    }

    /// Finish progress with error message
    pub fn finish_error(&self, message: &str) {
        self.status.finish_with_message(format!("✗ {}", message));
        self.tiles_bar.abandon();
    }

    /// Check if progress is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Get progress summary
    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            total_tiles: self.total_tiles.load(Ordering::Relaxed),
            tiles_done: self.tiles_done.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            tile_rate: self.tile_rate(),
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    /// Total tiles in the plan
    pub total_tiles: u64,
    /// Tiles merged so far
    pub tiles_done: u64,
    /// Elapsed time
    pub elapsed: Duration,
    /// Tiles per second
    pub tile_rate: f64,
}

impl ProgressSummary {
    /// Get completion percentage
    pub fn percentage(&self) -> f64 {
        if self.total_tiles == 0 {
            0.0
        } else {
            (self.tiles_done as f64 / self.total_tiles as f64) * 100.0
        }
    }

    /// Print summary to stderr, keeping stdout for profile output
    pub fn print(&self) {
        eprintln!("{}", self);
    }
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Progress: {:.1}%", self.percentage())?;
        writeln!(f, "Tiles:    {}/{}", self.tiles_done, self.total_tiles)?;
        writeln!(
            f,
            "Elapsed:  {}",
            humantime::format_duration(Duration::from_millis(self.elapsed.as_millis() as u64))
        )?;
        write!(f, "Rate:     {:.1} tiles/s", self.tile_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_reporter() {
        let reporter = ProgressReporter::disabled();
        assert!(!reporter.is_enabled());

        reporter.set_total_tiles(10);
        for _ in 0..5 {
            reporter.tile_done();
        }

        let summary = reporter.summary();
        assert_eq!(summary.tiles_done, 5);
        assert_eq!(summary.total_tiles, 10);
        assert_eq!(summary.percentage(), 50.0);

        let text = summary.to_string();
        assert!(text.starts_with("Progress: 50.0%"));
        assert!(text.contains("Tiles:    5/10"));
    }

    #[test]
    fn test_total_resets_count() {
        let reporter = ProgressReporter::disabled();
        reporter.set_total_tiles(2);
        reporter.tile_done();
        reporter.set_total_tiles(4);
        assert_eq!(reporter.summary().tiles_done, 0);
    }
}
