//! Progress display for client pulls
//!
//! File operations scroll above a fixed status line, cargo-style.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

pub struct PullProgress {
    bar: ProgressBar,
    start_time: Instant,
    show_files: bool,
}

impl PullProgress {
    pub fn new(total: u64, verbose: bool) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            start_time: Instant::now(),
            show_files: verbose,
        }
    }

    /// Hidden bar for non-interactive use
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            start_time: Instant::now(),
            show_files: false,
        }
    }

    /// Print a file operation above the status line
    pub fn file_op(&self, operation: &str, path: &str) {
        if self.show_files {
            self.bar.suspend(|| println!("  {:>10} {}", operation, path));
        }
    }

    pub fn advance(&self, path: &str) {
        self.bar.set_message(path.to_string());
        self.bar.inc(1);
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self, summary: &str) {
        self.bar.finish_and_clear();
        println!(
            "{} in {:.1}s",
            summary,
            self.start_time.elapsed().as_secs_f64()
        );
    }
}
