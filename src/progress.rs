//! Progress display for a reconciliation pass

use colored::Colorize;
use converge::{Action, ApplyResult, ProgressCallback};
use indicatif::{ProgressBar, ProgressStyle};

use crate::ui;

/// Progress bar over the instances of a pass
pub struct PassProgress {
    bar: ProgressBar,
    failed: usize,
}

impl PassProgress {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar, failed: 0 }
    }

    /// Hidden bar, for quiet runs
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            failed: 0,
        }
    }

    /// Clear the bar and return how many instances failed
    pub fn finish(self) -> usize {
        self.bar.finish_and_clear();
        self.failed
    }
}

impl ProgressCallback for PassProgress {
    fn on_level_start(&mut self, level: usize, count: usize) {
        log::debug!("Level {level}: {count} instance(s)");
    }

    fn on_instance_complete(&mut self, name: &str, _action: Action, result: &ApplyResult) {
        self.bar.set_message(format!("{} {}", ui::result_symbol(result), name));
        if let ApplyResult::Failed { error } = result {
            self.bar.suspend(|| {
                println!("  {} {}", "✗".red(), error);
            });
            self.failed += 1;
        }
        self.bar.inc(1);
    }

    fn on_level_complete(&mut self) {}
}
