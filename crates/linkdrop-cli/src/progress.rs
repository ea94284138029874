//! Transfer progress display with progress bars.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;

const BAR_TEMPLATE: &str = "{msg:24} {spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One progress bar per file name
pub struct TransferProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl TransferProgress {
    /// Create a bar for each `(name, size)`
    #[must_use]
    pub fn new<'a>(files: impl IntoIterator<Item = (&'a str, u64)>) -> Self {
        let multi = MultiProgress::new();
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");

        let bars = files
            .into_iter()
            .map(|(name, size)| {
                let bar = multi.add(ProgressBar::new(size));
                bar.set_style(style.clone());
                bar.set_message(name.to_string());
                bar.enable_steady_tick(Duration::from_millis(120));
                (name.to_string(), bar)
            })
            .collect();

        Self { multi, bars }
    }

    /// Update progress of one file
    pub fn update(&self, name: &str, transferred_bytes: u64) {
        if let Some(bar) = self.bars.get(name) {
            bar.set_position(transferred_bytes);
        }
    }

    /// Finish one file with a message
    pub fn finish(&self, name: &str, msg: String) {
        if let Some(bar) = self.bars.get(name) {
            bar.finish_with_message(msg);
        }
    }

    /// Abandon one file's bar (for errors)
    pub fn abandon(&self, name: &str, msg: String) {
        if let Some(bar) = self.bars.get(name) {
            bar.abandon_with_message(msg);
        }
    }

    /// Print a line above the bars
    pub fn println(&self, line: impl AsRef<str>) {
        // Falls back to stderr when the bars are hidden
        if self.multi.println(line.as_ref()).is_err() {
            eprintln!("{}", line.as_ref());
        }
    }
}

/// Format bytes in human-readable format
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format a millisecond Unix timestamp as an age relative to `now_ms`
#[must_use]
pub fn format_age(created_ms: u64, now_ms: u64) -> String {
    let secs = now_ms.saturating_sub(created_ms) / 1000;

    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}
