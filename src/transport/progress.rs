//! Byte-level transfer progress.

use indicatif::{ProgressBar, ProgressBarIter, ProgressDrawTarget, ProgressStyle};
use std::io::Read;

const BAR_TEMPLATE: &str =
    "{msg}\n[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})";

/// Where transfers report progress. Disabled sinks draw nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSink {
    enabled: bool,
}

impl ProgressSink {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bar(&self, len: u64, message: String) -> ProgressBar {
        if !self.enabled {
            return ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::hidden());
        }
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        let bar = ProgressBar::new(len).with_style(style);
        bar.set_message(message);
        bar
    }

    /// Wrap `reader` so reads advance a bar of `len` bytes.
    pub fn wrap<R: Read>(&self, reader: R, len: u64, message: String) -> ProgressBarIter<R> {
        self.bar(len, message).wrap_read(reader)
    }
}
