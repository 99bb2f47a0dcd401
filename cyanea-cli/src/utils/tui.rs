use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"];

fn sync_style() -> ProgressStyle {
    let style = ProgressStyle::default_spinner().tick_strings(TICKS);
    style
        .clone()
        .template("{spinner:.cyan} {msg} {elapsed:.dim}")
        .unwrap_or(style)
}

/// Spinner shown on stderr while sinks are syncing; hidden when stderr
/// is not a terminal.
pub fn create_spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(sync_style());
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
