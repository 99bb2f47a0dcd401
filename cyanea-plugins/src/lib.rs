//! Plugins bundled with the `cyanea` binary.
//!
//! - `fs`: events from JSON files (source) and a local output directory (filestore)
//! - `ics`: an iCalendar feed of every event, written to the filestore (sink)
//! - `caldir`: a directory of one `.ics` file per event, kept in sync (sink)

pub mod caldir;
pub mod fs;
pub mod ics;

mod ical;

use std::path::PathBuf;

use cyanea_core::PluginLoader;

/// A loader that knows every bundled plugin.
pub fn builtin_loader() -> PluginLoader {
    PluginLoader::new()
        .with_builtin("fs", fs::declaration)
        .with_builtin("ics", ics::declaration)
        .with_builtin("caldir", caldir::declaration)
}

/// Expands a leading `~` in a configured path.
pub(crate) fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}
