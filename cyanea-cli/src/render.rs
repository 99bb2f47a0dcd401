//! Terminal rendering for run outcomes.
//!
//! Colors are only applied when the target stream supports them and
//! `--no-color` was not given.

use cyanea_core::run::StepFailure;
use cyanea_core::{RunError, RunSummary};
use owo_colors::{OwoColorize, Stream};

/// "1 sink", "3 sinks"
pub fn count(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

pub fn summary(summary: &RunSummary) -> String {
    let mut lines = vec![format!(
        "{} Synced {} to {}",
        "✓".if_supports_color(Stream::Stdout, |t| t.green()),
        count(summary.events, "event"),
        count(summary.sinks.len(), "sink")
    )];

    for sink in &summary.sinks {
        lines.push(format!(
            "   {}",
            sink.if_supports_color(Stream::Stdout, |t| t.dimmed())
        ));
    }

    lines.join("\n")
}

pub fn failure(err: &RunError) -> String {
    let mut lines = vec![format!(
        "{} Run failed at step: {}",
        "✗".if_supports_color(Stream::Stderr, |t| t.red()),
        err.failed_at
    )];

    for failure in &err.failures {
        match failure {
            StepFailure::SyncSinks(sinks) => {
                lines.push("   failed to push events to sinks:".to_string());
                for sink in sinks {
                    lines.push(format!(
                        "     {} {:#}",
                        format!("{}:", sink.sink).if_supports_color(Stream::Stderr, |t| t.red()),
                        sink.error
                    ));
                }
            }
            other => lines.push(format!("   {other}")),
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyanea_core::CyaneaError;
    use cyanea_core::run::{SinkFailure, Step};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_count_pluralizes() {
        assert_eq!(count(0, "sink"), "0 sinks");
        assert_eq!(count(1, "sink"), "1 sink");
        assert_eq!(count(2, "event"), "2 events");
    }

    #[test]
    fn test_summary_lists_sinks() {
        owo_colors::set_override(false);
        let rendered = summary(&RunSummary {
            events: 3,
            sinks: vec!["ics".to_string(), "caldir#mirror".to_string()],
        });

        assert_eq!(
            rendered,
            "✓ Synced 3 events to 2 sinks\n   ics\n   caldir#mirror"
        );
    }

    #[test]
    fn test_failure_names_every_failing_sink_and_step() {
        owo_colors::set_override(false);
        let err = RunError {
            failed_at: Step::CommitFilestore,
            failures: vec![
                StepFailure::SyncSinks(vec![SinkFailure {
                    sink: "caldir".to_string(),
                    error: anyhow::anyhow!("disk full").context("Failed to write a.ics"),
                }]),
                StepFailure::CommitFilestore(CyaneaError::Protocol("plugin exited".into())),
            ],
        };

        let rendered = failure(&err);

        assert!(rendered.starts_with("✗ Run failed at step: commit filestore"));
        assert!(rendered.contains("     caldir: Failed to write a.ics: disk full"));
        assert!(rendered.contains("   failed to commit changes to the filestore"));
    }
}
