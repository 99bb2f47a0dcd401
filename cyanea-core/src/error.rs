//! Error types for the cyanea sync engine.

use std::fmt;

use thiserror::Error;

use crate::plugin::ComponentKind;

/// A single failed check from schema or event validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON pointer to the offending value (`""` for the document root).
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Violation {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{}: {}", path, self.message)
    }
}

/// Renders violations one per line, indented under their heading.
pub struct Violations<'a>(pub &'a [Violation]);

impl fmt::Display for Violations<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for violation in self.0 {
            write!(f, "\n  {}", violation)?;
        }
        Ok(())
    }
}

/// Errors that can occur in cyanea operations.
#[derive(Error, Debug)]
pub enum CyaneaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config does not contain a version")]
    MissingVersion,

    #[error("Config has unsupported version '{0}'")]
    UnsupportedVersion(String),

    #[error("Config failed schema validation:{}", Violations(.violations))]
    Schema { violations: Vec<Violation> },

    #[error("Could not resolve plugin '{plugin}' (tried {})", .tried.join(", "))]
    PluginResolution { plugin: String, tried: Vec<String> },

    #[error("Plugin '{plugin}' isn't a valid {kind} plugin: {reason}")]
    PluginShape {
        plugin: String,
        kind: ComponentKind,
        reason: String,
    },

    #[error("Invalid config for {kind} plugin '{plugin}':{}", Violations(.violations))]
    ConfigValidation {
        plugin: String,
        kind: ComponentKind,
        violations: Vec<Violation>,
    },

    #[error("Failed to load {kind} plugin '{plugin}'")]
    PluginLoad {
        plugin: String,
        kind: ComponentKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read from source '{plugin}'")]
    SourceRead {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Source returned invalid events:{}", Violations(.0))]
    InvalidEvents(Vec<Violation>),

    #[error("Source returned more than one event with id '{0}'")]
    DuplicateEventId(String),

    #[error("Failed to commit filestore '{plugin}'")]
    FilestoreCommit {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Refusing to stage invalid path {0:?}")]
    InvalidPath(String),

    #[error("File '{0}' is already staged in this filestore")]
    FileAlreadyStaged(String),

    #[error("More than one item in the external medium carries id '{0}'")]
    IdentityConflict(String),

    #[error("Cannot embed id '{id}': {reason}")]
    IdentityEmbed { id: String, reason: String },

    #[error("Plugin protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for cyanea operations.
pub type CyaneaResult<T> = Result<T, CyaneaError>;

/// Formats an error followed by every error in its source chain.
pub fn display_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_chain_includes_every_cause() {
        let err = CyaneaError::PluginLoad {
            plugin: "discord".into(),
            kind: ComponentKind::Sink,
            source: anyhow::anyhow!("token rejected").context("handshake failed"),
        };

        assert_eq!(
            display_chain(&err),
            "Failed to load sink plugin 'discord': handshake failed: token rejected"
        );
    }

    #[test]
    fn test_schema_error_lists_every_violation() {
        let err = CyaneaError::Schema {
            violations: vec![
                Violation::new("/filestore", "has more than 1 property"),
                Violation::new("", "Additional properties are not allowed"),
            ],
        };

        assert_eq!(
            err.to_string(),
            "Config failed schema validation:\n  /filestore: has more than 1 property\n  /: Additional properties are not allowed"
        );
    }
}
