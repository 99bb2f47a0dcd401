//! The run config document.
//!
//! ```json
//! { "version": 1,
//!   "source":    { "<plugin>": { ... } },
//!   "filestore": { "<plugin>": { ... } },
//!   "sinks":     { "<plugin>[#label]": { ... }, ... } }
//! ```
//!
//! The document is checked in full before any plugin is resolved: a missing
//! or unsupported `version` first, then the shape as a whole.

use std::path::Path;

use serde_json::{Value, json};
use tracing::debug;

use crate::error::{CyaneaError, CyaneaResult};
use crate::plugin::schema::ConfigSchema;

pub const SUPPORTED_VERSION: u64 = 1;

/// Plugin names, optionally followed by `#label` so one plugin can back
/// several sinks.
const INSTANCE_NAME_PATTERN: &str = "^[a-z0-9~-][a-z0-9._~-]*(#[A-Za-z0-9._~-]+)?$";

/// One configured plugin instance, e.g. `"discord#officers": { ... }`.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginInstance {
    /// The config key, including any `#label`
    pub name: String,
    pub config: Value,
}

impl PluginInstance {
    pub fn new(name: impl Into<String>, config: Value) -> Self {
        PluginInstance {
            name: name.into(),
            config,
        }
    }

    /// The plugin to resolve: the name without its label.
    pub fn plugin(&self) -> &str {
        plugin_name(&self.name)
    }
}

pub fn plugin_name(instance: &str) -> &str {
    instance.split_once('#').map_or(instance, |(plugin, _)| plugin)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub version: u64,
    pub source: PluginInstance,
    pub filestore: PluginInstance,
    /// In document order
    pub sinks: Vec<PluginInstance>,
}

impl Config {
    /// Reads a config file: TOML if the extension says so, JSON otherwise.
    pub fn load(path: &Path) -> CyaneaResult<Config> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CyaneaError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let raw = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str::<Value>(&contents).map_err(|e| {
                CyaneaError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            _ => serde_json::from_str::<Value>(&contents).map_err(|e| {
                CyaneaError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?,
        };

        debug!(path = %path.display(), "loaded config file");
        Config::from_value(raw)
    }

    /// Validates a raw document and splits it into plugin instances.
    pub fn from_value(raw: Value) -> CyaneaResult<Config> {
        let Value::Object(doc) = &raw else {
            return Err(CyaneaError::Config("config must be an object".into()));
        };

        let version = match doc.get("version") {
            None | Some(Value::Null) => return Err(CyaneaError::MissingVersion),
            Some(version) => version,
        };
        if version.as_u64() != Some(SUPPORTED_VERSION) {
            return Err(CyaneaError::UnsupportedVersion(version.to_string()));
        }

        let schema = document_schema()
            .compile()
            .map_err(|e| CyaneaError::Config(format!("config schema does not compile: {e}")))?;
        schema
            .validate(&raw)
            .map_err(|violations| CyaneaError::Schema { violations })?;

        Ok(Config {
            version: SUPPORTED_VERSION,
            source: single_instance(doc, "source")?,
            filestore: single_instance(doc, "filestore")?,
            sinks: instances(doc, "sinks"),
        })
    }
}

fn instances(doc: &serde_json::Map<String, Value>, key: &str) -> Vec<PluginInstance> {
    doc.get(key)
        .and_then(Value::as_object)
        .map(|modules| {
            modules
                .iter()
                .map(|(name, config)| PluginInstance::new(name, config.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn single_instance(
    doc: &serde_json::Map<String, Value>,
    key: &str,
) -> CyaneaResult<PluginInstance> {
    instances(doc, key)
        .into_iter()
        .next()
        .ok_or_else(|| CyaneaError::Config(format!("'{key}' must name exactly one plugin")))
}

/// JSON schema for a version 1 document.
pub fn document_schema() -> ConfigSchema {
    ConfigSchema::new(json!({
        "type": "object",
        "definitions": {
            "modules": {
                "type": "object",
                "patternProperties": {
                    INSTANCE_NAME_PATTERN: { "type": "object" }
                },
                "additionalProperties": false
            },
            "single": {
                "allOf": [{ "$ref": "#/definitions/modules" }],
                "minProperties": 1,
                "maxProperties": 1
            }
        },
        "properties": {
            "version": { "type": "integer", "const": SUPPORTED_VERSION },
            "source": { "$ref": "#/definitions/single" },
            "filestore": { "$ref": "#/definitions/single" },
            "sinks": { "$ref": "#/definitions/modules" }
        },
        "required": ["version", "source", "filestore", "sinks"],
        "additionalProperties": false
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid() -> Value {
        json!({
            "version": 1,
            "source": { "fs": { "path": "events.json" } },
            "filestore": { "fs": { "root": "out" } },
            "sinks": {
                "ics": {},
                "caldir#officers": { "dir": "~/calendar" }
            }
        })
    }

    #[test]
    fn test_valid_config() {
        let config = Config::from_value(valid()).unwrap();

        assert_eq!(config.source, PluginInstance::new("fs", json!({ "path": "events.json" })));
        assert_eq!(config.filestore.plugin(), "fs");
        let sinks: Vec<_> = config.sinks.iter().map(|s| (s.name.as_str(), s.plugin())).collect();
        assert_eq!(sinks, vec![("ics", "ics"), ("caldir#officers", "caldir")]);
    }

    #[test]
    fn test_missing_version() {
        let mut raw = valid();
        raw.as_object_mut().unwrap().remove("version");

        assert!(matches!(
            Config::from_value(raw),
            Err(CyaneaError::MissingVersion)
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut raw = valid();
        raw["version"] = json!(2);

        let err = Config::from_value(raw).unwrap_err();

        assert!(matches!(err, CyaneaError::UnsupportedVersion(v) if v == "2"));
    }

    #[test]
    fn test_two_filestores_are_rejected() {
        let mut raw = valid();
        raw["filestore"] = json!({ "fs": {}, "git": {} });

        let err = Config::from_value(raw).unwrap_err();

        let CyaneaError::Schema { violations } = err else {
            panic!("expected a schema error");
        };
        assert!(violations.iter().any(|v| v.path == "/filestore"));
    }

    #[test]
    fn test_empty_source_is_rejected() {
        let mut raw = valid();
        raw["source"] = json!({});

        assert!(matches!(
            Config::from_value(raw),
            Err(CyaneaError::Schema { .. })
        ));
    }

    #[test]
    fn test_empty_sinks_are_allowed() {
        let mut raw = valid();
        raw["sinks"] = json!({});

        assert!(Config::from_value(raw).unwrap().sinks.is_empty());
    }

    #[test]
    fn test_every_violation_is_listed() {
        let raw = json!({
            "version": 1,
            "source": { "Bad Name": {} },
            "filestore": { "fs": "not an object" },
            "sinks": {},
            "extra": true
        });

        let CyaneaError::Schema { violations } = Config::from_value(raw).unwrap_err() else {
            panic!("expected a schema error");
        };

        let mut paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths, vec!["", "/filestore/fs", "/source"]);
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(
            Config::from_value(json!([1])),
            Err(CyaneaError::Config(_))
        ));
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyanea.toml");
        std::fs::write(
            &path,
            r#"
version = 1

[source.fs]
path = "events"

[filestore.fs]
root = "public"

[sinks.ics]
path = "feed.ics"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.source.config, json!({ "path": "events" }));
        assert_eq!(config.sinks[0].config, json!({ "path": "feed.ics" }));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyanea.json");
        std::fs::write(&path, "{ nope").unwrap();

        assert!(matches!(Config::load(&path), Err(CyaneaError::Config(_))));
    }

    #[test]
    fn test_plugin_name_strips_label() {
        assert_eq!(plugin_name("discord#officers"), "discord");
        assert_eq!(plugin_name("discord"), "discord");
    }
}
