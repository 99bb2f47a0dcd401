//! JSON-schema validation for run and plugin configs.

use jsonschema::{Draft, JSONSchema};
use serde_json::json;

use crate::error::Violation;

/// An uncompiled JSON schema (draft 7) describing a config document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSchema(serde_json::Value);

impl ConfigSchema {
    pub fn new(schema: serde_json::Value) -> Self {
        ConfigSchema(schema)
    }

    /// Accepts any object; for plugins that take no options.
    pub fn any_object() -> Self {
        ConfigSchema(json!({ "type": "object" }))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn compile(&self) -> Result<CompiledSchema, String> {
        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&self.0)
            .map(CompiledSchema)
            .map_err(|e| e.to_string())
    }
}

pub struct CompiledSchema(JSONSchema);

impl CompiledSchema {
    /// Checks `instance`, collecting every violation rather than the first.
    pub fn validate(&self, instance: &serde_json::Value) -> Result<(), Vec<Violation>> {
        self.0.validate(instance).map_err(|errors| {
            errors
                .map(|e| Violation::new(e.instance_path.to_string(), e.to_string()))
                .collect()
        })
    }
}
