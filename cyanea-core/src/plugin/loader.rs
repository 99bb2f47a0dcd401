//! Resolves plugin names and constructs validated capability instances.
//!
//! Bundled plugins (registered in-process) always win. Otherwise the loader
//! looks for a `cyanea-plugin-<name>` executable in its search directories,
//! then on `PATH`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::{PluginInstance, plugin_name};
use crate::error::{CyaneaError, CyaneaResult};
use crate::plugin::external::{ExternalPlugin, binary_name};
use crate::plugin::{Capability, ComponentKind, Filestore, PluginDecl, Sink, Source};

/// Builds a bundled plugin's declaration.
pub type BuiltinFactory = Arc<dyn Fn() -> PluginDecl + Send + Sync>;

#[derive(Default)]
pub struct PluginLoader {
    builtins: HashMap<String, BuiltinFactory>,
    search_dirs: Vec<PathBuf>,
    resolved: Mutex<HashMap<String, Arc<PluginDecl>>>,
}

impl PluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> PluginDecl + Send + Sync + 'static,
    {
        self.builtins.insert(name.into(), Arc::new(factory));
    }

    pub fn with_builtin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> PluginDecl + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    /// Adds a directory to search for external plugin binaries, ahead of `PATH`.
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dirs.push(dir.into());
        self
    }

    pub fn builtin_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.builtins.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// Finds `plugin` and reads its declaration. Declarations are cached for
    /// the loader's lifetime.
    pub async fn resolve(&self, plugin: &str, kind: ComponentKind) -> CyaneaResult<Arc<PluginDecl>> {
        let cached = self
            .resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin)
            .cloned();
        if let Some(decl) = cached {
            return Ok(decl);
        }

        let decl = if let Some(factory) = self.builtins.get(plugin) {
            debug!(plugin, "resolved bundled plugin");
            factory()
        } else {
            let binary = self.find_external(plugin)?;
            debug!(plugin, binary = %binary.display(), "resolved external plugin");
            ExternalPlugin::new(plugin, binary)
                .into_decl()
                .await
                .map_err(|e| CyaneaError::PluginShape {
                    plugin: plugin.to_string(),
                    kind,
                    reason: format!("could not read its declaration: {e}"),
                })?
        };

        let decl = Arc::new(decl);
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plugin.to_string(), decl.clone());
        Ok(decl)
    }

    fn find_external(&self, plugin: &str) -> CyaneaResult<PathBuf> {
        let binary = binary_name(plugin);
        let mut tried = vec![format!("bundled plugin '{plugin}'")];

        let cwd = std::env::current_dir()?;
        for dir in &self.search_dirs {
            if let Ok(path) = which::which_in(&binary, Some(dir), &cwd) {
                return Ok(path);
            }
            tried.push(dir.join(&binary).display().to_string());
        }

        if let Ok(path) = which::which(&binary) {
            return Ok(path);
        }
        tried.push(format!("{binary} in PATH"));

        Err(CyaneaError::PluginResolution {
            plugin: plugin.to_string(),
            tried,
        })
    }

    /// Loads the `C` component of the plugin behind `name` (which may carry a
    /// `#label`) from `config`.
    ///
    /// `config` is checked against the component's schema first; the
    /// component's factory never sees an invalid config.
    pub async fn load_component<C: Capability + ?Sized>(
        &self,
        name: &str,
        config: &serde_json::Value,
    ) -> CyaneaResult<Box<C>> {
        let plugin = plugin_name(name);
        let decl = self.resolve(plugin, C::KIND).await?;

        let component = C::slot(&decl).ok_or_else(|| CyaneaError::PluginShape {
            plugin: plugin.to_string(),
            kind: C::KIND,
            reason: format!("it does not provide a {} component", C::KIND),
        })?;

        let schema = component
            .config_schema
            .compile()
            .map_err(|reason| CyaneaError::PluginShape {
                plugin: plugin.to_string(),
                kind: C::KIND,
                reason: format!("its config schema does not compile: {reason}"),
            })?;

        schema
            .validate(config)
            .map_err(|violations| CyaneaError::ConfigValidation {
                plugin: name.to_string(),
                kind: C::KIND,
                violations,
            })?;

        let loaded = component
            .load(config.clone())
            .await
            .map_err(|source| CyaneaError::PluginLoad {
                plugin: name.to_string(),
                kind: C::KIND,
                source,
            })?;

        info!(plugin = name, kind = %C::KIND, "loaded plugin");
        Ok(loaded)
    }

    pub async fn load_source(&self, instance: &PluginInstance) -> CyaneaResult<Box<dyn Source>> {
        self.load_component::<dyn Source>(&instance.name, &instance.config)
            .await
    }

    pub async fn load_filestore(
        &self,
        instance: &PluginInstance,
    ) -> CyaneaResult<Box<dyn Filestore>> {
        self.load_component::<dyn Filestore>(&instance.name, &instance.config)
            .await
    }

    pub async fn load_sink(&self, instance: &PluginInstance) -> CyaneaResult<Box<dyn Sink>> {
        self.load_component::<dyn Sink>(&instance.name, &instance.config)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::plugin::Component;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EmptySource;

    #[async_trait]
    impl Source for EmptySource {
        async fn read_events(&self) -> anyhow::Result<Vec<Event>> {
            Ok(Vec::new())
        }
    }

    fn counting_loader(loads: Arc<AtomicUsize>) -> PluginLoader {
        PluginLoader::new().with_builtin("json", move || {
            let loads = loads.clone();
            PluginDecl::new().with_source(Component::new(
                json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"],
                    "additionalProperties": false
                }),
                move |config| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if config["path"] == "missing.json" {
                            anyhow::bail!("no such file");
                        }
                        Ok(Box::new(EmptySource) as Box<dyn Source>)
                    }
                },
            ))
        })
    }

    #[tokio::test]
    async fn test_loads_bundled_plugin() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(loads.clone());

        let source = loader
            .load_component::<dyn Source>("json", &json!({ "path": "events.json" }))
            .await
            .unwrap();

        assert!(source.read_events().await.unwrap().is_empty());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_never_reaches_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(loads.clone());

        let err = loader
            .load_component::<dyn Source>("json", &json!({ "path": 3, "extra": true }))
            .await
            .err()
            .unwrap();

        let CyaneaError::ConfigValidation {
            plugin,
            kind,
            violations,
        } = err
        else {
            panic!("expected a config validation error");
        };
        assert_eq!(plugin, "json");
        assert_eq!(kind, ComponentKind::Source);
        assert_eq!(violations.len(), 2);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_slot_is_a_shape_error() {
        let loader = counting_loader(Arc::new(AtomicUsize::new(0)));

        let err = loader
            .load_component::<dyn Sink>("json#feed", &json!({}))
            .await
            .err()
            .unwrap();

        assert!(matches!(
            err,
            CyaneaError::PluginShape { plugin, kind: ComponentKind::Sink, .. } if plugin == "json"
        ));
    }

    #[tokio::test]
    async fn test_load_failure_keeps_cause() {
        let loader = counting_loader(Arc::new(AtomicUsize::new(0)));

        let err = loader
            .load_component::<dyn Source>("json", &json!({ "path": "missing.json" }))
            .await
            .err()
            .unwrap();

        assert_eq!(
            crate::error::display_chain(&err),
            "Failed to load source plugin 'json': no such file"
        );
    }

    #[tokio::test]
    async fn test_unknown_plugin_lists_every_location() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PluginLoader::new().with_search_dir(dir.path());

        let err = loader
            .load_component::<dyn Source>("does-not-exist", &json!({}))
            .await
            .err()
            .unwrap();

        let CyaneaError::PluginResolution { plugin, tried } = err else {
            panic!("expected a resolution error");
        };
        assert_eq!(plugin, "does-not-exist");
        assert_eq!(
            tried,
            vec![
                "bundled plugin 'does-not-exist'".to_string(),
                dir.path()
                    .join("cyanea-plugin-does-not-exist")
                    .display()
                    .to_string(),
                "cyanea-plugin-does-not-exist in PATH".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_schema_is_a_shape_error() {
        let loader = PluginLoader::new().with_builtin("odd", || {
            PluginDecl::new().with_source(Component::new(
                json!({ "type": 12 }),
                |_| async { Ok(Box::new(EmptySource) as Box<dyn Source>) },
            ))
        });

        let err = loader
            .load_component::<dyn Source>("odd", &json!({}))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, CyaneaError::PluginShape { .. }));
    }

    #[test]
    fn test_builtin_names_are_sorted() {
        let loader = PluginLoader::new()
            .with_builtin("ics", PluginDecl::new)
            .with_builtin("fs", PluginDecl::new);

        assert_eq!(loader.builtin_names(), vec!["fs", "ics"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolves_external_plugin_from_search_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyanea-plugin-remote");
        std::fs::write(
            &path,
            "#!/bin/sh\ncat > /dev/null\necho '{\"status\":\"success\",\"data\":{\"source\":{\"config_schema\":{\"type\":\"object\",\"required\":[\"url\"]}}}}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let loader = PluginLoader::new().with_search_dir(dir.path());

        // The schema comes from the binary's own declaration.
        let err = loader
            .load_component::<dyn Source>("remote", &json!({}))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, CyaneaError::ConfigValidation { .. }));
    }
}
