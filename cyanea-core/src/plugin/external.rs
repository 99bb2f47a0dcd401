//! Host side of the external plugin protocol.
//!
//! An external plugin is any executable named `cyanea-plugin-<name>` that
//! speaks [`crate::protocol`] over stdin/stdout. The proxies here make such
//! a binary look like any bundled plugin.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CyaneaError, CyaneaResult};
use crate::event::Event;
use crate::filestore::StagedFiles;
use crate::plugin::{Component, ComponentKind, Filestore, PluginDecl, Sink, Source};
use crate::protocol::{
    Commit, Describe, Load, PluginCommand, ReadEvents, Request, Response, SyncEvents,
};

pub const BINARY_PREFIX: &str = "cyanea-plugin-";

pub fn binary_name(plugin: &str) -> String {
    format!("{BINARY_PREFIX}{plugin}")
}

#[derive(Debug, Clone)]
pub struct ExternalPlugin {
    name: String,
    binary: PathBuf,
}

impl ExternalPlugin {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        ExternalPlugin {
            name: name.into(),
            binary: binary.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run one command in a fresh plugin process and return its result.
    pub async fn call<C: PluginCommand>(&self, params: &C) -> CyaneaResult<C::Response> {
        let request = Request::new(params)?;
        let request_json = serde_json::to_string(&request)
            .map_err(|e| CyaneaError::Serialization(e.to_string()))?;

        debug!(plugin = %self.name, command = ?request.command, "calling external plugin");

        let mut child = Command::new(&self.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                CyaneaError::Protocol(format!(
                    "Failed to spawn {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CyaneaError::Protocol("plugin stdin was not captured".into()))?;
        stdin
            .write_all(format!("{request_json}\n").as_bytes())
            .await?;
        drop(stdin);

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(CyaneaError::Protocol(format!(
                "Plugin '{}' exited with status: {}",
                self.name,
                output.status.code().unwrap_or(-1)
            )));
        }

        let response_str = String::from_utf8_lossy(&output.stdout);
        let Some(line) = response_str.lines().find(|l| !l.trim().is_empty()) else {
            return Err(CyaneaError::Protocol(format!(
                "Plugin '{}' returned no response",
                self.name
            )));
        };

        let response: Response<C::Response> = serde_json::from_str(line).map_err(|e| {
            CyaneaError::Protocol(format!(
                "Failed to parse response from plugin '{}': {}",
                self.name, e
            ))
        })?;

        match response {
            Response::Success { data } => Ok(data),
            Response::Error { error } => Err(CyaneaError::Protocol(error)),
        }
    }

    /// Asks the binary what it provides and wraps each slot in a proxy.
    pub async fn into_decl(self) -> CyaneaResult<PluginDecl> {
        let declaration = self.call(&Describe {}).await?;
        let plugin = Arc::new(self);
        let mut decl = PluginDecl::new();

        if let Some(slot) = declaration.source {
            let plugin = plugin.clone();
            decl = decl.with_source(Component::new(slot.config_schema, move |config| {
                let plugin = plugin.clone();
                async move {
                    plugin.handshake(ComponentKind::Source, &config).await?;
                    Ok::<_, anyhow::Error>(Box::new(ExternalSource { plugin, config }) as Box<dyn Source>)
                }
            }));
        }

        if let Some(slot) = declaration.filestore {
            let plugin = plugin.clone();
            decl = decl.with_filestore(Component::new(slot.config_schema, move |config| {
                let plugin = plugin.clone();
                async move {
                    plugin.handshake(ComponentKind::Filestore, &config).await?;
                    Ok::<_, anyhow::Error>(Box::new(ExternalFilestore {
                        plugin,
                        config,
                        staged: StagedFiles::new(),
                    }) as Box<dyn Filestore>)
                }
            }));
        }

        if let Some(slot) = declaration.sink {
            decl = decl.with_sink(Component::new(slot.config_schema, move |config| {
                let plugin = plugin.clone();
                async move {
                    plugin.handshake(ComponentKind::Sink, &config).await?;
                    Ok::<_, anyhow::Error>(Box::new(ExternalSink { plugin, config }) as Box<dyn Sink>)
                }
            }));
        }

        Ok(decl)
    }

    async fn handshake(&self, kind: ComponentKind, config: &serde_json::Value) -> CyaneaResult<()> {
        self.call(&Load {
            kind,
            config: config.clone(),
        })
        .await
    }
}

struct ExternalSource {
    plugin: Arc<ExternalPlugin>,
    config: serde_json::Value,
}

#[async_trait]
impl Source for ExternalSource {
    async fn read_events(&self) -> anyhow::Result<Vec<Event>> {
        let events = self
            .plugin
            .call(&ReadEvents {
                config: self.config.clone(),
            })
            .await?;
        Ok(events)
    }
}

struct ExternalSink {
    plugin: Arc<ExternalPlugin>,
    config: serde_json::Value,
}

#[async_trait]
impl Sink for ExternalSink {
    async fn sync_events(
        &self,
        events: &[Event],
        filestore: &dyn Filestore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let outcome = self
            .plugin
            .call(&SyncEvents {
                config: self.config.clone(),
                events: events.to_vec(),
                now: now.timestamp_millis(),
            })
            .await?;

        debug!(plugin = %self.plugin.name, files = outcome.files.len(), "staging files from external sink");
        for file in outcome.files {
            filestore.write_file(&file.path, file.content).await?;
        }
        Ok(())
    }
}

/// Stages writes locally and ships all of them in a single commit.
struct ExternalFilestore {
    plugin: Arc<ExternalPlugin>,
    config: serde_json::Value,
    staged: StagedFiles,
}

#[async_trait]
impl Filestore for ExternalFilestore {
    async fn write_file(&self, path: &str, content: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.staged.stage(path, content)?)
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let files = self.staged.take();
        self.plugin
            .call(&Commit {
                config: self.config.clone(),
                files,
            })
            .await?;
        Ok(())
    }
}
