//! The plugin contract.
//!
//! A plugin declares up to three capability slots (source, filestore, sink).
//! Each slot pairs a JSON schema for its config with an async factory that
//! builds the capability from a validated config.

pub mod external;
pub mod loader;
pub mod schema;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::plugin::schema::ConfigSchema;

pub use loader::PluginLoader;

/// The single source of truth for a run.
#[async_trait]
pub trait Source: Send + Sync {
    async fn read_events(&self) -> anyhow::Result<Vec<Event>>;
}

/// Staged file storage shared by every sink in a run.
///
/// Filestores begin empty every run; sinks that output static files must
/// regenerate all of them instead of assuming earlier output still exists.
#[async_trait]
pub trait Filestore: Send + Sync {
    /// Stages `content` under `path`, relative to the store root.
    async fn write_file(&self, path: &str, content: Vec<u8>) -> anyhow::Result<()>;

    /// Makes every staged file durable.
    async fn commit(&self) -> anyhow::Result<()>;
}

/// A target that reconciles the canonical events against one external system.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn sync_events(
        &self,
        events: &[Event],
        filestore: &dyn Filestore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Source,
    Filestore,
    Sink,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Source => write!(f, "source"),
            ComponentKind::Filestore => write!(f, "filestore"),
            ComponentKind::Sink => write!(f, "sink"),
        }
    }
}

type LoadFn<T> =
    Box<dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<Box<T>>> + Send + Sync>;

/// One declared capability slot.
pub struct Component<T: ?Sized> {
    pub config_schema: ConfigSchema,
    load: LoadFn<T>,
}

impl<T: ?Sized> Component<T> {
    /// A slot whose factory receives the raw (already validated) config.
    pub fn new<F, Fut>(config_schema: serde_json::Value, load: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Box<T>>> + Send + 'static,
    {
        Component {
            config_schema: ConfigSchema::new(config_schema),
            load: Box::new(move |config| load(config).boxed()),
        }
    }

    /// A slot whose factory receives its config deserialized into `C`.
    pub fn typed<C, F, Fut>(config_schema: serde_json::Value, load: F) -> Self
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Box<T>>> + Send + 'static,
    {
        Component::new(config_schema, move |raw| {
            let loaded = serde_json::from_value::<C>(raw).map(&load);
            async move {
                match loaded {
                    Ok(fut) => fut.await,
                    Err(e) => {
                        Err(anyhow::Error::new(e).context("config does not match its schema"))
                    }
                }
            }
        })
    }

    /// Runs the factory. Callers validate `config` against the schema first.
    pub async fn load(&self, config: serde_json::Value) -> anyhow::Result<Box<T>> {
        (self.load)(config).await
    }
}

/// What a plugin provides: up to one component per kind.
#[derive(Default)]
pub struct PluginDecl {
    pub source: Option<Component<dyn Source>>,
    pub filestore: Option<Component<dyn Filestore>>,
    pub sink: Option<Component<dyn Sink>>,
}

impl PluginDecl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, component: Component<dyn Source>) -> Self {
        self.source = Some(component);
        self
    }

    pub fn with_filestore(mut self, component: Component<dyn Filestore>) -> Self {
        self.filestore = Some(component);
        self
    }

    pub fn with_sink(mut self, component: Component<dyn Sink>) -> Self {
        self.sink = Some(component);
        self
    }

    pub fn schema_for(&self, kind: ComponentKind) -> Option<&ConfigSchema> {
        match kind {
            ComponentKind::Source => self.source.as_ref().map(|c| &c.config_schema),
            ComponentKind::Filestore => self.filestore.as_ref().map(|c| &c.config_schema),
            ComponentKind::Sink => self.sink.as_ref().map(|c| &c.config_schema),
        }
    }
}

/// Ties a capability trait object to its slot in a [`PluginDecl`].
pub trait Capability: Send + Sync + 'static {
    const KIND: ComponentKind;

    fn slot(decl: &PluginDecl) -> Option<&Component<Self>>;
}

impl Capability for dyn Source {
    const KIND: ComponentKind = ComponentKind::Source;

    fn slot(decl: &PluginDecl) -> Option<&Component<Self>> {
        decl.source.as_ref()
    }
}

impl Capability for dyn Filestore {
    const KIND: ComponentKind = ComponentKind::Filestore;

    fn slot(decl: &PluginDecl) -> Option<&Component<Self>> {
        decl.filestore.as_ref()
    }
}

impl Capability for dyn Sink {
    const KIND: ComponentKind = ComponentKind::Sink;

    fn slot(decl: &PluginDecl) -> Option<&Component<Self>> {
        decl.sink.as_ref()
    }
}
