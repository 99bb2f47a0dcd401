//! Core of the cyanea event-sync engine.
//!
//! This crate is shared by the `cyanea` binary, the bundled plugins and any
//! external plugin written in Rust:
//! - `Event` and validation for the canonical event record
//! - `plugin` for the source/filestore/sink contract and the loader
//! - `diff` and `identity` for sinks that reconcile against external state
//! - `run` for the orchestrator that ties one run together
//! - `protocol` for the host/plugin subprocess protocol

pub mod config;
pub mod diff;
pub mod error;
pub mod event;
pub mod filestore;
pub mod identity;
pub mod plugin;
pub mod protocol;
pub mod run;

pub use config::{Config, PluginInstance};
pub use error::{CyaneaError, CyaneaResult};
pub use event::*;
pub use plugin::{Component, ComponentKind, Filestore, PluginDecl, PluginLoader, Sink, Source};
pub use run::{Run, RunError, RunSummary};
