//! Defines the JSON protocol spoken between the cyanea host and external
//! plugin binaries (`cyanea-plugin-<name>`) over stdin/stdout.
//!
//! Each invocation handles one request line and answers with one response
//! line. Plugins hold no state between invocations, so every request that
//! needs a capability carries that capability's config.

use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::error::{CyaneaResult, Violations};
use crate::event::Event;
use crate::filestore::{StagedFile, StagingFilestore};
use crate::plugin::{Capability, ComponentKind, Filestore, PluginDecl, Sink, Source};

pub trait PluginCommand: Serialize {
    type Response: DeserializeOwned;
    fn command() -> Command;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Describe,
    Load,
    ReadEvents,
    SyncEvents,
    Commit,
}

/// Request sent from the host to a plugin.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn new<C: PluginCommand>(params: &C) -> CyaneaResult<Self> {
        Ok(Request {
            command: C::command(),
            params: serde_json::to_value(params)
                .map_err(|e| crate::CyaneaError::Serialization(e.to_string()))?,
        })
    }
}

/// Response sent from a plugin to the host.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response<T> {
    Success { data: T },
    Error { error: String },
}

impl<T: Serialize> Response<T> {
    pub fn success(data: T) -> String {
        serde_json::to_string(&Response::Success { data })
            .unwrap_or_else(|e| Response::error(&format!("Failed to serialize response: {e}")))
    }
}

impl Response<()> {
    pub fn error(msg: &str) -> String {
        serde_json::json!({ "status": "error", "error": msg }).to_string()
    }
}

// ============================================================================
// Describe
// ============================================================================

/// Ask a plugin which components it provides.
#[derive(Debug, Serialize, Deserialize)]
pub struct Describe {}

/// The serializable half of a [`PluginDecl`]: which slots exist and the
/// schema each one validates its config against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SlotDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filestore: Option<SlotDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<SlotDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotDecl {
    pub config_schema: serde_json::Value,
}

impl Declaration {
    pub fn of(decl: &PluginDecl) -> Self {
        let slot = |kind| {
            decl.schema_for(kind).map(|schema| SlotDecl {
                config_schema: schema.as_value().clone(),
            })
        };
        Declaration {
            source: slot(ComponentKind::Source),
            filestore: slot(ComponentKind::Filestore),
            sink: slot(ComponentKind::Sink),
        }
    }
}

impl PluginCommand for Describe {
    type Response = Declaration;
    fn command() -> Command {
        Command::Describe
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Construct a component and report whether that worked.
#[derive(Debug, Serialize, Deserialize)]
pub struct Load {
    pub kind: ComponentKind,
    pub config: serde_json::Value,
}

impl PluginCommand for Load {
    type Response = ();
    fn command() -> Command {
        Command::Load
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadEvents {
    pub config: serde_json::Value,
}

impl PluginCommand for ReadEvents {
    type Response = Vec<Event>;
    fn command() -> Command {
        Command::ReadEvents
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncEvents {
    pub config: serde_json::Value,
    pub events: Vec<Event>,
    /// Run instant in milliseconds since the UNIX epoch
    pub now: i64,
}

/// Files a sink staged while syncing, for the host to stage in turn.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub files: Vec<StagedFile>,
}

impl PluginCommand for SyncEvents {
    type Response = SyncOutcome;
    fn command() -> Command {
        Command::SyncEvents
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Commit {
    pub config: serde_json::Value,
    pub files: Vec<StagedFile>,
}

impl PluginCommand for Commit {
    type Response = ();
    fn command() -> Command {
        Command::Commit
    }
}

// ============================================================================
// Plugin side
// ============================================================================

/// Serves `decl` over stdin/stdout until stdin closes.
///
/// This is the whole `main` of an external plugin:
///
/// ```no_run
/// # async fn run(decl: cyanea_core::plugin::PluginDecl) -> cyanea_core::CyaneaResult<()> {
/// cyanea_core::protocol::serve(decl).await
/// # }
/// ```
pub async fn serve(decl: PluginDecl) -> CyaneaResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(&decl, request).await,
            Err(e) => Response::error(&format!("Failed to parse request: {e}")),
        };

        stdout.write_all(format!("{response}\n").as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

/// Answers a single request against `decl`, returning the response line.
pub async fn handle_request(decl: &PluginDecl, request: Request) -> String {
    debug!(command = ?request.command, "handling plugin request");

    match request.command {
        Command::Describe => Response::success(Declaration::of(decl)),
        Command::Load => handle_load(decl, request.params).await,
        Command::ReadEvents => handle_read_events(decl, request.params).await,
        Command::SyncEvents => handle_sync_events(decl, request.params).await,
        Command::Commit => handle_commit(decl, request.params).await,
    }
}

fn parse_params<P: DeserializeOwned>(params: serde_json::Value) -> Result<P, String> {
    serde_json::from_value(params).map_err(|e| Response::error(&format!("Invalid params: {e}")))
}

/// Validates `config` against the slot's schema and builds the component.
async fn instantiate<C: Capability + ?Sized>(
    decl: &PluginDecl,
    config: serde_json::Value,
) -> anyhow::Result<Box<C>> {
    let component = C::slot(decl)
        .ok_or_else(|| anyhow::anyhow!("plugin does not provide a {} component", C::KIND))?;

    let schema = component
        .config_schema
        .compile()
        .map_err(|e| anyhow::anyhow!("{} config schema does not compile: {e}", C::KIND))?;
    if let Err(violations) = schema.validate(&config) {
        anyhow::bail!("invalid {} config:{}", C::KIND, Violations(&violations));
    }

    component.load(config).await
}

async fn handle_load(decl: &PluginDecl, params: serde_json::Value) -> String {
    let params: Load = match parse_params(params) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let loaded = match params.kind {
        ComponentKind::Source => instantiate::<dyn Source>(decl, params.config).await.map(drop),
        ComponentKind::Filestore => instantiate::<dyn Filestore>(decl, params.config)
            .await
            .map(drop),
        ComponentKind::Sink => instantiate::<dyn Sink>(decl, params.config).await.map(drop),
    };

    match loaded {
        Ok(()) => Response::success(()),
        Err(e) => Response::error(&format!("{:#}", e)),
    }
}

async fn handle_read_events(decl: &PluginDecl, params: serde_json::Value) -> String {
    let params: ReadEvents = match parse_params(params) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let result = async {
        let source = instantiate::<dyn Source>(decl, params.config).await?;
        source.read_events().await
    }
    .await;

    match result {
        Ok(events) => Response::success(events),
        Err(e) => Response::error(&format!("{:#}", e)),
    }
}

async fn handle_sync_events(decl: &PluginDecl, params: serde_json::Value) -> String {
    let params: SyncEvents = match parse_params(params) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let Some(now) = Utc.timestamp_millis_opt(params.now).single() else {
        return Response::error(&format!("Invalid params: 'now' out of range: {}", params.now));
    };

    let staging = StagingFilestore::default();
    let result = async {
        let sink = instantiate::<dyn Sink>(decl, params.config).await?;
        sink.sync_events(&params.events, &staging, now).await
    }
    .await;

    match result {
        Ok(()) => Response::success(SyncOutcome {
            files: staging.staged.take(),
        }),
        Err(e) => Response::error(&format!("{:#}", e)),
    }
}

async fn handle_commit(decl: &PluginDecl, params: serde_json::Value) -> String {
    let params: Commit = match parse_params(params) {
        Ok(p) => p,
        Err(response) => return response,
    };

    let result = async {
        let filestore = instantiate::<dyn Filestore>(decl, params.config).await?;
        for file in params.files {
            filestore.write_file(&file.path, file.content).await?;
        }
        filestore.commit().await
    }
    .await;

    match result {
        Ok(()) => Response::success(()),
        Err(e) => Response::error(&format!("{:#}", e)),
    }
}
