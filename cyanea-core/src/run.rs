//! One sync run: load every plugin, read the source, fan the events out to
//! every sink, then commit the filestore.
//!
//! ```text
//! Init -> PluginsLoaded -> SourceRead -> SinksSettled -> FilestoreCommitted -> Done
//!                  \______________\______________\_______________\______> Failed { step }
//! ```
//!
//! Loading and reading stop the run immediately. Sink failures are isolated
//! from each other and from the commit, which runs exactly once after every
//! sink has settled, even if none succeeded.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::try_join_all;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{CyaneaError, display_chain};
use crate::event::{Event, validate_events};
use crate::plugin::{Filestore, PluginLoader, Sink};

/// A step of a run, used to say where a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    LoadPlugins,
    ReadSource,
    SyncSinks,
    CommitFilestore,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::LoadPlugins => write!(f, "load plugins"),
            Step::ReadSource => write!(f, "read source"),
            Step::SyncSinks => write!(f, "sync sinks"),
            Step::CommitFilestore => write!(f, "commit filestore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    PluginsLoaded,
    SourceRead,
    SinksSettled,
    FilestoreCommitted,
    Done,
    Failed { step: Step },
}

/// A sink that failed (or panicked) during its sync.
#[derive(Debug)]
pub struct SinkFailure {
    /// The sink's config key
    pub sink: String,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub enum StepFailure {
    LoadPlugins(CyaneaError),
    ReadSource(CyaneaError),
    SyncSinks(Vec<SinkFailure>),
    CommitFilestore(CyaneaError),
}

impl StepFailure {
    pub fn step(&self) -> Step {
        match self {
            StepFailure::LoadPlugins(_) => Step::LoadPlugins,
            StepFailure::ReadSource(_) => Step::ReadSource,
            StepFailure::SyncSinks(_) => Step::SyncSinks,
            StepFailure::CommitFilestore(_) => Step::CommitFilestore,
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::LoadPlugins(e) => {
                write!(f, "failed to load plugins: {}", display_chain(e))
            }
            StepFailure::ReadSource(e) => {
                write!(f, "failed to read events from the source: {}", display_chain(e))
            }
            StepFailure::SyncSinks(failures) => {
                write!(f, "failed to push events to sinks:")?;
                for failure in failures {
                    write!(f, "\n  {}: {:#}", failure.sink, failure.error)?;
                }
                Ok(())
            }
            StepFailure::CommitFilestore(e) => {
                write!(f, "failed to commit changes to the filestore: {}", display_chain(e))
            }
        }
    }
}

/// Everything that went wrong in a failed run.
#[derive(Debug)]
pub struct RunError {
    /// The last step the run reached
    pub failed_at: Step,
    pub failures: Vec<StepFailure>,
}

impl RunError {
    /// Names of the sinks that failed, in config order.
    pub fn failed_sinks(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|f| match f {
                StepFailure::SyncSinks(sinks) => Some(sinks),
                _ => None,
            })
            .flatten()
            .map(|f| f.sink.as_str())
            .collect()
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub events: usize,
    /// Sink config keys, in config order
    pub sinks: Vec<String>,
}

struct Loaded {
    source: Box<dyn crate::plugin::Source>,
    filestore: Arc<dyn Filestore>,
    sinks: Vec<(String, Arc<dyn Sink>)>,
}

/// Drives a single run.
pub struct Run {
    now: DateTime<Utc>,
    stage: Stage,
}

impl Run {
    /// `now` is handed to every sink unchanged.
    pub fn new(now: DateTime<Utc>) -> Self {
        Run {
            now,
            stage: Stage::Init,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn fail(&mut self, failures: Vec<StepFailure>) -> RunError {
        let failed_at = failures.last().map_or(Step::LoadPlugins, StepFailure::step);
        self.stage = Stage::Failed { step: failed_at };
        RunError {
            failed_at,
            failures,
        }
    }

    pub async fn execute(
        &mut self,
        config: &Config,
        loader: &PluginLoader,
    ) -> Result<RunSummary, RunError> {
        info!(now = %self.now, sinks = config.sinks.len(), "starting run");

        let loaded = match load_plugins(config, loader).await {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.fail(vec![StepFailure::LoadPlugins(e)])),
        };
        self.stage = Stage::PluginsLoaded;

        let events = match read_source(config, loaded.source.as_ref()).await {
            Ok(events) => events,
            Err(e) => return Err(self.fail(vec![StepFailure::ReadSource(e)])),
        };
        info!(events = events.len(), "read events from source");
        self.stage = Stage::SourceRead;

        let sink_failures = sync_sinks(
            Arc::from(events.clone()),
            loaded.filestore.clone(),
            loaded.sinks,
            self.now,
        )
        .await;
        self.stage = Stage::SinksSettled;

        let mut failures = Vec::new();
        if !sink_failures.is_empty() {
            failures.push(StepFailure::SyncSinks(sink_failures));
        }

        debug!(plugin = %config.filestore.name, "committing filestore");
        match loaded.filestore.commit().await {
            Ok(()) => self.stage = Stage::FilestoreCommitted,
            Err(source) => failures.push(StepFailure::CommitFilestore(
                CyaneaError::FilestoreCommit {
                    plugin: config.filestore.name.clone(),
                    source,
                },
            )),
        }

        if !failures.is_empty() {
            return Err(self.fail(failures));
        }

        self.stage = Stage::Done;
        info!("run complete");
        Ok(RunSummary {
            events: events.len(),
            sinks: config.sinks.iter().map(|s| s.name.clone()).collect(),
        })
    }
}

async fn load_plugins(config: &Config, loader: &PluginLoader) -> Result<Loaded, CyaneaError> {
    let source = loader.load_source(&config.source).await?;
    let filestore: Arc<dyn Filestore> = Arc::from(loader.load_filestore(&config.filestore).await?);

    let sinks = try_join_all(config.sinks.iter().map(|instance| async move {
        let sink = loader.load_sink(instance).await?;
        Ok::<_, CyaneaError>((instance.name.clone(), Arc::<dyn Sink>::from(sink)))
    }))
    .await?;

    Ok(Loaded {
        source,
        filestore,
        sinks,
    })
}

async fn read_source(
    config: &Config,
    source: &dyn crate::plugin::Source,
) -> Result<Vec<Event>, CyaneaError> {
    let events = source
        .read_events()
        .await
        .map_err(|source| CyaneaError::SourceRead {
            plugin: config.source.name.clone(),
            source,
        })?;

    validate_events(&events).map_err(|e| CyaneaError::SourceRead {
        plugin: config.source.name.clone(),
        source: e.into(),
    })?;

    Ok(events)
}

/// Runs every sink concurrently and returns the failures in config order.
async fn sync_sinks(
    events: Arc<[Event]>,
    filestore: Arc<dyn Filestore>,
    sinks: Vec<(String, Arc<dyn Sink>)>,
    now: DateTime<Utc>,
) -> Vec<SinkFailure> {
    let mut set = JoinSet::new();
    let mut tasks = HashMap::new();

    for (index, (name, sink)) in sinks.into_iter().enumerate() {
        let events = events.clone();
        let filestore = filestore.clone();
        let sink_name = name.clone();
        let handle = set.spawn(async move {
            debug!(sink = %sink_name, "syncing sink");
            let result = AssertUnwindSafe(sink.sync_events(&events, filestore.as_ref(), now))
                .catch_unwind()
                .await;
            match result {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!("sink panicked: {}", panic_message(&panic))),
            }
        });
        tasks.insert(handle.id(), (index, name));
    }

    settle(set, tasks).await
}

/// Waits for every sink task. A task that cannot be joined (aborted, or
/// lost to the runtime) is a failure of the sink it was running.
async fn settle(
    mut set: JoinSet<anyhow::Result<()>>,
    mut tasks: HashMap<task::Id, (usize, String)>,
) -> Vec<SinkFailure> {
    let mut failures: Vec<(usize, SinkFailure)> = Vec::new();

    while let Some(joined) = set.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(join_error) => (
                join_error.id(),
                Err(anyhow::anyhow!("sink task did not complete: {join_error}")),
            ),
        };
        let Some((index, sink)) = tasks.remove(&id) else {
            warn!(task = %id, "joined an unknown sink task");
            continue;
        };

        match result {
            Ok(()) => info!(sink = %sink, "sink synced"),
            Err(error) => {
                error!(sink = %sink, error = %format!("{error:#}"), "sink failed");
                failures.push((index, SinkFailure { sink, error }));
            }
        }
    }

    failures.sort_by_key(|(index, _)| *index);
    failures.into_iter().map(|(_, failure)| failure).collect()
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
