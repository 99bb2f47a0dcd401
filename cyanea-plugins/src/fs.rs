//! The `fs` plugin: events from local JSON files, output to a local directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use cyanea_core::filestore::{StagedFile, StagedFiles};
use cyanea_core::{Component, Event, Filestore, PluginDecl, Source};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::expand_path;

#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    /// A JSON file holding an array of events, or a directory of them
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct FilestoreConfig {
    pub root: String,
    /// Remove everything already under `root` when committing
    #[serde(default)]
    pub clean: bool,
}

pub fn declaration() -> PluginDecl {
    PluginDecl::new()
        .with_source(Component::typed(
            json!({
                "type": "object",
                "properties": { "path": { "type": "string", "minLength": 1 } },
                "required": ["path"],
                "additionalProperties": false
            }),
            |config: SourceConfig| async move {
                Ok(Box::new(JsonSource::new(expand_path(&config.path))) as Box<dyn Source>)
            },
        ))
        .with_filestore(Component::typed(
            json!({
                "type": "object",
                "properties": {
                    "root": { "type": "string", "minLength": 1 },
                    "clean": { "type": "boolean" }
                },
                "required": ["root"],
                "additionalProperties": false
            }),
            |config: FilestoreConfig| async move {
                Ok(
                    Box::new(DirFilestore::new(expand_path(&config.root), config.clean))
                        as Box<dyn Filestore>,
                )
            },
        ))
}

/// Reads events from a JSON file or a directory tree of `*.json` files.
///
/// Each file holds either one event or an array of events. Directory
/// entries are read in sorted path order.
pub struct JsonSource {
    path: PathBuf,
}

impl JsonSource {
    pub fn new(path: PathBuf) -> Self {
        JsonSource { path }
    }
}

#[async_trait]
impl Source for JsonSource {
    async fn read_events(&self) -> anyhow::Result<Vec<Event>> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let files = if metadata.is_dir() {
            let root = self.path.clone();
            let mut files = tokio::task::spawn_blocking(move || {
                let mut files = Vec::new();
                collect_json_files(&root, &mut files).map(|()| files)
            })
            .await??;
            files.sort();
            files
        } else {
            vec![self.path.clone()]
        };

        let mut events = Vec::new();
        for file in &files {
            let content = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let parsed = parse_events(&content)
                .with_context(|| format!("Failed to parse events from {}", file.display()))?;
            debug!(file = %file.display(), events = parsed.len(), "read event file");
            events.extend(parsed);
        }

        Ok(events)
    }
}

fn collect_json_files(dir: &Path, files: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_json_files(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(())
}

fn parse_events(content: &str) -> anyhow::Result<Vec<Event>> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

/// Stages files in memory and writes them under `root` on commit.
///
/// Commit writes everything into a staging directory inside `root` first, so
/// a failed write leaves `root` untouched.
pub struct DirFilestore {
    root: PathBuf,
    clean: bool,
    staged: StagedFiles,
}

impl DirFilestore {
    pub fn new(root: PathBuf, clean: bool) -> Self {
        DirFilestore {
            root,
            clean,
            staged: StagedFiles::new(),
        }
    }
}

#[async_trait]
impl Filestore for DirFilestore {
    async fn write_file(&self, path: &str, content: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.staged.stage(path, content)?)
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let files = self.staged.take();
        let root = self.root.clone();
        let clean = self.clean;
        let count = files.len();

        tokio::task::spawn_blocking(move || commit_files(&root, clean, files)).await??;

        info!(root = %self.root.display(), files = count, "committed filestore");
        Ok(())
    }
}

fn commit_files(root: &Path, clean: bool, files: Vec<StagedFile>) -> anyhow::Result<()> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create {}", root.display()))?;

    let staging = tempfile::Builder::new()
        .prefix(".cyanea-staging-")
        .tempdir_in(root)
        .with_context(|| format!("Failed to create a staging directory in {}", root.display()))?;

    for file in &files {
        let target = staging.path().join(&file.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &file.content)
            .with_context(|| format!("Failed to write {}", file.path))?;
    }

    let previous = tempfile::Builder::new()
        .prefix(".cyanea-previous-")
        .tempdir_in(root)
        .with_context(|| format!("Failed to create a backup directory in {}", root.display()))?;

    let mut swap = Swap::new(root, previous.path());
    if let Err(e) = apply(&mut swap, staging.path(), clean, &files) {
        swap.rollback();
        return Err(e);
    }

    Ok(())
}

fn apply(swap: &mut Swap<'_>, staging: &Path, clean: bool, files: &[StagedFile]) -> anyhow::Result<()> {
    if clean {
        for entry in std::fs::read_dir(swap.root)? {
            let name = entry?.file_name();
            let path = swap.root.join(&name);
            if path == staging || path == swap.previous {
                continue;
            }
            swap.set_aside(Path::new(&name))
                .with_context(|| format!("Failed to move {} aside", path.display()))?;
            debug!(path = %path.display(), "removed previous output");
        }
    }

    for file in files {
        swap.place(&staging.join(&file.path), Path::new(&file.path))
            .with_context(|| format!("Failed to move {} into place", file.path))?;
    }

    Ok(())
}

/// Moves committed files into `root`, keeping whatever they displace in
/// `previous` so a failed commit can put `root` back as it was.
struct Swap<'a> {
    root: &'a Path,
    previous: &'a Path,
    set_aside: Vec<PathBuf>,
    placed: Vec<PathBuf>,
}

impl<'a> Swap<'a> {
    fn new(root: &'a Path, previous: &'a Path) -> Self {
        Swap {
            root,
            previous,
            set_aside: Vec::new(),
            placed: Vec::new(),
        }
    }

    fn set_aside(&mut self, relative: &Path) -> std::io::Result<()> {
        let backup = self.previous.join(relative);
        if let Some(parent) = backup.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(self.root.join(relative), backup)?;
        self.set_aside.push(relative.to_path_buf());
        Ok(())
    }

    fn place(&mut self, from: &Path, relative: &Path) -> std::io::Result<()> {
        let target = self.root.join(relative);
        if std::fs::symlink_metadata(&target).is_ok() {
            self.set_aside(relative)?;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from, &target)?;
        self.placed.push(relative.to_path_buf());
        Ok(())
    }

    fn rollback(self) {
        for relative in self.placed.iter().rev() {
            let target = self.root.join(relative);
            if let Err(e) = std::fs::remove_file(&target) {
                warn!(path = %target.display(), error = %e, "failed to remove partial output");
            }
        }
        for relative in self.set_aside.iter().rev() {
            let target = self.root.join(relative);
            if let Some(parent) = target.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::rename(self.previous.join(relative), &target) {
                warn!(path = %target.display(), error = %e, "failed to restore previous output");
            }
        }
    }
}
