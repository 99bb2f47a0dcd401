//! The `caldir` plugin: mirrors events into a directory of `.ics` files.
//!
//! Each event gets one file named `<date>__<slug>.ics`. The event id (and
//! banner) ride along invisibly at the end of the DESCRIPTION, so the
//! mirror can be reconciled even after other calendar tools rewrite or
//! rename the files. Files without an embedded id are never touched.
//!
//! With `upcoming_only`, events that already ended are removed from the
//! mirror too.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cyanea_core::diff::diff;
use cyanea_core::identity::{Aux, IdentityCodec, Recovered, TagCodec, embed_with_fallback, recover};
use cyanea_core::{Component, Event, Filestore, PluginDecl, Sink};
use icalendar::Calendar;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::expand_path;
use crate::ical::{self, ParsedVevent, VeventMeta};

const BANNER_KEY: &str = "b";
const PENDING_UID: &str = "pending@cyanea";

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_description_limit() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    pub dir: String,
    /// IANA name used for file dates and DTSTART/DTEND
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Maximum DESCRIPTION length in characters, hidden id included
    #[serde(default = "default_description_limit")]
    pub description_limit: usize,
    #[serde(default)]
    pub upcoming_only: bool,
}

pub fn declaration() -> PluginDecl {
    PluginDecl::new().with_sink(Component::typed(
        json!({
            "type": "object",
            "properties": {
                "dir": { "type": "string", "minLength": 1 },
                "timezone": { "type": "string" },
                "description_limit": { "type": "integer", "minimum": 1 },
                "upcoming_only": { "type": "boolean" }
            },
            "required": ["dir"],
            "additionalProperties": false
        }),
        |config: MirrorConfig| async move {
            let tz = config
                .timezone
                .parse::<Tz>()
                .map_err(|e| anyhow::anyhow!("unknown timezone '{}': {}", config.timezone, e))?;
            let mirror = CaldirMirror::new(expand_path(&config.dir), tz)
                .with_description_limit(config.description_limit)
                .with_upcoming_only(config.upcoming_only);
            Ok::<_, anyhow::Error>(Box::new(mirror) as Box<dyn Sink>)
        },
    ))
}

pub struct CaldirMirror {
    dir: PathBuf,
    tz: Tz,
    description_limit: usize,
    upcoming_only: bool,
}

/// A file in the mirror that carries an id.
struct MirroredFile {
    path: PathBuf,
    uid: String,
    event: Event,
}

/// A desired event, ready to be written.
struct Planned {
    event: Event,
    /// Visible description followed by the hidden id
    description: String,
    /// What reading the written file back will yield
    expected: Event,
}

impl CaldirMirror {
    pub fn new(dir: PathBuf, tz: Tz) -> Self {
        CaldirMirror {
            dir,
            tz,
            description_limit: default_description_limit(),
            upcoming_only: false,
        }
    }

    pub fn with_description_limit(mut self, limit: usize) -> Self {
        self.description_limit = limit;
        self
    }

    pub fn with_upcoming_only(mut self, upcoming_only: bool) -> Self {
        self.upcoming_only = upcoming_only;
        self
    }

    fn read_mirror(&self) -> anyhow::Result<Vec<MirroredFile>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "ics"))
            .collect();
        paths.sort();

        let mut parsed = Vec::new();
        for path in paths {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match ical::parse_vevent(&content, self.tz) {
                Some(vevent) => parsed.push((path, vevent)),
                None => debug!(path = %path.display(), "skipping unparseable file"),
            }
        }

        let recovered = recover(&parsed, |(_, vevent): &(PathBuf, ParsedVevent)| {
            TagCodec.extract(&vevent.description)
        })?;
        Ok(recovered
            .into_iter()
            .map(|(found, (path, vevent))| MirroredFile {
                path: path.clone(),
                uid: vevent.uid.clone(),
                event: decode(found, vevent),
            })
            .collect())
    }

    fn plan(&self, event: &Event, now: DateTime<Utc>) -> anyhow::Result<Planned> {
        let visible = TagCodec::visible(&event.description);
        let visible_len = visible.chars().count();

        let mut aux = Aux::new();
        if let Some(banner) = &event.banner {
            aux.insert(BANNER_KEY.to_string(), banner.clone());
        }

        let embedded = embed_with_fallback(&TagCodec, &event.id, &aux, |payload: &String| {
            visible_len + payload.chars().count() <= self.description_limit
        })
        .with_context(|| {
            format!(
                "event {} does not fit in a {}-character description",
                event.id, self.description_limit
            )
        })?;

        let mut normalized = event.clone();
        if embedded.dropped_aux {
            warn!(event = %event.id, "description too long to carry the banner, dropping it");
            normalized.banner = None;
        }

        let description = format!("{visible}{}", embedded.payload);
        let rendered = self.render(&normalized, PENDING_UID, &description, now)?;
        let expected = ical::parse_vevent(&rendered, self.tz)
            .and_then(|vevent| Some(decode(TagCodec.extract(&vevent.description)?, &vevent)))
            .with_context(|| format!("event {} could not be read back after rendering", event.id))?;

        Ok(Planned {
            event: normalized,
            description,
            expected,
        })
    }

    fn render(
        &self,
        event: &Event,
        uid: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let mut cal = Calendar::new();
        cal.push(ical::vevent(
            event,
            &VeventMeta {
                uid,
                description,
                stamp: now,
                tz: self.tz,
            },
        )?);
        Ok(ical::render(cal))
    }

    /// `<date>__<slug>.ics`, suffixed `-2`, `-3`... if taken.
    fn unique_path(&self, event: &Event) -> anyhow::Result<PathBuf> {
        let date = event
            .start_time()
            .map(|start| start.with_timezone(&self.tz).format("%Y-%m-%dT%H%M").to_string())
            .unwrap_or_default();
        let slug = match slug::slugify(&event.title) {
            s if s.is_empty() => "event".to_string(),
            s => s,
        };
        let base = format!("{date}__{slug}");

        let candidates =
            std::iter::once(base.clone()).chain((2..=100).map(|n| format!("{base}-{n}")));
        for candidate in candidates {
            let path = self.dir.join(format!("{candidate}.ics"));
            if !path.exists() {
                return Ok(path);
            }
        }

        anyhow::bail!("Too many filename collisions for {base}")
    }
}

fn decode(found: Recovered, vevent: &ParsedVevent) -> Event {
    Event {
        id: found.id,
        title: vevent.summary.clone(),
        kind: None,
        description: TagCodec::visible(&vevent.description),
        location: vevent.location.clone(),
        banner: found.aux.get(BANNER_KEY).cloned(),
        start: vevent.start.timestamp_millis(),
        end: vevent.end.timestamp_millis(),
        links: None,
        meta: None,
    }
}

fn write(path: &Path, content: &str) -> anyhow::Result<()> {
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

#[async_trait]
impl Sink for CaldirMirror {
    async fn sync_events(
        &self,
        events: &[Event],
        _filestore: &dyn Filestore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let mirrored = self.read_mirror()?;
        let planned = events
            .iter()
            .filter(|event| !self.upcoming_only || event.end >= now.timestamp_millis())
            .map(|event| self.plan(event, now))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let previous: Vec<Event> = mirrored.iter().map(|f| f.event.clone()).collect();
        let desired: Vec<Event> = planned.iter().map(|p| p.expected.clone()).collect();
        let changes = diff(&previous, &desired);

        if changes.is_empty() {
            info!(dir = %self.dir.display(), "mirror is up to date");
            return Ok(());
        }

        let files: HashMap<&str, &MirroredFile> =
            mirrored.iter().map(|f| (f.event.id.as_str(), f)).collect();
        let plans: HashMap<&str, &Planned> =
            planned.iter().map(|p| (p.event.id.as_str(), p)).collect();

        for event in &changes.removed {
            let Some(file) = files.get(event.id.as_str()) else {
                continue;
            };
            std::fs::remove_file(&file.path)
                .with_context(|| format!("Failed to remove {}", file.path.display()))?;
            debug!(event = %event.id, path = %file.path.display(), "removed");
        }

        for event in &changes.modified {
            let (Some(file), Some(plan)) =
                (files.get(event.id.as_str()), plans.get(event.id.as_str()))
            else {
                continue;
            };
            let content = self.render(&plan.event, &file.uid, &plan.description, now)?;
            write(&file.path, &content)?;
            debug!(event = %event.id, path = %file.path.display(), "updated");
        }

        for event in &changes.added {
            let Some(plan) = plans.get(event.id.as_str()) else {
                continue;
            };
            let path = self.unique_path(&plan.event)?;
            let uid = format!("{}@cyanea", Uuid::new_v4());
            let content = self.render(&plan.event, &uid, &plan.description, now)?;
            write(&path, &content)?;
            debug!(event = %event.id, path = %path.display(), "created");
        }

        info!(dir = %self.dir.display(), changes = %changes, "synced mirror");
        Ok(())
    }
}
