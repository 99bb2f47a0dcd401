//! The canonical event record.
//!
//! Sources produce these, every sink consumes them, and the diff engine
//! compares them. Sinks translate them into whatever their external system
//! understands and decode their external representation back into them when
//! reconciling.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CyaneaError, CyaneaResult, Violation};

/// A single event from the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EventType>,
    pub description: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    /// Start instant in milliseconds since the UNIX epoch
    pub start: i64,
    /// End instant in milliseconds since the UNIX epoch
    pub end: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<BTreeMap<String, String>>,
    /// Sink-specific extras; sinks ignore keys they don't understand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, MetaValue>>,
}

/// Event category, either a single tag or a list of tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventType {
    One(String),
    Many(Vec<String>),
}

impl EventType {
    pub fn tags(&self) -> Vec<&str> {
        match self {
            EventType::One(tag) => vec![tag.as_str()],
            EventType::Many(tags) => tags.iter().map(String::as_str).collect(),
        }
    }
}

/// A scalar value in an event's `meta` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title, self.id)
    }
}

impl Event {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.start).single()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.end).single()
    }

    /// Fails if the event ends before it starts.
    ///
    /// The core does not call this; sinks do, since only they know whether
    /// their medium can represent such an event.
    pub fn check_time_range(&self) -> anyhow::Result<()> {
        if self.end < self.start {
            anyhow::bail!("event with id {} ends before it starts", self.id);
        }
        Ok(())
    }

    /// Field-level checks that don't depend on other events.
    fn violations(&self, index: usize) -> Vec<Violation> {
        let mut violations = Vec::new();

        if self.id.is_empty() {
            violations.push(Violation::new(format!("/{index}/id"), "must not be empty"));
        }

        if let Some(banner) = &self.banner {
            if let Err(e) = url::Url::parse(banner) {
                violations.push(Violation::new(
                    format!("/{index}/banner"),
                    format!("'{banner}' is not a valid URL ({e})"),
                ));
            }
        }

        for (name, link) in self.links.iter().flatten() {
            if let Err(e) = url::Url::parse(link) {
                violations.push(Violation::new(
                    format!("/{index}/links/{name}"),
                    format!("'{link}' is not a valid URL ({e})"),
                ));
            }
        }

        violations
    }
}

/// Validates one source read: every event well-formed, every id unique.
///
/// Duplicate ids are always an error; they are never deduplicated.
pub fn validate_events(events: &[Event]) -> CyaneaResult<()> {
    let mut seen = HashSet::new();
    for event in events {
        if !seen.insert(event.id.as_str()) {
            return Err(CyaneaError::DuplicateEventId(event.id.clone()));
        }
    }

    let violations: Vec<Violation> = events
        .iter()
        .enumerate()
        .flat_map(|(i, e)| e.violations(i))
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(CyaneaError::InvalidEvents(violations))
    }
}
