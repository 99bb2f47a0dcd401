use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// The result of diffing a previous event set against a desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    /// Desired events whose id is absent from the previous set
    pub added: Vec<Event>,
    /// Desired events whose id exists in the previous set with a different value
    pub modified: Vec<Event>,
    /// Previous events whose id is absent from the desired set
    pub removed: Vec<Event>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// (created, updated, deleted)
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.added.len(), self.modified.len(), self.removed.len())
    }
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (created, updated, deleted) = self.counts();
        write!(f, "{}+{}+{} added/modified/removed", created, updated, deleted)
    }
}

/// Diffs `desired` against `previous` by event id.
///
/// Events present in both with full structural equality appear in no set.
/// Output keeps the order of the originating collection, and when an id
/// repeats within one collection only its first occurrence counts.
pub fn diff(previous: &[Event], desired: &[Event]) -> DiffResult {
    let mut previous_by_id: HashMap<&str, &Event> = HashMap::new();
    for event in previous {
        previous_by_id.entry(event.id.as_str()).or_insert(event);
    }

    let mut result = DiffResult::default();
    let mut desired_ids = HashSet::new();

    for event in desired {
        if !desired_ids.insert(event.id.as_str()) {
            continue;
        }

        match previous_by_id.get(event.id.as_str()) {
            None => result.added.push(event.clone()),
            Some(old) if *old != event => result.modified.push(event.clone()),
            Some(_) => {}
        }
    }

    let mut removed_ids = HashSet::new();
    for event in previous {
        if !desired_ids.contains(event.id.as_str()) && removed_ids.insert(event.id.as_str()) {
            result.removed.push(event.clone());
        }
    }

    result
}
