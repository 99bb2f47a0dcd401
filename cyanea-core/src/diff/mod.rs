//! Identity-based diffing between two event collections.
//!
//! Sinks have no "changed since" API to lean on, so each one reads back its
//! external state, decodes it into canonical events, and diffs that against
//! the desired set with [`diff`].

mod event_diff;

pub use event_diff::{DiffResult, diff};
