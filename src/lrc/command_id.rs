//! Command identifiers.
//!
//! Every accepted submission gets a [`CommandId`] of the form
//! `<unix seconds>.<microseconds>_<command name>`, e.g.
//! `1718031234.004211_MoveAbsolute`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Opaque, sortable identifier of one submitted command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the command this id was issued for.
    pub fn command_name(&self) -> &str {
        self.0.split_once('_').map_or("", |(_, name)| name)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CommandId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Issues [`CommandId`]s for a single engine.
///
/// Stamps have microsecond resolution. When two submissions land on the same
/// microsecond (or the wall clock steps backwards) the stamp is advanced past
/// the previous one, so ids from one generator are strictly increasing.
#[derive(Debug, Default)]
pub struct CommandIdGenerator {
    last_micros: AtomicI64,
}

impl CommandIdGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue an id for `name` submitted now.
    pub fn generate(&self, name: &str) -> CommandId {
        self.generate_at(Utc::now(), name)
    }

    /// Issue an id for `name` submitted at `submitted_at`.
    pub fn generate_at(&self, submitted_at: DateTime<Utc>, name: &str) -> CommandId {
        let observed = submitted_at.timestamp_micros();
        let mut previous = self.last_micros.load(Ordering::Acquire);
        let stamp = loop {
            let candidate = observed.max(previous.saturating_add(1));
            match self.last_micros.compare_exchange_weak(
                previous,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break candidate,
                Err(actual) => previous = actual,
            }
        };

        CommandId(format!(
            "{}.{:06}_{}",
            stamp.div_euclid(1_000_000),
            stamp.rem_euclid(1_000_000),
            name
        ))
    }
}
