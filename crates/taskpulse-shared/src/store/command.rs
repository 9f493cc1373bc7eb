//! Pipeline commands and auxiliary store record types.

use std::time::Duration;

use serde::Serialize;

/// One mutation queued into a [`Pipeline`]
#[derive(Debug, Clone)]
pub enum StoreCommand {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HashIncr {
        key: String,
        field: String,
        by: i64,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
    SortedAdd {
        key: String,
        score: f64,
        member: String,
    },
    SortedRemove {
        key: String,
        member: String,
    },
    ListPush {
        key: String,
        value: String,
    },
    ListTrim {
        key: String,
        start: i64,
        stop: i64,
    },
    Delete {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// A batch of mutations executed as one round-trip.
///
/// Transactional pipelines commit all-or-nothing: a failed execution leaves
/// no state visible to readers.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub commands: Vec<StoreCommand>,
    pub transactional: bool,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactional() -> Self {
        Self {
            commands: Vec::new(),
            transactional: true,
        }
    }

    pub fn push(mut self, command: StoreCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

/// One slow-log entry as reported by the store
#[derive(Debug, Clone, Serialize)]
pub struct SlowLogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub duration_us: i64,
    pub command: String,
}
