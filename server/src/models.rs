use chrono::Utc;

/// Kind of change recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

impl EventKind {
    pub fn as_i64(self) -> i64 {
        match self {
            EventKind::Put => 0,
            EventKind::Delete => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(EventKind::Put),
            1 => Some(EventKind::Delete),
            _ => None,
        }
    }
}

/// One entry of the append-only event log.
#[derive(Debug, Clone)]
pub struct Record {
    pub revision: u64,
    pub kind: EventKind,
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: i64,
}

impl Record {
    pub fn new(revision: u64, kind: EventKind, key: String, value: Vec<u8>) -> Self {
        Self {
            revision,
            kind,
            key,
            value,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// A live key as returned by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: u64,
}

/// What a watch delivers: either a batch of events or notice that the
/// requested history is gone.
#[derive(Debug, Clone)]
pub enum WatchItem {
    Events { revision: u64, records: Vec<Record> },
    Compacted(u64),
}
