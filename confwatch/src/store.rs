//! The store capability the synchronizer and writer are built on.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Error;

/// Position in the store's global event log.
///
/// Revision zero is the empty store. Every committed change gets a strictly
/// larger revision, so revisions double as resume markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Revision(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Result of a prefix read: the entries plus the revision they reflect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub entries: Vec<Entry>,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
    /// A kind this client does not know about; carries the raw wire value.
    Unknown(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
    /// Revision that committed this change. Local views skip events at or
    /// below the revision they already reflect, so it must never be left at
    /// zero.
    pub revision: Revision,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<String>, revision: Revision) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: value.into(),
            revision,
        }
    }

    pub fn delete(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: String::new(),
            revision,
        }
    }
}

/// Changes delivered together by a watch. The batch is the unit the local
/// view is republished at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    /// Store revision this batch brings the watcher up to.
    pub revision: Revision,
}

/// Ordered, cancellable stream of watch batches. Dropping it cancels the
/// watch and releases its resources.
pub type WatchStream = BoxStream<'static, Result<WatchBatch, Error>>;

/// A revisioned key-value store with consistent prefix reads and prefix
/// watches.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Reads every entry whose key starts with `prefix`, consistently, with the
    /// revision of the read.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, Error>;

    /// Unconditionally stores `value` under `key`.
    async fn put(&self, key: &str, value: &str) -> Result<Revision, Error>;

    /// Removes `key`. Returns the revision of the delete, or `None` when there
    /// was nothing to remove.
    async fn delete(&self, key: &str) -> Result<Option<Revision>, Error>;

    /// Streams changes under `prefix` committed strictly after `after`.
    ///
    /// Every event carries its own commit revision, which is greater than
    /// `after`; events of one commit share a revision and arrive in the same
    /// batch. Events at or below `after` are treated as already applied.
    async fn watch_prefix(&self, prefix: &str, after: Revision) -> Result<WatchStream, Error>;
}

#[async_trait]
impl<S: ConfigStore + ?Sized> ConfigStore for Arc<S> {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, Error> {
        (**self).get_prefix(prefix).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<Revision, Error> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<Option<Revision>, Error> {
        (**self).delete(key).await
    }

    async fn watch_prefix(&self, prefix: &str, after: Revision) -> Result<WatchStream, Error> {
        (**self).watch_prefix(prefix, after).await
    }
}
