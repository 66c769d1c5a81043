//! An in-process [`ConfigStore`].
//!
//! `MemoryStore` keeps the same revision and compaction rules as the gRPC
//! server: one revision per committed change set, watches replay history from
//! any revision that has not been compacted, and deleting nothing commits
//! nothing. It is useful for embedding and as a stand-in store in tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::store::{
    ConfigStore, Entry, Revision, Snapshot, WatchBatch, WatchEvent, WatchStream,
};
use crate::Error;

/// One change in a [`MemoryStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put { key: String, value: String },
    Delete { key: String },
}

impl Op {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete { key: key.into() }
    }
}

struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<Result<WatchBatch, Error>>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    compacted: Revision,
    data: BTreeMap<String, String>,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    pub fn compacted(&self) -> Revision {
        self.lock().compacted
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.sender.is_closed());
        inner.watchers.len()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Revision {
        self.commit(vec![Op::put(key, value)])
    }

    /// Deletes `key`. Returns the revision of the delete, or `None` when the
    /// key did not exist.
    pub fn remove(&self, key: &str) -> Option<Revision> {
        let mut inner = self.lock();
        apply(&mut inner, vec![Op::delete(key)])
    }

    /// Deletes every key starting with `prefix` in a single revision.
    pub fn remove_prefix(&self, prefix: &str) -> Option<Revision> {
        let mut inner = self.lock();
        let ops: Vec<_> = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| Op::delete(k.clone()))
            .collect();
        apply(&mut inner, ops)
    }

    /// Applies `ops` atomically under one new revision; watchers receive all
    /// resulting events as one batch. Ops that change nothing (deleting an
    /// absent key) produce no event, and a commit without events does not
    /// advance the revision. Returns the store revision after the commit.
    pub fn commit(&self, ops: Vec<Op>) -> Revision {
        let mut inner = self.lock();
        apply(&mut inner, ops).unwrap_or(inner.revision)
    }

    /// Drops history at or below `revision`. Watches that need events from
    /// that range afterwards fail with [`Error::Compacted`].
    pub fn compact(&self, revision: Revision) -> Result<Revision, Error> {
        let mut inner = self.lock();
        if revision > inner.revision {
            return Err(Error::FutureRevision {
                requested: revision,
                current: inner.revision,
            });
        }
        if revision <= inner.compacted {
            return Ok(inner.compacted);
        }

        inner.history.retain(|e| e.revision > revision);
        inner.compacted = revision;
        debug!(%revision, "history compacted");
        Ok(revision)
    }

    /// Ends every open watch stream cleanly, as a server shutting down would.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }
}

/// Commits `ops` on a locked store. Returns the new revision, or `None` when
/// nothing changed.
fn apply(inner: &mut Inner, ops: Vec<Op>) -> Option<Revision> {
    let revision = inner.revision.next();

    let mut events = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            Op::Put { key, value } => {
                inner.data.insert(key.clone(), value.clone());
                events.push(WatchEvent::put(key, value, revision));
            }
            Op::Delete { key } => {
                if inner.data.remove(&key).is_some() {
                    events.push(WatchEvent::delete(key, revision));
                }
            }
        }
    }

    if events.is_empty() {
        return None;
    }

    inner.revision = revision;
    inner.history.extend(events.iter().cloned());
    inner.watchers.retain(|watcher| {
        let matching: Vec<_> = events
            .iter()
            .filter(|e| e.key.starts_with(&watcher.prefix))
            .cloned()
            .collect();
        if matching.is_empty() {
            return !watcher.sender.is_closed();
        }
        watcher
            .sender
            .send(Ok(WatchBatch {
                events: matching,
                revision,
            }))
            .is_ok()
    });

    trace!(%revision, events = events.len(), "commit");
    Some(revision)
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot, Error> {
        let inner = self.lock();
        let entries = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| Entry::new(k.clone(), v.clone()))
            .collect();

        Ok(Snapshot {
            entries,
            revision: inner.revision,
        })
    }

    async fn put(&self, key: &str, value: &str) -> Result<Revision, Error> {
        Ok(self.set(key, value))
    }

    async fn delete(&self, key: &str) -> Result<Option<Revision>, Error> {
        Ok(self.remove(key))
    }

    async fn watch_prefix(&self, prefix: &str, after: Revision) -> Result<WatchStream, Error> {
        let mut inner = self.lock();

        if after < inner.compacted {
            let err = Error::Compacted {
                requested: after.next(),
                compacted: inner.compacted,
            };
            return Ok(stream::once(async move { Err::<WatchBatch, _>(err) }).boxed());
        }

        let backlog: Vec<_> = inner
            .history
            .iter()
            .filter(|e| e.revision > after && e.key.starts_with(prefix))
            .cloned()
            .collect();
        let replay = if backlog.is_empty() {
            None
        } else {
            Some(Ok(WatchBatch {
                events: backlog,
                revision: inner.revision,
            }))
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            sender,
        });
        debug!(prefix, %after, "watch registered");

        Ok(stream::iter(replay)
            .chain(UnboundedReceiverStream::new(receiver))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    async fn next_batch(stream: &mut WatchStream) -> WatchBatch {
        stream.next().await.expect("open stream").expect("batch")
    }

    #[tokio::test]
    async fn prefix_read_returns_only_matching_keys() {
        let store = MemoryStore::new();
        store.set("/config/srv1/timeout", "30");
        store.set("/config/srv10/timeout", "99");
        store.set("/config/srv1/retries", "3");

        let snapshot = store.get_prefix("/config/srv1/").await.unwrap();

        assert_eq!(snapshot.revision, Revision(3));
        let keys: Vec<_> = snapshot.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["/config/srv1/retries", "/config/srv1/timeout"]);
    }

    #[tokio::test]
    async fn deleting_nothing_does_not_advance_the_revision() {
        let store = MemoryStore::new();
        store.set("/a/b/c", "1");

        assert_eq!(store.remove("/a/b/missing"), None);
        assert_eq!(store.revision(), Revision(1));
        assert_eq!(store.remove("/a/b/c"), Some(Revision(2)));
    }

    #[test]
    fn removing_absent_keys_reports_nothing_under_concurrent_writes() {
        let store = Arc::new(MemoryStore::new());
        let stop = Arc::new(AtomicBool::new(false));

        let writer = std::thread::spawn({
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            move || {
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    store.set("/other/k", i.to_string());
                    i += 1;
                }
            }
        });

        let mut reported = 0;
        for _ in 0..20_000 {
            if store.remove("/config/srv1/never-set").is_some() {
                reported += 1;
            }
            if store.remove_prefix("/config/srv1/").is_some() {
                reported += 1;
            }
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();

        assert_eq!(reported, 0);
        assert!(store.revision() > Revision::ZERO);
    }

    #[tokio::test]
    async fn watch_replays_history_then_follows_live_commits() {
        let store = MemoryStore::new();
        store.set("/config/srv1/a", "1");
        store.set("/config/srv1/b", "2");

        let mut stream = store
            .watch_prefix("/config/srv1/", Revision(1))
            .await
            .unwrap();

        let replay = next_batch(&mut stream).await;
        assert_eq!(replay.events, vec![WatchEvent::put("/config/srv1/b", "2", Revision(2))]);

        store.commit(vec![
            Op::put("/config/srv1/c", "3"),
            Op::put("/config/other/x", "9"),
            Op::delete("/config/srv1/a"),
        ]);

        let live = next_batch(&mut stream).await;
        assert_eq!(live.revision, Revision(3));
        assert_eq!(
            live.events,
            vec![
                WatchEvent::put("/config/srv1/c", "3", Revision(3)),
                WatchEvent::delete("/config/srv1/a", Revision(3)),
            ]
        );
    }

    #[tokio::test]
    async fn watch_from_compacted_revision_fails() {
        let store = MemoryStore::new();
        store.set("/config/srv1/a", "1");
        store.set("/config/srv1/a", "2");
        store.compact(Revision(2)).unwrap();

        assert_eq!(store.compacted(), Revision(2));

        let mut stream = store
            .watch_prefix("/config/srv1/", Revision(1))
            .await
            .unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_compacted());

        assert!(store.watch_prefix("/config/srv1/", Revision(2)).await.is_ok());
    }

    #[tokio::test]
    async fn prefix_removal_is_one_batch() {
        let store = MemoryStore::new();
        store.set("/config/srv1/a", "1");
        store.set("/config/srv1/b", "2");
        let mut stream = store
            .watch_prefix("/config/srv1/", store.revision())
            .await
            .unwrap();

        assert_eq!(store.remove_prefix("/config/srv1/"), Some(Revision(3)));
        assert_eq!(store.remove_prefix("/config/srv1/"), None);

        let batch = next_batch(&mut stream).await;
        assert_eq!(batch.events.len(), 2);
        assert!(batch.events.iter().all(|e| e.revision == Revision(3)));
    }

    #[tokio::test]
    async fn compacting_the_future_is_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.compact(Revision(1)),
            Err(Error::FutureRevision { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_streams_are_unregistered() {
        let store = MemoryStore::new();
        let stream = store.watch_prefix("/a/", Revision::ZERO).await.unwrap();
        assert_eq!(store.watcher_count(), 1);

        drop(stream);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn close_watches_ends_streams() {
        let store = MemoryStore::new();
        let mut stream = store.watch_prefix("/a/", Revision::ZERO).await.unwrap();

        store.close_watches();
        assert!(stream.next().await.is_none());
    }
}
