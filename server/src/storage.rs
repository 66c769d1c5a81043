use crate::db::DbPool;
use crate::models::{EventKind, KeyValue, Record, WatchItem};
use futures_util::stream::Stream;
use sqlx::{Row, SqliteConnection};
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

const META_REVISION: &str = "revision";
const META_COMPACTED: &str = "compacted";

/// Latest event of every key under a prefix; deleted keys are filtered out by
/// the caller.
const LATEST_UNDER_PREFIX: &str = "SELECT key, value, revision, kind FROM events
     WHERE id IN (SELECT MAX(id) FROM events WHERE substr(key, 1, length(?)) = ? GROUP BY key)
     ORDER BY key";

const LATEST_FOR_KEY: &str = "SELECT key, value, revision, kind FROM events
     WHERE key = ? ORDER BY id DESC LIMIT 1";

const EVENTS_BETWEEN: &str = "SELECT revision, kind, key, value, timestamp FROM events
     WHERE revision >= ? AND revision <= ? AND substr(key, 1, length(?)) = ?
     ORDER BY id";

/// Drops history that no range read can reach any more: tombstones and every
/// put that was superseded by a later event on the same key.
const COMPACT: &str = "DELETE FROM events
     WHERE revision <= ? AND (kind = 1 OR id NOT IN (SELECT MAX(id) FROM events GROUP BY key))";

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchItem, StorageError>> + Send>>;

/// Revisioned key-value storage on top of an append-only event log.
///
/// Writers are serialized so revisions are assigned without gaps. After each
/// commit the new head revision is broadcast, which wakes up watch streams.
pub struct Storage {
    pool: DbPool,
    write_lock: Mutex<()>,
    head: watch::Sender<u64>,
}

impl Storage {
    pub async fn open(pool: DbPool) -> Result<Self, StorageError> {
        let mut conn = pool.acquire().await?;
        let revision = read_meta(&mut conn, META_REVISION).await?;
        drop(conn);

        let (head, _) = watch::channel(revision);
        info!(revision, "storage opened");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            head,
        })
    }

    /// Latest committed revision.
    pub fn revision(&self) -> u64 {
        *self.head.borrow()
    }

    /// Returns `(revision, compacted revision)`.
    pub async fn status(&self) -> Result<(u64, u64), StorageError> {
        let mut conn = self.pool.acquire().await?;
        let revision = read_meta(&mut conn, META_REVISION).await?;
        let compacted = read_meta(&mut conn, META_COMPACTED).await?;
        Ok((revision, compacted))
    }

    /// Reads every live key under `prefix` together with the revision the read
    /// reflects. Both come from the same transaction.
    pub async fn range(&self, prefix: &str) -> Result<(Vec<KeyValue>, u64), StorageError> {
        let mut tx = self.pool.begin().await?;
        let revision = read_meta(&mut tx, META_REVISION).await?;
        let kvs = live_under_prefix(&mut tx, prefix).await?;
        tx.commit().await?;
        Ok((kvs, revision))
    }

    pub async fn put(&self, key: String, value: Vec<u8>) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let revision = read_meta(&mut tx, META_REVISION).await? + 1;
        let record = Record::new(revision, EventKind::Put, key, value);
        insert_record(&mut tx, &record).await?;
        write_meta(&mut tx, META_REVISION, revision).await?;
        tx.commit().await?;

        self.head.send_replace(revision);
        debug!(revision, key = %record.key, "put committed");
        Ok(revision)
    }

    /// Deletes `key`, or every live key starting with it when `prefix` is set.
    ///
    /// Returns `(deleted, revision)`. Deleting nothing commits no revision and
    /// reports the current one.
    pub async fn delete(&self, key: &str, prefix: bool) -> Result<(u64, u64), StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let current = read_meta(&mut tx, META_REVISION).await?;
        let live = if prefix {
            live_under_prefix(&mut tx, key).await?
        } else {
            live_key(&mut tx, key).await?.into_iter().collect()
        };

        if live.is_empty() {
            return Ok((0, current));
        }

        let revision = current + 1;
        for kv in &live {
            let tombstone = Record::new(revision, EventKind::Delete, kv.key.clone(), Vec::new());
            insert_record(&mut tx, &tombstone).await?;
        }
        write_meta(&mut tx, META_REVISION, revision).await?;
        tx.commit().await?;

        self.head.send_replace(revision);
        debug!(revision, deleted = live.len(), key, prefix, "delete committed");
        Ok((live.len() as u64, revision))
    }

    /// Discards superseded history at or below `revision`.
    ///
    /// Watches that still need events from that range fail with
    /// [`WatchItem::Compacted`]. Returns the effective compacted revision.
    pub async fn compact(&self, revision: u64) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let current = read_meta(&mut tx, META_REVISION).await?;
        if revision > current {
            return Err(StorageError::FutureRevision {
                requested: revision,
                current,
            });
        }

        let compacted = read_meta(&mut tx, META_COMPACTED).await?;
        if revision <= compacted {
            return Ok(compacted);
        }

        let removed = sqlx::query(COMPACT)
            .bind(revision as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        write_meta(&mut tx, META_COMPACTED, revision).await?;
        tx.commit().await?;

        info!(revision, removed, "history compacted");
        Ok(revision)
    }

    /// Streams every change under `prefix` starting at `start_revision`
    /// (zero: after the current head).
    ///
    /// Each item carries all matching events committed since the previous
    /// item, in commit order. A revision is never split across items.
    pub fn watch(&self, prefix: String, start_revision: u64) -> WatchStream {
        let pool = self.pool.clone();
        let mut head = self.head.subscribe();
        let mut next = if start_revision == 0 {
            *head.borrow() + 1
        } else {
            start_revision
        };

        Box::pin(async_stream::stream! {
            loop {
                let current = *head.borrow_and_update();

                if current >= next {
                    match read_window(&pool, &prefix, next, current).await {
                        Ok(WatchItem::Compacted(compacted)) => {
                            yield Ok(WatchItem::Compacted(compacted));
                            break;
                        }
                        Ok(WatchItem::Events { revision, records }) => {
                            next = revision + 1;
                            if !records.is_empty() {
                                yield Ok(WatchItem::Events { revision, records });
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    }
                }

                if head.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

async fn read_window(
    pool: &DbPool,
    prefix: &str,
    from: u64,
    to: u64,
) -> Result<WatchItem, StorageError> {
    let mut tx = pool.begin().await?;

    let compacted = read_meta(&mut tx, META_COMPACTED).await?;
    if from <= compacted {
        return Ok(WatchItem::Compacted(compacted));
    }

    let rows = sqlx::query(EVENTS_BETWEEN)
        .bind(from as i64)
        .bind(to as i64)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;

    let records = rows
        .iter()
        .filter_map(|row| {
            let kind = EventKind::from_i64(row.get("kind"))?;
            Some(Record {
                revision: row.get::<i64, _>("revision") as u64,
                kind,
                key: row.get("key"),
                value: row.get("value"),
                timestamp: row.get("timestamp"),
            })
        })
        .collect();

    Ok(WatchItem::Events {
        revision: to,
        records,
    })
}

async fn read_meta(conn: &mut SqliteConnection, name: &str) -> Result<u64, sqlx::Error> {
    let value: i64 = sqlx::query("SELECT value FROM meta WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?
        .get("value");
    Ok(value as u64)
}

async fn write_meta(
    conn: &mut SqliteConnection,
    name: &str,
    value: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE meta SET value = ? WHERE name = ?")
        .bind(value as i64)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_record(conn: &mut SqliteConnection, record: &Record) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO events (revision, kind, key, value, timestamp) VALUES (?, ?, ?, ?, ?)")
        .bind(record.revision as i64)
        .bind(record.kind.as_i64())
        .bind(&record.key)
        .bind(&record.value)
        .bind(record.timestamp)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn live_under_prefix(
    conn: &mut SqliteConnection,
    prefix: &str,
) -> Result<Vec<KeyValue>, sqlx::Error> {
    let rows = sqlx::query(LATEST_UNDER_PREFIX)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows.iter().filter_map(live_key_value).collect())
}

async fn live_key(conn: &mut SqliteConnection, key: &str) -> Result<Option<KeyValue>, sqlx::Error> {
    let row = sqlx::query(LATEST_FOR_KEY)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.as_ref().and_then(live_key_value))
}

fn live_key_value(row: &sqlx::sqlite::SqliteRow) -> Option<KeyValue> {
    match EventKind::from_i64(row.get("kind")) {
        Some(EventKind::Put) => Some(KeyValue {
            key: row.get("key"),
            value: row.get("value"),
            mod_revision: row.get::<i64, _>("revision") as u64,
        }),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("revision {requested} is ahead of the current revision {current}")]
    FutureRevision { requested: u64, current: u64 },
}
