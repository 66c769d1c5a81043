//! The local projection of one entity's configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::key::variable_name;
use crate::store::{EventKind, Revision, Snapshot, WatchBatch, WatchEvent};

/// Outcome of applying one event to a [`LocalView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Set,
    Removed,
    /// Delete of a variable the view does not hold.
    Absent,
    /// Event at or before the revision the view already reflects.
    Stale,
    /// Event kind this client does not understand.
    Ignored,
}

/// Variable name to value map kept consistent with a watched prefix.
///
/// The map is shared copy-on-write with the snapshots handed out by
/// [`LocalView::snapshot`], so publishing is cheap and a published snapshot
/// never changes afterwards.
#[derive(Debug, Clone, Default)]
pub struct LocalView {
    entries: Arc<BTreeMap<String, String>>,
    revision: Revision,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the view from a prefix read, indexing every entry by the
    /// trailing segment of its key.
    pub fn seeded(snapshot: &Snapshot) -> Self {
        let entries = snapshot
            .entries
            .iter()
            .map(|entry| (variable_name(&entry.key).to_string(), entry.value.clone()))
            .collect();

        Self {
            entries: Arc::new(entries),
            revision: snapshot.revision,
        }
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn get(&self, variable: &str) -> Option<&str> {
        self.entries.get(variable).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies a single event, whatever its revision.
    pub fn apply(&mut self, event: &WatchEvent) -> Applied {
        let variable = variable_name(&event.key);
        match event.kind {
            EventKind::Put => {
                Arc::make_mut(&mut self.entries).insert(variable.to_string(), event.value.clone());
                Applied::Set
            }
            EventKind::Delete => {
                if !self.entries.contains_key(variable) {
                    return Applied::Absent;
                }
                Arc::make_mut(&mut self.entries).remove(variable);
                Applied::Removed
            }
            EventKind::Unknown(kind) => {
                debug!(kind, key = %event.key, "ignoring event of unknown kind");
                Applied::Ignored
            }
        }
    }

    /// Applies a delivered batch in order and advances the view's revision.
    ///
    /// Events at or before the revision the view had when the batch arrived
    /// are already reflected and get skipped. Returns how many events changed
    /// the view.
    pub fn apply_batch(&mut self, batch: &WatchBatch) -> usize {
        let base = self.revision;
        let mut changed = 0;
        let mut revision = base.max(batch.revision);

        for event in &batch.events {
            let outcome = if event.revision <= base {
                Applied::Stale
            } else {
                revision = revision.max(event.revision);
                self.apply(event)
            };

            trace!(key = %event.key, revision = %event.revision, ?outcome, "applied event");
            if matches!(outcome, Applied::Set | Applied::Removed) {
                changed += 1;
            }
        }

        self.revision = revision;
        changed
    }

    /// Immutable copy of the current state.
    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            entries: Arc::clone(&self.entries),
            revision: self.revision,
        }
    }
}

/// A published, read-only state of a [`LocalView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSnapshot {
    entries: Arc<BTreeMap<String, String>>,
    revision: Revision,
}

impl ViewSnapshot {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn get(&self, variable: &str) -> Option<&str> {
        self.entries.get(variable).map(String::as_str)
    }

    pub fn contains_key(&self, variable: &str) -> bool {
        self.entries.contains_key(variable)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        (*self.entries).clone()
    }
}

impl fmt::Display for ViewSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Entry;

    fn rev(n: u64) -> Revision {
        Revision(n)
    }

    fn batch(events: Vec<WatchEvent>) -> WatchBatch {
        let revision = events.iter().map(|e| e.revision).max().unwrap_or_default();
        WatchBatch { events, revision }
    }

    #[test]
    fn seed_maps_trailing_segment_to_value() {
        let snapshot = Snapshot {
            entries: vec![
                Entry::new("/config/srv1/timeout", "30"),
                Entry::new("/config/srv1/retries", "3"),
            ],
            revision: rev(7),
        };

        let view = LocalView::seeded(&snapshot);

        assert_eq!(view.revision(), rev(7));
        assert_eq!(view.len(), 2);
        assert_eq!(view.get("timeout"), Some("30"));
        assert_eq!(view.get("retries"), Some("3"));
    }

    #[test]
    fn seed_of_empty_prefix_is_empty_view() {
        let view = LocalView::seeded(&Snapshot::default());
        assert!(view.is_empty());
        assert!(view.snapshot().is_empty());
    }

    #[test]
    fn delete_of_absent_variable_is_a_no_op() {
        let mut view = LocalView::seeded(&Snapshot {
            entries: vec![Entry::new("/config/srv1/timeout", "30")],
            revision: rev(1),
        });
        let before = view.snapshot();

        let outcome = view.apply(&WatchEvent::delete("/config/srv1/missing", rev(2)));

        assert_eq!(outcome, Applied::Absent);
        assert_eq!(view.snapshot().as_map(), before.as_map());
    }

    #[test]
    fn events_fold_in_delivery_order() {
        let mut view = LocalView::new();
        view.apply_batch(&batch(vec![
            WatchEvent::put("/config/srv1/a", "1", rev(1)),
            WatchEvent::put("/config/srv1/a", "2", rev(2)),
            WatchEvent::delete("/config/srv1/a", rev(3)),
        ]));
        assert_eq!(view.get("a"), None);

        let mut view = LocalView::new();
        view.apply_batch(&batch(vec![
            WatchEvent::delete("/config/srv1/a", rev(1)),
            WatchEvent::put("/config/srv1/a", "1", rev(2)),
            WatchEvent::put("/config/srv1/a", "2", rev(3)),
        ]));
        assert_eq!(view.get("a"), Some("2"));
    }

    #[test]
    fn events_at_or_before_view_revision_are_skipped() {
        let mut view = LocalView::seeded(&Snapshot {
            entries: vec![Entry::new("/config/srv1/timeout", "30")],
            revision: rev(5),
        });

        let changed = view.apply_batch(&batch(vec![
            WatchEvent::put("/config/srv1/timeout", "10", rev(4)),
            WatchEvent::delete("/config/srv1/timeout", rev(5)),
            WatchEvent::put("/config/srv1/retries", "3", rev(6)),
        ]));

        assert_eq!(changed, 1);
        assert_eq!(view.get("timeout"), Some("30"));
        assert_eq!(view.get("retries"), Some("3"));
        assert_eq!(view.revision(), rev(6));
    }

    #[test]
    fn events_must_carry_their_commit_revision() {
        let mut view = LocalView::seeded(&Snapshot {
            entries: vec![Entry::new("/config/srv1/timeout", "30")],
            revision: rev(3),
        });

        let changed = view.apply_batch(&WatchBatch {
            events: vec![WatchEvent::put("/config/srv1/timeout", "10", Revision::ZERO)],
            revision: rev(4),
        });

        assert_eq!(changed, 0);
        assert_eq!(view.get("timeout"), Some("30"));
        assert_eq!(view.revision(), rev(4));
    }

    #[test]
    fn events_sharing_a_revision_all_apply() {
        let mut view = LocalView::seeded(&Snapshot {
            entries: vec![
                Entry::new("/config/srv1/a", "1"),
                Entry::new("/config/srv1/b", "2"),
            ],
            revision: rev(2),
        });

        view.apply_batch(&batch(vec![
            WatchEvent::delete("/config/srv1/a", rev(3)),
            WatchEvent::delete("/config/srv1/b", rev(3)),
        ]));

        assert!(view.is_empty());
        assert_eq!(view.revision(), rev(3));
    }

    #[test]
    fn unknown_kinds_are_ignored() {
        let mut view = LocalView::new();
        let event = WatchEvent {
            kind: EventKind::Unknown(42),
            key: "/config/srv1/a".into(),
            value: "1".into(),
            revision: rev(1),
        };

        assert_eq!(view.apply(&event), Applied::Ignored);
        assert!(view.is_empty());
    }

    #[test]
    fn published_snapshot_is_not_affected_by_later_changes() {
        let mut view = LocalView::new();
        view.apply(&WatchEvent::put("/config/srv1/a", "1", rev(1)));
        let published = view.snapshot();

        view.apply(&WatchEvent::put("/config/srv1/a", "2", rev(2)));
        view.apply(&WatchEvent::put("/config/srv1/b", "3", rev(3)));

        assert_eq!(published.get("a"), Some("1"));
        assert_eq!(published.len(), 1);
        assert_eq!(view.get("a"), Some("2"));
    }

    #[test]
    fn display_lists_variables_in_name_order() {
        let view = LocalView::seeded(&Snapshot {
            entries: vec![
                Entry::new("/config/srv1/timeout", "30"),
                Entry::new("/config/srv1/retries", "3"),
            ],
            revision: rev(2),
        });

        assert_eq!(view.snapshot().to_string(), "{retries=3, timeout=30}");
        assert_eq!(LocalView::new().snapshot().to_string(), "{}");
    }
}
