//! Seed-then-follow synchronization of a [`LocalView`].

use std::ops::ControlFlow;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::key::KeySpace;
use crate::store::ConfigStore;
use crate::view::{LocalView, ViewSnapshot};
use crate::Error;

/// Lifecycle of one synchronizer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Seeding,
    Streaming,
    Closed,
    Failed,
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The cancellation token fired.
    Cancelled,
    /// The store ended the watch cleanly.
    EndOfStream,
    /// The sink reported that nobody consumes views any more.
    ConsumerGone,
}

/// Receives every published view, in order, one at a time.
pub trait ViewSink {
    fn publish(&mut self, view: ViewSnapshot) -> ControlFlow<()>;
}

impl<F> ViewSink for F
where
    F: FnMut(ViewSnapshot),
{
    fn publish(&mut self, view: ViewSnapshot) -> ControlFlow<()> {
        self(view);
        ControlFlow::Continue(())
    }
}

/// Sink that forwards views into an unbounded channel and stops the run once
/// the receiver is dropped.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ViewSnapshot>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<ViewSnapshot>) -> Self {
        Self { sender }
    }
}

impl ViewSink for ChannelSink {
    fn publish(&mut self, view: ViewSnapshot) -> ControlFlow<()> {
        match self.sender.send(view) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

/// Keeps a [`LocalView`] of one entity consistent with the store.
///
/// A run seeds the view from a prefix read, publishes it, then follows the
/// watch from the read's revision and republishes after every batch. It ends
/// in [`SyncState::Closed`] on cancellation or clean end of stream, and in
/// [`SyncState::Failed`] on any seed or stream error. A failed run is never
/// resumed from its old revision; run again (or build a new synchronizer) to
/// start from a fresh seed.
pub struct Synchronizer<S> {
    store: S,
    entity: String,
    prefix: String,
    state: SyncState,
    cancel: CancellationToken,
}

impl<S: ConfigStore> Synchronizer<S> {
    pub fn new(store: S, keys: &KeySpace, entity: &str) -> Result<Self, Error> {
        Ok(Self {
            prefix: keys.entity_prefix(entity)?,
            entity: entity.to_string(),
            store,
            state: SyncState::Idle,
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the cancellation token, e.g. with a child of an application
    /// wide shutdown token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Runs until the watch ends, fails or is cancelled.
    ///
    /// The sink sees the seeded view exactly once (even when it is empty) and
    /// then one view per delivered batch, each reflecting the whole batch.
    /// Nothing is published after cancellation.
    pub async fn run<K>(&mut self, sink: &mut K) -> Result<CloseReason, Error>
    where
        K: ViewSink + ?Sized,
    {
        let result = self.follow(sink).await;

        match &result {
            Ok(reason) => {
                self.transition(SyncState::Closed);
                info!(entity = %self.entity, ?reason, "synchronizer closed");
            }
            Err(e) => {
                self.transition(SyncState::Failed);
                warn!(
                    entity = %self.entity,
                    error = %e,
                    compacted = e.is_compacted(),
                    "synchronizer failed"
                );
            }
        }

        result
    }

    async fn follow<K>(&mut self, sink: &mut K) -> Result<CloseReason, Error>
    where
        K: ViewSink + ?Sized,
    {
        self.transition(SyncState::Seeding);

        let snapshot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(CloseReason::Cancelled),
            result = self.store.get_prefix(&self.prefix) => {
                result.map_err(|e| Error::seed(&self.prefix, e))?
            }
        };

        let mut view = LocalView::seeded(&snapshot);
        info!(
            entity = %self.entity,
            revision = %view.revision(),
            entries = view.len(),
            "view seeded"
        );
        if sink.publish(view.snapshot()).is_break() {
            return Ok(CloseReason::ConsumerGone);
        }

        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(CloseReason::Cancelled),
            result = self.store.watch_prefix(&self.prefix, view.revision()) => {
                result.map_err(|e| Error::stream(&self.prefix, e))?
            }
        };
        self.transition(SyncState::Streaming);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(CloseReason::Cancelled),
                next = stream.next() => next,
            };

            let batch = match next {
                Some(Ok(batch)) => batch,
                Some(Err(e)) => return Err(Error::stream(&self.prefix, e)),
                None => return Ok(CloseReason::EndOfStream),
            };

            let changed = view.apply_batch(&batch);
            debug!(
                entity = %self.entity,
                revision = %view.revision(),
                events = batch.events.len(),
                changed,
                "batch applied"
            );

            if sink.publish(view.snapshot()).is_break() {
                return Ok(CloseReason::ConsumerGone);
            }
        }
    }

    fn transition(&mut self, next: SyncState) {
        debug!(prefix = %self.prefix, from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }
}
