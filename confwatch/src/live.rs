//! Background synchronization with a channel of published views.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::key::KeySpace;
use crate::store::ConfigStore;
use crate::sync::{ChannelSink, CloseReason, Synchronizer};
use crate::view::ViewSnapshot;
use crate::Error;

/// A [`Synchronizer`] running on its own task.
///
/// Views arrive through [`LiveView::next`] in publish order. Dropping the
/// handle cancels the task.
pub struct LiveView {
    views: mpsc::UnboundedReceiver<ViewSnapshot>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<CloseReason, Error>>>,
}

impl LiveView {
    /// Spawns a synchronizer for `entity` on the current tokio runtime.
    pub fn start<S>(store: S, keys: &KeySpace, entity: &str) -> Result<Self, Error>
    where
        S: ConfigStore + 'static,
    {
        Ok(Self::spawn(Synchronizer::new(store, keys, entity)?))
    }

    /// Spawns an already configured synchronizer.
    pub fn spawn<S>(mut sync: Synchronizer<S>) -> Self
    where
        S: ConfigStore + 'static,
    {
        let cancel = sync.cancellation_token();
        let (sender, views) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut sink = ChannelSink::new(sender);
            sync.run(&mut sink).await
        });

        Self {
            views,
            cancel,
            handle: Some(handle),
        }
    }

    /// Next published view, or `None` once the run has ended and every view
    /// has been received.
    pub async fn next(&mut self) -> Option<ViewSnapshot> {
        self.views.recv().await
    }

    /// Stops the run. Views already published stay readable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the run to end and returns how it ended.
    pub async fn join(mut self) -> Result<CloseReason, Error> {
        match self.handle.take() {
            Some(handle) => handle.await?,
            None => Ok(CloseReason::Cancelled),
        }
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
