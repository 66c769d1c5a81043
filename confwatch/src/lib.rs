//! Live, consistent in-memory views of a prefix in a revisioned key-value
//! store.
//!
//! A [`Synchronizer`] reads every variable under `/config/<entity>/` once,
//! then follows a watch from the revision of that read, so no change is missed
//! and none is applied twice. After the initial read and after every delivered
//! batch it publishes an immutable [`ViewSnapshot`] of `variable -> value`.
//! A [`Writer`] stores single values under the same layout.
//!
//! # Features
//!
//! - Any backend implementing [`ConfigStore`]: [`GrpcStore`] talks to
//!   `confwatch-server`, [`MemoryStore`] lives in process
//! - Revision-based resume, compaction surfaced as a distinct failure
//! - Cooperative cancellation through `tokio_util`'s `CancellationToken`
//!
//! # Example
//!
//! ```no_run
//! use confwatch::{GrpcStore, KeySpace, LiveView, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), confwatch::Error> {
//!     let store = GrpcStore::connect(&StoreConfig::default()).await?;
//!     let mut live = LiveView::start(store, &KeySpace::default(), "srv1")?;
//!
//!     while let Some(view) = live.next().await {
//!         println!("{}", view);
//!     }
//!     live.join().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod grpc;
mod key;
mod live;
mod memory;
mod store;
mod sync;
mod view;
mod writer;

pub use config::{StoreConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_ENDPOINT, DEFAULT_REQUEST_TIMEOUT};
pub use error::Error;
pub use grpc::{Credentials, GrpcStore};
pub use key::{variable_name, KeySpace, DEFAULT_NAMESPACE, SEPARATOR};
pub use live::LiveView;
pub use memory::{MemoryStore, Op};
pub use store::{
    ConfigStore, Entry, EventKind, Revision, Snapshot, WatchBatch, WatchEvent, WatchStream,
};
pub use sync::{ChannelSink, CloseReason, SyncState, Synchronizer, ViewSink};
pub use view::{Applied, LocalView, ViewSnapshot};
pub use writer::Writer;
