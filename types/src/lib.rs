//! Generated gRPC bindings for the confwatch key-value store.
//!
//! The `kv` package defines a revisioned key-value service: prefix reads that
//! report the revision they were taken at, point writes and deletes, history
//! compaction, and prefix watches that stream ordered event batches.

pub mod kv {
    tonic::include_proto!("kv");
}
