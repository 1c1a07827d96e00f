//! blobfs cache core.
//!
//! Tracks, per open file, which byte ranges of a sparse local cache file
//! have been downloaded from the object store and which were modified
//! locally; plans the mixed COPY/PUT multi-part upload that commits local
//! changes back; persists that state to a stats sidecar and reconciles it
//! against the file's physical hole/data layout; and runs the
//! object-store traffic on a fixed pool of worker threads.

/// Page-state tracking, upload planning and persistence.
pub mod cache;
/// Cache configuration.
pub mod config;
/// Worker pool executing object-store jobs.
pub mod pool;
/// Synchronization primitives.
pub mod sync;
