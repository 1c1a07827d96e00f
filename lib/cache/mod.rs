//! Caching primitives for blobfs.

/// Per-open-file orchestration.
pub mod entity;
/// Page records and the per-file page table.
pub mod page;
/// Sparse-file probing and reconciliation.
pub mod sparse;
/// Stats sidecar persistence.
pub mod stat;
/// Multi-part upload planning.
pub mod upload;

pub use entity::CacheEntity;
pub use page::{Page, PageList, PageStatus};
pub use sparse::{ReconcileReport, WarnArea, WarnReason};
pub use stat::StatsFile;
pub use upload::{ByteRange, PartKind, UploadPart, UploadPlan};
