//! Typed object-store jobs.
//!
//! Workers receive well-typed work rather than opaque callbacks: each
//! variant carries exactly the data its operation needs. Jobs address the
//! cache file through a shared handle with positional I/O, so no seek
//! state is involved.

use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use blobstore::PartEtag;

use crate::cache::upload::ByteRange;

/// Shared failure counter for a batch of related jobs.
///
/// Workers record failures here; the dispatching side awaits the batch via
/// completion semaphores and then inspects the count.
#[derive(Debug, Default)]
pub struct JobBatch {
    failures: AtomicUsize,
}

impl JobBatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Fetch a byte range of the remote object into the cache file.
#[derive(Debug)]
pub struct DownloadJob {
    pub key: String,
    pub range: ByteRange,
    pub file: Arc<File>,
    pub batch: Arc<JobBatch>,
}

/// Upload a byte range of the cache file as one part (PUT).
#[derive(Debug)]
pub struct UploadPartJob {
    pub key: String,
    pub upload_id: String,
    pub part_number: u16,
    pub range: ByteRange,
    pub file: Arc<File>,
    pub etags: Arc<Mutex<Vec<PartEtag>>>,
    pub batch: Arc<JobBatch>,
}

/// Re-use a byte range of the existing remote object as one part (COPY).
#[derive(Debug)]
pub struct CopyPartJob {
    pub key: String,
    pub upload_id: String,
    pub part_number: u16,
    pub range: ByteRange,
    pub etags: Arc<Mutex<Vec<PartEtag>>>,
    pub batch: Arc<JobBatch>,
}

/// Finalize the multi-part upload from the collected part etags.
#[derive(Debug)]
pub struct CompleteJob {
    pub key: String,
    pub upload_id: String,
    pub etags: Arc<Mutex<Vec<PartEtag>>>,
    pub batch: Arc<JobBatch>,
}

/// One unit of work for the pool.
#[derive(Debug)]
pub enum StoreJob {
    Download(DownloadJob),
    UploadPart(UploadPartJob),
    CopyPart(CopyPartJob),
    Complete(CompleteJob),
}

impl StoreJob {
    /// Short operation name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreJob::Download(_) => "download",
            StoreJob::UploadPart(_) => "upload-part",
            StoreJob::CopyPart(_) => "copy-part",
            StoreJob::Complete(_) => "complete",
        }
    }

    /// Record this job's failure on its batch.
    pub fn mark_failed(&self) {
        match self {
            StoreJob::Download(job) => job.batch.record_failure(),
            StoreJob::UploadPart(job) => job.batch.record_failure(),
            StoreJob::CopyPart(job) => job.batch.record_failure(),
            StoreJob::Complete(job) => job.batch.record_failure(),
        }
    }
}
