//! Per-open-file cache orchestration.
//!
//! A [`CacheEntity`] owns everything the cache tracks for one open file:
//! the sparse cache file, its page table and its stats sidecar. Reads go
//! through [`CacheEntity::ensure_loaded`] to fault in missing ranges,
//! writes are recorded with [`CacheEntity::mark_written`], and
//! [`CacheEntity::flush`] commits local changes back to the object store
//! as a mixed COPY/PUT multi-part upload.
//!
//! The filesystem adapter serializes calls per file; nothing here locks.

use std::fs::File;
use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::pool::WorkerPool;
use crate::pool::job::{
    CompleteJob, CopyPartJob, DownloadJob, JobBatch, StoreJob, UploadPartJob,
};
use crate::sync::Semaphore;

use super::page::{PageList, PageStatus};
use super::sparse::sparse_file_pages;
use super::stat::{StatsFile, StatsFileError, file_inode};
use super::upload::{ByteRange, PartKind};

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("stats sidecar error: {0}")]
    Stats(#[from] StatsFileError),

    #[error("IO error on cache file: {0}")]
    Io(#[from] io::Error),

    #[error("{failed} of {total} {what} jobs failed")]
    JobsFailed {
        what: &'static str,
        failed: usize,
        total: usize,
    },

    #[error("worker pool rejected the job")]
    PoolUnavailable,
}

/// One open file's cache state.
pub struct CacheEntity {
    key: String,
    file: Arc<File>,
    inode: u64,
    pages: PageList,
    stats: StatsFile,
    min_part_size: i64,
    max_part_size: i64,
}

impl CacheEntity {
    /// Bind the cache state for `key` to an open cache file.
    ///
    /// The recorded page table is loaded from the sidecar when it exists,
    /// is bound to the right inode and matches the file's size; otherwise
    /// the state falls back to "nothing loaded". With the sanity check
    /// enabled, a table that contradicts the file's physical hole/data map
    /// is replaced by the map itself.
    pub fn open(
        key: impl Into<String>,
        file: File,
        stats: StatsFile,
        config: &CacheConfig,
    ) -> Result<Self, EntityError> {
        let key = key.into();
        let inode = file_inode(&file)?;
        let size = file.metadata()?.len() as i64;

        let mut pages = PageList::default();
        match stats.load(&mut pages, inode) {
            Ok(()) => {
                if pages.size() != size {
                    debug!(
                        key = %key,
                        recorded = pages.size(),
                        actual = size,
                        "stats size differs from cache file; starting unloaded"
                    );
                    pages.init(size, false, false);
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "unusable stats sidecar; starting unloaded");
                stats.remove()?;
                pages.init(size, false, false);
            }
        }

        if config.check_cache_on_open {
            let report = pages.reconcile(&file, size);
            if !report.errors.is_empty() {
                warn!(
                    key = %key,
                    errors = report.errors.len(),
                    "page table claims data over holes; rebuilding from the file"
                );
                pages = Self::pages_from_probe(&file, size)?;
            } else if !report.warnings.is_empty() {
                warn!(
                    key = %key,
                    warnings = report.warnings.len(),
                    "cache file holds data the page table does not claim"
                );
            }
        }

        Ok(Self {
            key,
            file: Arc::new(file),
            inode,
            pages,
            stats,
            min_part_size: config.min_part_bytes(),
            max_part_size: config.max_part_bytes(),
        })
    }

    /// The objective page table derived from the file's hole/data map.
    fn pages_from_probe(file: &File, size: i64) -> Result<PageList, EntityError> {
        let mut pages = PageList::with_size(size, false, false);
        let probe = sparse_file_pages(file, size)
            .map_err(|e| EntityError::Io(io::Error::other(e)))?;
        for seg in probe.iter().filter(|seg| seg.loaded) {
            pages.set_status(seg.offset, seg.bytes, PageStatus::Loaded, false);
        }
        pages.compress();
        Ok(pages)
    }

    pub fn pages(&self) -> &PageList {
        &self.pages
    }

    pub fn size(&self) -> i64 {
        self.pages.size()
    }

    pub fn is_modified(&self) -> bool {
        self.pages.is_modified()
    }

    /// Fan a batch of jobs out to the pool and wait for all of them.
    fn run_batch(
        &self,
        pool: &WorkerPool,
        jobs: Vec<StoreJob>,
        batch: &JobBatch,
        what: &'static str,
    ) -> Result<(), EntityError> {
        let done = Arc::new(Semaphore::new(0));
        let mut queued = 0;
        let mut refused = false;
        for job in jobs {
            if pool.instruct(job, Arc::clone(&done)) {
                queued += 1;
            } else {
                refused = true;
                break;
            }
        }
        for _ in 0..queued {
            done.acquire();
        }
        if refused {
            return Err(EntityError::PoolUnavailable);
        }
        let failed = batch.failures();
        if failed > 0 {
            return Err(EntityError::JobsFailed {
                what,
                failed,
                total: queued,
            });
        }
        Ok(())
    }

    fn download_jobs(&self, ranges: &[ByteRange], batch: &Arc<JobBatch>) -> Vec<StoreJob> {
        ranges
            .iter()
            .map(|range| {
                StoreJob::Download(DownloadJob {
                    key: self.key.clone(),
                    range: *range,
                    file: Arc::clone(&self.file),
                    batch: Arc::clone(batch),
                })
            })
            .collect()
    }

    /// Make sure `[start, start + bytes)` is present in the cache file,
    /// downloading whatever is missing. Ranges written locally are already
    /// authoritative and are never fetched.
    pub fn ensure_loaded(
        &mut self,
        pool: &WorkerPool,
        start: i64,
        bytes: i64,
    ) -> Result<(), EntityError> {
        let mut need = Vec::new();
        self.pages.collect_unloaded(start, bytes, &mut need);
        if need.is_empty() {
            return Ok(());
        }

        let ranges: Vec<ByteRange> = need.iter().map(|page| ByteRange::from(*page)).collect();
        let batch = JobBatch::new();
        self.run_batch(pool, self.download_jobs(&ranges, &batch), &batch, "download")?;

        for range in &ranges {
            self.pages
                .set_status(range.offset, range.bytes, PageStatus::Loaded, false);
        }
        self.pages.compress();
        Ok(())
    }

    /// Record a local write of `[start, start + bytes)`. The adapter has
    /// already put the bytes into the cache file.
    pub fn mark_written(&mut self, start: i64, bytes: i64) {
        self.pages
            .set_status(start, bytes, PageStatus::LoadedModified, true);
    }

    /// Truncate the cache file and the page table to `size`.
    pub fn truncate(&mut self, size: i64) -> Result<(), EntityError> {
        self.file.set_len(size as u64)?;
        self.pages.resize(size, false, true);
        self.stats.save(&self.pages, self.inode)?;
        Ok(())
    }

    /// Commit all local changes to the object store as one multi-part
    /// upload under `upload_id`, then persist the cleaned page table.
    pub fn flush(&mut self, pool: &WorkerPool, upload_id: &str) -> Result<(), EntityError> {
        if !self.pages.is_modified() {
            return Ok(());
        }

        let plan = self
            .pages
            .multipart_plan(self.min_part_size, self.max_part_size);
        debug!(
            key = %self.key,
            downloads = plan.downloads.len(),
            parts = plan.parts.len(),
            "flush planned"
        );

        // Download the padding ranges first: every PUT part must be backed
        // by real bytes before it is read from the cache file.
        if !plan.downloads.is_empty() {
            let batch = JobBatch::new();
            self.run_batch(
                pool,
                self.download_jobs(&plan.downloads, &batch),
                &batch,
                "download",
            )?;
            for range in &plan.downloads {
                self.pages
                    .set_status(range.offset, range.bytes, PageStatus::Loaded, false);
            }
            self.pages.compress();
        }

        if !plan.parts.is_empty() {
            let etags = Arc::new(Mutex::new(Vec::new()));
            let batch = JobBatch::new();
            let jobs: Vec<StoreJob> = plan
                .parts
                .iter()
                .enumerate()
                .map(|(idx, part)| {
                    let part_number = (idx + 1) as u16;
                    match part.kind {
                        PartKind::Put => StoreJob::UploadPart(UploadPartJob {
                            key: self.key.clone(),
                            upload_id: upload_id.to_owned(),
                            part_number,
                            range: part.range,
                            file: Arc::clone(&self.file),
                            etags: Arc::clone(&etags),
                            batch: Arc::clone(&batch),
                        }),
                        PartKind::Copy => StoreJob::CopyPart(CopyPartJob {
                            key: self.key.clone(),
                            upload_id: upload_id.to_owned(),
                            part_number,
                            range: part.range,
                            etags: Arc::clone(&etags),
                            batch: Arc::clone(&batch),
                        }),
                    }
                })
                .collect();
            let total = jobs.len();
            self.run_batch(pool, jobs, &batch, "upload")?;

            let complete_batch = JobBatch::new();
            if !pool.await_instruct(StoreJob::Complete(CompleteJob {
                key: self.key.clone(),
                upload_id: upload_id.to_owned(),
                etags,
                batch: Arc::clone(&complete_batch),
            })) {
                return Err(EntityError::PoolUnavailable);
            }
            if complete_batch.failures() > 0 {
                return Err(EntityError::JobsFailed {
                    what: "complete",
                    failed: complete_batch.failures(),
                    total: 1,
                });
            }
            info!(key = %self.key, parts = total, "multi-part upload committed");
        }

        self.pages.clear_modified();
        self.stats.save(&self.pages, self.inode)?;
        Ok(())
    }

    /// Persist the page table on close.
    pub fn release(&mut self) -> Result<(), EntityError> {
        self.stats.save(&self.pages, self.inode)?;
        Ok(())
    }
}
