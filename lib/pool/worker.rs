//! The production store worker.
//!
//! Wraps a [`BlobStore`] over the blocking `ureq` backend. One instance
//! lives per worker thread; the HTTP agent's connection cache is reused
//! across jobs and dropped with the worker at thread exit.

use std::os::unix::fs::FileExt as _;
use std::sync::Mutex;
use std::time::Duration;

use blobstore::{BlobStore, HttpClient, PartEtag, StoreError, UreqClient};
use bytes::Bytes;
use tracing::{debug, warn};

use super::StoreWorker;
use super::job::StoreJob;

/// Executes [`StoreJob`]s against a real object store.
pub struct BlobStoreWorker {
    store: BlobStore<UreqClient>,
}

impl BlobStoreWorker {
    pub fn new(store: BlobStore<UreqClient>) -> Self {
        Self { store }
    }

    /// Fresh worker with its own HTTP agent. Intended as the pool factory:
    /// each call builds the one handle a worker thread will own.
    pub fn connect(endpoint: &str, bucket: &str, timeout: Duration) -> Self {
        Self::new(BlobStore::new(UreqClient::new(timeout), endpoint, bucket))
    }

    fn push_etag(etags: &Mutex<Vec<PartEtag>>, part_number: u16, etag: String) {
        etags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PartEtag { part_number, etag });
    }

    fn take_parts(etags: &Mutex<Vec<PartEtag>>) -> Vec<PartEtag> {
        let mut parts = etags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        parts.sort_by_key(|part| part.part_number);
        parts
    }
}

impl StoreWorker for BlobStoreWorker {
    fn reset(&mut self) -> bool {
        self.store.client_mut().reset();
        true
    }

    fn execute(&mut self, job: &StoreJob) -> Result<(), StoreError> {
        match job {
            StoreJob::Download(dl) => {
                let body = self
                    .store
                    .get_object_range(&dl.key, dl.range.offset, dl.range.bytes)?;
                if body.len() as i64 != dl.range.bytes {
                    warn!(
                        key = %dl.key,
                        expected = dl.range.bytes,
                        got = body.len(),
                        "ranged download returned unexpected length"
                    );
                }
                dl.file.write_all_at(&body, dl.range.offset as u64)?;
                debug!(key = %dl.key, offset = dl.range.offset, bytes = dl.range.bytes, "range downloaded");
                Ok(())
            }
            StoreJob::UploadPart(up) => {
                let mut buf = vec![0u8; up.range.bytes as usize];
                up.file.read_exact_at(&mut buf, up.range.offset as u64)?;
                let etag = self.store.upload_part(
                    &up.key,
                    &up.upload_id,
                    up.part_number,
                    Bytes::from(buf),
                )?;
                Self::push_etag(&up.etags, up.part_number, etag);
                Ok(())
            }
            StoreJob::CopyPart(cp) => {
                let etag = self.store.upload_part_copy(
                    &cp.key,
                    &cp.upload_id,
                    cp.part_number,
                    cp.range.offset,
                    cp.range.bytes,
                )?;
                Self::push_etag(&cp.etags, cp.part_number, etag);
                Ok(())
            }
            StoreJob::Complete(fin) => {
                let parts = Self::take_parts(&fin.etags);
                self.store
                    .complete_multipart_upload(&fin.key, &fin.upload_id, &parts)
            }
        }
    }

    fn disconnect(&mut self) {
        debug!("store worker disconnected");
    }
}
