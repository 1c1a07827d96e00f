//! Sparse-file probing and reconciliation.
//!
//! The cache file is sparse: ranges that were never downloaded are holes.
//! The kernel's hole/data map is therefore an independent record of what
//! the file physically holds, and comparing it against the page table
//! catches corruption (a range claimed loaded that is actually a hole) and
//! stale leftovers (data where the table claims nothing was written).

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt as _;

use nix::unistd::{Whence, lseek};
use thiserror::Error;
use tracing::{error, warn};

use super::page::{Page, PageList};

/// Read granularity of the zero-area check.
const ZERO_CHECK_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum SparseProbeError {
    /// Neither a hole nor data could be located from offset 0.
    #[error("could not locate either hole or data from offset 0")]
    Unprobeable,
}

/// Derive the physical hole/data partition of an open cache file.
///
/// Returns a gap-free page list covering `[0, file_size)` where `loaded`
/// marks data segments and holes are unloaded; `modified` is never set. A
/// filesystem without hole support reports one data segment covering the
/// whole file, which is a valid (if uninformative) answer.
pub fn sparse_file_pages(file: &File, file_size: i64) -> Result<Vec<Page>, SparseProbeError> {
    if file_size == 0 {
        return Ok(Vec::new());
    }

    let hole_pos = lseek(file, 0, Whence::SeekHole).ok();
    let data_pos = lseek(file, 0, Whence::SeekData).ok();
    let mut in_hole = match (hole_pos, data_pos) {
        (None, None) => return Err(SparseProbeError::Unprobeable),
        (None, Some(_)) => false,
        (Some(_), None) => true,
        // Whichever lies at the smaller position is what offset 0 is in.
        (Some(hole), Some(data)) => hole < data,
    };

    let mut pages = Vec::new();
    let mut cur: i64 = 0;
    while cur < file_size {
        let seek_to = if in_hole {
            Whence::SeekData
        } else {
            Whence::SeekHole
        };
        // Failure to find the next transition means the current segment
        // runs to end-of-file.
        let next = lseek(file, cur, seek_to).map_or(file_size, |pos| pos.min(file_size));
        if next > cur {
            pages.push(Page::new(cur, next - cur, !in_hole, false));
            cur = next;
        }
        in_hole = !in_hole;
    }
    Ok(pages)
}

/// Confirm that `[start, start + bytes)` of the file reads as all zeros.
fn is_zero_area(file: &File, start: i64, bytes: i64) -> io::Result<bool> {
    let mut buf = [0u8; ZERO_CHECK_CHUNK];
    let mut done: i64 = 0;
    while done < bytes {
        let want = usize::try_from(bytes - done)
            .unwrap_or(usize::MAX)
            .min(ZERO_CHECK_CHUNK);
        let got = file.read_at(&mut buf[..want], (start + done) as u64)?;
        if got == 0 {
            // Short file; nothing further to inspect.
            break;
        }
        if buf[..got].iter().any(|b| *b != 0) {
            return Ok(false);
        }
        done += got as i64;
    }
    Ok(true)
}

/// Why a reconciliation warning was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnReason {
    /// The unclaimed range holds non-zero bytes.
    NonZeroData,
    /// The unclaimed range could not be read, so its content is unknown.
    ReadFailed,
}

/// A range the page table claims nothing about, yet the file holds data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarnArea {
    pub page: Page,
    pub reason: WarnReason,
}

/// Outcome of comparing a page table against the file's hole/data map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ranges claimed loaded or modified that are physically holes.
    pub errors: Vec<Page>,
    /// Unclaimed ranges that hold (or may hold) data.
    pub warnings: Vec<WarnArea>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Compare one stored page against the probe segments it overlaps,
/// appending findings to the report.
fn check_area(check: &Page, sparse: &[Page], file: &File, report: &mut ReconcileReport) {
    for seg in sparse {
        if seg.next() <= check.offset {
            continue;
        }
        if check.next() <= seg.offset {
            // Segments are ordered; nothing further overlaps.
            break;
        }
        let start = check.offset.max(seg.offset);
        let bytes = check.next().min(seg.next()) - start;

        if check.loaded || check.modified {
            // A claimed range must be physically present.
            if !seg.loaded {
                report.errors.push(Page::new(start, bytes, false, false));
            }
        } else if seg.loaded {
            // An unclaimed range should be a hole; data is tolerable only
            // if it is all zeros (block-boundary spillover).
            match is_zero_area(file, start, bytes) {
                Ok(true) => {}
                Ok(false) => report.warnings.push(WarnArea {
                    page: Page::new(start, bytes, true, false),
                    reason: WarnReason::NonZeroData,
                }),
                Err(e) => {
                    warn!(
                        error = ?e,
                        start,
                        bytes,
                        "could not read cache file while checking unclaimed area"
                    );
                    report.warnings.push(WarnArea {
                        page: Page::new(start, bytes, true, false),
                        reason: WarnReason::ReadFailed,
                    });
                }
            }
        }
    }
}

impl PageList {
    /// Compare this page table against the physical layout of the cache
    /// file. The table itself is never mutated.
    ///
    /// A failed probe yields a single error page covering the whole file.
    pub fn reconcile(&self, file: &File, file_size: i64) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let sparse = match sparse_file_pages(file, file_size) {
            Ok(sparse) => sparse,
            Err(e) => {
                error!(error = %e, "failed to probe hole/data layout of the cache file");
                report.errors.push(Page::new(0, file_size, false, false));
                return report;
            }
        };

        for page in self.pages() {
            check_area(page, &sparse, file, &mut report);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_file_with(content: &[u8]) -> File {
        let mut file = tempfile::tempfile().expect("create temp file");
        file.write_all(content).expect("write temp file");
        file
    }

    #[test]
    fn zero_file_has_no_segments() {
        let file = temp_file_with(b"");
        assert_eq!(sparse_file_pages(&file, 0).unwrap(), Vec::new());
    }

    #[test]
    fn fully_written_file_is_one_data_segment() {
        let file = temp_file_with(&[7u8; 8192]);
        let segments = sparse_file_pages(&file, 8192).unwrap();
        assert_eq!(segments, vec![Page::new(0, 8192, true, false)]);
    }

    #[test]
    fn is_zero_area_detects_nonzero() {
        let mut content = vec![0u8; 64 * 1024];
        content[40 * 1024] = 1;
        let file = temp_file_with(&content);

        assert!(is_zero_area(&file, 0, 16 * 1024).unwrap());
        assert!(!is_zero_area(&file, 0, 64 * 1024).unwrap());
        assert!(!is_zero_area(&file, 40 * 1024, 1).unwrap());
    }

    #[test]
    fn clean_file_reconciles_clean() {
        let file = temp_file_with(&[1u8; 4096]);
        let list = PageList::with_size(4096, true, false);
        let report = list.reconcile(&file, 4096);
        assert!(report.is_clean(), "unexpected findings: {report:?}");
    }

    #[test]
    fn zero_spillover_is_ignored() {
        // Data present on disk, but all zero: the unclaimed table entry is
        // acceptable.
        let file = temp_file_with(&[0u8; 4096]);
        let list = PageList::with_size(4096, false, false);
        let report = list.reconcile(&file, 4096);
        assert!(report.is_clean(), "unexpected findings: {report:?}");
    }

    #[test]
    fn nonzero_unclaimed_data_warns() {
        let file = temp_file_with(&[9u8; 4096]);
        let list = PageList::with_size(4096, false, false);
        let report = list.reconcile(&file, 4096);
        assert!(report.errors.is_empty());
        assert_eq!(
            report.warnings,
            vec![WarnArea {
                page: Page::new(0, 4096, true, false),
                reason: WarnReason::NonZeroData,
            }]
        );
    }
}
