//! Multi-part upload planning.
//!
//! The object store accepts a committed file as an ordered sequence of
//! parts, each either uploaded from local bytes (PUT) or copied
//! server-side from the existing remote object (COPY), and every non-final
//! part must be at least the protocol's minimum part size. The planner
//! turns a page table into the cheapest such sequence it can form in one
//! left-to-right pass, together with the ranges that must be downloaded
//! first so that every PUT part is backed by real local bytes.

use super::page::{FlagFilter, Page, PageList, compress_pages};

/// A contiguous byte range of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: i64,
    pub bytes: i64,
}

impl ByteRange {
    pub fn new(offset: i64, bytes: i64) -> Self {
        Self { offset, bytes }
    }

    /// Offset one past the last byte of the range.
    pub fn next(&self) -> i64 {
        self.offset + self.bytes
    }
}

impl From<Page> for ByteRange {
    fn from(page: Page) -> Self {
        Self::new(page.offset, page.bytes)
    }
}

/// How one part of a multi-part upload is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    /// Server-side copy from the existing remote object.
    Copy,
    /// Uploaded from the local cache file.
    Put,
}

/// One part of the planned upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPart {
    pub range: ByteRange,
    pub kind: PartKind,
}

/// The full commit plan for a file: ranges to download first, then the
/// ordered part sequence. The parts concatenate to exactly `[0, size)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPlan {
    pub downloads: Vec<ByteRange>,
    pub parts: Vec<UploadPart>,
}

/// Split every modified page into chunks of `max` bytes. While the
/// remaining tail exceeds `2 * max` a full `max` chunk is cut; the final
/// remainder is halved so that neither piece exceeds `max` or drops below
/// `max / 2`. Unmodified pages pass through unchanged.
fn split_by_max(pages: Vec<Page>, max: i64) -> Vec<Page> {
    let mut out = Vec::with_capacity(pages.len());
    for page in pages {
        if !page.modified {
            out.push(page);
            continue;
        }
        let mut start = page.offset;
        let mut rest = page.bytes;
        while rest > 2 * max {
            out.push(Page::new(start, max, page.loaded, page.modified));
            start += max;
            rest -= max;
        }
        if rest > max {
            let head = rest / 2;
            out.push(Page::new(start, head, page.loaded, page.modified));
            start += head;
            rest -= head;
        }
        if rest > 0 {
            out.push(Page::new(start, rest, page.loaded, page.modified));
        }
    }
    out
}

impl PageList {
    /// Plan the multi-part commit of this file.
    ///
    /// `min` is the protocol's minimum part size, `max` the configured
    /// maximum (`max >= 2 * min`). Unmodified runs shorter than `min`
    /// cannot stand alone as COPY parts, so they are scheduled for
    /// download and folded into the neighboring PUT part; a modified run
    /// shorter than `min` is padded with downloaded bytes stolen from the
    /// front of the following unmodified run.
    pub fn multipart_plan(&mut self, min: i64, max: i64) -> UploadPlan {
        self.compress();

        // View of the list keyed by the modified flag alone.
        let modified_pages = compress_pages(
            self.pages(),
            FlagFilter::IgnoreLoad { default_load: false },
        );

        let mut downloads: Vec<Page> = Vec::new();
        let mut mixup: Vec<Page> = Vec::new();

        let mut prev = Page::default();
        for cur in modified_pages {
            match (cur.modified, prev.modified) {
                (true, false) => {
                    if prev.bytes < min {
                        // Too small for a COPY part: download the run and
                        // fold it into the upcoming PUT part.
                        downloads.push(prev);
                        prev.modified = true;
                        mixup.push(prev);
                    } else {
                        mixup.push(prev);
                    }
                    prev = cur;
                }
                (true, true) => prev.bytes += cur.bytes,
                (false, false) => prev.bytes += cur.bytes,
                (false, true) => {
                    if prev.bytes < min {
                        let missing = min - prev.bytes;
                        if missing + min < cur.bytes {
                            // Steal just enough of the unmodified run's
                            // front to pad the PUT part up to `min`; the
                            // remainder stays a COPY candidate.
                            downloads.push(Page::new(cur.offset, missing, false, false));
                            prev.bytes = min;
                            mixup.push(prev);
                            prev = Page::new(
                                cur.offset + missing,
                                cur.bytes - missing,
                                cur.loaded,
                                cur.modified,
                            );
                        } else {
                            // The whole run is consumed by the padding (or
                            // its remainder would itself drop below `min`).
                            downloads.push(cur);
                            prev.bytes += cur.bytes;
                        }
                    } else {
                        mixup.push(prev);
                        prev = cur;
                    }
                }
            }
        }
        if prev.bytes > 0 {
            mixup.push(prev);
        }

        let downloads = compress_pages(
            &downloads,
            FlagFilter::IgnoreModify {
                default_modify: false,
            },
        );
        let mixup = compress_pages(&mixup, FlagFilter::IgnoreLoad { default_load: false });

        let downloads = split_by_max(downloads, max);
        let mixup = split_by_max(mixup, max);

        UploadPlan {
            downloads: downloads.into_iter().map(ByteRange::from).collect(),
            parts: mixup
                .into_iter()
                .map(|page| UploadPart {
                    range: ByteRange::from(page),
                    kind: if page.modified { PartKind::Put } else { PartKind::Copy },
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::page::PageStatus;

    const MIB: i64 = 1024 * 1024;
    const MIN: i64 = 5 * MIB;
    const MAX: i64 = 16 * MIB;

    /// The structural laws every plan must satisfy against its input.
    fn assert_plan_laws(input: &PageList, plan: &UploadPlan, min: i64, max: i64) {
        // Parts concatenate to exactly [0, size) in order.
        let mut pos = 0;
        for part in &plan.parts {
            assert_eq!(part.range.offset, pos, "parts must be gap-free and ordered");
            assert!(part.range.bytes > 0);
            pos = part.range.next();
        }
        assert_eq!(pos, input.size(), "parts must cover the whole file");

        // Every part but the last is at least the minimum part size.
        for part in &plan.parts[..plan.parts.len().saturating_sub(1)] {
            assert!(
                part.range.bytes >= min,
                "non-tail part below minimum: {:?}",
                part
            );
        }

        // PUT parts and downloads never exceed the maximum part size.
        for part in plan.parts.iter().filter(|p| p.kind == PartKind::Put) {
            assert!(part.range.bytes <= max, "oversized PUT part: {part:?}");
        }
        for dl in &plan.downloads {
            assert!(dl.bytes <= max, "oversized download: {dl:?}");
        }

        // Every modified byte of the input lies in a PUT part.
        for page in input.pages().iter().filter(|p| p.modified) {
            for pos in [page.offset, page.next() - 1] {
                let covering = plan
                    .parts
                    .iter()
                    .find(|part| part.range.offset <= pos && pos < part.range.next())
                    .expect("every byte is covered");
                assert_eq!(
                    covering.kind,
                    PartKind::Put,
                    "modified byte {pos} landed in a COPY part"
                );
            }
        }

        // Downloads only ever target bytes that were not modified locally.
        for dl in &plan.downloads {
            for page in input.pages().iter().filter(|p| p.modified) {
                let overlap = dl.offset.max(page.offset) < dl.next().min(page.next());
                assert!(!overlap, "download {dl:?} overlaps modified page {page:?}");
            }
        }
    }

    #[test]
    fn unmodified_file_is_one_copy_part() {
        let mut list = PageList::with_size(20 * MIB, true, false);
        let plan = list.multipart_plan(MIN, MAX);
        assert!(plan.downloads.is_empty());
        assert_eq!(
            plan.parts,
            vec![UploadPart {
                range: ByteRange::new(0, 20 * MIB),
                kind: PartKind::Copy
            }]
        );
    }

    #[test]
    fn empty_file_plans_nothing() {
        let mut list = PageList::with_size(0, false, false);
        let plan = list.multipart_plan(MIN, MAX);
        assert!(plan.downloads.is_empty());
        assert!(plan.parts.is_empty());
    }

    #[test]
    fn small_write_is_padded_from_the_following_run() {
        // 30 MiB file, 1 MiB modified at 10 MiB. The 4 MiB pad comes out
        // of the following run's front; its remainder stays a COPY part.
        let mut list = PageList::with_size(30 * MIB, true, false);
        list.set_status(10 * MIB, MIB, PageStatus::Modified, true);

        let plan = list.multipart_plan(MIN, MAX);
        assert_plan_laws(&list, &plan, MIN, MAX);

        assert_eq!(plan.downloads, vec![ByteRange::new(11 * MIB, 4 * MIB)]);
        assert_eq!(
            plan.parts,
            vec![
                UploadPart {
                    range: ByteRange::new(0, 10 * MIB),
                    kind: PartKind::Copy
                },
                UploadPart {
                    range: ByteRange::new(10 * MIB, 5 * MIB),
                    kind: PartKind::Put
                },
                UploadPart {
                    range: ByteRange::new(15 * MIB, 15 * MIB),
                    kind: PartKind::Copy
                },
            ]
        );
    }

    #[test]
    fn short_following_run_is_absorbed_whole() {
        // The run after the write is too short to survive the padding, so
        // all of it is downloaded and merged into the PUT part.
        let mut list = PageList::with_size(20 * MIB, true, false);
        list.set_status(10 * MIB, MIB, PageStatus::Modified, true);

        let plan = list.multipart_plan(MIN, MAX);
        assert_plan_laws(&list, &plan, MIN, MAX);

        assert_eq!(plan.downloads, vec![ByteRange::new(11 * MIB, 9 * MIB)]);
        assert_eq!(
            plan.parts,
            vec![
                UploadPart {
                    range: ByteRange::new(0, 10 * MIB),
                    kind: PartKind::Copy
                },
                UploadPart {
                    range: ByteRange::new(10 * MIB, 10 * MIB),
                    kind: PartKind::Put
                },
            ]
        );
    }

    #[test]
    fn short_leading_run_becomes_part_of_the_put() {
        // A 1 MiB clean head cannot stand alone as a COPY part.
        let mut list = PageList::with_size(20 * MIB, true, false);
        list.set_status(MIB, 6 * MIB, PageStatus::Modified, true);

        let plan = list.multipart_plan(MIN, MAX);
        assert_plan_laws(&list, &plan, MIN, MAX);

        assert_eq!(plan.downloads, vec![ByteRange::new(0, MIB)]);
        assert_eq!(plan.parts[0].kind, PartKind::Put);
        assert_eq!(plan.parts[0].range, ByteRange::new(0, 7 * MIB));
    }

    #[test]
    fn adjacent_modified_runs_accumulate() {
        let mut list = PageList::with_size(40 * MIB, true, false);
        list.set_status(0, 10 * MIB, PageStatus::Modified, true);
        list.set_status(10 * MIB, 10 * MIB, PageStatus::LoadedModified, true);

        let plan = list.multipart_plan(MIN, MAX);
        assert_plan_laws(&list, &plan, MIN, MAX);

        assert!(plan.downloads.is_empty());
        // The merged 20 MiB PUT run exceeds MAX and is halved.
        assert_eq!(
            plan.parts,
            vec![
                UploadPart {
                    range: ByteRange::new(0, 10 * MIB),
                    kind: PartKind::Put
                },
                UploadPart {
                    range: ByteRange::new(10 * MIB, 10 * MIB),
                    kind: PartKind::Put
                },
                UploadPart {
                    range: ByteRange::new(20 * MIB, 20 * MIB),
                    kind: PartKind::Copy
                },
            ]
        );
    }

    #[test]
    fn oversized_put_parts_are_split() {
        let mut list = PageList::with_size(80 * MIB, true, false);
        list.set_status(0, 70 * MIB, PageStatus::LoadedModified, true);

        let plan = list.multipart_plan(MIN, MAX);
        assert_plan_laws(&list, &plan, MIN, MAX);

        // 70 MiB at MAX = 16 MiB: three 16 MiB chunks, then 22 MiB halved.
        let put_sizes: Vec<i64> = plan
            .parts
            .iter()
            .filter(|p| p.kind == PartKind::Put)
            .map(|p| p.range.bytes)
            .collect();
        assert_eq!(put_sizes, vec![16 * MIB, 16 * MIB, 16 * MIB, 11 * MIB, 11 * MIB]);
    }

    #[test]
    fn fully_modified_file_is_all_put() {
        let mut list = PageList::with_size(12 * MIB, false, true);
        let plan = list.multipart_plan(MIN, MAX);
        assert_plan_laws(&list, &plan, MIN, MAX);
        assert!(plan.downloads.is_empty());
        assert!(plan.parts.iter().all(|p| p.kind == PartKind::Put));
    }

    #[test]
    fn split_by_max_leaves_unmodified_untouched() {
        let pages = vec![Page::new(0, 100 * MIB, true, false)];
        assert_eq!(split_by_max(pages.clone(), MAX), pages);
    }

    mod laws {
        use super::*;
        use proptest::collection::vec;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            /// The plan laws hold for arbitrary page tables and any valid
            /// (min, max) pair.
            #[test]
            fn prop_plan_laws_hold(
                initial in 1_i64..64,
                ops in vec((0_i64..64, 1_i64..32, 0_u8..4), 0..12),
                min in 1_i64..8,
                max_factor in 2_i64..5,
            ) {
                let mut list = PageList::with_size(initial, false, false);
                for (start, bytes, status) in ops {
                    let status = match status {
                        0 => PageStatus::Unloaded,
                        1 => PageStatus::Loaded,
                        2 => PageStatus::Modified,
                        _ => PageStatus::LoadedModified,
                    };
                    list.set_status(start, bytes, status, true);
                }

                let max = min * max_factor;
                let plan = list.clone().multipart_plan(min, max);
                assert_plan_laws(&list, &plan, min, max);
            }
        }
    }
}
