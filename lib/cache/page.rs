//! Page-state tracking for one cached file.
//!
//! A [`PageList`] partitions the logical byte range `[0, size)` of a cache
//! file into contiguous [`Page`]s, each carrying a `loaded` flag (the bytes
//! match the remote object) and a `modified` flag (the bytes were written
//! locally and not yet committed). The list is always gap-free, ordered and
//! non-overlapping; every public operation restores that shape before
//! returning.

use tracing::debug;

/// One contiguous byte range of a cache file.
///
/// `offset` and `bytes` are signed 64-bit byte counts to match the OS file
/// offset type. A zero-length page is only ever valid as the single entry
/// describing an empty file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    /// Byte offset of the range within the file.
    pub offset: i64,
    /// Length of the range in bytes.
    pub bytes: i64,
    /// The cache file holds the remote object's bytes for this range.
    pub loaded: bool,
    /// The range was written locally and differs from the remote object.
    pub modified: bool,
}

impl Page {
    pub fn new(offset: i64, bytes: i64, loaded: bool, modified: bool) -> Self {
        Self {
            offset,
            bytes,
            loaded,
            modified,
        }
    }

    /// Offset one past the last byte of the range.
    pub fn next(&self) -> i64 {
        self.offset + self.bytes
    }
}

/// The four load/modify states a range can be set to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Not fetched from the object store and not written locally.
    Unloaded,
    /// Cache bytes equal the remote bytes.
    Loaded,
    /// Written locally; the cache file does not hold the bytes.
    Modified,
    /// Written locally; the cache file holds the written bytes.
    LoadedModified,
}

impl PageStatus {
    /// Expand the status into its `(loaded, modified)` flag pair.
    pub fn flags(self) -> (bool, bool) {
        match self {
            PageStatus::Unloaded => (false, false),
            PageStatus::Loaded => (true, false),
            PageStatus::Modified => (false, true),
            PageStatus::LoadedModified => (true, true),
        }
    }
}

/// Which flags a compression pass compares, and what the ignored flag is
/// rewritten to in the output.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FlagFilter {
    /// Merge neighbors only when both flags agree.
    Both,
    /// Merge by `modified` alone; every output page gets `loaded = default`.
    IgnoreLoad { default_load: bool },
    /// Merge by `loaded` alone; every output page gets `modified = default`.
    IgnoreModify { default_modify: bool },
}

impl FlagFilter {
    fn apply(self, mut page: Page) -> Page {
        match self {
            FlagFilter::Both => {}
            FlagFilter::IgnoreLoad { default_load } => page.loaded = default_load,
            FlagFilter::IgnoreModify { default_modify } => page.modified = default_modify,
        }
        page
    }

    /// Whether any flag this filter compares is set on `page`.
    fn any_considered_set(self, page: &Page) -> bool {
        match self {
            FlagFilter::Both => page.loaded || page.modified,
            FlagFilter::IgnoreLoad { .. } => page.modified,
            FlagFilter::IgnoreModify { .. } => page.loaded,
        }
    }
}

/// Rebuild `pages` into a compressed list: zero-length pages are dropped,
/// adjacent pages with equal (considered) flags are merged, and any internal
/// gap is repaired: absorbed into an unflagged predecessor, or filled with
/// a fresh `(false, false)` page when the predecessor carries a flag.
///
/// Gaps only arise from external misuse; the repair keeps the coverage
/// invariant intact instead of propagating the damage.
pub(crate) fn compress_pages(pages: &[Page], filter: FlagFilter) -> Vec<Page> {
    let mut out: Vec<Page> = Vec::with_capacity(pages.len());

    for page in pages {
        if page.bytes == 0 {
            continue;
        }
        let cur = filter.apply(*page);

        let Some(last) = out.last_mut() else {
            out.push(cur);
            continue;
        };

        if last.next() != cur.offset {
            if filter.any_considered_set(last) {
                let filler = filter.apply(Page::new(
                    last.next(),
                    cur.offset - last.next(),
                    false,
                    false,
                ));
                out.push(filler);
            } else {
                last.bytes = cur.offset - last.offset;
            }
        }

        let last = out.last_mut().expect("output is non-empty here");
        if last.loaded == cur.loaded && last.modified == cur.modified {
            last.bytes += cur.bytes;
        } else {
            out.push(cur);
        }
    }
    out
}

/// Ordered, gap-free page table of one cached file.
///
/// Not internally synchronized: the caller serializes access per file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageList {
    pages: Vec<Page>,
    /// The logical size was truncated downward and the truncation has not
    /// yet been committed to the remote object. Truncation cannot be
    /// expressed as a modified page (the bytes are gone), so it is carried
    /// here until the next commit.
    shrunk: bool,
}

impl PageList {
    /// A list describing a file of `size` bytes in one uniform state.
    pub fn with_size(size: i64, loaded: bool, modified: bool) -> Self {
        let mut list = Self::default();
        list.init(size, loaded, modified);
        list
    }

    /// Replace all state with a single page `(0, size)` carrying the given
    /// flags. A negative `size` yields an empty list. Clears the shrunk
    /// flag.
    pub fn init(&mut self, size: i64, loaded: bool, modified: bool) {
        self.clear();
        if size >= 0 {
            self.pages.push(Page::new(0, size, loaded, modified));
        }
    }

    /// Drop every page and the shrunk flag.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.shrunk = false;
    }

    /// The logical size covered by the list.
    pub fn size(&self) -> i64 {
        self.pages.last().map_or(0, Page::next)
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn is_shrunk(&self) -> bool {
        self.shrunk
    }

    /// Merge equal-flag neighbors and repair any internal gap. Idempotent.
    /// A single zero-length page (empty file) is left alone.
    pub fn compress(&mut self) {
        if self.pages.len() == 1 && self.pages[0].bytes == 0 {
            return;
        }
        self.pages = compress_pages(&self.pages, FlagFilter::Both);
    }

    /// Grow or shrink the logical size.
    ///
    /// Growing appends one page `(old_size, size - old_size)` with the given
    /// flags. Shrinking drops pages wholly past `size`, shortens a
    /// straddler, and records the shrink when `modified` is passed (an
    /// intentional truncation that must reach the remote object). Resizing
    /// an empty list behaves like [`PageList::init`] except that the shrunk
    /// flag is preserved.
    pub fn resize(&mut self, size: i64, loaded: bool, modified: bool) {
        let total = self.size();

        if total == 0 {
            let shrunk = self.shrunk;
            self.init(size, loaded, modified);
            self.shrunk = shrunk;
        } else if total < size {
            self.pages.push(Page::new(total, size - total, loaded, modified));
        } else if size < total {
            self.pages.retain_mut(|page| {
                if page.next() <= size {
                    true
                } else if size <= page.offset {
                    false
                } else {
                    page.bytes = size - page.offset;
                    true
                }
            });
            if modified {
                self.shrunk = true;
            }
        }
        self.compress();
    }

    /// Split the page containing `pos` at `pos`, producing two adjacent
    /// pages with identical flags. A `pos` that already is a page boundary
    /// is a no-op. Returns `false` when `pos` lies outside the list.
    pub fn split_at(&mut self, pos: i64) -> bool {
        for idx in 0..self.pages.len() {
            let page = self.pages[idx];
            if pos == page.offset {
                return true;
            }
            if page.offset < pos && pos < page.next() {
                let head = Page::new(page.offset, pos - page.offset, page.loaded, page.modified);
                let tail = &mut self.pages[idx];
                tail.bytes -= pos - tail.offset;
                tail.offset = pos;
                self.pages.insert(idx, head);
                return true;
            }
        }
        false
    }

    /// Set the state of `[start, start + bytes)`.
    ///
    /// A range reaching past the current end extends the list: the gap from
    /// the old end to `start` becomes `(false, false)`, the new range takes
    /// the requested flags. `compress` is optional so a caller replaying
    /// many ranges can defer the merge pass.
    pub fn set_status(&mut self, start: i64, bytes: i64, status: PageStatus, compress: bool) {
        let total = self.size();
        let (loaded, modified) = status.flags();

        if total <= start {
            if total < start {
                self.resize(start, false, false);
            }
            self.resize(start + bytes, loaded, modified);
        } else if total <= start + bytes {
            // Cut back to start (existing flags keep their meaning up to
            // there), then regrow the tail with the requested flags.
            self.resize(start, false, false);
            self.resize(start + bytes, loaded, modified);
        } else {
            self.split_at(start);
            self.split_at(start + bytes);
            for page in &mut self.pages {
                if page.next() <= start {
                    continue;
                }
                if start + bytes <= page.offset {
                    break;
                }
                page.loaded = loaded;
                page.modified = modified;
            }
        }

        if compress {
            self.compress();
        }
    }

    /// Whether every page intersecting `[start, start + bytes)` is loaded.
    /// `bytes == 0` means "to the end of the list".
    pub fn is_loaded(&self, start: i64, bytes: i64) -> bool {
        for page in &self.pages {
            if page.next() <= start {
                continue;
            }
            if !page.loaded {
                return false;
            }
            if bytes != 0 && start + bytes <= page.next() {
                break;
            }
        }
        true
    }

    /// The first page at or after `start` that is neither loaded nor
    /// modified.
    pub fn find_unloaded(&self, start: i64) -> Option<Page> {
        self.pages
            .iter()
            .find(|page| start < page.next() && !page.loaded && !page.modified)
            .copied()
    }

    /// Total bytes of `[start, start + bytes)` lying in unloaded-unmodified
    /// pages. Pages whose own full length is at least `limit` are excluded
    /// when `limit > 0`. `bytes == 0` means "to the end of the list".
    pub fn unloaded_bytes(&self, start: i64, mut bytes: i64, limit: i64) -> i64 {
        if bytes == 0 && start < self.size() {
            bytes = self.size() - start;
        }
        let stop = start + bytes;

        let mut total = 0;
        for page in &self.pages {
            if page.next() <= start {
                continue;
            }
            if stop <= page.offset {
                break;
            }
            if page.loaded || page.modified {
                continue;
            }
            let span = page.next().min(stop) - page.offset.max(start);
            if limit == 0 || page.bytes < limit {
                total += span;
            }
        }
        total
    }

    /// Append the unloaded-unmodified ranges of `[start, start + bytes)` to
    /// `out`, clipped to the range; an appended range adjacent to the last
    /// entry is merged into it. `bytes == 0` means "to the end of the
    /// list".
    pub fn collect_unloaded(&self, start: i64, mut bytes: i64, out: &mut Vec<Page>) {
        if bytes == 0 && start < self.size() {
            bytes = self.size() - start;
        }
        let stop = start + bytes;

        for page in &self.pages {
            if page.next() <= start {
                continue;
            }
            if stop <= page.offset {
                break;
            }
            if page.loaded || page.modified {
                continue;
            }

            let clip_start = page.offset.max(start);
            let clip_bytes = page.next().min(stop) - clip_start;

            match out.last_mut() {
                Some(last) if last.next() == clip_start => last.bytes += clip_bytes,
                _ => out.push(Page::new(clip_start, clip_bytes, false, false)),
            }
        }
    }

    /// Compressed list of the unmodified pages intersecting
    /// `[start, start + bytes)`, clipped to the range. `bytes == 0` means
    /// "to the end of the list". Used by the flush path to find the ranges
    /// that carry no local changes.
    pub fn unmodified_pages(&mut self, start: i64, bytes: i64) -> Vec<Page> {
        self.compress();

        let stop = if bytes == 0 { i64::MAX } else { start + bytes };
        let mut collected: Vec<Page> = Vec::new();
        for page in &self.pages {
            if page.next() < start {
                continue;
            }
            if stop <= page.offset {
                break;
            }
            if page.modified {
                continue;
            }

            let clip_start = page.offset.max(start);
            let clip_next = page.next().min(stop);
            let clipped = Page::new(clip_start, clip_next - clip_start, page.loaded, false);

            // Merge contiguous equal-flag runs only; a gap here is a
            // modified region and must stay absent from the result.
            match collected.last_mut() {
                Some(last)
                    if last.next() == clipped.offset && last.loaded == clipped.loaded =>
                {
                    last.bytes += clipped.bytes;
                }
                _ => collected.push(clipped),
            }
        }
        collected.retain(|page| page.bytes > 0);
        collected
    }

    /// Total bytes across all modified pages.
    pub fn modified_bytes(&self) -> i64 {
        self.pages
            .iter()
            .filter(|page| page.modified)
            .map(|page| page.bytes)
            .sum()
    }

    /// Whether any local change (modified page or uncommitted shrink) is
    /// pending.
    pub fn is_modified(&self) -> bool {
        self.shrunk || self.pages.iter().any(|page| page.modified)
    }

    /// Drop every modified flag and the shrunk flag, then compress.
    pub fn clear_modified(&mut self) {
        self.shrunk = false;
        for page in &mut self.pages {
            page.modified = false;
        }
        self.compress();
    }

    /// Log the page table at debug level.
    pub fn dump(&self) {
        debug!(shrunk = self.shrunk, "page table");
        for (idx, page) in self.pages.iter().enumerate() {
            debug!(
                idx,
                offset = page.offset,
                bytes = page.bytes,
                loaded = page.loaded,
                modified = page.modified,
                "page"
            );
        }
    }
}
