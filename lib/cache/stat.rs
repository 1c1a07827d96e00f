//! Stats sidecar persistence.
//!
//! Each cache file has a text sidecar recording its page table and the
//! inode it belongs to:
//!
//! ```text
//! <inode>:<size>
//! <offset>:<length>:<loaded 0|1>:<modified 0|1>
//! ...
//! ```
//!
//! A legacy header of just `<size>` (no inode) is still read, as are
//! three-field lines without the modified flag; newly written files always
//! use the current form. A sidecar bound to a different inode than the
//! cache file is refused: the cache file was replaced underneath it and
//! the recorded state describes somebody else's bytes.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error};

use super::page::{PageList, PageStatus};

/// Suffix of every sidecar file.
const STATS_SUFFIX: &str = ".stat";

#[derive(Debug, Error)]
pub enum StatsFileError {
    /// The sidecar belongs to a different cache file generation.
    #[error("stats file is bound to inode {found}, expected {expected}")]
    InodeMismatch { expected: u64, found: u64 },

    /// The sidecar text could not be parsed.
    #[error("malformed stats file: {0}")]
    Malformed(&'static str),

    /// The page lines do not add up to the header size.
    #[error("stats header claims size {header} but pages reconstruct to {actual}")]
    SizeMismatch { header: i64, actual: i64 },

    /// An IO error occurred while reading or writing the sidecar.
    #[error("IO error on stats file: {0}")]
    Io(#[from] io::Error),
}

/// The inode number of an open file.
pub fn file_inode(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.ino())
}

impl PageList {
    /// Encode the list in the sidecar text format.
    pub fn to_stats_string(&self, inode: u64) -> String {
        let mut out = format!("{inode}:{}", self.size());
        for page in self.pages() {
            out.push_str(&format!(
                "\n{}:{}:{}:{}",
                page.offset,
                page.bytes,
                u8::from(page.loaded),
                u8::from(page.modified)
            ));
        }
        out
    }

    /// Rebuild the list from sidecar text.
    ///
    /// On any failure the list is left cleared, never half-loaded.
    pub fn load_stats_string(&mut self, text: &str, inode: u64) -> Result<(), StatsFileError> {
        self.clear();

        let mut lines = text.lines();
        let Some(head) = lines.next() else {
            // Empty sidecar: a fresh, empty file.
            self.init(0, false, false);
            return Ok(());
        };

        let header_size = match head.split_once(':') {
            // Current header: <inode>:<size>.
            Some((inode_field, size_field)) => {
                let bound_inode: u64 = inode_field
                    .parse()
                    .map_err(|_| StatsFileError::Malformed("unparseable inode"))?;
                if bound_inode == 0 {
                    return Err(StatsFileError::Malformed("zero inode in header"));
                }
                if bound_inode != inode {
                    return Err(StatsFileError::InodeMismatch {
                        expected: inode,
                        found: bound_inode,
                    });
                }
                size_field
                    .parse()
                    .map_err(|_| StatsFileError::Malformed("unparseable size"))?
            }
            // Legacy header: <size> only, inode unchecked.
            None => head
                .parse()
                .map_err(|_| StatsFileError::Malformed("unparseable size"))?,
        };

        for line in lines {
            match self.apply_stats_line(line) {
                Ok(()) => {}
                Err(e) => {
                    self.clear();
                    return Err(e);
                }
            }
        }

        if header_size != self.size() {
            let actual = self.size();
            self.clear();
            return Err(StatsFileError::SizeMismatch {
                header: header_size,
                actual,
            });
        }
        Ok(())
    }

    fn apply_stats_line(&mut self, line: &str) -> Result<(), StatsFileError> {
        let mut fields = line.split(':');
        let offset: i64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(StatsFileError::Malformed("unparseable page offset"))?;
        let bytes: i64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(StatsFileError::Malformed("unparseable page length"))?;
        let loaded = match fields.next() {
            Some(f) => {
                f.parse::<i64>()
                    .map_err(|_| StatsFileError::Malformed("unparseable loaded flag"))?
                    == 1
            }
            None => return Err(StatsFileError::Malformed("missing loaded flag")),
        };
        // The modified field is absent in legacy sidecars.
        let modified = match fields.next() {
            Some(f) => {
                f.parse::<i64>()
                    .map_err(|_| StatsFileError::Malformed("unparseable modified flag"))?
                    == 1
            }
            None => false,
        };

        let status = match (loaded, modified) {
            (false, false) => PageStatus::Unloaded,
            (true, false) => PageStatus::Loaded,
            (false, true) => PageStatus::Modified,
            (true, true) => PageStatus::LoadedModified,
        };
        self.set_status(offset, bytes, status, true);
        Ok(())
    }
}

/// Handle to the sidecar of one cache file.
#[derive(Debug, Clone)]
pub struct StatsFile {
    path: PathBuf,
}

impl StatsFile {
    /// The sidecar for cache key `key` under `stats_dir`. Keys may contain
    /// path separators; the directory tree is created on first save.
    pub fn new(stats_dir: &Path, key: &str) -> Self {
        Self {
            path: stats_dir.join(format!("{key}{STATS_SUFFIX}")),
        }
    }

    /// A sidecar at an explicit path.
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the sidecar with the current page table.
    pub fn save(&self, list: &PageList, inode: u64) -> Result<(), StatsFileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, list.to_stats_string(inode)).map_err(|e| {
            error!(error = ?e, path = ?self.path, "failed to write stats file");
            StatsFileError::Io(e)
        })?;
        debug!(path = ?self.path, inode, "stats file saved");
        Ok(())
    }

    /// Load the page table from the sidecar.
    ///
    /// A missing sidecar is not an error: the file simply has no recorded
    /// state yet, and the list is initialized empty.
    pub fn load(&self, list: &mut PageList, inode: u64) -> Result<(), StatsFileError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                list.init(0, false, false);
                return Ok(());
            }
            Err(e) => {
                error!(error = ?e, path = ?self.path, "failed to read stats file");
                return Err(StatsFileError::Io(e));
            }
        };
        list.load_stats_string(&text, inode)
    }

    /// Delete the sidecar. Already being gone is fine.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
