//! Per-entry sanity checks.
//!
//! Structural soundness (size bounds, alignment, region fit) is checked
//! by the raw entry walk in [`crate::index_file::entry_offsets`]; the
//! logical checks here run per entry on top of that.

use crate::digest;
use crate::entry::IndexEntry;
use crate::wall_time;

/// How defective entries are treated while loading an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationMode {
    /// Any defect aborts the load.
    Strict,
    /// Defective entries are dropped.
    Lenient,
    /// All defects are reported, all entries retained.
    Diagnostic,
    /// Entries are retained so a fixer can be run per defect.
    Recovery,
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum EntryDefect {
    #[error("entry size {0} out of bounds")]
    SizeOutOfBounds(u32),
    #[error("entry region truncated")]
    RegionTruncated,
    #[error("entry count mismatch (header says {header}, walked {walked})")]
    CountMismatch { header: u32, walked: u32 },
    #[error("empty path")]
    EmptyPath,
    #[error("path not NUL terminated")]
    UnterminatedPath,
    #[error("path is not valid UTF-8")]
    PathEncoding,
    #[error("file size {0} out of range")]
    FileSizeRange(u64),
    #[error("unknown hash type {0}")]
    UnknownHashType(u16),
    #[error("hash set but hash type unset")]
    HashTypeUnset,
    #[error("hash slot is all zero")]
    ZeroHash,
    #[error("nonzero bytes after hash end")]
    HashPadding,
    #[error("timestamp out of range")]
    TimestampRange,
}

/// A defect found while loading, with enough context to report or fix it.
#[derive(Clone, Debug)]
pub struct Defect {
    pub offset: u64,
    pub path: Option<String>,
    pub defect: EntryDefect,
}

impl std::fmt::Display for Defect {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{:?} (offset {}): {}", path, self.offset, self.defect),
            None => write!(f, "offset {}: {}", self.offset, self.defect),
        }
    }
}

const MAX_FILE_SIZE: u64 = 1 << 62;

/// Logical checks for one structurally sound entry. Returns all defects
/// found, so diagnostic mode can report them in one pass.
pub fn validate_entry(entry: &IndexEntry, now: i64) -> Vec<EntryDefect> {
    let mut defects = Vec::new();

    let tail_len = entry.size as usize - crate::entry::ENTRY_FIXED_SIZE;
    let path = entry.path_bytes();
    if path.len() >= tail_len && tail_len > 0 {
        // no room left for the NUL terminator
        defects.push(EntryDefect::UnterminatedPath);
    } else if path.is_empty() {
        defects.push(EntryDefect::EmptyPath);
    } else if std::str::from_utf8(path).is_err() {
        defects.push(EntryDefect::PathEncoding);
    }

    if entry.file_size > MAX_FILE_SIZE {
        defects.push(EntryDefect::FileSizeRange(entry.file_size));
    }

    match digest::digest_by_type(entry.hash_type) {
        Some(kind) => {
            let used = &entry.hash[..kind.digest_size];
            if used.iter().all(|&b| b == 0) {
                defects.push(EntryDefect::ZeroHash);
            }
            if entry.hash[kind.digest_size..].iter().any(|&b| b != 0) {
                defects.push(EntryDefect::HashPadding);
            }
        }
        None if entry.hash_type == digest::HASH_TYPE_NONE => {
            if entry.hash.iter().any(|&b| b != 0) {
                defects.push(EntryDefect::HashTypeUnset);
            }
        }
        None => defects.push(EntryDefect::UnknownHashType(entry.hash_type)),
    }

    if !wall_time::in_valid_range(entry.ctime, now)
        || !wall_time::in_valid_range(entry.mtime, now)
    {
        defects.push(EntryDefect::TimestampRange);
    }

    defects
}
