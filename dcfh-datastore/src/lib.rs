//! Low level access to dcfh index files.
//!
//! An index file is a single header followed by a packed run of variable
//! length entries, written in host byte order and designed for zero-copy
//! reads through a memory mapping. Three roles of index live in a
//! repository's metadata directory: *main* (last committed state),
//! *cache* (additions since the last commit) and *scan* (in-flight work,
//! tagged with process and task ids).
//!
//! The mapped-region layer hands out offset based [`EntryRef`] handles
//! instead of raw pointers, because a growing scan index may relocate its
//! mapping. Resolution goes through a shared lock on the mapping's move
//! lock; growth takes the exclusive side.

pub mod digest;
pub mod entry;
pub mod entry_map;
pub mod error;
pub mod file_formats;
pub mod index_file;
pub mod temp_file;
pub mod validate;
pub mod wall_time;

pub use digest::{digest_by_name, digest_by_type, DigestKind};
pub use entry::{EntryMeta, IndexEntry};
pub use entry_map::{EntryItem, EntryMap, IndexContext, MergeStrategy};
pub use error::IndexError;
pub use file_formats::IndexHeader;
pub use index_file::{
    load_entry_map, write_index_atomic, EntryRef, MapGuard, MappedIndex, ScanIndexWriter,
};
pub use validate::{Defect, EntryDefect, ValidationMode};
