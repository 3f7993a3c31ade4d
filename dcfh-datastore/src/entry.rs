use nix::sys::stat::FileStat;

use crate::digest;
use crate::file_formats::ENTRY_FLAG_DELETED;
use crate::wall_time;

/// Fixed leading part of an index entry.
///
/// The `size` field comes first so a parser can walk an entry region by
/// sizes alone. The full entry is the fixed header followed by the NUL
/// terminated UTF-8 relative path, zero padded to an 8 byte boundary;
/// `size` counts the padded total.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct IndexEntry {
    pub size: u32,
    pub entry_flags: u16,
    pub hash_type: u16,
    pub ctime: u64,
    pub mtime: u64,
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub reserved: u32,
    pub file_size: u64,
    pub hash: [u8; 64],
}
proxmox_lang::static_assert_size!(IndexEntry, 128);

pub const ENTRY_FIXED_SIZE: usize = std::mem::size_of::<IndexEntry>();

/// Padded on-disk size of an entry with the given relative path.
pub fn entry_size_for_path(path: &str) -> usize {
    let unpadded = ENTRY_FIXED_SIZE + path.len() + 1;
    (unpadded + 7) & !7
}

impl IndexEntry {
    /// Path tail bytes up to the NUL terminator.
    ///
    /// Only valid for entries resolved out of a mapped region, where the
    /// tail actually follows the fixed header in memory.
    pub fn path_bytes(&self) -> &[u8] {
        let total = self.size as usize;
        if total <= ENTRY_FIXED_SIZE {
            return &[];
        }
        unsafe {
            let base = (self as *const IndexEntry as *const u8).add(ENTRY_FIXED_SIZE);
            let tail = std::slice::from_raw_parts(base, total - ENTRY_FIXED_SIZE);
            match tail.iter().position(|&b| b == 0) {
                Some(n) => &tail[..n],
                None => tail,
            }
        }
    }

    /// Relative path of the entry. UTF-8 is validated when an index is
    /// loaded, so the conversion here is unchecked.
    pub fn path(&self) -> &str {
        unsafe { std::str::from_utf8_unchecked(self.path_bytes()) }
    }

    pub fn is_deleted(&self) -> bool {
        (self.entry_flags & ENTRY_FLAG_DELETED) != 0
    }

    pub fn has_hash(&self) -> bool {
        self.hash_type != digest::HASH_TYPE_NONE
    }

    /// The digest bytes actually used by `hash_type`, if any.
    pub fn hash_slice(&self) -> Option<&[u8]> {
        let kind = digest::digest_by_type(self.hash_type)?;
        Some(&self.hash[..kind.digest_size])
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            ctime: self.ctime,
            mtime: self.mtime,
            dev: self.dev,
            ino: self.ino,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            file_size: self.file_size,
        }
    }
}

/// Stat derived metadata of one filesystem object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub ctime: u64,
    pub mtime: u64,
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub file_size: u64,
}

impl EntryMeta {
    pub fn from_stat(stat: &FileStat) -> Self {
        Self {
            ctime: wall_time::pack(stat.st_ctime, stat.st_ctime_nsec),
            mtime: wall_time::pack(stat.st_mtime, stat.st_mtime_nsec),
            dev: stat.st_dev,
            ino: stat.st_ino,
            mode: stat.st_mode,
            uid: stat.st_uid,
            gid: stat.st_gid,
            file_size: stat.st_size as u64,
        }
    }

    /// The change detection predicate: device and inode are allowed to
    /// differ, everything else has to match.
    pub fn unchanged(&self, other: &EntryMeta) -> bool {
        self.file_size == other.file_size
            && self.uid == other.uid
            && self.gid == other.gid
            && self.mode == other.mode
            && self.ctime == other.ctime
            && self.mtime == other.mtime
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_sizes() {
        assert_eq!(ENTRY_FIXED_SIZE, 128);
        assert_eq!(entry_size_for_path("a"), 136);
        assert_eq!(entry_size_for_path("abcdefg"), 136);
        assert_eq!(entry_size_for_path("abcdefgh"), 144);
        assert_eq!(entry_size_for_path("a.txt") % 8, 0);
    }

    #[test]
    fn change_predicate_ignores_dev_ino() {
        let a = EntryMeta {
            ctime: 1,
            mtime: 2,
            dev: 3,
            ino: 4,
            mode: 0o100644,
            uid: 5,
            gid: 6,
            file_size: 7,
        };
        let mut b = a;
        b.dev = 9;
        b.ino = 9;
        assert!(a.unchanged(&b));
        b.mtime = 3;
        assert!(!a.unchanged(&b));
    }
}
