//! Mapped index files: readers, the growable scan writer and the bulk
//! scatter-gather writer.

use std::fs::File;
use std::io::{IoSlice, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use anyhow::{bail, format_err, Error};

use proxmox_io::ReadExt;

use crate::digest::{self, DigestKind};
use crate::entry::{entry_size_for_path, EntryMeta, IndexEntry, ENTRY_FIXED_SIZE};
use crate::entry_map::{EntryItem, EntryMap, IndexContext};
use crate::error::{nix_to_io, IndexError};
use crate::file_formats::{
    IndexHeader, ENTRY_FLAG_DELETED, INDEX_BYTE_ORDER_MAGIC, INDEX_FLAG_CLEAN, INDEX_HEADER_CSUM_LEN,
    INDEX_HEADER_SIZE, INDEX_SIGNATURE, INDEX_VERSION, MAX_ENTRY_SIZE,
};
use crate::temp_file::{self, TempFileGuard};
use crate::validate::{self, Defect, EntryDefect, ValidationMode};

struct MapRegion {
    ptr: *mut u8,
    len: usize,
}

/// A mapped index file.
///
/// The mapping of a growing scan index may relocate, so nothing outside
/// this module ever sees the base pointer: access goes through
/// [`EntryRef`] or [`MapGuard`], both of which hold the shared side of
/// the move lock while a pointer derived from the base is live.
pub struct MappedIndex {
    file: File,
    path: PathBuf,
    map: RwLock<MapRegion>,
    clean: bool,
}

// The mapping is plain memory shared between threads; the move lock
// serialises relocation against access.
unsafe impl Send for MappedIndex {}
unsafe impl Sync for MappedIndex {}

impl Drop for MappedIndex {
    fn drop(&mut self) {
        let region = self.map.get_mut().unwrap();
        if !region.ptr.is_null() {
            if let Err(err) =
                unsafe { nix::sys::mman::munmap(region.ptr as *mut std::ffi::c_void, region.len) }
            {
                log::error!("unable to unmap index {:?} - {}", self.path, err);
            }
            region.ptr = std::ptr::null_mut();
        }
    }
}

fn mmap_file(file: &File, len: usize, writable: bool) -> Result<*mut u8, Error> {
    use nix::sys::mman::{MapFlags, ProtFlags};

    let mut prot = ProtFlags::PROT_READ;
    let flags = if writable {
        prot |= ProtFlags::PROT_WRITE;
        MapFlags::MAP_SHARED
    } else {
        MapFlags::MAP_PRIVATE
    };

    let ptr = unsafe {
        nix::sys::mman::mmap(
            None,
            std::num::NonZeroUsize::new(len).ok_or_else(|| format_err!("empty mapping"))?,
            prot,
            flags,
            file.as_raw_fd(),
            0,
        )
    }
    .map_err(|err| Error::from(nix_to_io(err)))?;

    Ok(ptr as *mut u8)
}

impl MappedIndex {
    /// Open an existing index read-only.
    ///
    /// Verifies signature, byte order and version; a clean file also gets
    /// its checksum verified. An unclean file is returned as-is - it is a
    /// recovery candidate, the caller decides how to treat it.
    pub fn open(path: &Path) -> Result<Arc<Self>, Error> {
        Self::open_impl(path, true)
    }

    /// Open without checksum verification, for recovery: a clean flag
    /// over a damaged payload (for example after truncation) must not
    /// keep the salvageable prefix out of reach. Header signature,
    /// byte order and version are still enforced.
    pub fn open_unchecked(path: &Path) -> Result<Arc<Self>, Error> {
        Self::open_impl(path, false)
    }

    fn open_impl(path: &Path, verify: bool) -> Result<Arc<Self>, Error> {
        let mut file = File::open(path)
            .map_err(|err| format_err!("unable to open index {:?} - {}", path, err))?;

        let stat = nix::sys::stat::fstat(file.as_raw_fd()).map_err(nix_to_io)?;
        let size = stat.st_size as usize;
        if size < INDEX_HEADER_SIZE {
            bail!("index {:?} too small ({} bytes)", path, size);
        }

        let header: Box<IndexHeader> = unsafe { file.read_host_value_boxed()? };

        if header.signature != INDEX_SIGNATURE {
            bail!(IndexError::InvalidSignature);
        }
        if header.byte_order_magic != INDEX_BYTE_ORDER_MAGIC.to_ne_bytes() {
            bail!(IndexError::ByteOrderMismatch);
        }
        if header.version != INDEX_VERSION {
            bail!(IndexError::VersionUnsupported {
                found: header.version,
            });
        }

        let ptr = mmap_file(&file, size, false)?;

        let index = Arc::new(Self {
            file,
            path: path.to_path_buf(),
            map: RwLock::new(MapRegion { ptr, len: size }),
            clean: header.is_clean(),
        });

        if verify && index.clean {
            index.verify_checksum()?;
        }

        Ok(index)
    }

    fn verify_checksum(&self) -> Result<(), Error> {
        let guard = self.read_guard();
        let header = guard.header();

        let kind = match digest::digest_by_type(header.checksum_type) {
            Some(kind) => kind,
            None => {
                log::error!(
                    "index {:?} uses unknown checksum type {}",
                    self.path,
                    header.checksum_type
                );
                bail!(IndexError::ChecksumMismatch);
            }
        };

        let computed = compute_region_checksum(&guard, kind)?;
        if computed[..] != header.checksum[..kind.digest_size] {
            bail!(IndexError::ChecksumMismatch);
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file carried the clean flag when it was opened.
    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn read_guard(&self) -> MapGuard<'_> {
        MapGuard {
            guard: self.map.read().unwrap(),
        }
    }
}

/// Digest over the checksummed header prefix and the whole entry region.
fn compute_region_checksum(guard: &MapGuard, kind: &'static DigestKind) -> Result<Vec<u8>, Error> {
    let mut hasher = kind.create()?;
    let bytes = guard.as_bytes();
    hasher.update(&bytes[..INDEX_HEADER_CSUM_LEN])?;
    hasher.update(&bytes[INDEX_HEADER_SIZE..])?;
    Ok(hasher.finish()?.to_vec())
}

/// Shared-lock view of a mapped index.
pub struct MapGuard<'a> {
    guard: RwLockReadGuard<'a, MapRegion>,
}

impl MapGuard<'_> {
    fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.guard.ptr, self.guard.len) }
    }

    pub fn header(&self) -> &IndexHeader {
        unsafe { &*(self.guard.ptr as *const IndexHeader) }
    }

    /// Length of the entry region in bytes.
    pub fn entry_region_len(&self) -> usize {
        self.guard.len - INDEX_HEADER_SIZE
    }

    /// Entry at a byte offset into the entry region.
    ///
    /// The offset has to come from [`entry_offsets`] (or an [`EntryRef`]
    /// created by a writer), which guarantee it is in bounds and 8 byte
    /// aligned.
    pub fn entry_at(&self, offset: usize) -> &IndexEntry {
        unsafe { &*(self.guard.ptr.add(INDEX_HEADER_SIZE + offset) as *const IndexEntry) }
    }

    fn entry_slice(&self, offset: usize) -> &[u8] {
        let entry = self.entry_at(offset);
        unsafe {
            std::slice::from_raw_parts(
                self.guard.ptr.add(INDEX_HEADER_SIZE + offset),
                entry.size as usize,
            )
        }
    }
}

/// Walk the entry region by entry sizes.
///
/// Returns the offsets of all structurally sound entries, plus the defect
/// that stopped the walk early, if any. A truncated or garbled size field
/// never causes reads past the mapping.
pub fn entry_offsets(guard: &MapGuard) -> (Vec<usize>, Option<Defect>) {
    let region_len = guard.entry_region_len();
    let mut offsets = Vec::new();
    let mut offset = 0usize;

    while offset < region_len {
        if region_len - offset < ENTRY_FIXED_SIZE {
            return (
                offsets,
                Some(Defect {
                    offset: offset as u64,
                    path: None,
                    defect: EntryDefect::RegionTruncated,
                }),
            );
        }
        let size = guard.entry_at(offset).size;
        if (size as usize) < ENTRY_FIXED_SIZE
            || (size as usize) > MAX_ENTRY_SIZE
            || (size % 8) != 0
        {
            return (
                offsets,
                Some(Defect {
                    offset: offset as u64,
                    path: None,
                    defect: EntryDefect::SizeOutOfBounds(size),
                }),
            );
        }
        if (size as usize) > region_len - offset {
            return (
                offsets,
                Some(Defect {
                    offset: offset as u64,
                    path: None,
                    defect: EntryDefect::RegionTruncated,
                }),
            );
        }
        offsets.push(offset);
        offset += size as usize;
    }

    (offsets, None)
}

/// Offset based, remap safe handle to one entry of a mapped index.
#[derive(Clone)]
pub struct EntryRef {
    index: Arc<MappedIndex>,
    offset: usize,
}

impl EntryRef {
    pub fn new(index: Arc<MappedIndex>, offset: usize) -> Self {
        Self { index, offset }
    }

    pub fn index(&self) -> &Arc<MappedIndex> {
        &self.index
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Resolve to the entry, holding the shared side of the move lock
    /// for the lifetime of the returned guard.
    pub fn resolve(&self) -> EntryGuard<'_> {
        EntryGuard {
            guard: self.index.map.read().unwrap(),
            offset: self.offset,
        }
    }

    /// Write the digest of a finished hash job into the entry.
    ///
    /// The entry's hash field is owned by exactly one job, so a shared
    /// lock (which only fences off relocation) is sufficient here.
    pub fn write_hash(&self, hash_type: u16, digest: &[u8]) {
        debug_assert!(digest.len() <= 64);
        let guard = self.index.map.read().unwrap();
        unsafe {
            let entry =
                guard.ptr.add(INDEX_HEADER_SIZE + self.offset) as *mut IndexEntry;
            (*entry).hash = [0u8; 64];
            (*entry).hash[..digest.len()].copy_from_slice(digest);
            (*entry).hash_type = hash_type;
        }
    }
}

/// Shared-lock guard dereferencing to the referenced [`IndexEntry`].
pub struct EntryGuard<'a> {
    guard: RwLockReadGuard<'a, MapRegion>,
    offset: usize,
}

impl std::ops::Deref for EntryGuard<'_> {
    type Target = IndexEntry;

    fn deref(&self) -> &IndexEntry {
        unsafe {
            &*(self.guard.ptr.add(INDEX_HEADER_SIZE + self.offset) as *const IndexEntry)
        }
    }
}

/// Append-only writer for scan index files.
///
/// Every append grows the file and remaps; the mapping may relocate, so
/// callers keep [`EntryRef`]s, never pointers. Hash workers fill in
/// digests of already appended entries concurrently through their refs.
pub struct ScanIndexWriter {
    index: Arc<MappedIndex>,
    checksum_kind: &'static DigestKind,
    tail: usize,
    count: u32,
}

impl ScanIndexWriter {
    pub fn create(path: &Path, checksum_kind: &'static DigestKind) -> Result<Self, Error> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| format_err!("unable to create scan index {:?} - {}", path, err))?;

        let header = IndexHeader::new(checksum_kind.type_id);
        file.write_all(header.as_bytes())?;

        let ptr = mmap_file(&file, INDEX_HEADER_SIZE, true)?;

        Ok(Self {
            index: Arc::new(MappedIndex {
                file,
                path: path.to_path_buf(),
                map: RwLock::new(MapRegion {
                    ptr,
                    len: INDEX_HEADER_SIZE,
                }),
                clean: false,
            }),
            checksum_kind,
            tail: 0,
            count: 0,
        })
    }

    pub fn index(&self) -> Arc<MappedIndex> {
        Arc::clone(&self.index)
    }

    pub fn entry_count(&self) -> u32 {
        self.count
    }

    /// Append a fresh entry with an unset hash (a hash job fills it in).
    pub fn append_new(&mut self, path: &str, meta: &EntryMeta) -> Result<EntryRef, Error> {
        self.append_impl(path, meta, 0, digest::HASH_TYPE_NONE, &[0u8; 64])
    }

    /// Append a copy of an existing entry, optionally as a tombstone.
    pub fn append_copy(
        &mut self,
        path: &str,
        src: &IndexEntry,
        deleted: bool,
    ) -> Result<EntryRef, Error> {
        let mut flags = src.entry_flags;
        if deleted {
            flags |= ENTRY_FLAG_DELETED;
        }
        self.append_impl(path, &src.meta(), flags, src.hash_type, &src.hash)
    }

    /// Append raw entry bytes (fixed header plus padded path tail), used
    /// when materialising accepted entries out of an unclean index.
    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<EntryRef, Error> {
        if bytes.len() < ENTRY_FIXED_SIZE || (bytes.len() % 8) != 0 {
            bail!("malformed raw entry ({} bytes)", bytes.len());
        }
        let offset = self.grow(bytes.len())?;
        {
            let region = self.index.map.read().unwrap();
            unsafe {
                let dst = region.ptr.add(INDEX_HEADER_SIZE + offset);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                // the size field has to match what we grew by
                (*(dst as *mut IndexEntry)).size = bytes.len() as u32;
                let header = &mut *(region.ptr as *mut IndexHeader);
                header.entry_count = self.count + 1;
            }
        }
        self.count += 1;
        self.tail += bytes.len();
        Ok(EntryRef::new(Arc::clone(&self.index), offset))
    }

    fn append_impl(
        &mut self,
        path: &str,
        meta: &EntryMeta,
        entry_flags: u16,
        hash_type: u16,
        hash: &[u8; 64],
    ) -> Result<EntryRef, Error> {
        if path.is_empty() {
            bail!("refusing to append entry with empty path");
        }
        if path.as_bytes().contains(&0) {
            bail!("refusing to append entry with NUL in path {:?}", path);
        }
        let esize = entry_size_for_path(path);
        if esize > MAX_ENTRY_SIZE {
            bail!("path too long for index entry: {:?}", path);
        }

        let offset = self.grow(esize)?;

        {
            let region = self.index.map.read().unwrap();
            unsafe {
                let dst = region.ptr.add(INDEX_HEADER_SIZE + offset);
                let entry = IndexEntry {
                    size: esize as u32,
                    entry_flags,
                    hash_type,
                    ctime: meta.ctime,
                    mtime: meta.mtime,
                    dev: meta.dev,
                    ino: meta.ino,
                    mode: meta.mode,
                    uid: meta.uid,
                    gid: meta.gid,
                    reserved: 0,
                    file_size: meta.file_size,
                    hash: *hash,
                };
                std::ptr::write(dst as *mut IndexEntry, entry);
                std::ptr::copy_nonoverlapping(
                    path.as_ptr(),
                    dst.add(ENTRY_FIXED_SIZE),
                    path.len(),
                );
                // NUL terminator and padding are already zero, the file
                // grows zero filled
                let header = &mut *(region.ptr as *mut IndexHeader);
                header.entry_count = self.count + 1;
            }
        }

        self.count += 1;
        self.tail += esize;
        Ok(EntryRef::new(Arc::clone(&self.index), offset))
    }

    /// Grow file and mapping by `add` bytes, returning the entry region
    /// offset of the fresh space. Takes the exclusive side of the move
    /// lock; the mapping may relocate.
    fn grow(&mut self, add: usize) -> Result<usize, Error> {
        use nix::sys::mman::{mremap, MRemapFlags};

        let offset = self.tail;
        let mut region = self.index.map.write().unwrap();
        let new_len = region.len + add;

        nix::unistd::ftruncate(self.index.file.as_raw_fd(), new_len as i64)
            .map_err(nix_to_io)?;

        let new_ptr = unsafe {
            mremap(
                region.ptr as *mut std::ffi::c_void,
                region.len,
                new_len,
                MRemapFlags::MREMAP_MAYMOVE,
                None,
            )
        }
        .map_err(nix_to_io)?;

        region.ptr = new_ptr as *mut u8;
        region.len = new_len;

        Ok(offset)
    }

    /// Set the clean flag and write the checksum. Call only once all
    /// hash jobs against this index have completed.
    pub fn finish(&mut self) -> Result<(), Error> {
        {
            let guard = self.index.read_guard();
            unsafe {
                let header = &mut *(guard.guard.ptr as *mut IndexHeader);
                header.flags |= INDEX_FLAG_CLEAN;
            }
            let checksum = compute_region_checksum(&guard, self.checksum_kind)?;
            unsafe {
                let header = &mut *(guard.guard.ptr as *mut IndexHeader);
                header.checksum = [0u8; 64];
                header.checksum[..checksum.len()].copy_from_slice(&checksum);
            }
        }
        self.index.file.sync_all()?;
        Ok(())
    }
}

/// Write an index file from already mapped entries with scatter-gather
/// I/O, then atomically rename it over `target`.
///
/// The entries have to be in ascending path order; deleted tombstones
/// are the caller's business to filter. Writes go to a temp file in the
/// same directory; the clean flag and checksum are written only after
/// the payload is on disk.
pub fn write_index_atomic(
    target: &Path,
    entries: &[EntryRef],
    checksum_kind: &'static DigestKind,
) -> Result<(), Error> {
    let dir = target
        .parent()
        .ok_or_else(|| format_err!("index target {:?} has no parent directory", target))?;
    let role = target
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("index");

    let tmp_path = dir.join(temp_file::temp_index_name(role));
    let mut guard = TempFileGuard::new(tmp_path.clone());

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .map_err(|err| format_err!("unable to create temp index {:?} - {}", tmp_path, err))?;

    let mut header = IndexHeader::new(checksum_kind.type_id);
    header.entry_count = entries.len() as u32;
    file.write_all(header.as_bytes())?;

    // distinct source mappings, shared-locked for the duration of the
    // write so nothing can move underneath the gathered pointers
    let mut sources: Vec<&Arc<MappedIndex>> = Vec::new();
    for entry in entries {
        if !sources.iter().any(|s| Arc::ptr_eq(s, entry.index())) {
            sources.push(entry.index());
        }
    }
    let guards: Vec<MapGuard> = sources.iter().map(|s| s.read_guard()).collect();

    let mut hasher = checksum_kind.create()?;

    {
        let slices: Vec<&[u8]> = entries
            .iter()
            .map(|entry| {
                let source = sources
                    .iter()
                    .position(|s| Arc::ptr_eq(s, entry.index()))
                    .unwrap();
                guards[source].entry_slice(entry.offset())
            })
            .collect();

        writev_all(&mut file, &slices)?;

        header.flags |= INDEX_FLAG_CLEAN;
        hasher.update(&header.as_bytes()[..INDEX_HEADER_CSUM_LEN])?;
        for slice in &slices {
            hasher.update(slice)?;
        }
    }

    let checksum = hasher.finish()?;
    header.checksum[..checksum.len()].copy_from_slice(&checksum);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(header.as_bytes())?;
    file.sync_all()?;
    drop(file);
    drop(guards);

    std::fs::rename(&tmp_path, target)
        .map_err(|err| format_err!("atomic rename to {:?} failed - {}", target, err))?;
    guard.disarm();

    Ok(())
}

/// Gather-write all slices, chunked to the platform scatter-gather limit.
fn writev_all(file: &mut File, slices: &[&[u8]]) -> Result<(), Error> {
    let limit = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
    let max_iov = if limit <= 0 { 1024 } else { limit as usize };

    let fd = file.as_raw_fd();
    let mut index = 0usize;
    let mut first_advance = 0usize;

    while index < slices.len() {
        let chunk_end = std::cmp::min(index + max_iov, slices.len());
        let iov: Vec<IoSlice> = slices[index..chunk_end]
            .iter()
            .enumerate()
            .map(|(i, slice)| {
                if i == 0 {
                    IoSlice::new(&slice[first_advance..])
                } else {
                    IoSlice::new(slice)
                }
            })
            .collect();

        let mut written = nix::sys::uio::writev(fd, &iov).map_err(nix_to_io)?;
        if written == 0 {
            bail!("writev wrote 0 bytes");
        }

        // advance over fully written slices
        while index < chunk_end {
            let remaining = slices[index].len() - first_advance;
            if written < remaining {
                first_advance += written;
                written = 0;
                break;
            }
            written -= remaining;
            first_advance = 0;
            index += 1;
        }
    }

    Ok(())
}

/// Load an index file into an ordered [`EntryMap`].
///
/// Keys are owned copies of the entry paths, values are remap safe
/// entry references tagged with `context`. Defect handling depends on
/// the validation mode; the returned defect list is empty in strict
/// mode (strict fails on the first defect instead).
pub fn load_entry_map(
    path: &Path,
    context: IndexContext,
    mode: ValidationMode,
) -> Result<(EntryMap, Vec<Defect>), Error> {
    let index = MappedIndex::open(path)?;
    load_entry_map_from(index, context, mode)
}

/// Like [`load_entry_map`], for an already opened index.
pub fn load_entry_map_from(
    index: Arc<MappedIndex>,
    context: IndexContext,
    mode: ValidationMode,
) -> Result<(EntryMap, Vec<Defect>), Error> {
    if !index.is_clean() {
        match mode {
            ValidationMode::Strict => bail!(IndexError::UncleanFile),
            _ => log::warn!(
                "index {:?} was not closed cleanly, loading what can be salvaged",
                index.path()
            ),
        }
    }

    let mut map = EntryMap::new();
    let mut defects = Vec::new();
    let now = proxmox_time::epoch_i64();

    {
        let guard = index.read_guard();
        let (offsets, walk_defect) = entry_offsets(&guard);

        if index.is_clean() && walk_defect.is_none() {
            let header_count = guard.header().entry_count;
            if header_count as usize != offsets.len() {
                let defect = Defect {
                    offset: 0,
                    path: None,
                    defect: EntryDefect::CountMismatch {
                        header: header_count,
                        walked: offsets.len() as u32,
                    },
                };
                if mode == ValidationMode::Strict {
                    bail!(IndexError::EntryCorrupt {
                        offset: 0,
                        defect: defect.defect,
                    });
                }
                defects.push(defect);
            }
        }

        for offset in offsets {
            let entry = guard.entry_at(offset);
            let entry_defects = validate::validate_entry(entry, now);

            let key = match std::str::from_utf8(entry.path_bytes()) {
                Ok(path) => Some(path.to_string()),
                Err(_) => None,
            };

            if !entry_defects.is_empty() {
                match mode {
                    ValidationMode::Strict => {
                        bail!(IndexError::EntryCorrupt {
                            offset: offset as u64,
                            defect: entry_defects[0].clone(),
                        });
                    }
                    ValidationMode::Lenient => {
                        for defect in entry_defects {
                            defects.push(Defect {
                                offset: offset as u64,
                                path: key.clone(),
                                defect,
                            });
                        }
                        continue;
                    }
                    ValidationMode::Diagnostic | ValidationMode::Recovery => {
                        for defect in entry_defects {
                            defects.push(Defect {
                                offset: offset as u64,
                                path: key.clone(),
                                defect,
                            });
                        }
                    }
                }
            }

            if let Some(key) = key {
                map.insert(
                    key,
                    EntryItem {
                        entry: EntryRef::new(Arc::clone(&index), offset),
                        context,
                    },
                );
            }
        }

        if let Some(defect) = walk_defect {
            if mode == ValidationMode::Strict {
                bail!(IndexError::EntryCorrupt {
                    offset: defect.offset,
                    defect: defect.defect,
                });
            }
            defects.push(defect);
        }
    }

    Ok((map, defects))
}
