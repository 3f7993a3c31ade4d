//! Recovery of damaged repositories.
//!
//! Before anything mutating happens, every index file is copied into the
//! `recovery/` snapshot directory with its timestamps preserved. Loading
//! then walks the raw entry region of each source index (checksums are
//! not trusted here), validates every entry, applies or prompts fixes,
//! and materialises a byte level copy of each accepted entry into a
//! fresh scratch index - later merges never depend on the original,
//! possibly torn, mapping.
//!
//! Auto-recovery tries the union of main, cache and all scan files
//! first, falls back to cache alone, then to the newest scan file, then
//! to main, and in each case reconciles the result with a fresh
//! filesystem scan before committing it.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use dcfh_datastore::entry::IndexEntry;
use dcfh_datastore::entry_map::{EntryItem, EntryMap, IndexContext};
use dcfh_datastore::index_file::{entry_offsets, MappedIndex, ScanIndexWriter};
use dcfh_datastore::temp_file::{self, TempFileGuard};
use dcfh_datastore::validate::{validate_entry, EntryDefect};
use dcfh_datastore::{write_index_atomic, MergeStrategy};
use dcfh_tools::ShutdownSignal;

use crate::config::Config;
use crate::error::WorkflowError;
use crate::repository::{Repository, CACHE_INDEX_NAME, MAIN_INDEX_NAME};
use crate::workflow::run_scan_pipeline;

pub const RECOVERY_DIR_NAME: &str = "recovery";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixMode {
    /// No fixes; defective entries are dropped.
    None,
    /// Safe fixes are applied without asking.
    Auto,
    /// Every fix is prompted.
    Manual,
}

/// Confirmation hook for manual fix mode; the front end owns the
/// terminal.
pub trait FixPrompt {
    fn confirm(&mut self, description: &str) -> bool;
}

/// Reads y/N answers from standard input.
pub struct StdinPrompt;

impl FixPrompt for StdinPrompt {
    fn confirm(&mut self, description: &str) -> bool {
        eprint!("{} [y/N]: ", description);
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

/// Never asked anything outside manual mode; answers "no" defensively
/// if it is.
pub struct DenyPrompt;

impl FixPrompt for DenyPrompt {
    fn confirm(&mut self, _description: &str) -> bool {
        false
    }
}

/// Copy every `*.idx` file into the `recovery/` snapshot directory,
/// preserving timestamps.
pub fn snapshot_indices(meta_dir: &Path) -> Result<(), Error> {
    let snapshot_dir = meta_dir.join(RECOVERY_DIR_NAME);
    std::fs::create_dir_all(&snapshot_dir)
        .map_err(|err| format_err!("unable to create {:?} - {}", snapshot_dir, err))?;

    for item in std::fs::read_dir(meta_dir)? {
        let item = item?;
        let name = item.file_name();
        if Path::new(&name).extension().map(|e| e == "idx").unwrap_or(false) {
            dcfh_tools::fs::copy_preserving_times(&item.path(), &snapshot_dir.join(&name))?;
        }
    }
    Ok(())
}

/// All scan index files in the metadata directory, oldest first.
fn scan_files(meta_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for item in std::fs::read_dir(meta_dir)? {
        let item = item?;
        let name = item.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("scan-") && name.ends_with(".idx") {
            let mtime = item
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            files.push((mtime, item.path()));
        }
    }
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

fn context_for_source(path: &Path) -> IndexContext {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(MAIN_INDEX_NAME) => IndexContext::Main,
        Some(CACHE_INDEX_NAME) => IndexContext::Cache,
        _ => IndexContext::Scan,
    }
}

/// Try the recovery strategy chain. On success the repository has a
/// consistent main index, no cache and no leftover scan files.
pub(crate) fn auto_recover(
    repo: &Repository,
    config: &Config,
    fix: FixMode,
    prompt: &mut dyn FixPrompt,
    shutdown: &ShutdownSignal,
) -> Result<(), Error> {
    snapshot_indices(repo.meta_dir())?;

    let main_path = repo.main_index_path();
    let cache_path = repo.cache_index_path();
    let scans = scan_files(repo.meta_dir())?;

    let mut comprehensive: Vec<PathBuf> = vec![main_path.clone(), cache_path.clone()];
    comprehensive.extend(scans.iter().cloned());

    let mut strategies: Vec<(&str, Vec<PathBuf>)> = vec![
        ("comprehensive", comprehensive),
        ("cache only", vec![cache_path]),
    ];
    if let Some(newest) = scans.last() {
        strategies.push(("newest scan", vec![newest.clone()]));
    }
    strategies.push(("main only", vec![main_path]));

    for (name, sources) in strategies {
        match recover_from(repo, config, &sources, fix, prompt, shutdown) {
            Ok(()) => {
                log::info!("recovery succeeded using the {} strategy", name);
                remove_scan_files(repo.meta_dir());
                return Ok(());
            }
            Err(err) => {
                if crate::error::is_interrupted(&err) {
                    return Err(err);
                }
                log::warn!("{} recovery failed - {}", name, err);
            }
        }
    }

    bail!("all recovery strategies failed");
}

fn remove_scan_files(meta_dir: &Path) {
    if let Ok(files) = scan_files(meta_dir) {
        for path in files {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("unable to remove scan file {:?} - {}", path, err);
            }
        }
    }
}

fn recover_from(
    repo: &Repository,
    config: &Config,
    sources: &[PathBuf],
    fix: FixMode,
    prompt: &mut dyn FixPrompt,
    shutdown: &ShutdownSignal,
) -> Result<(), Error> {
    let scratch_path = repo
        .meta_dir()
        .join(temp_file::temp_index_name("recover"));
    let _scratch_guard = TempFileGuard::new(scratch_path.clone());
    let mut scratch = ScanIndexWriter::create(&scratch_path, config.default_hash)?;

    let mut union = EntryMap::new();
    let mut loaded_any = false;

    for source in sources {
        if !source.exists() {
            continue;
        }
        let context = context_for_source(source);
        match load_salvaged(source, context, repo, config, fix, prompt, &mut scratch) {
            Ok(map) => {
                loaded_any = true;
                union.merge_from(map, MergeStrategy::TheirsWins)?;
            }
            Err(err) => log::warn!("unable to salvage {:?} - {}", source, err),
        }
    }

    if !loaded_any {
        bail!("no index could be salvaged from this source set");
    }

    // reconcile with reality: a fresh scan against the salvaged union
    let (outcome, _scan_guard) =
        run_scan_pipeline(repo, config, union, Vec::new(), shutdown)?;
    if outcome.interrupted {
        bail!(WorkflowError::Interrupted);
    }

    let entries: Vec<_> = outcome
        .scan_map
        .iter()
        .filter(|(_, item)| !item.is_deleted())
        .map(|(_, item)| item.entry.clone())
        .collect();

    write_index_atomic(&repo.main_index_path(), &entries, config.default_hash)?;

    match std::fs::remove_file(repo.cache_index_path()) {
        Ok(()) => (),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
        Err(err) => log::warn!("unable to remove cache index - {}", err),
    }

    Ok(())
}

/// Walk one source index without trusting its checksum, validate every
/// entry, fix or drop defective ones and materialise the survivors into
/// the scratch index.
fn load_salvaged(
    path: &Path,
    context: IndexContext,
    repo: &Repository,
    config: &Config,
    fix: FixMode,
    prompt: &mut dyn FixPrompt,
    scratch: &mut ScanIndexWriter,
) -> Result<EntryMap, Error> {
    let index = MappedIndex::open_unchecked(path)?;
    if !index.is_clean() {
        log::info!("{:?} was not closed cleanly, salvaging", path);
    }

    let now = proxmox_time::epoch_i64();
    let mut map = EntryMap::new();

    let guard = index.read_guard();
    let (offsets, walk_defect) = entry_offsets(&guard);
    if let Some(defect) = walk_defect {
        log::warn!("{:?}: {} - keeping the prefix before it", path, defect);
    }

    for offset in offsets {
        let raw = {
            let entry = guard.entry_at(offset);
            unsafe {
                std::slice::from_raw_parts(
                    entry as *const IndexEntry as *const u8,
                    entry.size as usize,
                )
            }
        };
        let mut bytes = raw.to_vec();

        // the copy is unaligned, go through read/write_unaligned
        let mut entry = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const IndexEntry) };

        let key = match std::str::from_utf8(guard.entry_at(offset).path_bytes()) {
            Ok(path) => path.to_string(),
            Err(_) => {
                log::warn!("dropping entry at offset {} with undecodable path", offset);
                continue;
            }
        };

        let mut keep = true;
        for defect in validate_entry(guard.entry_at(offset), now) {
            if !apply_fix(&mut entry, &key, &defect, config, fix, prompt) {
                log::warn!("dropping {:?} - {}", key, defect);
                keep = false;
                break;
            }
        }
        if !keep {
            continue;
        }

        if fix != FixMode::None {
            reconcile_with_filesystem(&mut entry, &key, repo, fix, prompt);
        }

        unsafe {
            std::ptr::write_unaligned(bytes.as_mut_ptr() as *mut IndexEntry, entry);
        }

        let entry_ref = scratch.append_raw(&bytes)?;
        map.insert(
            key,
            EntryItem {
                entry: entry_ref,
                context,
            },
        );
    }

    Ok(map)
}

/// Apply (or prompt) the fix for one defect. Returns false when the
/// entry has to be dropped instead.
fn apply_fix(
    entry: &mut IndexEntry,
    key: &str,
    defect: &EntryDefect,
    config: &Config,
    fix: FixMode,
    prompt: &mut dyn FixPrompt,
) -> bool {
    if fix == FixMode::None {
        return false;
    }

    let confirmed = |prompt: &mut dyn FixPrompt, description: String| match fix {
        FixMode::Manual => prompt.confirm(&description),
        _ => true,
    };

    match defect {
        EntryDefect::HashTypeUnset => {
            if !confirmed(
                prompt,
                format!("{}: set hash type to {}", key, config.default_hash.name),
            ) {
                return false;
            }
            entry.hash_type = config.default_hash.type_id;
            for byte in &mut entry.hash[config.default_hash.digest_size..] {
                *byte = 0;
            }
            true
        }
        EntryDefect::HashPadding => {
            let size = match dcfh_datastore::digest_by_type(entry.hash_type) {
                Some(kind) => kind.digest_size,
                None => return false,
            };
            if !confirmed(prompt, format!("{}: clear garbage after hash", key)) {
                return false;
            }
            for byte in &mut entry.hash[size..] {
                *byte = 0;
            }
            true
        }
        // everything else (timestamps out of range, bad paths, bogus
        // sizes, unknown or zeroed hashes) is unfixable; the fresh scan
        // re-adds the file with correct data
        _ => false,
    }
}

/// Reconcile one salvaged entry with the current filesystem: a missing
/// file becomes a tombstone, drifted metadata is resynced from stat.
fn reconcile_with_filesystem(
    entry: &mut IndexEntry,
    key: &str,
    repo: &Repository,
    fix: FixMode,
    prompt: &mut dyn FixPrompt,
) {
    use dcfh_datastore::entry::EntryMeta;
    use dcfh_datastore::file_formats::ENTRY_FLAG_DELETED;

    let abs = repo.root().join(key);
    match nix::sys::stat::lstat(&abs) {
        Err(nix::errno::Errno::ENOENT) => {
            if fix == FixMode::Manual
                && !prompt.confirm(&format!("{}: file is gone, mark deleted", key))
            {
                return;
            }
            entry.entry_flags |= ENTRY_FLAG_DELETED;
        }
        Ok(stat) => {
            let current = EntryMeta::from_stat(&stat);
            if !current.unchanged(&entry.meta()) {
                if fix == FixMode::Manual
                    && !prompt.confirm(&format!("{}: resync metadata from filesystem", key))
                {
                    return;
                }
                entry.ctime = current.ctime;
                entry.mtime = current.mtime;
                entry.dev = current.dev;
                entry.ino = current.ino;
                entry.mode = current.mode;
                entry.uid = current.uid;
                entry.gid = current.gid;
                entry.file_size = current.file_size;
            }
        }
        Err(err) => log::warn!("unable to stat {:?} - {}", abs, err),
    }
}
