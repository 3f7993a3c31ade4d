//! Workflow orchestration shared by status, update and duplicate
//! detection: the scan/compare/hash pipeline and the cache rewrite.

pub mod duplicates;
pub mod status;
pub mod update;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::bounded;

use dcfh_datastore::entry_map::{EntryMap, IndexContext};
use dcfh_datastore::index_file::{EntryRef, ScanIndexWriter};
use dcfh_datastore::temp_file::{self, TempFileGuard};
use dcfh_tools::ShutdownSignal;

use crate::compare;
use crate::config::Config;
use crate::error::{is_interrupted, WorkflowError};
use crate::hash_pool::HashPool;
use crate::ignore::IgnoreList;
use crate::repository::Repository;
use crate::scan::{Scanner, SCAN_CHANNEL_DEPTH};

pub(crate) struct PipelineOutcome {
    /// The scan container: every scanned path, tombstones included.
    pub scan_map: EntryMap,
    /// The shutdown signal fired while the pipeline ran; `scan_map`
    /// holds the partial result.
    pub interrupted: bool,
}

/// Run the scan/compare/hash pipeline for the given repository paths
/// (empty means whole tree) against the comparison container `base`.
///
/// The scan index file itself is transient: it is removed when the
/// returned maps are no longer in use (its mapping stays valid until
/// then); only a crash leaves it behind for recovery.
pub(crate) fn run_scan_pipeline(
    repo: &Repository,
    config: &Config,
    base: EntryMap,
    paths: Vec<String>,
    shutdown: &ShutdownSignal,
) -> Result<(PipelineOutcome, TempFileGuard), Error> {
    let task_id = temp_file::next_task_id();
    let scan_path = repo.meta_dir().join(temp_file::scan_index_name(task_id));
    let scan_guard = TempFileGuard::new(scan_path.clone());

    let mut writer = ScanIndexWriter::create(&scan_path, config.default_hash)?;

    let scanner = Scanner::new(
        repo.root().to_path_buf(),
        IgnoreList::load(repo.meta_dir()),
        config.symlink_mode,
        shutdown.clone(),
    );

    let (tx, rx) = bounded(SCAN_CHANNEL_DEPTH);
    let scanner_thread = std::thread::Builder::new()
        .name("scan".to_string())
        .spawn(move || scanner.run(paths, tx))?;

    let pool = HashPool::new(
        config.hash_workers,
        config.hash_buffer,
        config.default_hash,
        shutdown.clone(),
    )?;

    let merge_result = compare::merge_scan(&rx, base, &mut writer, &pool, shutdown);
    drop(rx);

    let scanner_result = scanner_thread
        .join()
        .map_err(|_| format_err!("scanner thread panicked"))?;
    let pool_result = pool.finish();

    let interrupted = shutdown.is_fired();

    if !interrupted {
        // the stage errors are the root causes; a merge error is often
        // just their fallout (submissions fail once the pool failed)
        if let Err(err) = scanner_result {
            return Err(err.context("scan failed"));
        }
        if let Err(err) = pool_result {
            return Err(err.context("hashing failed"));
        }
    } else {
        // partial results stay usable; errors at this point are all
        // interruption fallout
        if let Err(err) = scanner_result {
            if !is_interrupted(&err) {
                log::warn!("scan failed during shutdown - {}", err);
            }
        }
        if let Err(err) = pool_result {
            log::debug!("hash pool drained with errors during shutdown - {}", err);
        }
    }

    let scan_map = match merge_result {
        Ok(scan_map) => scan_map,
        Err(err) if interrupted => {
            log::debug!("merge failed during shutdown - {}", err);
            EntryMap::new()
        }
        Err(err) => return Err(err),
    };

    if !interrupted {
        writer.finish()?;
    } else if let Err(err) = writer.finish() {
        log::debug!("unable to finish interrupted scan index - {}", err);
    }

    Ok((
        PipelineOutcome {
            scan_map,
            interrupted,
        },
        scan_guard,
    ))
}

/// Entries that belong into the cache file: everything that did not
/// originate in *main*, skipping entries whose hash job never finished
/// (possible after an interruption).
pub(crate) fn cache_entries(scan_map: &EntryMap) -> Vec<EntryRef> {
    scan_map
        .iter()
        .filter(|(_, item)| item.context != IndexContext::Main)
        .filter(|(_, item)| {
            let entry = item.entry.resolve();
            entry.is_deleted() || entry.has_hash()
        })
        .map(|(_, item)| item.entry.clone())
        .collect()
}

/// Atomically replace (or, when empty, remove) the cache file.
pub(crate) fn write_cache(repo: &Repository, config: &Config, entries: &[EntryRef]) -> Result<(), Error> {
    let cache_path = repo.cache_index_path();
    if entries.is_empty() {
        match std::fs::remove_file(&cache_path) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => bail!("unable to remove cache index {:?} - {}", cache_path, err),
        }
        return Ok(());
    }
    dcfh_datastore::write_index_atomic(&cache_path, entries, config.default_hash)
}

/// Make sure an interruption surfaces as the tagged error.
pub(crate) fn interrupted_error() -> Error {
    WorkflowError::Interrupted.into()
}
