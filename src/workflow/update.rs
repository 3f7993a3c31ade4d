//! The update workflow: commit the current filesystem state.

use anyhow::Error;

use dcfh_datastore::entry_map::EntryMap;
use dcfh_datastore::index_file::EntryRef;
use dcfh_datastore::{write_index_atomic, MergeStrategy, ValidationMode};
use dcfh_tools::ShutdownSignal;

use crate::config::Config;
use crate::repository::Repository;
use crate::workflow::{interrupted_error, run_scan_pipeline, status};

/// Entries that belong into a committed main index: everything live, in
/// ascending path order. Tombstones never reach `main.idx`.
fn main_entries(map: &EntryMap) -> Vec<EntryRef> {
    map.iter()
        .filter(|(_, item)| !item.is_deleted())
        .map(|(_, item)| item.entry.clone())
        .collect()
}

/// Update body; the caller holds the repository scan lock.
///
/// Without paths the whole tree is scanned against an empty container
/// (every file re-hashes) and the result becomes the new main index.
/// With paths, only the subtrees in question are re-scanned and merged
/// over a copy of the committed state; afterwards the status workflow
/// refreshes the cache against the new main.
pub(crate) fn update_locked(
    repo: &Repository,
    config: &Config,
    paths: Vec<String>,
    shutdown: &ShutdownSignal,
) -> Result<(), Error> {
    if paths.is_empty() {
        update_full(repo, config, shutdown)
    } else {
        update_paths(repo, config, paths, shutdown)
    }
}

fn update_full(
    repo: &Repository,
    config: &Config,
    shutdown: &ShutdownSignal,
) -> Result<(), Error> {
    let (outcome, _scan_guard) =
        run_scan_pipeline(repo, config, EntryMap::new(), Vec::new(), shutdown)?;
    if outcome.interrupted {
        return Err(interrupted_error());
    }

    write_index_atomic(
        &repo.main_index_path(),
        &main_entries(&outcome.scan_map),
        config.default_hash,
    )?;

    remove_cache(repo);
    Ok(())
}

fn update_paths(
    repo: &Repository,
    config: &Config,
    paths: Vec<String>,
    shutdown: &ShutdownSignal,
) -> Result<(), Error> {
    let main_map = repo.load_main(ValidationMode::Strict)?;

    let selected = crate::scan::dedup_paths(paths);

    // committed entries under the requested paths form the comparison
    // container, so unchanged files keep their hashes
    let mut restricted = main_map.clone();
    restricted.retain(|key, _| {
        selected.iter().any(|path| {
            key == path.as_str()
                || (key.len() > path.len()
                    && key.starts_with(path.as_str())
                    && key.as_bytes()[path.len()] == b'/')
        })
    });

    let (outcome, _scan_guard) =
        run_scan_pipeline(repo, config, restricted, selected, shutdown)?;
    if outcome.interrupted {
        return Err(interrupted_error());
    }

    let mut merged = main_map;
    merged.merge_from(outcome.scan_map, MergeStrategy::TheirsWins)?;

    write_index_atomic(
        &repo.main_index_path(),
        &main_entries(&merged),
        config.default_hash,
    )?;
    drop(merged);

    // now bring the cache up to date against the new main
    let _ = status::status_locked(repo, config, shutdown)?;
    Ok(())
}

fn remove_cache(repo: &Repository) {
    match std::fs::remove_file(repo.cache_index_path()) {
        Ok(()) => (),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
        // a stale cache only costs a rescan, the next status rewrites it
        Err(err) => log::warn!("unable to remove cache index - {}", err),
    }
}
