//! The status workflow: what changed since the last commit.

use anyhow::Error;
use serde::Serialize;

use dcfh_datastore::entry_map::EntryMap;
use dcfh_datastore::{MergeStrategy, ValidationMode};
use dcfh_tools::ShutdownSignal;

use crate::config::Config;
use crate::repository::Repository;
use crate::workflow::{cache_entries, interrupted_error, run_scan_pipeline, write_cache};

/// Paths classified against the committed state.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusReport {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
}

impl StatusReport {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.deleted.is_empty()
    }
}

/// Status body; the caller holds the repository scan lock.
pub(crate) fn status_locked(
    repo: &Repository,
    config: &Config,
    shutdown: &ShutdownSignal,
) -> Result<StatusReport, Error> {
    let main_map = repo.load_main(ValidationMode::Strict)?;
    let cache_map = repo.load_cache(ValidationMode::Strict)?;

    // working container: committed state with pending changes layered
    // on top
    let mut work = main_map.clone();
    work.merge_from(cache_map, MergeStrategy::TheirsWins)?;

    let (outcome, _scan_guard) =
        run_scan_pipeline(repo, config, work, Vec::new(), shutdown)?;

    if outcome.interrupted {
        // retain what completed: the cache write is atomic, main is
        // untouched either way
        if let Err(err) = write_cache(repo, config, &cache_entries(&outcome.scan_map)) {
            log::warn!("unable to write partial cache - {}", err);
        }
        return Err(interrupted_error());
    }

    let report = classify(&main_map, &outcome.scan_map);

    write_cache(repo, config, &cache_entries(&outcome.scan_map))?;

    Ok(report)
}

/// Walk the committed container in lockstep with the scan container.
///
/// * a scan tombstone (or a committed path missing from the scan
///   container entirely, because the working set already carried a
///   tombstone for it) is a deletion,
/// * a scan-only live entry is an addition,
/// * a shared path whose metadata predicate fails is a modification.
fn classify(main_map: &EntryMap, scan_map: &EntryMap) -> StatusReport {
    let mut report = StatusReport::default();

    let mut main_iter = main_map.iter().peekable();
    let mut scan_iter = scan_map.iter().peekable();

    loop {
        enum Side {
            Main,
            Scan,
            Both,
        }

        let side = match (main_iter.peek(), scan_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Side::Main,
            (None, Some(_)) => Side::Scan,
            (Some((main_key, _)), Some((scan_key, _))) => match main_key.cmp(scan_key) {
                std::cmp::Ordering::Less => Side::Main,
                std::cmp::Ordering::Greater => Side::Scan,
                std::cmp::Ordering::Equal => Side::Both,
            },
        };

        match side {
            Side::Main => {
                let (key, _) = main_iter.next().unwrap();
                report.deleted.push(key.to_string());
            }
            Side::Scan => {
                let (key, item) = scan_iter.next().unwrap();
                if !item.entry.resolve().is_deleted() {
                    report.added.push(key.to_string());
                }
            }
            Side::Both => {
                let (key, main_item) = main_iter.next().unwrap();
                let (_, scan_item) = scan_iter.next().unwrap();

                let scan_entry = scan_item.entry.resolve();
                if scan_entry.is_deleted() {
                    report.deleted.push(key.to_string());
                } else {
                    let main_entry = main_item.entry.resolve();
                    if !main_entry.meta().unchanged(&scan_entry.meta()) {
                        report.modified.push(key.to_string());
                    }
                }
            }
        }
    }

    report
}
