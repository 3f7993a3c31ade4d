//! Sorted merge of the scan stream against a loaded index.
//!
//! Both sides are ascending by relative path, so one linear pass
//! classifies every path as new, deleted, unchanged or modified. Every
//! classified path is appended to the scan index: fresh entries (with a
//! hash job) for new/modified, verbatim copies for unchanged, tombstones
//! for deleted. Unchanged entries keep the context tag of their source,
//! which is what later lets the coordinator keep committed entries out
//! of the cache file.

use std::iter::Peekable;
use std::time::Duration;

use anyhow::Error;
use crossbeam_channel::{Receiver, RecvTimeoutError};

use dcfh_datastore::entry::EntryMeta;
use dcfh_datastore::entry_map::{EntryItem, EntryMap, IndexContext};
use dcfh_datastore::index_file::ScanIndexWriter;
use dcfh_tools::ShutdownSignal;

use crate::hash_pool::{HashJobKind, HashPool};
use crate::scan::ScanItem;

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receive the next scan item, polling the shutdown signal. `Ok(None)`
/// means the stream closed; a fired signal also ends the merge, the
/// caller checks the signal itself.
fn recv_item(
    rx: &Receiver<ScanItem>,
    shutdown: &ShutdownSignal,
) -> Option<ScanItem> {
    loop {
        if shutdown.is_fired() {
            return None;
        }
        match rx.recv_timeout(RECV_POLL_INTERVAL) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Advance the container iterator past deleted entries: an existing
/// tombstone only means "this path was already known to be gone".
fn next_live<I: Iterator<Item = (String, EntryItem)>>(
    iter: &mut Peekable<I>,
) -> Option<(String, EntryItem)> {
    for (key, item) in iter.by_ref() {
        if !item.is_deleted() {
            return Some((key, item));
        }
    }
    None
}

/// Merge the scan stream with the comparison container `base`,
/// appending every path to `writer` and collecting the resulting scan
/// container. Returns the partial result when the shutdown signal
/// fires; the caller decides what to do with it.
pub fn merge_scan(
    rx: &Receiver<ScanItem>,
    base: EntryMap,
    writer: &mut ScanIndexWriter,
    pool: &HashPool,
    shutdown: &ShutdownSignal,
) -> Result<EntryMap, Error> {
    let mut scan_map = EntryMap::new();
    let mut base_iter = base.into_iter().peekable();

    let mut pending_item = recv_item(rx, shutdown);
    let mut pending_base = next_live(&mut base_iter);

    loop {
        if shutdown.is_fired() {
            return Ok(scan_map);
        }

        enum Step {
            New,
            Tombstone,
            Both,
            Done,
        }

        let step = match (&pending_item, &pending_base) {
            (None, None) => Step::Done,
            (Some(_), None) => Step::New,
            (None, Some(_)) => Step::Tombstone,
            (Some(item), Some((key, _))) => match item.rel_path.as_str().cmp(key.as_str()) {
                std::cmp::Ordering::Less => Step::New,
                std::cmp::Ordering::Greater => Step::Tombstone,
                std::cmp::Ordering::Equal => Step::Both,
            },
        };

        let result = match step {
            Step::Done => break,
            Step::New => {
                let item = pending_item.take().unwrap();
                let result = add_new(&item, writer, pool, &mut scan_map);
                pending_item = recv_item(rx, shutdown);
                result
            }
            Step::Tombstone => {
                let (key, base_item) = pending_base.take().unwrap();
                let result = add_tombstone(&key, &base_item, writer, &mut scan_map);
                pending_base = next_live(&mut base_iter);
                result
            }
            Step::Both => {
                let item = pending_item.take().unwrap();
                let (key, base_item) = pending_base.take().unwrap();

                let scan_meta = EntryMeta::from_stat(&item.stat);
                let unchanged = {
                    let entry = base_item.entry.resolve();
                    entry.meta().unchanged(&scan_meta)
                };

                let result = if unchanged {
                    // keep the old hash and the original context tag
                    let entry = base_item.entry.resolve();
                    writer.append_copy(&key, &entry, false).map(|entry_ref| {
                        drop(entry);
                        scan_map.insert(
                            key,
                            EntryItem {
                                entry: entry_ref,
                                context: base_item.context,
                            },
                        );
                    })
                } else {
                    add_new(&item, writer, pool, &mut scan_map)
                };

                pending_item = recv_item(rx, shutdown);
                pending_base = next_live(&mut base_iter);
                result
            }
        };

        if let Err(err) = result {
            // a fired signal makes workers bail and submissions fail;
            // that is interruption fallout, not a merge error, and the
            // partial container is still wanted
            if shutdown.is_fired() {
                return Ok(scan_map);
            }
            return Err(err);
        }
    }

    Ok(scan_map)
}

/// Append a fresh zero-hash entry and queue its hash job.
fn add_new(
    item: &ScanItem,
    writer: &mut ScanIndexWriter,
    pool: &HashPool,
    scan_map: &mut EntryMap,
) -> Result<(), Error> {
    let meta = EntryMeta::from_stat(&item.stat);
    let entry_ref = writer.append_new(&item.rel_path, &meta)?;

    let kind = if item.is_symlink() {
        HashJobKind::Symlink
    } else {
        HashJobKind::File
    };
    pool.submit(item.abs_path.clone(), entry_ref.clone(), kind)?;

    scan_map.insert(
        item.rel_path.clone(),
        EntryItem {
            entry: entry_ref,
            context: IndexContext::Scan,
        },
    );
    Ok(())
}

/// Copy metadata and old hash, set the deleted flag.
fn add_tombstone(
    key: &str,
    base_item: &EntryItem,
    writer: &mut ScanIndexWriter,
    scan_map: &mut EntryMap,
) -> Result<(), Error> {
    let entry = base_item.entry.resolve();
    let entry_ref = writer.append_copy(key, &entry, true)?;
    drop(entry);

    scan_map.insert(
        key.to_string(),
        EntryItem {
            entry: entry_ref,
            context: IndexContext::Scan,
        },
    );
    Ok(())
}
