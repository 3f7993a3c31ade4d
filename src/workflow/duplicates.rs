//! Duplicate detection: group files sharing a content digest.

use std::collections::BTreeMap;

use anyhow::Error;
use serde::Serialize;

use dcfh_datastore::{MergeStrategy, ValidationMode};
use dcfh_tools::ShutdownSignal;

use crate::config::Config;
use crate::repository::Repository;
use crate::workflow::status;

/// Files whose content digests are identical.
#[derive(Clone, Debug, Serialize)]
pub struct DuplicateGroup {
    pub digest: String,
    pub paths: Vec<String>,
}

/// Duplicates body; the caller holds the repository scan lock.
///
/// Runs the status workflow first so the cache reflects the filesystem,
/// then groups all live hashed entries across main and cache.
pub(crate) fn duplicates_locked(
    repo: &Repository,
    config: &Config,
    shutdown: &ShutdownSignal,
) -> Result<Vec<DuplicateGroup>, Error> {
    let _report = status::status_locked(repo, config, shutdown)?;

    let mut all = repo.load_main(ValidationMode::Strict)?;
    all.merge_from(
        repo.load_cache(ValidationMode::Strict)?,
        MergeStrategy::TheirsWins,
    )?;

    // key: hash type plus used digest bytes, so equal digests of
    // different algorithms never collapse into one group
    let mut groups: BTreeMap<(u16, Vec<u8>), Vec<String>> = BTreeMap::new();

    for (path, item) in all.iter() {
        let entry = item.entry.resolve();
        if entry.is_deleted() {
            continue;
        }
        if let Some(digest) = entry.hash_slice() {
            groups
                .entry((entry.hash_type, digest.to_vec()))
                .or_default()
                .push(path.to_string());
        }
    }

    Ok(groups
        .into_iter()
        .filter(|(_, paths)| paths.len() >= 2)
        .map(|((_, digest), paths)| DuplicateGroup {
            digest: hex::encode(digest),
            paths,
        })
        .collect())
}
