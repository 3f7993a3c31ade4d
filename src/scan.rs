//! The filesystem scanner.
//!
//! Walks a repository in globally lexicographic path order: a sorted
//! frontier of pending relative paths is popped smallest-first, and
//! directory children are fed back into the frontier. That yields a
//! strictly ascending stream even across directory boundaries (`a.txt`
//! sorts between `a/b` only one way; depth-first emission would get it
//! wrong).
//!
//! Only regular files and symlinks are emitted; directories are
//! traversed, special files skipped.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::Sender;
use nix::sys::stat::{lstat, stat, FileStat};

use dcfh_tools::ShutdownSignal;

use crate::config::SymlinkMode;
use crate::error::WorkflowError;
use crate::ignore::IgnoreList;
use crate::repository::META_DIR_NAME;

/// Capacity of the scan output channel; the scanner blocks on
/// backpressure from the comparator.
pub const SCAN_CHANNEL_DEPTH: usize = 50;

const META_DIR_PREFIX: &str = ".dcfh/";

/// One scanned filesystem object.
pub struct ScanItem {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub stat: FileStat,
}

impl ScanItem {
    pub fn is_symlink(&self) -> bool {
        (self.stat.st_mode & libc::S_IFMT) == libc::S_IFLNK
    }
}

pub struct Scanner {
    root: PathBuf,
    ignore: IgnoreList,
    symlink_mode: SymlinkMode,
    shutdown: ShutdownSignal,
}

/// Sort the requested paths and drop any that is a strict descendant of
/// another, so no subtree is walked twice.
pub fn dedup_paths(mut paths: Vec<String>) -> Vec<String> {
    if paths.iter().any(|p| p.is_empty()) {
        return vec![String::new()];
    }
    paths.sort();
    paths.dedup();

    let mut kept: Vec<String> = Vec::new();
    for path in paths {
        match kept.last() {
            Some(prev) if path.starts_with(prev.as_str()) && path.as_bytes().get(prev.len()) == Some(&b'/') => (),
            _ => kept.push(path),
        }
    }
    kept
}

impl Scanner {
    pub fn new(
        root: PathBuf,
        ignore: IgnoreList,
        symlink_mode: SymlinkMode,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            root,
            ignore,
            symlink_mode,
            shutdown,
        }
    }

    /// Walk the given repository relative paths (empty list means the
    /// whole tree) and emit [`ScanItem`]s in strictly ascending relative
    /// path order. Closes the channel on return; polls the shutdown
    /// signal before every frontier pop.
    pub fn run(self, paths: Vec<String>, tx: Sender<ScanItem>) -> Result<(), Error> {
        let mut frontier: BTreeSet<String> = BTreeSet::new();
        if paths.is_empty() {
            frontier.insert(String::new());
        } else {
            for path in dedup_paths(paths) {
                frontier.insert(path);
            }
        }

        let mut visited_dirs: HashSet<(u64, u64)> = HashSet::new();

        while let Some(rel) = frontier.pop_first() {
            if self.shutdown.is_fired() {
                bail!(WorkflowError::Interrupted);
            }
            if !self.visit(&rel, &mut frontier, &mut visited_dirs, &tx)? {
                break;
            }
        }
        Ok(())
    }

    /// Returns `false` once the receiving side hung up.
    fn visit(
        &self,
        rel: &str,
        frontier: &mut BTreeSet<String>,
        visited_dirs: &mut HashSet<(u64, u64)>,
        tx: &Sender<ScanItem>,
    ) -> Result<bool, Error> {
        if !rel.is_empty() {
            if rel == META_DIR_NAME || rel.starts_with(META_DIR_PREFIX) {
                return Ok(true);
            }
            if self.ignore.is_ignored(rel) {
                log::debug!("ignoring {:?}", rel);
                return Ok(true);
            }
        }

        let abs = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };

        let item_stat = match lstat(&abs) {
            Ok(item_stat) => item_stat,
            Err(nix::errno::Errno::ENOENT) => {
                log::warn!("{:?} vanished during scan", abs);
                return Ok(true);
            }
            Err(err) => bail!("unable to stat {:?} - {}", abs, err),
        };

        match item_stat.st_mode & libc::S_IFMT {
            libc::S_IFDIR => {
                self.enter_dir(rel, &abs, &item_stat, frontier, visited_dirs)?;
                Ok(true)
            }
            libc::S_IFLNK => {
                // need the target type to decide between file and
                // directory symlink handling
                match stat(&abs) {
                    Ok(target) if (target.st_mode & libc::S_IFMT) == libc::S_IFDIR => {
                        let traverse = match self.symlink_mode {
                            SymlinkMode::All => true,
                            SymlinkMode::Contained => self.target_is_contained(&abs),
                            SymlinkMode::None => false,
                        };
                        if traverse {
                            self.enter_dir(rel, &abs, &target, frontier, visited_dirs)?;
                        } else {
                            log::debug!("not traversing directory symlink {:?}", rel);
                        }
                        Ok(true)
                    }
                    // dangling symlinks hash like file symlinks, over
                    // the target path string
                    _ => self.emit(rel, abs, item_stat, tx),
                }
            }
            libc::S_IFREG => self.emit(rel, abs, item_stat, tx),
            _ => {
                log::debug!("skipping special file {:?}", abs);
                Ok(true)
            }
        }
    }

    fn target_is_contained(&self, abs: &std::path::Path) -> bool {
        match std::fs::canonicalize(abs) {
            Ok(resolved) => resolved.starts_with(&self.root),
            Err(err) => {
                log::debug!("unable to resolve symlink {:?} - {}", abs, err);
                false
            }
        }
    }

    fn enter_dir(
        &self,
        rel: &str,
        abs: &std::path::Path,
        dir_stat: &FileStat,
        frontier: &mut BTreeSet<String>,
        visited_dirs: &mut HashSet<(u64, u64)>,
    ) -> Result<(), Error> {
        if !visited_dirs.insert((dir_stat.st_dev, dir_stat.st_ino)) {
            log::warn!("directory cycle at {:?}, not traversing again", abs);
            return Ok(());
        }

        let iter = std::fs::read_dir(abs)
            .map_err(|err| format_err!("unable to read directory {:?} - {}", abs, err))?;

        for item in iter {
            let item = item?;
            let name = match item.file_name().into_string() {
                Ok(name) => name,
                Err(name) => {
                    log::warn!("skipping non UTF-8 file name {:?} in {:?}", name, abs);
                    continue;
                }
            };
            let child_rel = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            frontier.insert(child_rel);
        }
        Ok(())
    }

    fn emit(
        &self,
        rel: &str,
        abs: PathBuf,
        item_stat: FileStat,
        tx: &Sender<ScanItem>,
    ) -> Result<bool, Error> {
        let item = ScanItem {
            rel_path: rel.to_string(),
            abs_path: abs,
            stat: item_stat,
        };
        // a dropped receiver means the comparator is gone; its error
        // wins, just stop walking
        Ok(tx.send(item).is_ok())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect_scan(root: &std::path::Path, paths: Vec<String>) -> Vec<String> {
        let scanner = Scanner::new(
            root.to_path_buf(),
            IgnoreList::load(&root.join(META_DIR_NAME)),
            SymlinkMode::Contained,
            ShutdownSignal::new(),
        );
        let (tx, rx) = crossbeam_channel::bounded(1000);
        scanner.run(paths, tx).unwrap();
        rx.iter().map(|item| item.rel_path).collect()
    }

    #[test]
    fn emits_globally_sorted_stream() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("a")).unwrap();
        std::fs::create_dir(root.join(".dcfh")).unwrap();
        std::fs::write(root.join("a/b"), b"ab").unwrap();
        std::fs::write(root.join("a.txt"), b"A").unwrap();
        std::fs::write(root.join("z"), b"z").unwrap();
        std::fs::create_dir(root.join("b")).unwrap();
        std::fs::write(root.join("b/c.txt"), b"BC").unwrap();

        let emitted = collect_scan(root, Vec::new());
        assert_eq!(emitted, vec!["a.txt", "a/b", "b/c.txt", "z"]);

        // strictly ascending
        for pair in emitted.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn restricted_paths_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub/inner")).unwrap();
        std::fs::write(root.join("sub/inner/x"), b"x").unwrap();
        std::fs::write(root.join("sub/y"), b"y").unwrap();
        std::fs::write(root.join("top"), b"t").unwrap();

        let emitted = collect_scan(
            root,
            vec!["sub".to_string(), "sub/inner".to_string()],
        );
        assert_eq!(emitted, vec!["sub/inner/x", "sub/y"]);

        assert_eq!(
            dedup_paths(vec![
                "b/c".to_string(),
                "a".to_string(),
                "a/x".to_string(),
                "ab".to_string(),
                "a".to_string(),
            ]),
            vec!["a".to_string(), "ab".to_string(), "b/c".to_string()]
        );
        assert_eq!(dedup_paths(vec!["a".into(), "".into()]), vec![String::new()]);
    }

    #[test]
    fn symlinks_are_recorded_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("real"), b"content").unwrap();
        std::os::unix::fs::symlink("real", root.join("link")).unwrap();
        std::os::unix::fs::symlink("/nonexistent", root.join("dangling")).unwrap();

        let emitted = collect_scan(root, Vec::new());
        assert_eq!(emitted, vec!["dangling", "link", "real"]);
    }

    #[test]
    fn shutdown_interrupts_walk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();

        let shutdown = ShutdownSignal::new();
        shutdown.fire();
        let scanner = Scanner::new(
            dir.path().to_path_buf(),
            IgnoreList::load(&dir.path().join(META_DIR_NAME)),
            SymlinkMode::Contained,
            shutdown,
        );
        let (tx, _rx) = crossbeam_channel::bounded(10);
        let err = scanner.run(Vec::new(), tx).unwrap_err();
        assert!(crate::error::is_interrupted(&err));
    }
}
