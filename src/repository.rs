//! Repository handles.
//!
//! A repository is a directory carrying a `.dcfh/` metadata directory.
//! Handles are process-wide singletons per canonical root, so the
//! per-repository scan mutex actually serialises concurrent operations
//! within one process.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;

use dcfh_datastore::entry_map::{EntryMap, IndexContext};
use dcfh_datastore::temp_file;
use dcfh_datastore::{load_entry_map, write_index_atomic, ValidationMode};
use dcfh_tools::ShutdownSignal;

use crate::config::Config;
use crate::error::WorkflowError;
use crate::recovery::{self, FixMode, FixPrompt};
use crate::workflow::duplicates::{duplicates_locked, DuplicateGroup};
use crate::workflow::status::{status_locked, StatusReport};
use crate::workflow::update::update_locked;

pub const META_DIR_NAME: &str = ".dcfh";
pub const MAIN_INDEX_NAME: &str = "main.idx";
pub const CACHE_INDEX_NAME: &str = "cache.idx";

lazy_static! {
    static ref REPOSITORY_MAP: Mutex<HashMap<PathBuf, Arc<Repository>>> =
        Mutex::new(HashMap::new());
}

/// Per-operation options: the option map from the front end, the
/// shutdown signal and whether to wait for a running scan.
#[derive(Clone)]
pub struct OperationOptions {
    pub options: HashMap<String, String>,
    pub shutdown: ShutdownSignal,
    pub wait: bool,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            options: HashMap::new(),
            shutdown: ShutdownSignal::new(),
            wait: true,
        }
    }
}

impl OperationOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct Repository {
    root: PathBuf,
    meta_dir: PathBuf,
    config: Config,
    scan_mutex: Mutex<()>,
}

impl Repository {
    /// Look up (or create) the handle for the repository at `root`.
    ///
    /// An existing directory without metadata is initialised with an
    /// empty committed index; a missing root is `NotARepository`.
    pub fn open(root: &Path) -> Result<Arc<Repository>, Error> {
        let root = root.canonicalize().map_err(|_| WorkflowError::NotARepository {
            path: root.to_path_buf(),
        })?;
        if !root.is_dir() {
            bail!(WorkflowError::NotARepository { path: root });
        }

        let mut map = REPOSITORY_MAP.lock().unwrap();
        if let Some(repo) = map.get(&root) {
            return Ok(Arc::clone(repo));
        }

        let meta_dir = root.join(META_DIR_NAME);
        if !meta_dir.is_dir() {
            std::fs::create_dir(&meta_dir)
                .map_err(|err| format_err!("unable to create {:?} - {}", meta_dir, err))?;
        }

        let config = Config::load(&meta_dir)?;

        let main_path = meta_dir.join(MAIN_INDEX_NAME);
        if !main_path.exists() {
            write_index_atomic(&main_path, &[], config.default_hash)?;
        }

        let repo = Arc::new(Repository {
            root: root.clone(),
            meta_dir,
            config,
            scan_mutex: Mutex::new(()),
        });
        map.insert(root, Arc::clone(&repo));

        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn main_index_path(&self) -> PathBuf {
        self.meta_dir.join(MAIN_INDEX_NAME)
    }

    pub fn cache_index_path(&self) -> PathBuf {
        self.meta_dir.join(CACHE_INDEX_NAME)
    }

    pub(crate) fn load_main(&self, mode: ValidationMode) -> Result<EntryMap, Error> {
        let (map, defects) = load_entry_map(&self.main_index_path(), IndexContext::Main, mode)?;
        for defect in &defects {
            log::warn!("main index: {}", defect);
        }
        Ok(map)
    }

    /// An absent cache file is an empty container.
    pub(crate) fn load_cache(&self, mode: ValidationMode) -> Result<EntryMap, Error> {
        let path = self.cache_index_path();
        if !path.exists() {
            return Ok(EntryMap::new());
        }
        let (map, defects) = load_entry_map(&path, IndexContext::Cache, mode)?;
        for defect in &defects {
            log::warn!("cache index: {}", defect);
        }
        Ok(map)
    }

    /// Serialise scans on this repository. With `wait` the second caller
    /// blocks until the lock is free and then performs its own fresh
    /// scan; without it the call fails fast.
    pub(crate) fn lock_scan(&self, wait: bool) -> Result<MutexGuard<'_, ()>, Error> {
        if wait {
            Ok(self.scan_mutex.lock().unwrap())
        } else {
            self.scan_mutex
                .try_lock()
                .map_err(|_| WorkflowError::AlreadyRunning.into())
        }
    }

    /// Report scan/temp files left behind by dead processes. They are
    /// never deleted automatically; recovery may incorporate them.
    pub fn report_orphans(&self) {
        match temp_file::find_orphans(&self.meta_dir) {
            Ok(orphans) => {
                for orphan in orphans {
                    log::warn!(
                        "orphaned file {:?} (pid {} no longer running)",
                        orphan.path,
                        orphan.pid
                    );
                }
            }
            Err(err) => log::warn!("orphan detection failed - {}", err),
        }
    }

    /// Turn a user supplied path (absolute or repository relative) into
    /// the canonical forward slash relative form. Purely lexical, so
    /// paths of deleted files work too.
    pub fn relativize(&self, path: &Path) -> Result<String, Error> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .map_err(|_| format_err!("path {:?} is outside the repository", path))?
        } else {
            path
        };

        let mut parts: Vec<&str> = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => match part.to_str() {
                    Some(part) => parts.push(part),
                    None => bail!("path {:?} is not valid UTF-8", path),
                },
                Component::CurDir => (),
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        bail!("path {:?} escapes the repository", path);
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    bail!("unexpected component in path {:?}", path)
                }
            }
        }
        Ok(parts.join("/"))
    }

    /// What changed since the last commit.
    pub fn status(&self, opts: &OperationOptions) -> Result<StatusReport, Error> {
        let config = self.config.with_overrides(&opts.options)?;
        let _guard = self.lock_scan(opts.wait)?;
        self.report_orphans();
        status_locked(self, &config, &opts.shutdown)
    }

    /// Commit the current state, wholly or restricted to `paths`.
    pub fn update(&self, paths: &[PathBuf], opts: &OperationOptions) -> Result<(), Error> {
        let config = self.config.with_overrides(&opts.options)?;
        let rel_paths = paths
            .iter()
            .map(|p| self.relativize(p))
            .collect::<Result<Vec<_>, Error>>()?;

        let _guard = self.lock_scan(opts.wait)?;
        self.report_orphans();
        update_locked(self, &config, rel_paths, &opts.shutdown)
    }

    /// Refresh the cache, then group files sharing a digest.
    pub fn find_duplicates(&self, opts: &OperationOptions) -> Result<Vec<DuplicateGroup>, Error> {
        let config = self.config.with_overrides(&opts.options)?;
        let _guard = self.lock_scan(opts.wait)?;
        self.report_orphans();
        duplicates_locked(self, &config, &opts.shutdown)
    }

    /// Repair the repository indices; see [`crate::recovery`].
    pub fn recover(
        &self,
        opts: &OperationOptions,
        fix: FixMode,
        prompt: &mut dyn FixPrompt,
    ) -> Result<(), Error> {
        let config = self.config.with_overrides(&opts.options)?;
        let _guard = self.lock_scan(opts.wait)?;
        recovery::auto_recover(self, &config, fix, prompt, &opts.shutdown)
    }
}
