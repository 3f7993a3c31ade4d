//! dcfh - a content-integrity index for directory trees.
//!
//! A repository is any directory with a `.dcfh/` metadata directory. The
//! committed state lives in `main.idx`, pending additions in `cache.idx`,
//! and in-flight work in per-process `scan-*.idx` files. Three operations
//! are exposed on a [`Repository`] handle:
//!
//! * [`Repository::status`] - what changed since the last commit,
//! * [`Repository::update`] - commit the current state,
//! * [`Repository::find_duplicates`] - files sharing a content digest.
//!
//! Comparison against the filesystem is incremental: a scan stream sorted
//! by path is merged against the loaded index, and only added or modified
//! files are re-hashed by a worker pool.

pub mod compare;
pub mod config;
pub mod error;
pub mod format;
pub mod hash_pool;
pub mod ignore;
pub mod recovery;
pub mod repository;
pub mod scan;
pub mod workflow;

pub use config::{Config, OutputFormat, SymlinkMode};
pub use error::WorkflowError;
pub use repository::{OperationOptions, Repository};
pub use workflow::duplicates::DuplicateGroup;
pub use workflow::status::StatusReport;

pub use dcfh_tools::ShutdownSignal;
