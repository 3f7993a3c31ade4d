use std::path::PathBuf;

/// Tagged workflow level error kinds.
///
/// Index file access has its own kinds in
/// [`dcfh_datastore::IndexError`]; both travel through `anyhow::Error`
/// and stay downcastable.
#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    /// The shutdown signal fired at a suspension point. Partial cache
    /// results may have been written; the main index is untouched.
    #[error("operation interrupted")]
    Interrupted,

    #[error("not a repository: {path:?}")]
    NotARepository { path: PathBuf },

    /// Another scan holds the repository scan lock and the caller asked
    /// not to wait for it.
    #[error("another scan is already running")]
    AlreadyRunning,

    #[error("invalid configuration - {msg}")]
    ConfigInvalid { msg: String },
}

/// Whether an error (possibly wrapped) is the interruption marker.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Interrupted)
    )
}
