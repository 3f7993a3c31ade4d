use crate::validate::EntryDefect;

/// Tagged error kinds for index file access.
///
/// Workflows pass these through `anyhow::Error`; callers that need to
/// distinguish kinds use `downcast_ref::<IndexError>()`.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("I/O error - {0}")]
    Io(#[from] std::io::Error),

    #[error("not an index file (bad signature)")]
    InvalidSignature,

    #[error("index file written with foreign byte order")]
    ByteOrderMismatch,

    #[error("unsupported index version {found}")]
    VersionUnsupported { found: u32 },

    #[error("index checksum mismatch")]
    ChecksumMismatch,

    #[error("index file was not closed cleanly")]
    UncleanFile,

    #[error("corrupt entry at offset {offset} - {defect}")]
    EntryCorrupt { offset: u64, defect: EntryDefect },
}

pub(crate) fn nix_to_io(errno: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}
