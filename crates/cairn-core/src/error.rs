use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("lock unavailable on '{0}'")]
    LockUnavailable(PathBuf),

    #[error("corrupt count file '{path}': {reason}")]
    CorruptCountFile { path: PathBuf, reason: String },

    #[error("rename '{from}' -> '{to}' failed: {source}")]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("unlink '{path}' failed: {source}")]
    UnlinkFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("chmod '{path}' failed: {source}")]
    ChmodFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("write '{path}' failed: {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Missing pool file {digest} count {count}")]
    MissingPoolObject { digest: String, count: i64 },

    #[error("Unknown pool file removed: '{0}'")]
    UnknownPoolObject(PathBuf),

    #[error("Unexpected pool file removed: '{0}'")]
    UnexpectedPoolObject(PathBuf),

    #[error("count mismatch for {digest}: rebuilt {rebuilt}, existing {existing}")]
    CountMismatch {
        digest: String,
        rebuilt: String,
        existing: String,
    },

    #[error("count underflow for {digest}: {count}")]
    CountUnderflow { digest: String, count: i64 },

    #[error("invalid arguments: {0}")]
    BadArgs(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
