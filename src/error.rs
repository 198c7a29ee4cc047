use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by [`crate::codec::decode`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("source image not found: {path}")]
    NotFound { path: PathBuf },

    #[error("unsupported image format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("corrupt image data in {path}: {source}")]
    CorruptData {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to read {path}: {source}")]
    IoFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("out of memory decoding {path}")]
    OutOfMemory { path: PathBuf },
}

impl CodecError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            CodecError::NotFound { path }
            | CodecError::UnsupportedFormat { path }
            | CodecError::CorruptData { path, .. }
            | CodecError::IoFailed { path, .. }
            | CodecError::OutOfMemory { path } => path,
        }
    }
}

/// Failures surfaced by [`crate::scheduler::Scheduler`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("decode worker terminated unexpectedly while decoding {path}")]
    WorkerDied { path: PathBuf },

    #[error("request for {path} was cancelled")]
    Cancelled { path: PathBuf },
}

/// Failures surfaced by [`crate::store::ThumbnailStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thumbnail database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("thumbnail database is corrupt: {0}")]
    CorruptDb(String),

    #[error("failed to write thumbnail record for {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to read thumbnail record: {source}")]
    ReadFailed {
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to acquire a pooled connection: {0}")]
    Pool(#[from] r2d2::Error),
}

/// The error surface a scheduler result carries downstream: either a codec
/// failure, or a scheduler-level failure (worker crash) that has no codec
/// counterpart.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl DecodeError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            DecodeError::Codec(error) => error.path(),
            DecodeError::Scheduler(SchedulerError::WorkerDied { path })
            | DecodeError::Scheduler(SchedulerError::Cancelled { path }) => path,
        }
    }
}

/// Top-level error type returned from [`crate::Engine`] entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("failed to create directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
