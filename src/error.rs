use std::path::PathBuf;

use thiserror::Error;

use crate::store::ChunkHash;

pub type MergeResult<T> = Result<T, MergeError>;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("chunk {hash} is not ready")]
    NotReady { hash: ChunkHash },

    #[error("unable to stat chunk {hash} ({})", .path.display())]
    StatFailure {
        hash: ChunkHash,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("end of central directory signature not found")]
    SignatureNotFound,

    #[error("failed to write chunk {hash} to the work directory: {source}")]
    DiscWrite {
        hash: ChunkHash,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("unsupported archive feature: {0}")]
    Unsupported(String),

    #[error("content mismatch in {path}: {reason}")]
    ContentMismatch { path: String, reason: String },

    #[error("failed to write entry {path}: {source}")]
    EntryWrite {
        path: String,
        #[source]
        source: Box<MergeError>,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

impl MergeError {
    /// Whether the error only means "try again later".
    pub fn is_not_ready(&self) -> bool {
        matches!(self, MergeError::NotReady { .. })
    }

    /// Errors that make a single source archive unusable without affecting the
    /// rest of the run.
    pub fn is_source_rejection(&self) -> bool {
        matches!(
            self,
            MergeError::SignatureNotFound
                | MergeError::InvalidArchive(_)
                | MergeError::Unsupported(_)
        )
    }
}
