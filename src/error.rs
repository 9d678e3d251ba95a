use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MvMapError>;

/// Errors surfaced by builders, readers and the query engine.
///
/// A missing key is never an error; lookups return an empty result instead.
#[derive(Debug, Error)]
pub enum MvMapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Perfect hash construction ran out of seeds. The builder that raised
    /// this keeps its contents.
    #[error("perfect hash construction failed for {keys} keys after {attempts} attempts")]
    Construction { keys: usize, attempts: u32 },

    #[error("corrupt blob at offset {offset}: {reason}")]
    CorruptBlob { offset: u64, reason: String },

    #[error("query parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("view was created from a different map")]
    ViewMismatch,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("mapping too large: {0}")]
    TooLarge(String),
}

impl MvMapError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        MvMapError::CorruptBlob {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        MvMapError::Parse {
            position,
            message: message.into(),
        }
    }
}
