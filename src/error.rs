use std::io;

use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// Failure kinds surfaced by the filesystem.
///
/// Lower layers map their failures onto these kinds; the only errors that are
/// swallowed anywhere are idempotent frees (releasing an already-free block
/// is a no-op). The shell prints the message plus [`FsError::code`].
#[derive(Debug, Error)]
pub enum FsError {
    #[error("filesystem is not mounted")]
    NotMounted,

    #[error("filesystem is already mounted")]
    AlreadyMounted,

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("wrong type: {0}")]
    WrongType(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("{0} is busy")]
    Busy(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("inode table exhausted")]
    NoInodes,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl FsError {
    /// Stable numeric code for the command-line surface.
    pub fn code(&self) -> i32 {
        match self {
            FsError::NotMounted => 1,
            FsError::AlreadyMounted => 2,
            FsError::InvalidName(_) => 3,
            FsError::NotFound(_) => 4,
            FsError::Exists(_) => 5,
            FsError::WrongType(_) => 6,
            FsError::NotEmpty(_) => 7,
            FsError::Busy(_) => 8,
            FsError::NoSpace => 9,
            FsError::NoInodes => 10,
            FsError::Io(_) => 11,
            FsError::Corruption(_) => 12,
        }
    }
}
