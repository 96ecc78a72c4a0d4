use std::io;

use thiserror::Error;

/// Why a login attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialError {
    /// no live user row carries that name
    UnknownUser,
    /// the user exists but the password does not match
    WrongPassword,
    /// the user's group has been removed
    GroupRemoved,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("partition {0} is not mounted")]
    NotMounted(String),

    #[error("partition {0} not found")]
    PartitionNotFound(String),

    #[error("not enough free space: {0}")]
    NoFreeSpace(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("path segment {0} does not exist")]
    PathSegmentMissing(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("{0} is not a file")]
    NotAFile(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid credentials ({0:?})")]
    InvalidCredentials(CredentialError),

    #[error("unsupported filesystem type: {0}")]
    UnsupportedFilesystemType(String),

    #[error("indirection unsupported: {0}")]
    IndirectionUnsupported(String),

    #[error("failed to access {entity} at offset {offset}")]
    SerializationFailure {
        entity: &'static str,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("malformed {entity} at offset {offset}: {reason}")]
    Malformed {
        entity: &'static str,
        offset: u64,
        reason: String,
    },

    #[error("partition at offset {0} holds no filesystem")]
    NotFormatted(u64),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no active session")]
    NoSession,

    #[error("a session is already active for {0}")]
    SessionActive(String),

    #[error("no mount letters left for disk {0}")]
    MountLettersExhausted(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub(crate) fn io(entity: &'static str, offset: u64, source: io::Error) -> Self {
        FsError::SerializationFailure {
            entity,
            offset,
            source,
        }
    }
}
