//! # Error Types
//!
//! Defines a structured error hierarchy for the snapshot engine using
//! `thiserror`. Each error variant carries enough context for meaningful
//! diagnostics without exposing internal implementation details to the
//! caller. The variants map onto the error kinds in the design: NotFound,
//! Conflict, Integrity, Compatibility, Subprocess, I/O, and Internal.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type encompassing all failure modes in the snapshot engine.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("{0}")]
    Archive(#[from] ArchiveError),

    #[error("{0}")]
    Conflict(#[from] ConflictError),

    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    #[error("{0}")]
    Import(#[from] ImportError),

    #[error("user lookup error: {0}")]
    User(#[from] UserError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised while writing, reading, verifying, or restoring a single
/// archive container (components C1/C4).
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ArchiveError {
    #[error("cannot create archive: {0}")]
    TarFailed(String),

    #[error("snapshot entry {entry:?} expected hash {expected} does not match actual {actual}")]
    HashMismatch {
        entry: String,
        expected: String,
        actual: String,
    },

    #[error("missing metadata entry {0:?} in archive")]
    MissingMetadata(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error(
        "snap {snap} revision {revision}: unreadable epoch (archive write {archive_write:?}, candidate read {candidate_read:?})"
    )]
    UnreadableEpoch {
        snap: String,
        revision: i64,
        archive_write: Vec<u32>,
        candidate_read: Vec<u32>,
    },

    #[error("snap {snap}: snap-id mismatch (archive {archive_id}, installed {installed_id})")]
    SnapIdMismatch {
        snap: String,
        archive_id: String,
        installed_id: String,
    },

    #[error("target directory already exists: {0}")]
    TargetExists(PathBuf),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

/// Conflict between two snapshot operations, or between a snapshot operation
/// and an in-progress package-manager change (component C8).
#[derive(Error, Debug)]
pub enum ConflictError {
    #[error("cannot operate on snapshot set #{set_id} while change {change_id:?} is in progress")]
    ChangeInProgress { set_id: u64, change_id: String },

    #[error("cannot operate on snapshot set #{set_id} while operation {op} is in progress")]
    OpInProgress { set_id: u64, op: String },
}

/// "Not present" conditions: an unknown set-ID, or a filter that matched
/// nothing within an otherwise-known set.
#[derive(Error, Debug)]
pub enum NotFoundError {
    #[error("no snapshot set with id #{0}")]
    SetNotFound(u64),

    #[error("no snapshots found in set #{set_id} matching {requested:?}")]
    SnapsNotFoundInSet { set_id: u64, requested: Vec<String> },

    #[error("snapshot file not found: {0:?}")]
    SnapshotFileNotFound(PathBuf),
}

/// Errors raised by `Import`'s duplicate-detection (component C4).
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("snapshot for {snap:?} already exists in set #{existing_set_id}")]
    Duplicate { snap: String, existing_set_id: u64 },
}

/// Errors resolving OS users (component C2).
#[derive(Error, Debug)]
pub enum UserError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("unknown uid {0}")]
    UnknownUid(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors talking to the external state store collaborator.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("no state under key {0:?}")]
    NoState(String),

    #[error("state store is locked by another writer")]
    Locked,

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum ConfigError {
    #[error(transparent)]
    Parse(#[from] toml::de::Error),

    #[error("invalid retention value {0:?}: expected \"no\" or a duration like \"24h\"")]
    InvalidRetention(String),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

impl SnapshotError {
    /// Constructs an `Internal` error for invariant violations — e.g. a
    /// snapshot-kind task missing its `snapshot-setup` payload.
    pub fn internal(message: impl Into<String>) -> Self {
        SnapshotError::Internal(message.into())
    }
}
