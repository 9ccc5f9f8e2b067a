use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{CounterpartyId, PieceId, TaskId};

/// Invalid flags, mode combinations or configuration values. Always fatal and
/// surfaced before any work starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid dispatch mode combination: {0}")]
    InvalidModeCombination(String),

    #[error("slice size limit must be greater than zero")]
    InvalidSliceSize,

    #[error("parallelism must be greater than zero")]
    InvalidParallelism,

    #[error("replication target must be at least 1, got {0}")]
    InvalidReplicationTarget(u32),

    #[error("no archives to assemble into a task")]
    NoArchives,

    #[error("remote encoder selected but no encoder url configured")]
    MissingRemoteUrl,

    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Error, Debug)]
pub enum BuildError {
    /// The encoding backend could not be reached. Retryable.
    #[error("encoder backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A source file of the unit could not be read. Fatal for that unit only.
    #[error("source unreadable {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("remote encoder refused request ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),
}

impl BuildError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildError::BackendUnavailable(_))
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("no upload endpoint configured")]
    MissingEndpoint,

    #[error("upload endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("upload refused ({status}): {message}")]
    Refused { status: u16, message: String },

    #[error("archive unreadable {path}: {source}")]
    ArchiveUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unexpected upload response: {0}")]
    BadResponse(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Encoding(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("piece {0} not found")]
    PieceNotFound(PieceId),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

impl From<serde_cbor::Error> for StoreError {
    fn from(e: serde_cbor::Error) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

/// A piece that ended a one-shot pass in the Failed state.
#[derive(Debug, Clone)]
pub struct FailedPiece {
    pub piece_id: PieceId,
    pub attempted: Vec<CounterpartyId>,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("deal proposal to {counterparty} timed out")]
    Timeout { counterparty: CounterpartyId },

    #[error("deal proposal rejected by {counterparty}: {reason}")]
    Rejected {
        counterparty: CounterpartyId,
        reason: String,
    },

    #[error("market rpc error: {0}")]
    Rpc(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{} piece(s) of task {task_id} failed", .failed.len())]
    PiecesFailed {
        task_id: TaskId,
        failed: Vec<FailedPiece>,
    },

    #[error("{pending} piece(s) of task {task_id} still in flight after the pass")]
    PiecesUnfinished { task_id: TaskId, pending: usize },

    #[error("dispatch task join error: {0}")]
    Join(String),
}

#[derive(Error, Debug)]
pub enum OnboardError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("{failed} of {total} units failed to build")]
    PackIncomplete { failed: usize, total: usize },

    #[error("{failed} of {total} archives failed to upload")]
    UploadIncomplete { failed: usize, total: usize },
}

impl From<serde_json::Error> for OnboardError {
    fn from(e: serde_json::Error) -> Self {
        OnboardError::Format(e.to_string())
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, OnboardError>;
