use thiserror::Error;

use crate::model::BackendKind;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid slice name {0:?}: use letters, digits, '-' or '_'")]
    InvalidName(String),

    #[error("Slice {0} has no nodes")]
    EmptyTopology(String),

    #[error("Node {node} links to unknown node {peer}")]
    UnknownLink { node: String, peer: String },

    #[error("Node {0} requests a zero-sized resource")]
    InvalidResources(String),

    #[error("Flavor not found: {0}")]
    UnknownFlavor(String),

    #[error("Image {0} not found and no source url given")]
    UnknownImage(String),

    #[error("Zone {0} has no workers")]
    UnknownZone(String),

    #[error("Node {0} has no assigned worker")]
    Unassigned(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("No worker can host node {node}")]
    Infeasible { node: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Worker {0} not found")]
    UnknownWorker(i64),

    #[error("Slice {0} not found")]
    UnknownSlice(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("API request failed with status {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Network setup failed: {0}")]
    NetworkSetup(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Scheduling(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Slice document error: {0}")]
    Document(#[from] DocumentError),

    #[error("No driver registered for backend {0}")]
    NoDriver(BackendKind),

    #[error("VM {vm} does not belong to slice {slice}")]
    UnknownVm { slice: String, vm: String },
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid document name {0:?}")]
    InvalidName(String),
}
