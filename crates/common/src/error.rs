//! Error types for MeshHub

use thiserror::Error;

/// Result type alias using the MeshHub Error
pub type Result<T> = std::result::Result<T, Error>;

/// MeshHub error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Peer at {address} is unreachable: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("Peer with address {address} already exists")]
    DuplicatePeer { address: String },

    #[error("Peer {id} was removed while the operation was in flight")]
    PeerRemoved { id: String },

    #[error("Short path '{short_path}' is already owned by {owner}")]
    PathConflict { short_path: String, owner: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("Zone conflict on subzone '{subzone}', kept {winner}")]
    ZoneConflict { subzone: String, winner: String },

    #[error("No healthy endpoint for service '{service}'")]
    NoHealthyEndpoint { service: String },

    #[error("No successful backup recorded for peer {peer_id}")]
    NoBackupAvailable { peer_id: String },

    #[error("Invalid service type: {0}")]
    InvalidServiceType(String),

    #[error("Restore not confirmed: {0}")]
    RestoreNotConfirmed(String),

    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// Transient errors are the only ones the health monitor will retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PeerUnreachable { .. } | Error::Timeout { .. } | Error::Io(_)
        )
    }
}
