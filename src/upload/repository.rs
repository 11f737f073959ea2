use crate::upload::session::{ChunkKey, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::time::SystemTime;
use tokio::io::AsyncRead;

/// A readable chunk payload.
pub type ChunkReader = Pin<Box<dyn AsyncRead + Send>>;

/// A session with stored chunks, as seen by the retention sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub session: SessionId,
    /// The modification time of the most recently written chunk.
    pub last_modified: SystemTime,
}

/// Durable storage of chunk payloads.
///
/// Implementations must make a successful [`put`](ChunkRepository::put) visible to
/// an immediately following [`list_indices`](ChunkRepository::list_indices) of the
/// same caller, and must never expose a partially written payload.
#[async_trait]
pub trait ChunkRepository: Send + Sync {
    /// Gets a short name of the backend for diagnostics.
    fn kind(&self) -> &'static str;

    /// Stores a payload, replacing any payload stored under the same key.
    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StorageError>;

    /// Returns the distinct indices stored for a session.
    async fn list_indices(&self, session: &SessionId) -> Result<BTreeSet<u32>, StorageError>;

    /// Opens a stored payload for reading.
    async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, StorageError>;

    /// Removes a single payload.
    async fn delete(&self, key: &ChunkKey) -> Result<(), StorageError>;

    /// Removes every payload of a session. Clearing an unknown session succeeds.
    async fn clear(&self, session: &SessionId) -> Result<(), StorageError>;

    /// Enumerates the sessions that currently have stored payloads.
    async fn sessions(&self) -> Result<Vec<StoredSession>, StorageError>;

    /// Checks whether the storage medium is reachable.
    async fn probe(&self) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Chunk {0} was not found")]
    NotFound(ChunkKey),
    #[error("Failed to write chunk {0}: {1}")]
    Write(ChunkKey, #[source] std::io::Error),
    #[error("Failed to read chunk {0}: {1}")]
    Read(ChunkKey, #[source] std::io::Error),
    #[error("Failed to delete chunk {0}: {1}")]
    Delete(ChunkKey, #[source] std::io::Error),
    #[error("Failed to list chunks of session {0}: {1}")]
    List(SessionId, #[source] std::io::Error),
    #[error("Failed to clear session {0}: {1}")]
    Clear(SessionId, #[source] std::io::Error),
    #[error("Storage is unavailable: {0}")]
    Unavailable(#[source] std::io::Error),
}

impl StorageError {
    /// The session the error relates to, if any.
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            StorageError::NotFound(key)
            | StorageError::Write(key, _)
            | StorageError::Read(key, _)
            | StorageError::Delete(key, _) => Some(&key.session),
            StorageError::List(session, _) | StorageError::Clear(session, _) => Some(session),
            StorageError::Unavailable(_) => None,
        }
    }

    /// The chunk index the error relates to, if any.
    pub fn index(&self) -> Option<u32> {
        match self {
            StorageError::NotFound(key)
            | StorageError::Write(key, _)
            | StorageError::Read(key, _)
            | StorageError::Delete(key, _) => Some(key.index),
            _ => None,
        }
    }
}
