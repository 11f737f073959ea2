use crate::upload::repository::{ChunkReader, ChunkRepository, StorageError, StoredSession};
use crate::upload::session::{ChunkKey, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::time::SystemTime;
use tokio::sync::RwLock;

/// A [`ChunkRepository`] keeping all payloads in process memory.
///
/// Chunks do not survive a restart; use this for tests and throwaway deployments.
#[derive(Default)]
pub struct InMemoryChunkRepository {
    inner: RwLock<HashMap<SessionId, MemorySession>>,
}

struct MemorySession {
    chunks: BTreeMap<u32, Bytes>,
    last_modified: SystemTime,
}

impl InMemoryChunkRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkRepository for InMemoryChunkRepository {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .entry(key.session.clone())
            .or_insert_with(|| MemorySession {
                chunks: BTreeMap::new(),
                last_modified: SystemTime::now(),
            });
        session.chunks.insert(key.index, data);
        session.last_modified = SystemTime::now();
        Ok(())
    }

    async fn list_indices(&self, session: &SessionId) -> Result<BTreeSet<u32>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(session)
            .map(|s| s.chunks.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, StorageError> {
        let inner = self.inner.read().await;
        match inner
            .get(&key.session)
            .and_then(|s| s.chunks.get(&key.index))
        {
            Some(data) => Ok(Box::pin(Cursor::new(data.clone()))),
            None => Err(StorageError::NotFound(key.clone())),
        }
    }

    async fn delete(&self, key: &ChunkKey) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.get_mut(&key.session) else {
            return Err(StorageError::NotFound(key.clone()));
        };

        if session.chunks.remove(&key.index).is_none() {
            return Err(StorageError::NotFound(key.clone()));
        }

        if session.chunks.is_empty() {
            inner.remove(&key.session);
        }
        Ok(())
    }

    async fn clear(&self, session: &SessionId) -> Result<(), StorageError> {
        self.inner.write().await.remove(session);
        Ok(())
    }

    async fn sessions(&self) -> Result<Vec<StoredSession>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .iter()
            .map(|(session, s)| StoredSession {
                session: session.clone(),
                last_modified: s.last_modified,
            })
            .collect())
    }

    async fn probe(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
