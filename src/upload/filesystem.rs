//! Stores chunks as individual files, one directory per session.
//!
//! ```text
//! <root>/<session>/<index>
//! ```

use crate::upload::repository::{ChunkReader, ChunkRepository, StorageError, StoredSession};
use crate::upload::session::{ChunkKey, SessionId};
use async_tempfile::TempFile;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

/// A [`ChunkRepository`] backed by a local directory.
pub struct FilesystemChunkRepository {
    root: PathBuf,
}

impl FilesystemChunkRepository {
    /// Opens the repository, creating the root directory if needed.
    pub async fn new<P: Into<PathBuf>>(root: P) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(StorageError::Unavailable)?;
        Ok(Self { root })
    }

    fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }

    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.session_dir(&key.session).join(key.index.to_string())
    }

    async fn write_chunk(&self, key: &ChunkKey, data: &[u8]) -> std::io::Result<()> {
        let dir = self.session_dir(&key.session);
        fs::create_dir_all(&dir).await?;

        // The payload is written to a uniquely named sibling and renamed into
        // place, so a listing never observes a partial chunk.
        let mut file = TempFile::new_in(dir).await.map_err(std::io::Error::other)?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;

        fs::rename(file.file_path(), self.chunk_path(key)).await
    }
}

/// Recovers the index from a chunk file name. Temporary files and anything
/// not in canonical decimal form are ignored.
fn parse_index(name: &str) -> Option<u32> {
    let index = name.parse::<u32>().ok()?;
    (index.to_string() == name).then_some(index)
}

#[async_trait]
impl ChunkRepository for FilesystemChunkRepository {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StorageError> {
        self.write_chunk(key, &data)
            .await
            .map_err(|e| StorageError::Write(key.clone(), e))?;
        trace!(session = %key.session, index = key.index, "Stored {bytes} bytes", bytes = data.len());
        Ok(())
    }

    async fn list_indices(&self, session: &SessionId) -> Result<BTreeSet<u32>, StorageError> {
        let mut indices = BTreeSet::new();
        let mut entries = match fs::read_dir(self.session_dir(session)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(StorageError::List(session.clone(), e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::List(session.clone(), e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::List(session.clone(), e))?;
            if !file_type.is_file() {
                continue;
            }

            if let Some(index) = entry.file_name().to_str().and_then(parse_index) {
                indices.insert(index);
            }
        }

        Ok(indices)
    }

    async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, StorageError> {
        match fs::File::open(self.chunk_path(key)).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.clone())),
            Err(e) => Err(StorageError::Read(key.clone(), e)),
        }
    }

    async fn delete(&self, key: &ChunkKey) -> Result<(), StorageError> {
        match fs::remove_file(self.chunk_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.clone())),
            Err(e) => Err(StorageError::Delete(key.clone(), e)),
        }
    }

    async fn clear(&self, session: &SessionId) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.session_dir(session)).await {
            Ok(()) => {
                debug!(session = %session, "Removed chunk directory of session {session}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Clear(session.clone(), e)),
        }
    }

    async fn sessions(&self) -> Result<Vec<StoredSession>, StorageError> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(StorageError::Unavailable)?;

        while let Some(entry) = entries.next_entry().await.map_err(StorageError::Unavailable)? {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }

            let Some(session) = entry
                .file_name()
                .to_str()
                .and_then(|name| SessionId::parse(name).ok())
            else {
                warn!(path = ?entry.path(), "Ignoring unexpected directory in chunk storage");
                continue;
            };

            let last_modified = newest_modification(&entry.path())
                .await
                .map_err(|e| StorageError::List(session.clone(), e))?;
            sessions.push(StoredSession {
                session,
                last_modified,
            });
        }

        Ok(sessions)
    }

    async fn probe(&self) -> Result<(), StorageError> {
        let metadata = fs::metadata(&self.root)
            .await
            .map_err(StorageError::Unavailable)?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} is not a directory", self.root.display()),
            )))
        }
    }
}

/// Determines the newest modification time of the files in a directory,
/// falling back to the directory itself when it is empty.
async fn newest_modification(dir: &Path) -> std::io::Result<SystemTime> {
    let mut newest = fs::metadata(dir).await?.modified()?;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let modified = entry.metadata().await?.modified()?;
        if modified > newest {
            newest = modified;
        }
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn key(session: &str, index: u32) -> ChunkKey {
        ChunkKey::new(SessionId::parse(session).unwrap(), index)
    }

    async fn read_all(mut reader: ChunkReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn only_canonical_indices_are_parsed() {
        assert_eq!(parse_index("0"), Some(0));
        assert_eq!(parse_index("17"), Some(17));
        assert_eq!(parse_index("017"), None);
        assert_eq!(parse_index("+1"), None);
        assert_eq!(parse_index("atmp_1234"), None);
    }

    #[tokio::test]
    async fn lists_exactly_the_stored_indices() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FilesystemChunkRepository::new(dir.path()).await.unwrap();
        let session = SessionId::parse("abc").unwrap();

        for index in [0, 2, 4] {
            repo.put(&key("abc", index), Bytes::from(vec![index as u8; 3]))
                .await
                .unwrap();
        }

        let indices = repo.list_indices(&session).await.unwrap();
        assert_eq!(indices, BTreeSet::from([0, 2, 4]));
    }

    #[tokio::test]
    async fn put_overwrites_existing_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FilesystemChunkRepository::new(dir.path()).await.unwrap();

        repo.put(&key("abc", 1), Bytes::from_static(b"first"))
            .await
            .unwrap();
        repo.put(&key("abc", 1), Bytes::from_static(b"second"))
            .await
            .unwrap();

        let reader = repo.open(&key("abc", 1)).await.unwrap();
        assert_eq!(read_all(reader).await, b"second");
        assert_eq!(
            repo.list_indices(&SessionId::parse("abc").unwrap())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn missing_chunks_are_reported_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FilesystemChunkRepository::new(dir.path()).await.unwrap();

        assert!(matches!(
            repo.open(&key("abc", 0)).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            repo.delete(&key("abc", 0)).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(repo
            .list_indices(&SessionId::parse("abc").unwrap())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FilesystemChunkRepository::new(dir.path()).await.unwrap();
        let session = SessionId::parse("abc").unwrap();

        repo.put(&key("abc", 0), Bytes::from_static(b"data"))
            .await
            .unwrap();
        repo.clear(&session).await.unwrap();
        repo.clear(&session).await.unwrap();

        assert!(repo.list_indices(&session).await.unwrap().is_empty());
        assert!(!dir.path().join("abc").exists());
    }

    #[tokio::test]
    async fn sessions_are_enumerated() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FilesystemChunkRepository::new(dir.path()).await.unwrap();

        repo.put(&key("first", 0), Bytes::from_static(b"a"))
            .await
            .unwrap();
        repo.put(&key("second", 3), Bytes::from_static(b"b"))
            .await
            .unwrap();
        std::fs::create_dir(dir.path().join(".staging")).unwrap();

        let mut sessions: Vec<_> = repo
            .sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session.to_string())
            .collect();
        sessions.sort();
        assert_eq!(sessions, vec!["first", "second"]);
        repo.probe().await.unwrap();
    }
}
