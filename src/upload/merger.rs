use crate::metrics::uploads::{MergeResult, UploadMetrics};
use crate::upload::artifacts::{ArtifactStore, FinalArtifact};
use crate::upload::repository::{ChunkRepository, StorageError};
use crate::upload::session::{ArtifactName, ChunkKey, SessionId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Concatenates the chunks of a session into its final artifact.
///
/// The output is staged, then renamed into place, then recorded, and only after
/// that are the chunks removed. Any failure before the rename leaves every chunk
/// untouched so the merge can simply be repeated.
pub struct Merger {
    repository: Arc<dyn ChunkRepository>,
    artifacts: Arc<ArtifactStore>,
}

/// The result of a successful [`Merger::merge`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The artifact was produced by this call.
    Committed(FinalArtifact),
    /// The session had been merged before; nothing was written.
    AlreadyMerged(FinalArtifact),
}

impl MergeOutcome {
    pub fn artifact(&self) -> &FinalArtifact {
        match self {
            MergeOutcome::Committed(artifact) | MergeOutcome::AlreadyMerged(artifact) => artifact,
        }
    }
}

impl Merger {
    pub fn new(repository: Arc<dyn ChunkRepository>, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            repository,
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Merges chunks `0..expected_total` of the session in index order.
    ///
    /// Callers must hold the session lock; the merger itself does not serialize.
    pub async fn merge(
        &self,
        session: &SessionId,
        expected_total: u32,
        name: &ArtifactName,
    ) -> Result<MergeOutcome, MergeError> {
        if let Some(artifact) = self.merged_artifact(session).await? {
            debug!(session = %session, artifact = %artifact.name, "Session {session} is already merged");
            self.release_chunks(session).await;
            return Ok(MergeOutcome::AlreadyMerged(artifact));
        }

        match self.merge_staged(session, expected_total, name).await {
            Ok(artifact) => {
                UploadMetrics::track_merge(MergeResult::Merged);
                info!(
                    session = %session,
                    artifact = %artifact.name,
                    total = expected_total,
                    "Merged {expected_total} chunks of session {session} into {path:?} ({bytes} bytes)",
                    path = artifact.path,
                    bytes = artifact.size_bytes
                );
                self.release_chunks(session).await;
                Ok(MergeOutcome::Committed(artifact))
            }
            Err(e) => {
                UploadMetrics::track_merge(MergeResult::Failed);
                warn!(session = %session, "Merge of session {session} failed, chunks are kept: {e}");
                Err(e)
            }
        }
    }

    /// Looks up the artifact a session was merged into, if any.
    pub async fn merged_artifact(
        &self,
        session: &SessionId,
    ) -> Result<Option<FinalArtifact>, MergeError> {
        self.artifacts
            .merged_artifact(session)
            .await
            .map_err(|e| MergeError::Record(session.clone(), e))
    }

    async fn merge_staged(
        &self,
        session: &SessionId,
        expected_total: u32,
        name: &ArtifactName,
    ) -> Result<FinalArtifact, MergeError> {
        let mut staged = self
            .artifacts
            .stage()
            .await
            .map_err(|e| MergeError::Staging(session.clone(), e))?;

        // Returning early drops the staging file, which deletes it.
        for index in 0..expected_total {
            let key = ChunkKey::new(session.clone(), index);
            let mut reader = self.repository.open(&key).await.map_err(|e| match e {
                StorageError::NotFound(key) => MergeError::MissingChunk(key),
                e => MergeError::Storage(e),
            })?;

            let copied = tokio::io::copy(&mut reader, &mut staged)
                .await
                .map_err(|e| MergeError::Copy(key.clone(), e))?;
            debug!(session = %session, index, "Appended {copied} bytes of chunk {key}");
        }

        // The record goes first. Until the artifact is renamed into place the
        // record reads as "not merged", so a failure in between stays retryable.
        self.artifacts
            .record_merge(session, name)
            .await
            .map_err(|e| MergeError::Record(session.clone(), e))?;

        let size_bytes = match self.artifacts.commit(staged, name).await {
            Ok(size_bytes) => size_bytes,
            Err(e) => {
                if let Err(e) = self.artifacts.remove_record(session).await {
                    warn!(session = %session, "Failed to remove the merge record of session {session}: {e}");
                }
                return Err(MergeError::Commit(session.clone(), name.clone(), e));
            }
        };

        Ok(FinalArtifact {
            session: session.clone(),
            name: name.clone(),
            path: self.artifacts.artifact_path(name),
            size_bytes,
        })
    }

    /// Removes the chunks of a merged session. The artifact is already
    /// committed at this point, so failures are only logged.
    async fn release_chunks(&self, session: &SessionId) {
        if let Err(e) = self.repository.clear(session).await {
            warn!(session = %session, "Failed to remove the chunks of merged session {session}: {e}");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Chunk {0} is missing")]
    MissingChunk(ChunkKey),
    #[error(transparent)]
    Storage(StorageError),
    #[error("Failed to copy chunk {0} into the staging file: {1}")]
    Copy(ChunkKey, #[source] std::io::Error),
    #[error("Failed to create a staging file for session {0}: {1}")]
    Staging(SessionId, #[source] std::io::Error),
    #[error("Failed to publish artifact {1} of session {0}: {2}")]
    Commit(SessionId, ArtifactName, #[source] std::io::Error),
    #[error("Failed to access the merge record of session {0}: {1}")]
    Record(SessionId, #[source] std::io::Error),
}
