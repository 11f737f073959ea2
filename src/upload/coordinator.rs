use crate::metrics::uploads::UploadMetrics;
use crate::upload::artifacts::ArtifactStore;
use crate::upload::completion::CompletionDetector;
use crate::upload::error::UploadError;
use crate::upload::merger::{MergeOutcome, Merger};
use crate::upload::repository::{ChunkRepository, StorageError};
use crate::upload::session::{AddChunkOutcome, ArtifactName, ChunkUpload, SessionId, ValidationError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The default upper bound of chunks per session.
pub const DEFAULT_MAX_CHUNKS_PER_SESSION: u32 = 100_000;

/// Limits applied to incoming chunks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UploadLimits {
    pub max_chunks_per_session: u32,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_chunks_per_session: DEFAULT_MAX_CHUNKS_PER_SESSION,
        }
    }
}

/// What a client can learn about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// The chunk indices currently stored.
    pub chunks: BTreeSet<u32>,
    /// Whether the session was merged into its artifact.
    pub merged: bool,
}

/// Accepts chunks and triggers the merge of completed sessions.
///
/// Storing a chunk, checking for completion and merging happen in one critical
/// section per session, so a session is merged at most once even when its last
/// chunks arrive concurrently. Different sessions never wait on each other.
pub struct UploadCoordinator {
    repository: Arc<dyn ChunkRepository>,
    merger: Merger,
    limits: UploadLimits,
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<SessionState>>>>,
}

#[derive(Debug, Default)]
struct SessionState {
    phase: Phase,
    /// The chunk count declared by the first accepted chunk.
    expected_total: Option<u32>,
    last_activity: Option<Instant>,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
enum Phase {
    /// The merge record was not consulted yet.
    #[default]
    Unknown,
    /// Chunks are being collected, or the last merge attempt failed.
    Open,
    /// The artifact is committed. Terminal.
    Merged,
}

impl SessionState {
    fn was_active_within(&self, max_age: Duration) -> bool {
        self.last_activity
            .map_or(false, |instant| instant.elapsed() < max_age)
    }
}

impl UploadCoordinator {
    pub fn new(
        repository: Arc<dyn ChunkRepository>,
        artifacts: Arc<ArtifactStore>,
        limits: UploadLimits,
    ) -> Self {
        let merger = Merger::new(repository.clone(), artifacts);
        Self {
            repository,
            merger,
            limits,
            sessions: Mutex::new(HashMap::default()),
        }
    }

    /// Stores a chunk and merges the session if it is complete afterwards.
    pub async fn add_chunk(&self, upload: ChunkUpload) -> Result<AddChunkOutcome, UploadError> {
        self.check_limits(upload.expected_total)?;

        let session = upload.session.clone();
        let lock = self.session_lock(&session).await;
        let mut state = lock.lock().await;

        if self.resolve_phase(&session, &mut state).await? == Phase::Merged {
            debug!(session = %session, index = upload.index, "Discarding chunk of merged session {session}");
            return Ok(AddChunkOutcome {
                accepted: false,
                merged: true,
            });
        }

        self.validate_total(&session, &state, upload.expected_total)
            .await?;

        let key = upload.key();
        let bytes = upload.data.len();
        self.repository.put(&key, upload.data).await?;
        state.expected_total = Some(upload.expected_total);
        state.last_activity = Some(Instant::now());
        UploadMetrics::track_chunk_stored(bytes);

        let received = self.repository.list_indices(&session).await?;
        if !CompletionDetector::is_complete(&received, upload.expected_total) {
            debug!(
                session = %session,
                index = key.index,
                total = upload.expected_total,
                "Stored chunk {key} ({bytes} bytes); {missing} chunks missing",
                missing = CompletionDetector::missing(&received, upload.expected_total).len()
            );
            return Ok(AddChunkOutcome {
                accepted: true,
                merged: false,
            });
        }

        self.merger
            .merge(&session, upload.expected_total, &upload.name)
            .await?;
        state.phase = Phase::Merged;
        self.forget(&session).await;

        Ok(AddChunkOutcome {
            accepted: true,
            merged: true,
        })
    }

    /// Re-runs the merge of a session, e.g. after a failed attempt.
    pub async fn merge(
        &self,
        session: &SessionId,
        expected_total: u32,
        name: &ArtifactName,
    ) -> Result<MergeOutcome, UploadError> {
        if expected_total == 0 {
            return Err(ValidationError::ZeroTotal.into());
        }
        self.check_limits(expected_total)?;

        let lock = self.session_lock(session).await;
        let mut state = lock.lock().await;

        if self.resolve_phase(session, &mut state).await? != Phase::Merged {
            self.validate_total(session, &state, expected_total).await?;
        }

        let outcome = self.merger.merge(session, expected_total, name).await?;
        state.phase = Phase::Merged;
        self.forget(session).await;
        Ok(outcome)
    }

    /// Reports the stored chunks of a session.
    pub async fn uploaded_chunks(&self, session: &SessionId) -> Result<SessionSnapshot, UploadError> {
        let chunks = self.repository.list_indices(session).await?;
        let merged = self.merger.merged_artifact(session).await?.is_some();
        Ok(SessionSnapshot {
            // Leftovers of an interrupted cleanup are not offered for resumption.
            chunks: if merged { BTreeSet::new() } else { chunks },
            merged,
        })
    }

    /// Removes the chunks of sessions that saw no new chunk for `max_age`.
    ///
    /// Returns the number of sessions removed.
    pub async fn sweep_abandoned(&self, max_age: Duration) -> Result<usize, StorageError> {
        let now = SystemTime::now();
        let mut swept = 0;

        for stored in self.repository.sessions().await? {
            let age = now
                .duration_since(stored.last_modified)
                .unwrap_or(Duration::ZERO);
            if age < max_age {
                continue;
            }

            let lock = self.session_lock(&stored.session).await;
            let mut state = lock.lock().await;

            // A chunk may have arrived while we were waiting for the lock.
            if state.was_active_within(max_age) || state.phase == Phase::Merged {
                continue;
            }

            if let Err(e) = self.repository.clear(&stored.session).await {
                warn!(
                    session = %stored.session,
                    "Failed to remove abandoned session {session}, skipping it: {e}",
                    session = stored.session
                );
                continue;
            }

            // The entry stays in the map: requests already waiting on this lock
            // and requests arriving later must share it. Idle entries are pruned below.
            *state = SessionState::default();

            info!(
                session = %stored.session,
                "Removed abandoned session {session} after {age:?} of inactivity",
                session = stored.session
            );
            swept += 1;
        }

        self.prune_idle_locks(max_age).await;
        if swept > 0 {
            UploadMetrics::track_sessions_swept(swept);
        }
        Ok(swept)
    }

    /// Checks whether the chunk and artifact storage are reachable.
    pub async fn probe(&self) -> Result<(), UploadError> {
        self.repository.probe().await?;
        self.merger
            .artifacts()
            .probe()
            .await
            .map_err(StorageError::Unavailable)?;
        Ok(())
    }

    fn check_limits(&self, total: u32) -> Result<(), ValidationError> {
        if total > self.limits.max_chunks_per_session {
            return Err(ValidationError::TooManyChunks {
                total,
                limit: self.limits.max_chunks_per_session,
            });
        }
        Ok(())
    }

    async fn session_lock(&self, session: &SessionId) -> Arc<Mutex<SessionState>> {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(session.clone()).or_default().clone()
    }

    /// Drops the bookkeeping of a merged session. Must be called while holding
    /// the session lock so that waiters observe the final state. Only valid for
    /// the terminal phase, which a fresh lock re-reads from the merge record.
    async fn forget(&self, session: &SessionId) {
        self.sessions.lock().await.remove(session);
    }

    /// Drops locks nobody uses that have been idle for `max_age`.
    async fn prune_idle_locks(&self, max_age: Duration) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, lock| {
            if Arc::strong_count(lock) > 1 {
                return true;
            }

            lock.try_lock()
                .map(|state| state.was_active_within(max_age))
                .unwrap_or(true)
        });
    }

    async fn resolve_phase(
        &self,
        session: &SessionId,
        state: &mut SessionState,
    ) -> Result<Phase, UploadError> {
        if state.phase == Phase::Unknown {
            state.phase = match self.merger.merged_artifact(session).await? {
                Some(_) => Phase::Merged,
                None => Phase::Open,
            };
        }
        Ok(state.phase)
    }

    async fn validate_total(
        &self,
        session: &SessionId,
        state: &SessionState,
        total: u32,
    ) -> Result<(), UploadError> {
        match state.expected_total {
            Some(expected) if expected != total => {
                warn!(session = %session, "Rejecting chunk declaring {total} chunks, session expects {expected}");
                Err(ValidationError::ConflictingTotal {
                    session: session.clone(),
                    expected,
                    actual: total,
                }
                .into())
            }
            Some(_) => Ok(()),
            None => {
                // Chunks stored before a restart must still fit the declared total.
                let stored = self.repository.list_indices(session).await?;
                match stored.last() {
                    Some(&index) if index >= total => Err(ValidationError::StoredIndexOutOfRange {
                        session: session.clone(),
                        index,
                        total,
                    }
                    .into()),
                    _ => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::memory::InMemoryChunkRepository;
    use crate::upload::merger::MergeError;
    use crate::upload::repository::{ChunkReader, StoredSession};
    use crate::upload::session::ChunkKey;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct Fixture {
        dir: tempfile::TempDir,
        repository: Arc<InMemoryChunkRepository>,
        coordinator: Arc<UploadCoordinator>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(InMemoryChunkRepository::new());
        let artifacts = Arc::new(ArtifactStore::new(dir.path()).await.unwrap());
        let coordinator = Arc::new(UploadCoordinator::new(
            repository.clone(),
            artifacts,
            UploadLimits::default(),
        ));
        Fixture {
            dir,
            repository,
            coordinator,
        }
    }

    /// Wraps the in-memory repository with per-call delays and optionally
    /// refuses to clear one session.
    #[derive(Default)]
    struct ScriptedRepository {
        inner: InMemoryChunkRepository,
        delay: Duration,
        clear_delay: Duration,
        stuck: Option<SessionId>,
    }

    #[async_trait]
    impl ChunkRepository for ScriptedRepository {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StorageError> {
            tokio::time::sleep(self.delay).await;
            self.inner.put(key, data).await
        }

        async fn list_indices(&self, session: &SessionId) -> Result<BTreeSet<u32>, StorageError> {
            tokio::time::sleep(self.delay).await;
            self.inner.list_indices(session).await
        }

        async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, StorageError> {
            tokio::time::sleep(self.delay).await;
            self.inner.open(key).await
        }

        async fn delete(&self, key: &ChunkKey) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn clear(&self, session: &SessionId) -> Result<(), StorageError> {
            tokio::time::sleep(self.clear_delay).await;
            if self.stuck.as_ref() == Some(session) {
                return Err(StorageError::Clear(
                    session.clone(),
                    std::io::Error::other("directory is busy"),
                ));
            }
            self.inner.clear(session).await
        }

        async fn sessions(&self) -> Result<Vec<StoredSession>, StorageError> {
            self.inner.sessions().await
        }

        async fn probe(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn upload(session: &str, index: u32, total: u32, data: Vec<u8>) -> ChunkUpload {
        ChunkUpload::new(
            SessionId::parse(session).unwrap(),
            index,
            total,
            ArtifactName::parse("artifact.bin").unwrap(),
            Bytes::from(data),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn merges_once_all_chunks_arrived() {
        let f = fixture().await;

        for (index, data) in [(2, b"c"), (0, b"a")] {
            let outcome = f
                .coordinator
                .add_chunk(upload("s1", index, 3, data.to_vec()))
                .await
                .unwrap();
            assert_eq!(
                outcome,
                AddChunkOutcome {
                    accepted: true,
                    merged: false
                }
            );
        }

        let snapshot = f
            .coordinator
            .uploaded_chunks(&SessionId::parse("s1").unwrap())
            .await
            .unwrap();
        assert_eq!(snapshot.chunks, BTreeSet::from([0, 2]));
        assert!(!snapshot.merged);

        let outcome = f
            .coordinator
            .add_chunk(upload("s1", 1, 3, b"b".to_vec()))
            .await
            .unwrap();
        assert!(outcome.merged);
        assert_eq!(std::fs::read(f.dir.path().join("artifact.bin")).unwrap(), b"abc");

        let snapshot = f
            .coordinator
            .uploaded_chunks(&SessionId::parse("s1").unwrap())
            .await
            .unwrap();
        assert!(snapshot.chunks.is_empty());
        assert!(snapshot.merged);
    }

    #[tokio::test]
    async fn duplicate_chunk_uses_last_payload() {
        let f = fixture().await;
        let steps: [(u32, &[u8], bool); 4] = [
            (0, b"A", false),
            (1, b"old", false),
            (1, b"B", false),
            (2, b"C", true),
        ];

        for (index, data, merged) in steps {
            let outcome = f
                .coordinator
                .add_chunk(upload("dup", index, 3, data.to_vec()))
                .await
                .unwrap();
            assert_eq!(outcome.merged, merged, "chunk {index}");
        }

        assert_eq!(std::fs::read(f.dir.path().join("artifact.bin")).unwrap(), b"ABC");
    }

    #[tokio::test]
    async fn conflicting_total_is_rejected_without_storing() {
        let f = fixture().await;
        f.coordinator
            .add_chunk(upload("s2", 0, 4, b"a".to_vec()))
            .await
            .unwrap();

        let result = f.coordinator.add_chunk(upload("s2", 1, 5, b"b".to_vec())).await;
        assert!(matches!(
            result,
            Err(UploadError::Validation(ValidationError::ConflictingTotal {
                expected: 4,
                actual: 5,
                ..
            }))
        ));

        let stored = f
            .repository
            .list_indices(&SessionId::parse("s2").unwrap())
            .await
            .unwrap();
        assert_eq!(stored, BTreeSet::from([0]));
    }

    #[tokio::test]
    async fn previously_stored_chunks_must_fit_the_total() {
        let f = fixture().await;
        let key = ChunkKey::new(SessionId::parse("s3").unwrap(), 7);
        f.repository
            .put(&key, Bytes::from_static(b"from before a restart"))
            .await
            .unwrap();

        let result = f.coordinator.add_chunk(upload("s3", 0, 4, b"a".to_vec())).await;
        assert!(matches!(
            result,
            Err(UploadError::Validation(
                ValidationError::StoredIndexOutOfRange { index: 7, total: 4, .. }
            ))
        ));
    }

    #[tokio::test]
    async fn too_many_chunks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = UploadCoordinator::new(
            Arc::new(InMemoryChunkRepository::new()),
            Arc::new(ArtifactStore::new(dir.path()).await.unwrap()),
            UploadLimits {
                max_chunks_per_session: 2,
            },
        );

        let result = coordinator.add_chunk(upload("s4", 0, 3, b"a".to_vec())).await;
        assert!(matches!(
            result,
            Err(UploadError::Validation(ValidationError::TooManyChunks { total: 3, limit: 2 }))
        ));
    }

    #[tokio::test]
    async fn chunks_after_merge_are_discarded() {
        let f = fixture().await;
        let outcome = f
            .coordinator
            .add_chunk(upload("s5", 0, 1, b"done".to_vec()))
            .await
            .unwrap();
        assert!(outcome.merged);

        let outcome = f
            .coordinator
            .add_chunk(upload("s5", 0, 1, b"late".to_vec()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AddChunkOutcome {
                accepted: false,
                merged: true
            }
        );
        assert_eq!(std::fs::read(f.dir.path().join("artifact.bin")).unwrap(), b"done");
        assert!(f.repository.sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_merge_can_be_retried() {
        let f = fixture().await;
        let session = SessionId::parse("s6").unwrap();
        let name = ArtifactName::parse("artifact.bin").unwrap();
        for index in 0..2 {
            f.coordinator
                .add_chunk(upload("s6", index, 3, vec![b'0' + index as u8]))
                .await
                .unwrap();
        }

        let result = f.coordinator.merge(&session, 3, &name).await;
        assert!(matches!(
            result,
            Err(UploadError::Merge(MergeError::MissingChunk(_)))
        ));

        f.repository
            .put(&ChunkKey::new(session.clone(), 2), Bytes::from_static(b"2"))
            .await
            .unwrap();
        let outcome = f.coordinator.merge(&session, 3, &name).await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Committed(_)));
        assert_eq!(std::fs::read(&outcome.artifact().path).unwrap(), b"012");

        let again = f.coordinator.merge(&session, 3, &name).await.unwrap();
        assert!(matches!(again, MergeOutcome::AlreadyMerged(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_chunks_merge_exactly_once() {
        const TOTAL: u32 = 32;
        let f = fixture().await;

        let tasks: Vec<_> = (0..TOTAL)
            .rev()
            .map(|index| {
                let coordinator = f.coordinator.clone();
                tokio::spawn(async move {
                    coordinator
                        .add_chunk(upload("race", index, TOTAL, vec![index as u8; 64]))
                        .await
                })
            })
            .collect();

        let mut merges = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(outcome.accepted);
            if outcome.merged {
                merges += 1;
            }
        }
        assert_eq!(merges, 1);

        let expected: Vec<u8> = (0..TOTAL).flat_map(|i| vec![i as u8; 64]).collect();
        assert_eq!(
            std::fs::read(f.dir.path().join("artifact.bin")).unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn abandoned_sessions_are_swept() {
        let f = fixture().await;
        f.coordinator
            .add_chunk(upload("idle", 0, 2, b"a".to_vec()))
            .await
            .unwrap();

        let swept = f
            .coordinator
            .sweep_abandoned(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(swept, 0);

        let swept = f.coordinator.sweep_abandoned(Duration::ZERO).await.unwrap();
        assert_eq!(swept, 1);
        assert!(f.repository.sessions().await.unwrap().is_empty());
        assert!(f.coordinator.sessions.lock().await.is_empty());

        // The session starts over and may declare a different total.
        f.coordinator
            .add_chunk(upload("idle", 0, 1, b"z".to_vec()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(f.dir.path().join("artifact.bin")).unwrap(), b"z");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_racing_with_uploads_keeps_one_lock_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(ScriptedRepository {
            delay: Duration::from_millis(50),
            clear_delay: Duration::from_millis(400),
            ..Default::default()
        });
        let coordinator = Arc::new(UploadCoordinator::new(
            repository.clone(),
            Arc::new(ArtifactStore::new(dir.path()).await.unwrap()),
            UploadLimits::default(),
        ));

        let session = SessionId::parse("swept").unwrap();
        repository
            .inner
            .put(&ChunkKey::new(session, 0), Bytes::from_static(b"a"))
            .await
            .unwrap();

        // The sweep holds the session lock while clearing; the first upload
        // queues behind it and the second arrives after the sweep released it.
        let sweep = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.sweep_abandoned(Duration::ZERO).await })
        };
        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                coordinator.add_chunk(upload("swept", 0, 2, b"a".to_vec())).await
            })
        };
        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(420)).await;
                coordinator.add_chunk(upload("swept", 1, 2, b"b".to_vec())).await
            })
        };

        assert_eq!(sweep.await.unwrap().unwrap(), 1);
        let outcomes = [
            first.await.unwrap().unwrap(),
            second.await.unwrap().unwrap(),
        ];
        assert!(outcomes.iter().all(|outcome| outcome.accepted));
        assert_eq!(
            outcomes.iter().filter(|outcome| outcome.merged).count(),
            1,
            "outcomes: {outcomes:?}"
        );
        assert_eq!(std::fs::read(dir.path().join("artifact.bin")).unwrap(), b"ab");
    }

    #[tokio::test]
    async fn sweep_skips_sessions_that_cannot_be_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let stuck = SessionId::parse("stuck").unwrap();
        let repository = Arc::new(ScriptedRepository {
            stuck: Some(stuck.clone()),
            ..Default::default()
        });
        let coordinator = UploadCoordinator::new(
            repository.clone(),
            Arc::new(ArtifactStore::new(dir.path()).await.unwrap()),
            UploadLimits::default(),
        );

        for session in ["stuck", "loose"] {
            repository
                .inner
                .put(
                    &ChunkKey::new(SessionId::parse(session).unwrap(), 0),
                    Bytes::from_static(b"x"),
                )
                .await
                .unwrap();
        }

        let swept = coordinator.sweep_abandoned(Duration::ZERO).await.unwrap();
        assert_eq!(swept, 1);

        let remaining: Vec<SessionId> = repository
            .sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|stored| stored.session)
            .collect();
        assert_eq!(remaining, vec![stuck]);
    }
}
