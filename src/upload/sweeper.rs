use crate::upload::coordinator::UploadCoordinator;
use rendezvous::RendezvousGuard;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// When and how often abandoned sessions are removed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RetentionPolicy {
    /// Sessions without a new chunk for this long are removed.
    pub abandon_after: Duration,
    /// The pause between two sweeps.
    pub interval: Duration,
}

/// Spawns the background task that periodically removes abandoned sessions.
///
/// The task runs until a shutdown is signalled and then completes the
/// rendezvous guard.
pub fn spawn_sweeper(
    coordinator: Arc<UploadCoordinator>,
    policy: RetentionPolicy,
    mut shutdown_rx: broadcast::Receiver<()>,
    cleanup_rendezvous: RendezvousGuard,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Removing sessions abandoned for {abandon:?}, checking every {interval:?}",
            abandon = policy.abandon_after,
            interval = policy.interval
        );

        let mut interval = tokio::time::interval(policy.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match coordinator.sweep_abandoned(policy.abandon_after).await {
                        Ok(0) => debug!("No abandoned sessions found"),
                        Ok(n) => info!("Removed {n} abandoned sessions"),
                        Err(e) => error!("Failed to sweep abandoned sessions: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("The session sweeper stopped");
        cleanup_rendezvous.completed();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::artifacts::ArtifactStore;
    use crate::upload::coordinator::UploadLimits;
    use crate::upload::memory::InMemoryChunkRepository;
    use crate::upload::repository::ChunkRepository;
    use crate::upload::session::{ChunkKey, SessionId};
    use bytes::Bytes;
    use rendezvous::Rendezvous;

    #[tokio::test]
    async fn sweeps_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(InMemoryChunkRepository::new());
        let coordinator = Arc::new(UploadCoordinator::new(
            repository.clone(),
            Arc::new(ArtifactStore::new(dir.path()).await.unwrap()),
            UploadLimits::default(),
        ));

        repository
            .put(
                &ChunkKey::new(SessionId::parse("stale").unwrap(), 0),
                Bytes::from_static(b"abandoned"),
            )
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let rendezvous = Rendezvous::new();
        let policy = RetentionPolicy {
            abandon_after: Duration::ZERO,
            interval: Duration::from_millis(10),
        };
        let handle = spawn_sweeper(coordinator, policy, shutdown_rx, rendezvous.fork_guard());

        // The first tick fires immediately.
        for _ in 0..100 {
            if repository.sessions().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(repository.sessions().await.unwrap().is_empty());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(rendezvous.rendezvous_async().await.is_ok());
    }
}
