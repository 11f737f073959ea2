//! The completed-files area.
//!
//! ```text
//! <root>/<name>                published artifacts
//! <root>/.staging/             merges in progress
//! <root>/.merged/<session>     merge records naming the artifact of a session
//! ```

use crate::upload::session::{ArtifactName, SessionId};
use async_tempfile::TempFile;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

const STAGING_DIR: &str = ".staging";
const RECORDS_DIR: &str = ".merged";

/// A published artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalArtifact {
    pub session: SessionId,
    pub name: ArtifactName,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Publishes merged files and remembers which session produced them.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Opens the store, creating its directories if needed.
    pub async fn new<P: Into<PathBuf>>(root: P) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR)).await?;
        fs::create_dir_all(root.join(RECORDS_DIR)).await?;
        Ok(Self { root })
    }

    pub fn artifact_path(&self, name: &ArtifactName) -> PathBuf {
        self.root.join(name.as_str())
    }

    fn record_path(&self, session: &SessionId) -> PathBuf {
        self.root.join(RECORDS_DIR).join(session.as_str())
    }

    /// Creates a staging file on the same filesystem as the published artifacts.
    ///
    /// The file is removed when dropped unless it was committed.
    pub async fn stage(&self) -> std::io::Result<TempFile> {
        TempFile::new_in(self.root.join(STAGING_DIR))
            .await
            .map_err(std::io::Error::other)
    }

    /// Durably publishes a staged file under its final name, replacing any
    /// artifact of the same name.
    pub async fn commit(&self, mut staged: TempFile, name: &ArtifactName) -> std::io::Result<u64> {
        staged.flush().await?;
        staged.sync_all().await?;
        let size_bytes = staged.metadata().await?.len();

        let path = self.artifact_path(name);
        if fs::try_exists(&path).await.unwrap_or(false) {
            warn!(artifact = %name, "Replacing the existing artifact {name}");
        }

        fs::rename(staged.file_path(), &path).await?;
        Ok(size_bytes)
    }

    /// Marks a session as merged into the named artifact.
    pub async fn record_merge(&self, session: &SessionId, name: &ArtifactName) -> std::io::Result<()> {
        let mut staged = self.stage().await?;
        staged.write_all(name.as_str().as_bytes()).await?;
        staged.flush().await?;
        staged.sync_all().await?;
        fs::rename(staged.file_path(), self.record_path(session)).await
    }

    /// Removes the merge record of a session. A missing record is not an error.
    pub async fn remove_record(&self, session: &SessionId) -> std::io::Result<()> {
        match fs::remove_file(self.record_path(session)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Looks up the artifact a session was merged into.
    ///
    /// A record whose artifact has disappeared is treated as absent.
    pub async fn merged_artifact(&self, session: &SessionId) -> std::io::Result<Option<FinalArtifact>> {
        let recorded = match fs::read_to_string(self.record_path(session)).await {
            Ok(recorded) => recorded,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let Ok(name) = ArtifactName::parse(recorded.trim_end()) else {
            warn!(session = %session, "Ignoring malformed merge record of session {session}");
            return Ok(None);
        };

        let path = self.artifact_path(&name);
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(Some(FinalArtifact {
                session: session.clone(),
                name,
                path,
                size_bytes: metadata.len(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Checks whether the completed-files area is reachable.
    pub async fn probe(&self) -> std::io::Result<()> {
        let metadata = fs::metadata(self.root.join(STAGING_DIR)).await?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                ErrorKind::NotFound,
                "the staging area is not a directory",
            ))
        }
    }
}
