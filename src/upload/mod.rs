//! Chunk storage, completion detection and merging of upload sessions.

mod artifacts;
mod completion;
mod coordinator;
mod error;
mod filesystem;
mod memory;
mod merger;
mod repository;
mod session;
mod sweeper;

pub use artifacts::ArtifactStore;
pub use coordinator::{UploadCoordinator, UploadLimits};
pub use error::UploadError;
pub use filesystem::FilesystemChunkRepository;
pub use memory::InMemoryChunkRepository;
pub use merger::{MergeError, MergeOutcome};
pub use repository::ChunkRepository;
pub use session::{AddChunkOutcome, ArtifactName, ChunkUpload, SessionId, ValidationError};
pub use sweeper::{spawn_sweeper, RetentionPolicy};
