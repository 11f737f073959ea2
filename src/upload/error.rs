use crate::upload::merger::MergeError;
use crate::upload::repository::StorageError;
use crate::upload::session::ValidationError;

/// Any failure of an upload operation. Each is scoped to a single session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}
