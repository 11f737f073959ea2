//! Contains chunk upload metrics, notably [`UploadMetrics`].

use lazy_static::lazy_static;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::{Registry, Unit};
use std::fmt::{Display, Formatter, Write};

lazy_static! {
    static ref CHUNKS_STORED: Counter = Counter::default();
    static ref CHUNK_BYTES_STORED: Counter = Counter::default();
    static ref MERGES: Family<MergeLabels, Counter> = Family::default();
    static ref SESSIONS_SWEPT: Counter = Counter::default();
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct MergeLabels {
    result: MergeResult,
}

/// The outcome of a merge attempt.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum MergeResult {
    Merged,
    Failed,
}

impl EncodeLabelValue for MergeResult {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        encoder.write_str(&self.to_string())
    }
}

impl Display for MergeResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeResult::Merged => write!(f, "merged"),
            MergeResult::Failed => write!(f, "failed"),
        }
    }
}

/// Registers the upload metric families with the registry.
pub(crate) fn register_upload_metrics(registry: &mut Registry) {
    registry.register(
        "upload_chunks",
        "Number of chunks stored",
        CHUNKS_STORED.clone(),
    );

    registry.register_with_unit(
        "upload_chunk_size",
        "Number of chunk payload bytes stored",
        Unit::Bytes,
        CHUNK_BYTES_STORED.clone(),
    );

    registry.register(
        "upload_merges",
        "Number of merge attempts by result",
        MERGES.clone(),
    );

    registry.register(
        "upload_sessions_swept",
        "Number of abandoned sessions removed",
        SESSIONS_SWEPT.clone(),
    );
}

/// Chunk upload metrics.
pub struct UploadMetrics;

impl UploadMetrics {
    /// Tracks one stored chunk of the given size.
    pub fn track_chunk_stored(bytes: usize) {
        CHUNKS_STORED.inc();
        CHUNK_BYTES_STORED.inc_by(bytes as u64);
    }

    pub fn track_merge(result: MergeResult) {
        MERGES.get_or_create(&MergeLabels { result }).inc();
    }

    pub fn track_sessions_swept(count: usize) {
        SESSIONS_SWEPT.inc_by(count as u64);
    }
}
