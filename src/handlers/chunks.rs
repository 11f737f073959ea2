//! Contains the `/upload/chunk` endpoint filters.

use crate::upload::{
    AddChunkOutcome, ArtifactName, ChunkUpload, MergeError, MergeOutcome, SessionId, UploadError,
    ValidationError,
};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

pub trait ChunkRoutes {
    /// Provides the chunk upload API.
    ///
    /// To learn which chunks of a session are already stored:
    ///
    /// ```http
    /// GET /upload/chunk/check?hash=d41d8cd98f00b204e9800998ecf8427e HTTP/1.1
    /// ```
    ///
    /// To upload a single chunk as `multipart/form-data` with the fields
    /// `chunk`, `index`, `hash`, `name` and `total`:
    ///
    /// ```http
    /// POST /upload/chunk/add HTTP/1.1
    /// Content-Type: multipart/form-data; boundary=...
    /// ```
    ///
    /// To retry the merge of a session after a failed attempt:
    ///
    /// ```http
    /// POST /upload/chunk/merge HTTP/1.1
    /// Content-Type: application/json
    ///
    /// {"hash": "d41d8cd98f00b204e9800998ecf8427e", "name": "video.mp4", "total": 12}
    /// ```
    fn map_chunk_endpoints(self) -> Self;
}

impl ChunkRoutes for Router<AppState> {
    // Ensure HttpCallMetricTracker is updated.
    fn map_chunk_endpoints(self) -> Self {
        self.route("/upload/chunk/check", get(check_chunks))
            .route("/upload/chunk/add", post(add_chunk))
            .route("/upload/chunk/merge", post(merge_chunks))
    }
}

#[derive(Debug, Deserialize)]
struct CheckQuery {
    hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckResponse {
    /// The stored chunk indices in ascending order.
    chunks: Vec<u32>,
    merged: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddResponse {
    message: String,
    accepted: bool,
    merged: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct MergeRequest {
    hash: String,
    name: String,
    total: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct MergeResponse {
    message: String,
    merged: bool,
    size: u64,
}

/// Lists the chunks already stored for a session, so that a client can
/// resume an interrupted upload.
async fn check_chunks(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
) -> Result<Json<CheckResponse>, Response> {
    let session = SessionId::parse(query.hash.unwrap_or_default()).map_err(UploadError::from)?;
    let snapshot = state.coordinator.uploaded_chunks(&session).await?;

    debug!(
        "Session {session} holds {count} chunks",
        count = snapshot.chunks.len()
    );
    Ok(Json(CheckResponse {
        chunks: snapshot.chunks.into_iter().collect(),
        merged: snapshot.merged,
    }))
}

/// Stores one chunk and merges the session if it was the last one missing.
async fn add_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<AddResponse>, Response> {
    let upload = read_chunk_form(multipart).await?;
    let (session, index) = (upload.session.clone(), upload.index);

    let outcome = state.coordinator.add_chunk(upload).await?;
    if outcome.merged && outcome.accepted {
        info!("Chunk {index} completed session {session}");
    }

    Ok(Json(AddResponse {
        message: describe(&outcome).to_string(),
        accepted: outcome.accepted,
        merged: outcome.merged,
    }))
}

/// Merges a session whose earlier merge failed.
async fn merge_chunks(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<MergeResponse>, Response> {
    let session = SessionId::parse(&request.hash).map_err(UploadError::from)?;
    let name = ArtifactName::parse(&request.name).map_err(UploadError::from)?;

    let outcome = state
        .coordinator
        .merge(&session, request.total, &name)
        .await?;
    let artifact = outcome.artifact();
    info!(
        "Session {session} is merged into {path}",
        session = artifact.session,
        path = artifact.path.display()
    );

    let message = match &outcome {
        MergeOutcome::Committed(_) => "File merged",
        MergeOutcome::AlreadyMerged(_) => "File already merged",
    };

    Ok(Json(MergeResponse {
        message: message.to_string(),
        merged: true,
        size: outcome.artifact().size_bytes,
    }))
}

fn describe(outcome: &AddChunkOutcome) -> &'static str {
    match (outcome.accepted, outcome.merged) {
        (true, true) => "File merged",
        (true, false) => "Chunk stored",
        (false, _) => "File already merged, chunk discarded",
    }
}

/// Collects the form fields of a chunk upload. Unknown fields are ignored.
async fn read_chunk_form(mut multipart: Multipart) -> Result<ChunkUpload, Response> {
    let mut chunk: Option<Bytes> = None;
    let mut index: Option<String> = None;
    let mut hash: Option<String> = None;
    let mut name: Option<String> = None;
    let mut total: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(malformed_form)? {
        let field_name = field.name().map(|s| s.to_string()).unwrap_or_default();
        match field_name.as_str() {
            "chunk" => chunk = Some(field.bytes().await.map_err(malformed_form)?),
            "index" => index = Some(field.text().await.map_err(malformed_form)?),
            "hash" => hash = Some(field.text().await.map_err(malformed_form)?),
            "name" => name = Some(field.text().await.map_err(malformed_form)?),
            "total" => total = Some(field.text().await.map_err(malformed_form)?),
            other => debug!("Ignoring unknown form field {other:?}"),
        }
    }

    let upload = ChunkUpload::from_raw(
        hash.as_deref(),
        index.as_deref(),
        total.as_deref(),
        name.as_deref(),
        chunk,
    )
    .map_err(UploadError::from)?;
    Ok(upload)
}

fn malformed_form(e: MultipartError) -> Response {
    problemdetails::new(e.status())
        .with_title("Malformed upload")
        .with_detail(e.body_text())
        .into_response()
}

impl From<UploadError> for Response {
    fn from(value: UploadError) -> Self {
        match value {
            UploadError::Validation(e) => {
                let status = match &e {
                    ValidationError::ConflictingTotal { .. }
                    | ValidationError::StoredIndexOutOfRange { .. } => StatusCode::CONFLICT,
                    _ => StatusCode::BAD_REQUEST,
                };
                problemdetails::new(status)
                    .with_title("Invalid chunk")
                    .with_detail(e.to_string())
                    .into_response()
            }
            UploadError::Storage(e) => {
                error!("Chunk storage failed: {error}", error = e);
                let mut problem = problemdetails::new(StatusCode::INTERNAL_SERVER_ERROR)
                    .with_title("Storage failure")
                    .with_detail(format!("Unable to access the chunk storage: {e}"));
                if let Some(session) = e.session() {
                    problem = problem.with_value("hash", session.to_string());
                }
                if let Some(index) = e.index() {
                    problem = problem.with_value("index", index);
                }
                problem.into_response()
            }
            UploadError::Merge(MergeError::MissingChunk(key)) => {
                problemdetails::new(StatusCode::CONFLICT)
                    .with_title("Upload incomplete")
                    .with_detail(format!("Chunk {index} has not been uploaded", index = key.index))
                    .with_value("hash", key.session.to_string())
                    .with_value("index", key.index)
                    .into_response()
            }
            UploadError::Merge(e) => {
                error!("Merging failed: {error}", error = e);
                problemdetails::new(StatusCode::INTERNAL_SERVER_ERROR)
                    .with_title("Merge failure")
                    .with_detail(format!("Unable to assemble the file: {e}"))
                    .into_response()
            }
        }
    }
}
