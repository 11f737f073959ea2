use bytes::Bytes;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// The longest session identifier accepted from clients.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// The longest artifact file name accepted from clients.
pub const MAX_ARTIFACT_NAME_LEN: usize = 255;

/// A client-supplied session identifier, usually the hash of the source file.
///
/// Only ASCII alphanumerics, `-` and `_` are accepted so that the identifier can
/// be used verbatim as a storage key segment without escaping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse<S: AsRef<str>>(value: S) -> Result<Self, ValidationError> {
        let value = value.as_ref().trim();
        if value.is_empty() {
            return Err(ValidationError::MissingField("hash"));
        }

        if value.len() > MAX_SESSION_ID_LEN {
            return Err(ValidationError::InvalidSessionId(format!(
                "must not be longer than {MAX_SESSION_ID_LEN} characters"
            )));
        }

        if let Some(c) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ValidationError::InvalidSessionId(format!(
                "contains the disallowed character {c:?}"
            )));
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifies one chunk of one session.
///
/// Keys are only ever built from validated parts; they are never recovered by
/// splitting a stored name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey {
    pub session: SessionId,
    pub index: u32,
}

impl ChunkKey {
    pub fn new(session: SessionId, index: u32) -> Self {
        Self { session, index }
    }
}

impl Display for ChunkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.session, self.index)
    }
}

/// The file name under which a merged artifact is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName(String);

impl ArtifactName {
    /// Validates a client-supplied file name.
    ///
    /// Names must be a single plain path component: no separators, no `.`/`..`
    /// and no leading dot (hidden names are reserved for bookkeeping).
    pub fn parse<S: AsRef<str>>(value: S) -> Result<Self, ValidationError> {
        let value = value.as_ref();
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField("name"));
        }

        if value.len() > MAX_ARTIFACT_NAME_LEN {
            return Err(ValidationError::InvalidArtifactName(format!(
                "must not be longer than {MAX_ARTIFACT_NAME_LEN} bytes"
            )));
        }

        if value.starts_with('.') {
            return Err(ValidationError::InvalidArtifactName(
                "must not start with a dot".to_string(),
            ));
        }

        if value
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
        {
            return Err(ValidationError::InvalidArtifactName(
                "must not contain path separators or control characters".to_string(),
            ));
        }

        let mut components = Path::new(value).components();
        match (components.next(), components.next()) {
            (Some(std::path::Component::Normal(_)), None) => Ok(Self(value.to_string())),
            _ => Err(ValidationError::InvalidArtifactName(
                "must be a plain file name".to_string(),
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ArtifactName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The validated primitives of a single chunk upload.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub session: SessionId,
    pub index: u32,
    pub expected_total: u32,
    pub name: ArtifactName,
    pub data: Bytes,
}

impl ChunkUpload {
    /// Builds an upload from already typed values and checks the index range.
    pub fn new(
        session: SessionId,
        index: u32,
        expected_total: u32,
        name: ArtifactName,
        data: Bytes,
    ) -> Result<Self, ValidationError> {
        if expected_total == 0 {
            return Err(ValidationError::ZeroTotal);
        }

        if index >= expected_total {
            return Err(ValidationError::IndexOutOfRange {
                index,
                total: expected_total,
            });
        }

        Ok(Self {
            session,
            index,
            expected_total,
            name,
            data,
        })
    }

    /// Builds an upload from raw form values as received by the front-end.
    pub fn from_raw(
        hash: Option<&str>,
        index: Option<&str>,
        total: Option<&str>,
        name: Option<&str>,
        data: Option<Bytes>,
    ) -> Result<Self, ValidationError> {
        let session = SessionId::parse(hash.unwrap_or_default())?;
        let index = parse_number("index", index)?;
        let total = parse_number("total", total)?;
        let name = ArtifactName::parse(name.unwrap_or_default())?;
        let data = data.ok_or(ValidationError::MissingField("chunk"))?;
        Self::new(session, index, total, name, data)
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.session.clone(), self.index)
    }
}

fn parse_number(field: &'static str, value: Option<&str>) -> Result<u32, ValidationError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField(field))?;
    value
        .parse::<u32>()
        .map_err(|_| ValidationError::MalformedNumber {
            field,
            value: value.to_string(),
        })
}

/// The result of accepting a chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddChunkOutcome {
    /// Whether the payload was stored.
    pub accepted: bool,
    /// Whether the session is merged into its final artifact.
    pub merged: bool,
}

/// A request was rejected before any state was touched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("The field {0} is missing")]
    MissingField(&'static str),
    #[error("The field {field} must be a non-negative integer, got {value:?}")]
    MalformedNumber { field: &'static str, value: String },
    #[error("Invalid session identifier: {0}")]
    InvalidSessionId(String),
    #[error("Invalid file name: {0}")]
    InvalidArtifactName(String),
    #[error("The total number of chunks must be at least one")]
    ZeroTotal,
    #[error("Chunk index {index} is outside of the range [0, {total})")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("A session may consist of at most {limit} chunks, got {total}")]
    TooManyChunks { total: u32, limit: u32 },
    #[error("Session {session} was declared with {expected} chunks, got {actual}")]
    ConflictingTotal {
        session: SessionId,
        expected: u32,
        actual: u32,
    },
    #[error("Session {session} already stores chunk {index}, which does not fit a total of {total}")]
    StoredIndexOutOfRange {
        session: SessionId,
        index: u32,
        total: u32,
    },
}
