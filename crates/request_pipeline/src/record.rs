//! The unit of work tracked from creation through completion.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a [`WorkRecord`].
///
/// Producers normally generate one with [`RecordId::generate`], but any non-empty text is
/// accepted on the wire so that records created elsewhere round-trip unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A unit of work flowing through both the inline processor and the queue pipeline.
///
/// The wire encoding uses the field names `id`, `startTime`, `endTime` and `sourceService`.
/// An absent `endTime` is encoded as `null` and decodes back to `None`; a missing field is
/// accepted as well.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    id: RecordId,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    source_service: String,
}

impl WorkRecord {
    /// Creates a fresh record with a generated id, started now.
    pub fn new(source_service: impl Into<String>) -> Self {
        Self::with_id(RecordId::generate(), source_service, Utc::now())
    }

    pub fn with_id(
        id: RecordId,
        source_service: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            start_time,
            end_time: None,
            source_service: source_service.into(),
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    pub fn is_processed(&self) -> bool {
        self.end_time.is_some()
    }

    /// Marks the record processed at `at`.
    ///
    /// `endTime` is never older than `startTime`: a completion instant earlier than the start
    /// (clock skew between producer and consumer hosts) is pinned to the start time.
    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at.max(self.start_time));
    }

    pub fn duration(&self) -> Option<chrono::TimeDelta> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}
