//! The aggregated project data served by the cache.
//!
//! Records are decoded from backing store documents. Only the fields the cache itself needs are
//! typed, everything else a document carries is kept verbatim in `extra`, so consumers see the
//! full document.

use std::sync::Arc;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// The opaque, stable identifier of a project.
pub type ProjectId = Arc<str>;

/// Fields of a document that are not modelled explicitly.
pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

/// The root record of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Marker of the last modification of the root record, kept as the store wrote it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl ProjectRecord {
    /// The update marker as epoch milliseconds.
    ///
    /// Understands RFC 3339 strings, plain epoch milliseconds and `{seconds, nanos}` timestamp
    /// objects (also with `_seconds`/`_nanoseconds` keys). Anything else yields `None`.
    pub fn updated_at_millis(&self) -> Option<i64> {
        match self.updated_at.as_ref()? {
            serde_json::Value::Number(millis) => millis
                .as_i64()
                .or_else(|| millis.as_f64().map(|millis| millis as i64)),
            serde_json::Value::String(timestamp) => DateTime::parse_from_rfc3339(timestamp)
                .ok()
                .map(|timestamp| timestamp.timestamp_millis()),
            serde_json::Value::Object(fields) => {
                let seconds = fields
                    .get("seconds")
                    .or_else(|| fields.get("_seconds"))?
                    .as_i64()?;
                let nanos = fields
                    .get("nanos")
                    .or_else(|| fields.get("_nanoseconds"))
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0);
                Some(seconds * 1000 + nanos / 1_000_000)
            }
            _ => None,
        }
    }
}

/// Profile data of a project member, resolved from the user's own document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberProfile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl MemberProfile {
    /// Minimal stand-in for a profile that could not be resolved.
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            display_name: user_id.to_owned(),
            email: None,
            avatar_url: None,
        }
    }
}

/// A member of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    #[serde(default)]
    pub id: String,
    /// The user this membership refers to. Falls back to the membership id.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
    /// The resolved user profile.
    #[serde(default)]
    pub profile: MemberProfile,
    /// `false` if `profile` is a placeholder because enrichment failed.
    #[serde(default)]
    pub enriched: bool,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// An item of the project backlog.
///
/// Stories nested below an epic are flattened into the backlog and point back to their epic
/// through `parent_id` and `parent_title`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// The item kind, e.g. `epic`, `story` or `bug`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parent_title: Option<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl BacklogItem {
    pub fn is_epic(&self) -> bool {
        self.kind.as_deref() == Some("epic")
    }
}

/// A sprint of the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sprint {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// The sprint status, e.g. `planned`, `active` or `completed`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Sprint {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("active")
    }
}

/// A task of the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Explicit position of the task in its list.
    #[serde(default)]
    pub order: Option<f64>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

/// A consistent snapshot of a project and its related collections.
///
/// A snapshot is immutable. A refresh produces a new snapshot that replaces the old one as a
/// whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub project: ProjectRecord,
    pub members: Vec<Member>,
    pub backlog: Vec<BacklogItem>,
    pub sprints: Vec<Sprint>,
    pub tasks: Vec<Task>,
    /// The id of the currently active sprint, if any.
    pub active_sprint_id: Option<String>,
    /// Cheap summary of the snapshot shape, for conditional responses.
    pub fingerprint: String,
    /// When this snapshot was assembled, in epoch milliseconds.
    pub loaded_at: u64,
}
