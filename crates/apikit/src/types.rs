//! Typed payloads for the endpoint families that have protocol logic.
//!
//! Most resource families are handled as raw JSON objects by their
//! controllers; the types here back the flows where field semantics matter
//! (uploads, rate limits, invites, organization users).

use serde::{Deserialize, Serialize};

/// Status of an upload session as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Completed,
    Cancelled,
    Expired,
}

/// Request body for `POST /uploads`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUpload {
    pub filename: String,
    pub purpose: String,
    pub bytes: u64,
    pub mime_type: String,
}

/// An upload session object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub bytes: u64,
    pub status: UploadStatus,
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// The file produced by completion.
    #[serde(default)]
    pub file: Option<FileObject>,
}

/// A file object (only the fields the engine relies on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub purpose: String,
}

/// Acknowledgement for `POST /uploads/{id}/parts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartAck {
    pub part_number: u32,
    pub etag: String,
}

/// One entry of the ordered list sent to `POST /uploads/{id}/complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRef {
    pub part_number: u32,
    pub etag: String,
}

/// A per-(project, model) rate limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_1_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_1_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_images_per_1_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_audio_megabytes_per_1_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_1_day: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_1_day_max_input_tokens: Option<u64>,
}

/// Fields of a rate limit that can be overridden.
pub const RATE_LIMIT_FIELDS: [&str; 6] = [
    "max_requests_per_1_minute",
    "max_tokens_per_1_minute",
    "max_images_per_1_minute",
    "max_audio_megabytes_per_1_minute",
    "max_requests_per_1_day",
    "batch_1_day_max_input_tokens",
];

/// Invitation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Expired,
}

impl InviteStatus {
    /// Accepted invitations cannot be deleted remotely.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// An organization invitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub id: String,
    pub email: String,
    pub role: String,
    pub status: InviteStatus,
    #[serde(default)]
    pub invited_at: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub accepted_at: Option<i64>,
}

/// A member of the organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub added_at: Option<i64>,
}

/// Response to a DELETE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deleted {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}
