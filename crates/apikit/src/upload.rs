//! Chunked upload protocol.
//!
//! Large files go through `POST /uploads` (session), `POST
//! /uploads/{id}/parts` (one binary part per call) and `POST
//! /uploads/{id}/complete` (ordered part list). The platform only checks
//! ordering and byte accounting at completion time, so [`UploadSession`]
//! tracks every acknowledged part and validates the completion list locally
//! before anything is sent.
//!
//! ```text
//! Created ──add_part──▶ Receiving ──complete──▶ Completing ──ok──▶ Completed
//!    │                     │  ▲                     │
//!    └──cancel──▶ Aborted ◀┘  └──────rejected───────┘
//! ```

use crate::client::Scoped;
use crate::error::{Error, Result};
use crate::transport::Payload;
use crate::types::{CreateUpload, FileObject, PartAck, PartRef, Upload, UploadStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Largest part the platform accepts (64 MiB).
pub const MAX_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Where a session is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Session exists remotely, no parts yet.
    Created,
    /// At least one part acknowledged.
    Receiving,
    /// Completion request in flight.
    Completing,
    /// Terminal: the file exists.
    Completed,
    /// Terminal: the session was cancelled.
    Aborted,
}

impl UploadState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Receiving => "receiving",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

/// A part acknowledged by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: u32,
    pub size: u64,
    /// blake3 of the part content, used to tell idempotent retries from conflicts.
    pub digest: String,
    pub etag: String,
}

/// Outcome of checking a part before submitting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartCheck {
    /// Not seen before; submit it.
    New,
    /// Identical to an acknowledged part; reuse its etag.
    Duplicate(String),
}

/// Local model of one upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    id: String,
    total_bytes: u64,
    part_size: u64,
    state: UploadState,
    parts: BTreeMap<u32, PartRecord>,
    file: Option<FileObject>,
}

impl UploadSession {
    /// Track a freshly created remote session.
    pub fn new(id: impl Into<String>, total_bytes: u64, part_size: u64) -> Self {
        Self {
            id: id.into(),
            total_bytes,
            part_size: part_size.clamp(1, MAX_PART_SIZE),
            state: UploadState::Created,
            parts: BTreeMap::new(),
            file: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Acknowledged parts, ordered by part number.
    pub fn parts(&self) -> impl Iterator<Item = &PartRecord> {
        self.parts.values()
    }

    /// The file produced by completion.
    pub fn file(&self) -> Option<&FileObject> {
        self.file.as_ref()
    }

    /// Number of parts needed to cover `total_bytes` at `part_size`.
    pub fn expected_part_count(&self) -> u32 {
        u32::try_from(self.total_bytes.div_ceil(self.part_size)).unwrap_or(u32::MAX)
    }

    /// Bytes acknowledged so far.
    pub fn received_bytes(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.state {
            UploadState::Created | UploadState::Receiving => Ok(()),
            state => Err(Error::state(format!(
                "upload {} is {state}; no further parts may be added",
                self.id
            ))),
        }
    }

    /// Decide whether `data` may be submitted as `part_number`.
    ///
    /// A part number already acknowledged with identical content is an
    /// idempotent retry; with different content it is a `State` error.
    pub fn check_part(&self, part_number: u32, data: &[u8]) -> Result<PartCheck> {
        self.ensure_accepting()?;

        let expected = self.expected_part_count();
        if part_number == 0 || part_number > expected {
            return Err(Error::validation(format!(
                "part {part_number} is outside 1..={expected} for upload {}",
                self.id
            )));
        }
        let size = data.len() as u64;
        if size == 0 || size > self.part_size {
            return Err(Error::validation(format!(
                "part {part_number} is {size} bytes; parts must be 1..={} bytes",
                self.part_size
            )));
        }

        match self.parts.get(&part_number) {
            None => Ok(PartCheck::New),
            Some(prior) if prior.size == size && prior.digest == digest(data) => {
                Ok(PartCheck::Duplicate(prior.etag.clone()))
            }
            Some(prior) => Err(Error::state(format!(
                "part {part_number} of upload {} was already acknowledged with {} bytes of different content",
                self.id, prior.size
            ))),
        }
    }

    /// Record a part the platform acknowledged.
    pub fn record_part(&mut self, part_number: u32, data: &[u8], etag: impl Into<String>) -> Result<()> {
        if let PartCheck::New = self.check_part(part_number, data)? {
            self.parts.insert(
                part_number,
                PartRecord {
                    part_number,
                    size: data.len() as u64,
                    digest: digest(data),
                    etag: etag.into(),
                },
            );
        }
        self.state = UploadState::Receiving;
        Ok(())
    }

    /// The ordered completion list, validated against the protocol rules.
    ///
    /// Every part from 1 to the expected count must be present, the sizes
    /// must add up to `total_bytes`, and only the last part may be short.
    pub fn completion_list(&self) -> Result<Vec<PartRef>> {
        let expected = self.expected_part_count();
        let missing: Vec<String> = (1..=expected)
            .filter(|n| !self.parts.contains_key(n))
            .map(|n| n.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::validation(format!(
                "upload {} is missing part(s) {}",
                self.id,
                missing.join(", ")
            )));
        }

        if let Some(short) = self
            .parts
            .values()
            .find(|p| p.part_number < expected && p.size != self.part_size)
        {
            return Err(Error::validation(format!(
                "part {} is {} bytes; only the last part may be smaller than {}",
                short.part_number, short.size, self.part_size
            )));
        }

        let received = self.received_bytes();
        if received != self.total_bytes {
            return Err(Error::validation(format!(
                "upload {} declared {} bytes but parts cover {received}",
                self.id, self.total_bytes
            )));
        }

        Ok(self
            .parts
            .values()
            .map(|p| PartRef {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect())
    }

    /// Move to `Completing`, returning the list to submit.
    ///
    /// On a validation failure the session stays `Receiving`.
    pub fn begin_completion(&mut self) -> Result<Vec<PartRef>> {
        match self.state {
            UploadState::Receiving => {}
            UploadState::Created => {
                return Err(Error::validation(format!(
                    "upload {} has no parts to complete",
                    self.id
                )));
            }
            state => {
                return Err(Error::state(format!(
                    "upload {} is {state} and cannot be completed",
                    self.id
                )));
            }
        }
        let list = self.completion_list()?;
        self.state = UploadState::Completing;
        Ok(list)
    }

    /// Settle a completion attempt.
    ///
    /// Success is irreversible. A rejected completion returns to
    /// `Receiving` so acknowledged parts are kept.
    pub fn finish_completion(&mut self, outcome: Result<FileObject>) -> Result<FileObject> {
        if self.state != UploadState::Completing {
            return Err(Error::state(format!(
                "upload {} is {}, not completing",
                self.id, self.state
            )));
        }
        match outcome {
            Ok(file) => {
                self.state = UploadState::Completed;
                self.file = Some(file.clone());
                Ok(file)
            }
            Err(e) => {
                self.state = UploadState::Receiving;
                Err(e)
            }
        }
    }

    /// Move to `Aborted`. Only sessions that have not begun completing can abort.
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            UploadState::Created | UploadState::Receiving => {
                self.state = UploadState::Aborted;
                Ok(())
            }
            UploadState::Aborted => Ok(()),
            state => Err(Error::state(format!(
                "upload {} is {state} and cannot be cancelled",
                self.id
            ))),
        }
    }
}

fn digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Split `data` into numbered parts of at most `part_size` bytes.
pub fn split_parts(data: &[u8], part_size: u64) -> impl Iterator<Item = (u32, &[u8])> {
    let size = usize::try_from(part_size.clamp(1, MAX_PART_SIZE)).unwrap_or(usize::MAX);
    (1u32..).zip(data.chunks(size))
}

/// Drives an [`UploadSession`] against the platform.
///
/// Part submissions are serialized: the session lock is held across each
/// remote call, so concurrent producers are applied one at a time.
pub struct Uploader<'a> {
    api: Scoped<'a>,
    session: Mutex<UploadSession>,
}

impl fmt::Debug for Uploader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uploader")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl<'a> Uploader<'a> {
    /// Create a remote session.
    pub fn create(api: Scoped<'a>, request: &CreateUpload, part_size: u64) -> Result<Self> {
        // A session with no parts can never complete
        if request.bytes == 0 {
            return Err(Error::validation(format!(
                "{} is empty; nothing to upload",
                request.filename
            )));
        }
        let body = serde_json::to_value(request)?;
        let upload: Upload = api.post_as("/uploads", &body)?;
        log::debug!("Created upload {} ({} bytes)", upload.id, request.bytes);
        Ok(Self::resume(
            api,
            UploadSession::new(upload.id, request.bytes, part_size),
        ))
    }

    /// Continue driving an existing session.
    pub fn resume(api: Scoped<'a>, session: UploadSession) -> Self {
        Self {
            api,
            session: Mutex::new(session),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UploadSession> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> UploadState {
        self.lock().state()
    }

    /// A copy of the session as it stands.
    pub fn session(&self) -> UploadSession {
        self.lock().clone()
    }

    pub fn into_session(self) -> UploadSession {
        match self.session.into_inner() {
            Ok(session) => session,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Submit one part. Identical re-submissions make no remote call.
    pub fn add_part(&self, part_number: u32, data: &[u8]) -> Result<PartAck> {
        let mut session = self.lock();
        if let PartCheck::Duplicate(etag) = session.check_part(part_number, data)? {
            log::debug!("Part {part_number} of {} already acknowledged", session.id());
            return Ok(PartAck { part_number, etag });
        }

        let path = format!("/uploads/{}/parts", session.id());
        let query = [("part_number".to_string(), part_number.to_string())];
        let payload = Payload::Bytes {
            content_type: "application/octet-stream".to_string(),
            data: data.to_vec(),
        };
        let ack: PartAck = serde_json::from_value(self.api.post_payload(&path, &query, payload)?)?;
        if ack.part_number != part_number {
            return Err(Error::InvalidResponse(format!(
                "acknowledged part {} for submitted part {part_number}",
                ack.part_number
            )));
        }

        session.record_part(part_number, data, ack.etag.clone())?;
        Ok(ack)
    }

    /// Submit every part of `data`.
    pub fn add_all(&self, data: &[u8]) -> Result<()> {
        let part_size = self.lock().part_size();
        for (number, chunk) in split_parts(data, part_size) {
            self.add_part(number, chunk)?;
        }
        Ok(())
    }

    /// Complete the session and return the produced file.
    pub fn complete(&self) -> Result<FileObject> {
        let mut session = self.lock();
        let parts = session.begin_completion()?;
        let path = format!("/uploads/{}/complete", session.id());

        let outcome = self
            .api
            .post_as::<Upload>(&path, &json!({ "parts": parts }))
            .and_then(|upload| match (upload.status, upload.file) {
                (UploadStatus::Completed, Some(file)) => Ok(file),
                (status, _) => Err(Error::InvalidResponse(format!(
                    "completion returned upload in status {status:?} without a file"
                ))),
            });

        session.finish_completion(outcome)
    }

    /// Cancel the session remotely.
    pub fn cancel(&self) -> Result<()> {
        let mut session = self.lock();
        match session.state() {
            UploadState::Aborted => return Ok(()),
            UploadState::Created | UploadState::Receiving => {}
            state => {
                return Err(Error::state(format!(
                    "upload {} is {state} and cannot be cancelled",
                    session.id()
                )));
            }
        }
        self.api.post_empty(&format!("/uploads/{}/cancel", session.id()))?;
        session.abort()
    }
}
