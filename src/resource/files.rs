//! Files and chunked uploads

use apikit::{
    CreateUpload, Error, MAX_PART_SIZE, Multipart, Result, Scope, Upload, UploadState,
    UploadStatus, Uploader,
};
use converge::{AttrMode, Attributes, Controller, Created, Imported, Registry, Schema};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use super::{Platform, identity_of, object, only_known, required};

const PURPOSES: [&str; 6] = ["assistants", "batch", "fine-tune", "vision", "user_data", "evals"];

const FILE: Schema = Schema::new(&[
    ("path", AttrMode::ForcesReplacement),
    ("purpose", AttrMode::ForcesReplacement),
    ("filename", AttrMode::ForcesReplacement),
]);

const UPLOAD: Schema = Schema::new(&[
    ("path", AttrMode::ForcesReplacement),
    ("purpose", AttrMode::ForcesReplacement),
    ("filename", AttrMode::ForcesReplacement),
    ("mime_type", AttrMode::ForcesReplacement),
    ("part_size", AttrMode::ForcesReplacement),
]);

pub fn register(registry: &mut Registry, platform: &Arc<Platform>) {
    registry
        .register(FileController {
            platform: Arc::clone(platform),
        })
        .register(UploadController {
            platform: Arc::clone(platform),
        });
}

fn check_purpose(declared: &Attributes) -> Result<&str> {
    let purpose = required(declared, "purpose")?;
    if PURPOSES.contains(&purpose) {
        Ok(purpose)
    } else {
        Err(Error::validation(format!(
            "purpose must be one of {}, got '{purpose}'",
            PURPOSES.join(", ")
        )))
    }
}

/// Local input: (bytes, file name sent to the platform)
fn read_input(declared: &Attributes) -> Result<(Vec<u8>, String)> {
    let path = required(declared, "path")?;
    let expanded = shellexpand::tilde(path);
    let data = fs::read(expanded.as_ref())
        .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("{path}: {e}"))))?;
    let filename = match declared.get("filename").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => Path::new(expanded.as_ref())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::validation(format!("'{path}' has no file name")))?,
    };
    Ok((data, filename))
}

fn mime_type(filename: &str) -> &'static str {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some("jsonl") => "text/jsonl",
        Some("json") => "application/json",
        Some("txt" | "md") => "text/plain",
        Some("csv") => "text/csv",
        Some("pdf") => "application/pdf",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

// ============================================================================
// file
// ============================================================================

/// A file uploaded in a single multipart request
#[derive(Debug)]
pub struct FileController {
    platform: Arc<Platform>,
}

impl Controller for FileController {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn schema(&self) -> &Schema {
        &FILE
    }

    fn validate(&self, declared: &Attributes) -> Result<()> {
        only_known(self.kind(), declared, &FILE)?;
        required(declared, "path")?;
        check_purpose(declared).map(|_| ())
    }

    fn create(&self, declared: &Attributes) -> Result<Created> {
        let purpose = check_purpose(declared)?;
        let (data, filename) = read_input(declared)?;
        let api = self.platform.api(Scope::Project)?;

        log::debug!("Uploading {filename} ({} bytes)", data.len());
        let form = Multipart::new()
            .text("purpose", purpose)
            .file("file", &filename, data);
        let observed = object(api.post_payload("/files", &[], form.into_payload())?)?;
        Ok(Created {
            identity: identity_of(&observed)?,
            observed,
        })
    }

    fn read(&self, identity: &str, _prior: &Attributes) -> Result<Attributes> {
        object(self.platform.api(Scope::Project)?.get(&format!("/files/{identity}"))?)
    }

    fn delete(&self, identity: &str, _observed: &Attributes) -> Result<()> {
        self.platform
            .api(Scope::Project)?
            .delete(&format!("/files/{identity}"))?;
        Ok(())
    }

    fn import(&self, identity: &str) -> Result<Imported> {
        let observed = self.read(identity, &Attributes::new())?;
        let mut declared = super::pick(&observed, ["purpose", "filename"]);
        // The local source is unknown; keep the platform's name as a stand-in
        if let Some(name) = observed.get("filename") {
            declared.insert("path".to_string(), name.clone());
        }
        Ok(Imported {
            declared,
            observed,
            suppressed: vec!["path".to_string()],
        })
    }
}

// ============================================================================
// upload
// ============================================================================

/// A large file sent through an upload session.
///
/// The identity is the upload id; the produced file is recorded under
/// `file` in the observed payload and is what `read` refreshes.
#[derive(Debug)]
pub struct UploadController {
    platform: Arc<Platform>,
}

impl UploadController {
    fn part_size(declared: &Attributes) -> Result<u64> {
        match declared.get("part_size") {
            None => Ok(MAX_PART_SIZE),
            Some(value) => value
                .as_u64()
                .filter(|size| (1..=MAX_PART_SIZE).contains(size))
                .ok_or_else(|| {
                    Error::validation(format!(
                        "part_size must be between 1 and {MAX_PART_SIZE} bytes"
                    ))
                }),
        }
    }

    fn file_id(observed: &Attributes) -> Option<&str> {
        observed
            .get("file")
            .and_then(|f| f.get("id"))
            .and_then(Value::as_str)
    }
}

impl Controller for UploadController {
    fn kind(&self) -> &'static str {
        "upload"
    }

    fn schema(&self) -> &Schema {
        &UPLOAD
    }

    fn validate(&self, declared: &Attributes) -> Result<()> {
        only_known(self.kind(), declared, &UPLOAD)?;
        required(declared, "path")?;
        check_purpose(declared)?;
        Self::part_size(declared).map(|_| ())
    }

    fn create(&self, declared: &Attributes) -> Result<Created> {
        let purpose = check_purpose(declared)?.to_string();
        let part_size = Self::part_size(declared)?;
        let (data, filename) = read_input(declared)?;
        if data.is_empty() {
            return Err(Error::validation(format!("'{filename}' is empty; nothing to upload")));
        }
        let mime_type = declared
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or_else(|| mime_type(&filename))
            .to_string();

        let request = CreateUpload {
            filename,
            purpose,
            bytes: data.len() as u64,
            mime_type,
        };
        let uploader = Uploader::create(self.platform.api(Scope::Project)?, &request, part_size)?;
        let session = uploader.session();
        log::info!(
            "Uploading {} in {} part(s) via {}",
            request.filename,
            session.expected_part_count(),
            session.id()
        );

        let file = match uploader.add_all(&data).and_then(|()| uploader.complete()) {
            Ok(file) => file,
            Err(e) => {
                if uploader.state() != UploadState::Completed
                    && let Err(cancel) = uploader.cancel()
                {
                    log::warn!("Could not cancel upload {}: {cancel}", session.id());
                }
                return Err(e);
            }
        };

        let upload = Upload {
            id: session.id().to_string(),
            filename: request.filename,
            purpose: request.purpose,
            bytes: request.bytes,
            status: UploadStatus::Completed,
            expires_at: None,
            file: Some(file),
        };
        Ok(Created {
            identity: upload.id.clone(),
            observed: object(serde_json::to_value(&upload)?)?,
        })
    }

    fn read(&self, identity: &str, prior: &Attributes) -> Result<Attributes> {
        let file_id = Self::file_id(prior).ok_or_else(|| {
            Error::not_found(format!("upload {identity} has no recorded file"))
        })?;
        let file = self
            .platform
            .api(Scope::Project)?
            .get(&format!("/files/{file_id}"))?;
        let mut observed = prior.clone();
        observed.insert("file".to_string(), file);
        Ok(observed)
    }

    fn delete(&self, identity: &str, observed: &Attributes) -> Result<()> {
        let api = self.platform.api(Scope::Project)?;
        match Self::file_id(observed) {
            Some(file_id) => api.delete(&format!("/files/{file_id}"))?,
            None => api.post_empty(&format!("/uploads/{identity}/cancel"))?,
        };
        Ok(())
    }

    fn import(&self, identity: &str) -> Result<Imported> {
        Err(Error::validation(format!(
            "upload {identity} cannot be imported; import the produced file as a 'file' resource"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{attrs, platform};
    use super::*;
    use apikit::{Method, MockTransport, Payload};
    use serde_json::json;

    fn input(content: &[u8]) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        fs::write(&path, content).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    fn upload(mock: &MockTransport) -> UploadController {
        UploadController {
            platform: platform(mock),
        }
    }

    #[test]
    fn test_file_is_sent_as_multipart() {
        let (_dir, path) = input(b"{\"prompt\": \"hi\"}\n");
        let mock = MockTransport::new();
        mock.respond(
            Method::Post,
            "/files",
            200,
            json!({"id": "file-1", "filename": "train.jsonl", "purpose": "fine-tune", "bytes": 17}),
        );
        let controller = FileController {
            platform: platform(&mock),
        };
        let created = controller
            .create(&attrs(json!({"path": path, "purpose": "fine-tune"})))
            .unwrap();
        assert_eq!(created.identity, "file-1");

        let call = &mock.calls_with(Method::Post)[0];
        let Payload::Bytes { content_type, data } = &call.payload else {
            panic!("expected a multipart body");
        };
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        let body = String::from_utf8_lossy(data);
        assert!(body.contains("filename=\"train.jsonl\""));
        assert!(body.contains("fine-tune"));
    }

    #[test]
    fn test_file_validation() {
        let mock = MockTransport::new();
        let controller = FileController {
            platform: platform(&mock),
        };
        let err = controller
            .validate(&attrs(json!({"path": "a.jsonl", "purpose": "training"})))
            .unwrap_err();
        assert!(err.to_string().contains("purpose must be one of"));
        assert!(controller.validate(&attrs(json!({"purpose": "batch"}))).is_err());
    }

    #[test]
    fn test_missing_local_file_is_io_error() {
        let mock = MockTransport::new();
        let controller = FileController {
            platform: platform(&mock),
        };
        let err = controller
            .create(&attrs(json!({"path": "/nonexistent/x.jsonl", "purpose": "batch"})))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_upload_runs_session_to_completion() {
        let (_dir, path) = input(b"0123456789");
        let mock = MockTransport::new();
        mock.respond(
            Method::Post,
            "/uploads",
            200,
            json!({"id": "upload_1", "status": "pending", "bytes": 10}),
        );
        mock.set_handler(|request| {
            if request.path != "/uploads/upload_1/parts" {
                return None;
            }
            let number = request
                .query
                .iter()
                .find(|(k, _)| k == "part_number")
                .map(|(_, v)| v.clone())?;
            Some(apikit::Response::json(
                200,
                &json!({"part_number": number.parse::<u32>().ok()?, "etag": format!("etag-{number}")}),
            ))
        });
        mock.respond(
            Method::Post,
            "/uploads/upload_1/complete",
            200,
            json!({
                "id": "upload_1",
                "status": "completed",
                "file": {"id": "file-9", "bytes": 10, "filename": "train.jsonl", "purpose": "fine-tune"}
            }),
        );

        let created = upload(&mock)
            .create(&attrs(json!({"path": path, "purpose": "fine-tune", "part_size": 4})))
            .unwrap();
        assert_eq!(created.identity, "upload_1");
        assert_eq!(created.observed["status"], "completed");
        assert_eq!(created.observed["file"]["id"], "file-9");
        assert_eq!(mock.count(Method::Post, "/uploads/upload_1/parts"), 3);

        let request = mock.calls_with(Method::Post)[0].json().unwrap().clone();
        assert_eq!(request["mime_type"], "text/jsonl");
        assert_eq!(request["bytes"], 10);

        let complete = mock
            .calls_with(Method::Post)
            .into_iter()
            .find(|c| c.path == "/uploads/upload_1/complete")
            .unwrap();
        assert_eq!(
            complete.json().unwrap()["parts"],
            json!([
                {"part_number": 1, "etag": "etag-1"},
                {"part_number": 2, "etag": "etag-2"},
                {"part_number": 3, "etag": "etag-3"}
            ])
        );
    }

    #[test]
    fn test_failed_upload_is_cancelled() {
        let (_dir, path) = input(b"0123456789");
        let mock = MockTransport::new();
        mock.respond(Method::Post, "/uploads", 200, json!({"id": "upload_2", "status": "pending"}));
        mock.respond_error(Method::Post, "/uploads/upload_2/parts", 400, "bad part");
        mock.respond(Method::Post, "/uploads/upload_2/cancel", 200, json!({"id": "upload_2", "status": "cancelled"}));

        let err = upload(&mock)
            .create(&attrs(json!({"path": path, "purpose": "batch"})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(mock.count(Method::Post, "/uploads/upload_2/cancel"), 1);
    }

    #[test]
    fn test_empty_input_never_opens_a_session() {
        let (_dir, path) = input(b"");
        let mock = MockTransport::new();

        let err = upload(&mock)
            .create(&attrs(json!({"path": path, "purpose": "fine-tune"})))
            .unwrap_err();
        assert!(err.to_string().contains("is empty"));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_upload_read_and_delete_follow_the_file() {
        let mock = MockTransport::new();
        mock.respond(Method::Get, "/files/file-9", 200, json!({"id": "file-9", "bytes": 10}));
        mock.respond(Method::Delete, "/files/file-9", 200, json!({"id": "file-9", "deleted": true}));
        let controller = upload(&mock);
        let prior = attrs(json!({"id": "upload_1", "status": "completed", "file": {"id": "file-9"}}));

        let observed = controller.read("upload_1", &prior).unwrap();
        assert_eq!(observed["file"]["bytes"], 10);
        assert_eq!(observed["status"], "completed");

        controller.delete("upload_1", &observed).unwrap();
        assert_eq!(mock.count(Method::Delete, "/files/file-9"), 1);

        assert!(controller.read("upload_1", &Attributes::new()).unwrap_err().is_not_found());
        assert!(controller.import("upload_1").is_err());
    }
}
