//! One-shot calls recorded as write-once resources
//!
//! Each kind is a single remote call whose result is kept in the snapshot.
//! Nothing is ever updated or deleted remotely; a changed declaration makes
//! a new call, and removal only forgets the recorded result.

use apikit::{Error, Multipart, Result, Scope};
use converge::{
    AttrMode, Attributes, Comparator, Controller, Created, Imported, Lifecycle, Registry, Schema,
    diff,
};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use super::{Platform, object, only_known, required};

const MODERATION: Schema = Schema::new(&[
    ("model", AttrMode::ForcesReplacement),
    ("input", AttrMode::ForcesReplacement),
])
.with_drift(&[("model", Comparator::ModelAlias)]);

const CHAT_COMPLETION: Schema = Schema::new(&[
    ("model", AttrMode::ForcesReplacement),
    ("messages", AttrMode::ForcesReplacement),
    ("temperature", AttrMode::ForcesReplacement),
    ("top_p", AttrMode::ForcesReplacement),
    ("max_completion_tokens", AttrMode::ForcesReplacement),
    ("response_format", AttrMode::ForcesReplacement),
    ("tools", AttrMode::ForcesReplacement),
    ("seed", AttrMode::ForcesReplacement),
    ("store", AttrMode::ForcesReplacement),
    ("metadata", AttrMode::ForcesReplacement),
])
.with_drift(&[
    ("model", Comparator::ModelAlias),
    ("messages", Comparator::WriteOnly),
    ("tools", Comparator::WriteOnly),
    ("response_format", Comparator::WriteOnly),
]);

const RESPONSE: Schema = Schema::new(&[
    ("model", AttrMode::ForcesReplacement),
    ("input", AttrMode::ForcesReplacement),
    ("instructions", AttrMode::ForcesReplacement),
    ("previous_response_id", AttrMode::ForcesReplacement),
    ("tools", AttrMode::ForcesReplacement),
    ("temperature", AttrMode::ForcesReplacement),
    ("max_output_tokens", AttrMode::ForcesReplacement),
    ("store", AttrMode::ForcesReplacement),
    ("metadata", AttrMode::ForcesReplacement),
])
.with_drift(&[
    ("model", Comparator::ModelAlias),
    ("input", Comparator::WriteOnly),
    ("tools", Comparator::Subset),
]);

const EMBEDDING: Schema = Schema::new(&[
    ("model", AttrMode::ForcesReplacement),
    ("input", AttrMode::ForcesReplacement),
    ("dimensions", AttrMode::ForcesReplacement),
    ("encoding_format", AttrMode::ForcesReplacement),
])
.with_drift(&[("model", Comparator::ModelAlias)]);

const IMAGE_GENERATION: Schema = Schema::new(&[
    ("model", AttrMode::ForcesReplacement),
    ("prompt", AttrMode::ForcesReplacement),
    ("n", AttrMode::ForcesReplacement),
    ("size", AttrMode::ForcesReplacement),
    ("quality", AttrMode::ForcesReplacement),
    ("style", AttrMode::ForcesReplacement),
    ("response_format", AttrMode::ForcesReplacement),
]);

const SPEECH: Schema = Schema::new(&[
    ("model", AttrMode::ForcesReplacement),
    ("input", AttrMode::ForcesReplacement),
    ("voice", AttrMode::ForcesReplacement),
    ("instructions", AttrMode::ForcesReplacement),
    ("response_format", AttrMode::ForcesReplacement),
    ("speed", AttrMode::ForcesReplacement),
    ("output_path", AttrMode::ForcesReplacement),
]);

const TRANSCRIPTION: Schema = Schema::new(&[
    ("model", AttrMode::ForcesReplacement),
    ("path", AttrMode::ForcesReplacement),
    ("language", AttrMode::ForcesReplacement),
    ("prompt", AttrMode::ForcesReplacement),
    ("response_format", AttrMode::ForcesReplacement),
    ("temperature", AttrMode::ForcesReplacement),
]);

/// How the call is made and its result recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    /// JSON in, JSON out
    Json,
    /// JSON in, audio bytes written to `output_path`
    Speech,
    /// Multipart upload of the local `path`
    Transcription,
}

/// A single remote call kept as a write-once result
pub struct OneShot {
    platform: Arc<Platform>,
    kind: &'static str,
    path: &'static str,
    schema: Schema,
    call: Call,
    /// Attribute that must be present besides `model`
    input: &'static str,
    /// Results can be re-read with `GET {path}/{id}`
    readable: bool,
}

impl std::fmt::Debug for OneShot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShot")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

pub fn register(registry: &mut Registry, platform: &Arc<Platform>) {
    let kinds = [
        ("moderation", "/moderations", MODERATION, Call::Json, "input", false),
        ("chat_completion", "/chat/completions", CHAT_COMPLETION, Call::Json, "messages", false),
        ("response", "/responses", RESPONSE, Call::Json, "input", true),
        ("embedding", "/embeddings", EMBEDDING, Call::Json, "input", false),
        ("image_generation", "/images/generations", IMAGE_GENERATION, Call::Json, "prompt", false),
        ("speech", "/audio/speech", SPEECH, Call::Speech, "input", false),
        ("transcription", "/audio/transcriptions", TRANSCRIPTION, Call::Transcription, "path", false),
    ];
    for (kind, path, schema, call, input, readable) in kinds {
        registry.register(OneShot {
            platform: Arc::clone(platform),
            kind,
            path,
            schema,
            call,
            input,
            readable,
        });
    }
}

impl OneShot {
    /// Identity for results without an id of their own
    fn derived_identity(&self, declared: &Attributes) -> String {
        let hash = diff::content_hash(declared);
        format!("{}-{}", self.kind, &hash[..16])
    }

    /// Request body: the declaration minus local-only attributes
    fn body(&self, declared: &Attributes) -> Value {
        let local: &[&str] = match self.call {
            Call::Json => &[],
            Call::Speech => &["output_path"],
            Call::Transcription => &["path"],
        };
        Value::Object(
            declared
                .iter()
                .filter(|(k, v)| !local.contains(&k.as_str()) && !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Drop bulky payloads the snapshot has no use for
    fn trim(&self, observed: &mut Attributes) {
        match self.kind {
            "embedding" => {
                if let Some(Value::Array(data)) = observed.remove("data") {
                    observed.insert("count".to_string(), Value::from(data.len()));
                }
            }
            "image_generation" => {
                if let Some(Value::Array(images)) = observed.get_mut("data") {
                    for image in images.iter_mut().filter_map(Value::as_object_mut) {
                        if let Some(Value::String(b64)) = image.remove("b64_json") {
                            image.insert("b64_bytes".to_string(), Value::from(b64.len()));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn speak(&self, declared: &Attributes) -> Result<Created> {
        let output = required(declared, "output_path")?;
        let target = shellexpand::tilde(output);
        let audio = self
            .platform
            .api(Scope::Project)?
            .post_for_bytes(self.path, &self.body(declared))?;

        let target = Path::new(target.as_ref());
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, &audio)
            .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("{output}: {e}"))))?;

        let digest = blake3::hash(&audio).to_hex().to_string();
        let mut observed = Attributes::new();
        observed.insert("output_path".to_string(), Value::String(output.to_string()));
        observed.insert("bytes".to_string(), Value::from(audio.len()));
        observed.insert("digest".to_string(), Value::String(digest.clone()));
        Ok(Created {
            identity: format!("{}-{}", self.kind, &digest[..16]),
            observed,
        })
    }

    fn transcribe(&self, declared: &Attributes) -> Result<Created> {
        let path = required(declared, "path")?;
        let expanded = shellexpand::tilde(path);
        let audio = fs::read(expanded.as_ref())
            .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("{path}: {e}"))))?;
        let filename = Path::new(expanded.as_ref())
            .file_name()
            .map_or_else(|| "audio".to_string(), |n| n.to_string_lossy().into_owned());

        let mut form = Multipart::new();
        if let Value::Object(fields) = self.body(declared) {
            for (name, value) in fields {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                form = form.text(&name, &text);
            }
        }
        let form = form.file("file", &filename, audio);

        let response = self
            .platform
            .api(Scope::Project)?
            .post_payload_for_bytes(self.path, form.into_payload())?;
        let observed = match serde_json::from_slice::<Value>(&response) {
            Ok(Value::Object(map)) => map,
            // text, srt and vtt response formats
            _ => {
                let mut map = Attributes::new();
                let text = String::from_utf8_lossy(&response).into_owned();
                map.insert("text".to_string(), Value::String(text));
                map
            }
        };
        Ok(Created {
            identity: self.derived_identity(declared),
            observed,
        })
    }
}

impl Controller for OneShot {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::WriteOnce
    }

    fn validate(&self, declared: &Attributes) -> Result<()> {
        only_known(self.kind, declared, &self.schema)?;
        if self.kind != "moderation" {
            required(declared, "model")?;
        }
        if declared.get(self.input).is_none_or(Value::is_null) {
            return Err(Error::validation(format!(
                "missing required attribute '{}'",
                self.input
            )));
        }
        if self.call == Call::Speech {
            required(declared, "output_path")?;
            required(declared, "voice")?;
        }
        Ok(())
    }

    fn create(&self, declared: &Attributes) -> Result<Created> {
        match self.call {
            Call::Speech => return self.speak(declared),
            Call::Transcription => return self.transcribe(declared),
            Call::Json => {}
        }
        let response = self
            .platform
            .api(Scope::Project)?
            .post(self.path, &self.body(declared))?;
        let mut observed = object(response)?;
        self.trim(&mut observed);

        let identity = match observed.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => self.derived_identity(declared),
        };
        Ok(Created { identity, observed })
    }

    fn read(&self, identity: &str, prior: &Attributes) -> Result<Attributes> {
        if self.readable {
            let api = self.platform.api(Scope::Project)?;
            return object(api.get(&format!("{}/{identity}", self.path))?);
        }
        if self.call == Call::Speech
            && let Some(output) = prior.get("output_path").and_then(Value::as_str)
            && !Path::new(shellexpand::tilde(output).as_ref()).exists()
        {
            return Err(Error::not_found(format!("{output} no longer exists")));
        }
        Ok(prior.clone())
    }

    fn delete(&self, identity: &str, _observed: &Attributes) -> Result<()> {
        log::debug!("{} {identity} has nothing to delete remotely", self.kind);
        Ok(())
    }

    /// Original inputs can't be recovered: every attribute gets the
    /// configured placeholder and its diff is suppressed.
    fn import(&self, identity: &str) -> Result<Imported> {
        let mut observed = if self.readable {
            self.read(identity, &Attributes::new())?
        } else {
            Attributes::new()
        };
        observed
            .entry("id".to_string())
            .or_insert_with(|| Value::String(identity.to_string()));

        let placeholder = Value::String(self.platform.import_placeholder.clone());
        let declared = self
            .schema
            .names()
            .map(|name| (name.to_string(), placeholder.clone()))
            .collect();
        Ok(Imported {
            declared,
            observed,
            suppressed: self.schema.names().map(String::from).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{attrs, platform};
    use super::*;
    use apikit::{Method, MockTransport, Response};
    use converge::{
        ApplyResult, AutoConfirm, Driver, ExecuteOptions, Instance, NoProgress, SnapshotStore,
    };
    use serde_json::json;

    fn registry(mock: &MockTransport) -> Registry {
        let mut registry = Registry::new();
        register(&mut registry, &platform(mock));
        registry
    }

    fn options() -> ExecuteOptions {
        ExecuteOptions::default()
    }

    fn moderation_reply() -> Value {
        json!({
            "id": "modr-1",
            "model": "text-moderation-007",
            "results": [{"flagged": false}]
        })
    }

    #[test]
    fn test_moderation_alias_is_stable_across_passes() {
        let mock = MockTransport::new();
        mock.respond(Method::Post, "/moderations", 200, moderation_reply());
        let registry = registry(&mock);
        let store = SnapshotStore::new();
        let instance = Instance::new(
            "check",
            "moderation",
            attrs(json!({"model": "text-moderation-latest", "input": "hello"})),
        );

        let report = Driver::new(&registry, &store, options())
            .execute(std::slice::from_ref(&instance), &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("check"), Some(&ApplyResult::Created));
        assert_eq!(store.identity("check").as_deref(), Some("modr-1"));

        let driver = Driver::new(&registry, &store, options());
        let plan = driver.plan(std::slice::from_ref(&instance)).unwrap();
        assert!(!plan.has_changes());
        let report = driver
            .execute(&[instance], &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("check"), Some(&ApplyResult::NoChange));
        assert_eq!(mock.count(Method::Post, "/moderations"), 1);
    }

    #[test]
    fn test_changed_input_makes_a_new_call_and_never_deletes() {
        let mock = MockTransport::new();
        mock.respond(Method::Post, "/moderations", 200, moderation_reply());
        mock.respond(Method::Post, "/moderations", 200, json!({"id": "modr-2", "model": "text-moderation-007"}));
        let registry = registry(&mock);
        let store = SnapshotStore::new();

        let first = Instance::new("check", "moderation", attrs(json!({"input": "hello"})));
        Driver::new(&registry, &store, options())
            .execute(&[first], &mut NoProgress, &mut AutoConfirm)
            .unwrap();

        let second = Instance::new("check", "moderation", attrs(json!({"input": "goodbye"})));
        let report = Driver::new(&registry, &store, options())
            .execute(&[second], &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("check"), Some(&ApplyResult::Replaced));
        assert_eq!(store.identity("check").as_deref(), Some("modr-2"));
        assert!(mock.calls_with(Method::Delete).is_empty());

        let report = Driver::new(&registry, &store, options())
            .execute(&[], &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("check"), Some(&ApplyResult::Deleted));
        assert!(store.is_empty());
        assert_eq!(mock.calls().len(), 2);
    }

    #[test]
    fn test_import_uses_placeholder_and_suppresses_diff() {
        let mock = MockTransport::new();
        let registry = registry(&mock);
        let store = SnapshotStore::new();
        let instance = Instance::new(
            "old",
            "moderation",
            attrs(json!({"model": "omni-moderation-latest", "input": "original text"})),
        )
        .import("modr-9");

        let report = Driver::new(&registry, &store, options())
            .execute(std::slice::from_ref(&instance), &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("old"), Some(&ApplyResult::Imported));

        let entry = store.get("old").unwrap();
        assert_eq!(entry.identity, "modr-9");
        assert!(entry.imported);
        assert_eq!(
            entry.last_applied["input"],
            crate::config::DEFAULT_IMPORT_PLACEHOLDER
        );
        assert_eq!(entry.suppressed, vec!["model".to_string(), "input".to_string()]);

        let plan = Driver::new(&registry, &store, options()).plan(&[instance]).unwrap();
        assert!(!plan.has_changes());
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_edited_import_makes_a_real_call() {
        let mock = MockTransport::new();
        mock.respond(Method::Post, "/moderations", 200, moderation_reply());
        let registry = registry(&mock);
        let store = SnapshotStore::new();
        let imported = Instance::new(
            "old",
            "moderation",
            attrs(json!({"model": "text-moderation-latest", "input": "original text"})),
        )
        .import("modr-9");
        for _ in 0..2 {
            Driver::new(&registry, &store, options())
                .execute(std::slice::from_ref(&imported), &mut NoProgress, &mut AutoConfirm)
                .unwrap();
        }
        assert!(mock.calls().is_empty());

        let edited = Instance::new(
            "old",
            "moderation",
            attrs(json!({"model": "text-moderation-latest", "input": "different text"})),
        )
        .import("modr-9");
        let plan = Driver::new(&registry, &store, options())
            .plan(std::slice::from_ref(&edited))
            .unwrap();
        assert!(plan.has_changes());
        assert!(plan.step("old").unwrap().diff.changed("input"));

        let report = Driver::new(&registry, &store, options())
            .execute(&[edited], &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("old"), Some(&ApplyResult::Replaced));
        assert_eq!(mock.count(Method::Post, "/moderations"), 1);
        let entry = store.get("old").unwrap();
        assert_eq!(entry.identity, "modr-1");
        assert_eq!(entry.last_applied["input"], "different text");
        assert!(entry.suppressed.is_empty());
    }

    #[test]
    fn test_embedding_vectors_are_not_stored() {
        let mock = MockTransport::new();
        mock.respond(
            Method::Post,
            "/embeddings",
            200,
            json!({
                "object": "list",
                "model": "text-embedding-3-small",
                "data": [{"embedding": [0.1, 0.2]}, {"embedding": [0.3, 0.4]}],
                "usage": {"prompt_tokens": 4}
            }),
        );
        let registry = registry(&mock);
        let declared = attrs(json!({"model": "text-embedding-3-small", "input": ["a", "b"]}));
        let created = registry.get("embedding").unwrap().create(&declared).unwrap();
        assert!(created.identity.starts_with("embedding-"));
        assert_eq!(created.observed["count"], 2);
        assert!(!created.observed.contains_key("data"));

        // Same request, same identity
        let again = registry.get("embedding").unwrap().create(&declared).unwrap();
        assert_eq!(again.identity, created.identity);
    }

    #[test]
    fn test_speech_written_to_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("audio").join("hello.mp3");
        let mock = MockTransport::new();
        mock.respond_raw(
            Method::Post,
            "/audio/speech",
            Response {
                status: 200,
                body: b"ID3-fake-audio".to_vec(),
                retry_after: None,
            },
        );
        let registry = registry(&mock);
        let speech = registry.get("speech").unwrap();
        let declared = attrs(json!({
            "model": "tts-1",
            "voice": "alloy",
            "input": "hello",
            "output_path": output.to_string_lossy()
        }));
        speech.validate(&declared).unwrap();

        let created = speech.create(&declared).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"ID3-fake-audio");
        assert_eq!(created.observed["bytes"], 14);
        assert!(mock.calls_with(Method::Post)[0].json().unwrap().get("output_path").is_none());

        // A deleted output file counts as vanished
        fs::remove_file(&output).unwrap();
        let err = speech.read(&created.identity, &created.observed).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_transcription_uploads_audio() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("meeting.wav");
        fs::write(&input, b"RIFF").unwrap();
        let mock = MockTransport::new();
        mock.respond(Method::Post, "/audio/transcriptions", 200, json!({"text": "hello there"}));
        let registry = registry(&mock);

        let created = registry
            .get("transcription")
            .unwrap()
            .create(&attrs(json!({"model": "whisper-1", "path": input.to_string_lossy(), "language": "en"})))
            .unwrap();
        assert_eq!(created.observed["text"], "hello there");

        let call = &mock.calls_with(Method::Post)[0];
        let apikit::Payload::Bytes { data, .. } = &call.payload else {
            panic!("expected a multipart body");
        };
        let body = String::from_utf8_lossy(data);
        assert!(body.contains("filename=\"meeting.wav\""));
        assert!(body.contains("whisper-1"));
        assert!(!body.contains("name=\"path\""));
    }

    #[test]
    fn test_plain_text_transcription() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("memo.mp3");
        fs::write(&input, b"ID3").unwrap();
        let mock = MockTransport::new();
        mock.respond_raw(
            Method::Post,
            "/audio/transcriptions",
            Response {
                status: 200,
                body: b"1\n00:00:00,000 --> 00:00:01,000\nhi\n".to_vec(),
                retry_after: None,
            },
        );
        let registry = registry(&mock);

        let created = registry
            .get("transcription")
            .unwrap()
            .create(&attrs(json!({"model": "whisper-1", "path": input.to_string_lossy(), "response_format": "srt"})))
            .unwrap();
        assert!(created.observed["text"].as_str().unwrap().contains("--> 00:00:01,000"));
        assert!(created.identity.starts_with("transcription-"));
    }

    #[test]
    fn test_streaming_is_rejected() {
        let mock = MockTransport::new();
        let registry = registry(&mock);
        let err = registry
            .get("chat_completion")
            .unwrap()
            .validate(&attrs(json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            })))
            .unwrap_err();
        assert!(err.to_string().contains("stream"));
    }
}
