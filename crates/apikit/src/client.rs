//! Bearer-scoped client over a [`Transport`].

use crate::error::{Error, PermissionKind, Result};
use crate::pagination::{CursorPage, CursorWalker, ListQuery};
use crate::retry::{LogCallback, RetryConfig, with_retry};
use crate::transport::{Method, Payload, Request, Transport};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Path prefixes of the assistants family, which needs the beta header.
const BETA_PREFIXES: [&str; 3] = ["/assistants", "/threads", "/vector_stores"];

/// Authentication scope required by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Project-scoped key: models, files, assistants, jobs.
    Project,
    /// Organization admin key: projects, users, invites, rate limits, admin keys.
    Admin,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// API keys available to the client.
#[derive(Clone, Default)]
pub struct Credentials {
    pub project_key: Option<String>,
    pub admin_key: Option<String>,
    /// Sent as `OpenAI-Organization` when set.
    pub organization: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("project_key", &self.project_key.as_ref().map(|_| "<redacted>"))
            .field("admin_key", &self.admin_key.as_ref().map(|_| "<redacted>"))
            .field("organization", &self.organization)
            .finish()
    }
}

/// Walker returned by [`Scoped::list`].
pub type Walker<'a, T> =
    CursorWalker<T, Box<dyn FnMut(&[(String, String)]) -> Result<CursorPage<T>> + 'a>>;

/// Client for the platform API.
///
/// Cheap to clone; the transport is shared.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    retry: RetryConfig,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("credentials", &self.credentials)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client over a transport. Calls are not retried until
    /// [`Client::with_retry`] sets a policy.
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
            retry: RetryConfig::no_retry(),
        }
    }

    /// Retry each transient call failure with backoff.
    ///
    /// Retries apply to one HTTP exchange at a time, never to a sequence
    /// of calls, so a request that succeeded is never sent again.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Get the configured credentials.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Bind a key for `scope`, failing fast when none is usable.
    ///
    /// Organization-level endpoints need the admin key; holding only a
    /// project key is a `MissingScope` error, holding nothing is
    /// `MissingAuth`. Project endpoints fall back to the admin key.
    pub fn scoped(&self, scope: Scope) -> Result<Scoped<'_>> {
        let project = self.credentials.project_key.as_deref().filter(|k| !k.is_empty());
        let admin = self.credentials.admin_key.as_deref().filter(|k| !k.is_empty());

        let key = match scope {
            Scope::Admin => admin.ok_or_else(|| Error::PermissionDenied {
                kind: if project.is_some() {
                    PermissionKind::MissingScope
                } else {
                    PermissionKind::MissingAuth
                },
                message: "organization-level resources require an admin key".to_string(),
            })?,
            Scope::Project => project.or(admin).ok_or_else(|| Error::PermissionDenied {
                kind: PermissionKind::MissingAuth,
                message: "no API key configured".to_string(),
            })?,
        };

        Ok(Scoped {
            client: self,
            scope,
            key,
        })
    }

    /// Shorthand for [`Scope::Project`].
    pub fn project(&self) -> Result<Scoped<'_>> {
        self.scoped(Scope::Project)
    }

    /// Shorthand for [`Scope::Admin`].
    pub fn admin(&self) -> Result<Scoped<'_>> {
        self.scoped(Scope::Admin)
    }
}

/// A client bound to one credential.
#[derive(Clone, Copy)]
pub struct Scoped<'a> {
    client: &'a Client,
    scope: Scope,
    key: &'a str,
}

impl<'a> Scoped<'a> {
    /// The scope this handle was bound for.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    fn request(&self, method: Method, path: &str) -> Request {
        let mut request = Request::new(method, path, self.key);
        if let Some(org) = &self.client.credentials.organization {
            request
                .headers
                .push(("OpenAI-Organization".to_string(), org.clone()));
        }
        if BETA_PREFIXES.iter().any(|p| path.starts_with(p)) {
            request
                .headers
                .push(("OpenAI-Beta".to_string(), "assistants=v2".to_string()));
        }
        request
    }

    /// Perform an exchange and return the raw body of a 2xx response.
    ///
    /// Transient failures (network, 429, 5xx) are retried under the
    /// client's policy.
    pub fn send(&self, request: &Request) -> Result<Vec<u8>> {
        with_retry(&self.client.retry, Some(&LogCallback), || self.exchange(request))
    }

    fn exchange(&self, request: &Request) -> Result<Vec<u8>> {
        let response = self.client.transport.send(request)?;
        if response.is_success() {
            Ok(response.body)
        } else {
            let err = Error::from_status(response.status, &response.body, response.retry_after);
            log::debug!("{} {} -> {}", request.method, request.path, err);
            Err(err)
        }
    }

    fn json(&self, request: &Request) -> Result<Value> {
        let body = self.send(request)?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// `GET path`.
    pub fn get(&self, path: &str) -> Result<Value> {
        self.json(&self.request(Method::Get, path))
    }

    /// `GET path?query`.
    pub fn get_query(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        let mut request = self.request(Method::Get, path);
        request.query = query.to_vec();
        self.json(&request)
    }

    /// `GET path`, decoded.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(serde_json::from_value(self.get(path)?)?)
    }

    /// `POST path` with a JSON body.
    pub fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let mut request = self.request(Method::Post, path);
        request.payload = Payload::Json(body.clone());
        self.json(&request)
    }

    /// `POST path` with a JSON body, decoded.
    pub fn post_as<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        Ok(serde_json::from_value(self.post(path, body)?)?)
    }

    /// `POST path` with no body.
    pub fn post_empty(&self, path: &str) -> Result<Value> {
        self.json(&self.request(Method::Post, path))
    }

    /// `POST path?query` with an arbitrary payload (binary parts, multipart forms).
    pub fn post_payload(
        &self,
        path: &str,
        query: &[(String, String)],
        payload: Payload,
    ) -> Result<Value> {
        let mut request = self.request(Method::Post, path);
        request.query = query.to_vec();
        request.payload = payload;
        self.json(&request)
    }

    /// `POST path` with an arbitrary payload, returning the raw response bytes.
    pub fn post_payload_for_bytes(&self, path: &str, payload: Payload) -> Result<Vec<u8>> {
        let mut request = self.request(Method::Post, path);
        request.payload = payload;
        self.send(&request)
    }

    /// `POST path` with a JSON body, returning the raw response bytes.
    pub fn post_for_bytes(&self, path: &str, body: &Value) -> Result<Vec<u8>> {
        let mut request = self.request(Method::Post, path);
        request.payload = Payload::Json(body.clone());
        self.send(&request)
    }

    /// `DELETE path`.
    pub fn delete(&self, path: &str) -> Result<Value> {
        self.json(&self.request(Method::Delete, path))
    }

    /// Walk a cursor-paginated list endpoint.
    pub fn list<T: DeserializeOwned + 'a>(self, path: &str, query: ListQuery) -> Walker<'a, T> {
        let path = path.to_string();
        let fetch = move |pairs: &[(String, String)]| -> Result<CursorPage<T>> {
            Ok(serde_json::from_value(self.get_query(&path, pairs)?)?)
        };
        CursorWalker::new(query, Box::new(fetch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use serde_json::json;
    use std::time::Duration;

    fn client(mock: &MockTransport, project: Option<&str>, admin: Option<&str>) -> Client {
        Client::new(
            Arc::new(mock.clone()),
            Credentials {
                project_key: project.map(String::from),
                admin_key: admin.map(String::from),
                organization: None,
            },
        )
    }

    #[test]
    fn test_admin_scope_with_project_key_is_missing_scope() {
        let mock = MockTransport::new();
        let client = client(&mock, Some("sk-proj"), None);

        match client.admin() {
            Err(Error::PermissionDenied { kind, .. }) => {
                assert_eq!(kind, PermissionKind::MissingScope);
            }
            _ => panic!("Expected PermissionDenied"),
        }
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_no_keys_is_missing_auth() {
        let mock = MockTransport::new();
        let client = client(&mock, None, None);

        for scope in [Scope::Project, Scope::Admin] {
            match client.scoped(scope) {
                Err(Error::PermissionDenied { kind, .. }) => {
                    assert_eq!(kind, PermissionKind::MissingAuth);
                }
                _ => panic!("Expected PermissionDenied"),
            }
        }
    }

    #[test]
    fn test_project_scope_falls_back_to_admin_key() {
        let mock = MockTransport::new();
        mock.respond(Method::Get, "/files/file-1", 200, json!({"id": "file-1"}));
        let client = client(&mock, None, Some("sk-admin"));

        client.project().unwrap().get("/files/file-1").unwrap();
        assert_eq!(mock.calls()[0].bearer, "sk-admin");
    }

    #[test]
    fn test_error_status_is_classified() {
        let mock = MockTransport::new();
        mock.respond_error(Method::Get, "/files/gone", 404, "No such File object: gone");
        let client = client(&mock, Some("sk"), None);

        let err = client.project().unwrap().get("/files/gone").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("No such File object"));
    }

    #[test]
    fn test_transient_status_retried_per_call() {
        let mock = MockTransport::new();
        mock.respond_error(Method::Get, "/files/file-1", 503, "upstream unavailable");
        mock.respond(Method::Get, "/files/file-1", 200, json!({"id": "file-1"}));
        let client = client(&mock, Some("sk"), None).with_retry(RetryConfig::new(3, Duration::from_millis(1), 1.0));

        let value = client.project().unwrap().get("/files/file-1").unwrap();
        assert_eq!(value["id"], "file-1");
        assert_eq!(mock.count(Method::Get, "/files/file-1"), 2);
    }

    #[test]
    fn test_semantic_status_not_retried() {
        let mock = MockTransport::new();
        mock.respond_error(Method::Post, "/organization/projects", 409, "already exists");
        let client = client(&mock, None, Some("sk-admin")).with_retry(RetryConfig::new(3, Duration::from_millis(1), 1.0));

        let err = client
            .admin()
            .unwrap()
            .post("/organization/projects", &json!({"name": "Demo"}))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(mock.count(Method::Post, "/organization/projects"), 1);
    }

    #[test]
    fn test_list_follows_cursor() {
        let mock = MockTransport::new();
        mock.respond(
            Method::Get,
            "/files",
            200,
            json!({"data": [{"id": "f1"}, {"id": "f2"}], "first_id": "f1", "last_id": "f2", "has_more": true}),
        );
        mock.respond(
            Method::Get,
            "/files",
            200,
            json!({"data": [{"id": "f3"}], "first_id": "f3", "last_id": "f3", "has_more": false}),
        );
        let client = client(&mock, Some("sk"), None);

        let ids: Vec<String> = client
            .project()
            .unwrap()
            .list::<Value>("/files", ListQuery::new().limit(2))
            .map(|item| item.unwrap()["id"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(ids, vec!["f1", "f2", "f3"]);
        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].query_param("after"), None);
        assert_eq!(calls[1].query_param("after"), Some("f2"));
        assert_eq!(calls[1].query_param("limit"), Some("2"));
    }

    #[test]
    fn test_beta_header_for_assistants_family() {
        let mock = MockTransport::new();
        let client = client(&mock, Some("sk"), None);
        let scoped = client.project().unwrap();

        let request = scoped.request(Method::Get, "/assistants/asst_1");
        assert!(
            request
                .headers
                .contains(&("OpenAI-Beta".to_string(), "assistants=v2".to_string()))
        );
        let request = scoped.request(Method::Get, "/files");
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_credentials_debug_redacts_keys() {
        let creds = Credentials {
            project_key: Some("sk-secret".into()),
            admin_key: None,
            organization: Some("org-1".into()),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("org-1"));
    }
}
