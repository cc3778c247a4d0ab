//! Organization-level kinds (admin scope)

use apikit::{Error, ListQuery, RATE_LIMIT_FIELDS, RateLimit, Result, Scope, Scoped};
use converge::{
    AttrMode, Attributes, Controller, Created, DeleteRule, Diff, Imported, Registry, Schema,
};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};

use super::{Platform, Removal, Rest, object, only_known, pick, required};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z]{2,}$")
        .expect("valid email regex")
});

const PROJECT: Schema = Schema::new(&[("name", AttrMode::Updatable)]);

const PROJECT_USER: Schema = Schema::new(&[
    ("project_id", AttrMode::ForcesReplacement),
    ("user_id", AttrMode::ForcesReplacement),
    ("role", AttrMode::Updatable),
]);

const SERVICE_ACCOUNT: Schema = Schema::new(&[
    ("project_id", AttrMode::ForcesReplacement),
    ("name", AttrMode::ForcesReplacement),
]);

const ADMIN_API_KEY: Schema = Schema::new(&[("name", AttrMode::ForcesReplacement)]);

const INVITE: Schema = Schema::new(&[
    ("email", AttrMode::ForcesReplacement),
    ("role", AttrMode::ForcesReplacement),
    ("projects", AttrMode::ForcesReplacement),
])
.with_drift(&[("projects", converge::Comparator::Subset)]);

pub fn register(registry: &mut Registry, platform: &Arc<Platform>) {
    registry
        .register(
            Rest::new(platform, "project", Scope::Admin, "/organization/projects", PROJECT)
                .removal(
                    Removal::Post("/archive"),
                    DeleteRule::LocalOnlyWhenTerminal {
                        field: "status",
                        terminal: &["archived"],
                    },
                )
                .check(check_named),
        )
        .register(
            Rest::new(
                platform,
                "project_user",
                Scope::Admin,
                "/organization/projects/{parent}/users",
                PROJECT_USER,
            )
            .parent("project_id")
            .check(check_project_user),
        )
        .register(
            Rest::new(
                platform,
                "project_service_account",
                Scope::Admin,
                "/organization/projects/{parent}/service_accounts",
                SERVICE_ACCOUNT,
            )
            .parent("project_id")
            .check(check_named),
        )
        .register(
            Rest::new(
                platform,
                "admin_api_key",
                Scope::Admin,
                "/organization/admin_api_keys",
                ADMIN_API_KEY,
            )
            .check(check_named),
        )
        .register(
            Rest::new(platform, "invite", Scope::Admin, "/organization/invites", INVITE)
                .removal(
                    Removal::Delete,
                    DeleteRule::LocalOnlyWhenTerminal {
                        field: "status",
                        terminal: &["accepted"],
                    },
                )
                .check(check_invite),
        )
        .register(RateLimitController {
            platform: Arc::clone(platform),
        });
}

fn check_named(declared: &Attributes) -> Result<()> {
    required(declared, "name").map(|_| ())
}

fn check_role(declared: &Attributes, roles: &[&str]) -> Result<()> {
    let role = required(declared, "role")?;
    if roles.contains(&role) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "role must be one of {}, got '{role}'",
            roles.join(", ")
        )))
    }
}

fn check_project_user(declared: &Attributes) -> Result<()> {
    required(declared, "user_id")?;
    check_role(declared, &["owner", "member"])
}

fn check_invite(declared: &Attributes) -> Result<()> {
    let email = required(declared, "email")?;
    if !EMAIL.is_match(email) {
        return Err(Error::validation(format!("'{email}' is not an email address")));
    }
    check_role(declared, &["owner", "reader"])?;
    if let Some(projects) = declared.get("projects") {
        let entries = projects
            .as_array()
            .ok_or_else(|| Error::validation("projects must be a list"))?;
        for project in entries {
            let project = project.as_object().ok_or_else(|| {
                Error::validation("each project must be a table with id and role")
            })?;
            required(project, "id")?;
            check_role(project, &["owner", "member"])?;
        }
    }
    Ok(())
}

// ============================================================================
// Rate limits
// ============================================================================

const RATE_LIMIT: Schema = Schema::new(&[
    ("project_id", AttrMode::ForcesReplacement),
    ("model", AttrMode::ForcesReplacement),
    ("max_requests_per_1_minute", AttrMode::Updatable),
    ("max_tokens_per_1_minute", AttrMode::Updatable),
    ("max_images_per_1_minute", AttrMode::Updatable),
    ("max_audio_megabytes_per_1_minute", AttrMode::Updatable),
    ("max_requests_per_1_day", AttrMode::Updatable),
    ("batch_1_day_max_input_tokens", AttrMode::Updatable),
]);

/// Observed key holding the values found before the first override
const DEFAULTS: &str = "defaults";

/// Per-(project, model) rate limit override.
///
/// Every model of a project always has a limit, so create locates the
/// existing one and overrides it, and delete resets it. The values seen
/// before the first override are kept in the observed payload; configured
/// defaults take precedence over them on reset.
#[derive(Debug)]
pub struct RateLimitController {
    platform: Arc<Platform>,
}

impl RateLimitController {
    fn collection(project: &str) -> String {
        format!("/organization/projects/{project}/rate_limits")
    }

    fn split(identity: &str) -> Result<(&str, &str)> {
        identity.split_once('/').ok_or_else(|| {
            Error::validation(format!(
                "rate_limit identity '{identity}' must be '<project_id>/<rate limit id>'"
            ))
        })
    }

    fn find(
        api: Scoped<'_>,
        project: &str,
        matches: impl Fn(&RateLimit) -> bool,
    ) -> Result<Option<RateLimit>> {
        for limit in api.list::<RateLimit>(&Self::collection(project), ListQuery::new().limit(100)) {
            let limit = limit?;
            if matches(&limit) {
                return Ok(Some(limit));
            }
        }
        Ok(None)
    }

    fn observe(limit: &RateLimit, project: &str, defaults: Option<&Value>) -> Result<Attributes> {
        let mut observed = object(serde_json::to_value(limit)?)?;
        observed.insert("project_id".to_string(), Value::String(project.to_string()));
        if let Some(defaults) = defaults {
            observed.insert(DEFAULTS.to_string(), defaults.clone());
        }
        Ok(observed)
    }

    fn post(
        &self,
        identity: &str,
        body: Attributes,
        defaults: Option<&Value>,
    ) -> Result<Attributes> {
        let (project, id) = Self::split(identity)?;
        let api = self.platform.api(Scope::Admin)?;
        let limit: RateLimit =
            api.post_as(&format!("{}/{id}", Self::collection(project)), &Value::Object(body))?;
        Self::observe(&limit, project, defaults)
    }

    /// Values restored on reset: configured per model, then for every
    /// model, then the values captured before the first override
    fn defaults_for(&self, model: &str, captured: Option<&Value>) -> Attributes {
        let configured = |key: &str, field: &str| {
            self.platform
                .rate_limit_defaults
                .get(key)
                .and_then(|fields| fields.get(field))
                .map(|v| Value::from(*v))
        };
        RATE_LIMIT_FIELDS
            .iter()
            .filter_map(|field| {
                configured(model, field)
                    .or_else(|| configured("*", field))
                    .or_else(|| captured.and_then(|c| c.get(*field)).cloned())
                    .map(|v| ((*field).to_string(), v))
            })
            .collect()
    }
}

impl Controller for RateLimitController {
    fn kind(&self) -> &'static str {
        "rate_limit"
    }

    fn schema(&self) -> &Schema {
        &RATE_LIMIT
    }

    fn delete_rule(&self) -> DeleteRule {
        DeleteRule::ResetToDefault
    }

    fn validate(&self, declared: &Attributes) -> Result<()> {
        only_known(self.kind(), declared, &RATE_LIMIT)?;
        required(declared, "project_id")?;
        required(declared, "model")?;
        let mut any = false;
        for field in RATE_LIMIT_FIELDS {
            if let Some(value) = declared.get(field) {
                if value.as_u64().is_none_or(|v| v == 0) {
                    return Err(Error::validation(format!(
                        "{field} must be a positive integer"
                    )));
                }
                any = true;
            }
        }
        if any {
            Ok(())
        } else {
            Err(Error::validation("a rate limit must override at least one field"))
        }
    }

    fn create(&self, declared: &Attributes) -> Result<Created> {
        let project = required(declared, "project_id")?;
        let model = required(declared, "model")?;
        let api = self.platform.api(Scope::Admin)?;

        let current = Self::find(api, project, |l| l.model == model)?.ok_or_else(|| {
            Error::not_found(format!("project {project} has no rate limit for model '{model}'"))
        })?;
        let defaults = Value::Object(pick(&object(serde_json::to_value(&current)?)?, RATE_LIMIT_FIELDS));

        let identity = format!("{project}/{}", current.id);
        let observed = self.post(&identity, pick(declared, RATE_LIMIT_FIELDS), Some(&defaults))?;
        Ok(Created { identity, observed })
    }

    fn read(&self, identity: &str, prior: &Attributes) -> Result<Attributes> {
        let (project, id) = Self::split(identity)?;
        let api = self.platform.api(Scope::Admin)?;
        let limit = Self::find(api, project, |l| l.id == id)?
            .ok_or_else(|| Error::not_found(format!("rate limit {id} not found in project {project}")))?;
        Self::observe(&limit, project, prior.get(DEFAULTS))
    }

    fn update(
        &self,
        identity: &str,
        declared: &Attributes,
        diff: &Diff,
        observed: &Attributes,
    ) -> Result<Attributes> {
        self.post(identity, pick(declared, diff.updatable()), observed.get(DEFAULTS))
    }

    fn delete(&self, identity: &str, observed: &Attributes) -> Result<()> {
        self.reset(identity, observed)
    }

    fn reset(&self, identity: &str, observed: &Attributes) -> Result<()> {
        let model = observed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let body = self.defaults_for(model, observed.get(DEFAULTS));
        if body.is_empty() {
            return Err(Error::state(format!(
                "no default known for rate limit {identity}; set settings.rate_limit_defaults"
            )));
        }
        log::info!("Resetting rate limit {identity} ({model}) to defaults");
        self.post(identity, body, None).map(|_| ())
    }

    fn import(&self, identity: &str) -> Result<Imported> {
        let observed = self.read(identity, &Attributes::new())?;
        let mut declared: Attributes = pick(&observed, RATE_LIMIT.names());
        declared.retain(|_, v| !v.is_null());
        Ok(Imported {
            declared,
            observed,
            suppressed: Vec::new(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::tests::{attrs, platform, platform_with};
    use super::*;
    use apikit::{Method, MockTransport, Payload, PermissionKind, Response};
    use converge::{
        ApplyResult, AutoConfirm, Driver, ExecuteOptions, Instance, NoProgress, SnapshotStore,
        reference,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Projects and their rate limits, served through the mock transport
    #[derive(Default)]
    struct Org {
        projects: BTreeMap<String, Value>,
        limits: BTreeMap<String, Vec<Value>>,
    }

    fn fake_org(mock: &MockTransport) -> Arc<Mutex<Org>> {
        let org = Arc::new(Mutex::new(Org::default()));
        let state = Arc::clone(&org);
        mock.set_handler(move |request| {
            let mut org = state.lock().unwrap();
            let body = match &request.payload {
                Payload::Json(v) => v.clone(),
                _ => Value::Null,
            };
            let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
            let reply = match (request.method, segments.as_slice()) {
                (Method::Post, ["organization", "projects"]) => {
                    let id = format!("proj_{}", org.projects.len() + 1);
                    let project = json!({"id": id, "name": body["name"], "status": "active"});
                    org.projects.insert(id.clone(), project.clone());
                    org.limits.insert(
                        id,
                        vec![
                            json!({"id": "rl-gpt-4o", "model": "gpt-4o", "max_requests_per_1_minute": 5000}),
                            json!({
                                "id": "rl-gpt-4",
                                "model": "gpt-4",
                                "max_requests_per_1_minute": 500,
                                "max_tokens_per_1_minute": 10000
                            }),
                        ],
                    );
                    project
                }
                (Method::Get, ["organization", "projects", id]) => org.projects.get(*id)?.clone(),
                (Method::Get, ["organization", "projects", id, "rate_limits"]) => {
                    let data = org.limits.get(*id)?.clone();
                    json!({"object": "list", "data": data, "has_more": false})
                }
                (Method::Post, ["organization", "projects", id, "rate_limits", limit_id]) => {
                    let limit = org
                        .limits
                        .get_mut(*id)?
                        .iter_mut()
                        .find(|l| l["id"] == *limit_id)?;
                    for (field, value) in body.as_object()? {
                        limit[field.as_str()] = value.clone();
                    }
                    limit.clone()
                }
                _ => return None,
            };
            Some(Response::json(200, &reply))
        });
        org
    }

    fn options() -> ExecuteOptions {
        ExecuteOptions::default()
    }

    fn registry_for(mock: &MockTransport) -> Registry {
        let mut registry = Registry::new();
        register(&mut registry, &platform(mock));
        registry
    }

    fn limit_of(org: &Mutex<Org>, project: &str, model: &str) -> Value {
        org.lock().unwrap().limits[project]
            .iter()
            .find(|l| l["model"] == model)
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_removed_rate_limit_is_reset_never_deleted() {
        let mock = MockTransport::new();
        let org = fake_org(&mock);
        let registry = registry_for(&mock);
        let store = SnapshotStore::new();

        let project = Instance::new("demo", "project", attrs(json!({"name": "Demo"})));
        let mut limit = attrs(json!({"model": "gpt-4", "max_requests_per_1_minute": 10}));
        limit.insert("project_id".into(), reference::make("demo", None));
        let limit = Instance::new("gpt4", "rate_limit", limit);

        let report = Driver::new(&registry, &store, options())
            .execute(&[project.clone(), limit], &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("demo"), Some(&ApplyResult::Created));
        assert_eq!(report.result("gpt4"), Some(&ApplyResult::Created));
        assert_eq!(store.identity("gpt4").as_deref(), Some("proj_1/rl-gpt-4"));
        assert_eq!(limit_of(&org, "proj_1", "gpt-4")["max_requests_per_1_minute"], 10);

        // Override removed from the manifest
        let report = Driver::new(&registry, &store, options())
            .execute(&[project], &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("gpt4"), Some(&ApplyResult::Deleted));
        assert_eq!(report.result("demo"), Some(&ApplyResult::NoChange));

        assert!(mock.calls_with(Method::Delete).is_empty());
        let reset = mock
            .calls_with(Method::Post)
            .into_iter()
            .filter(|c| c.path == "/organization/projects/proj_1/rate_limits/rl-gpt-4")
            .last()
            .unwrap();
        assert_eq!(
            reset.json().unwrap(),
            &json!({"max_requests_per_1_minute": 500, "max_tokens_per_1_minute": 10000})
        );
        assert_eq!(limit_of(&org, "proj_1", "gpt-4")["max_requests_per_1_minute"], 500);
        assert!(store.get("gpt4").is_none());
        assert!(store.get("demo").is_some());
    }

    #[test]
    fn test_configured_defaults_win_over_captured_values() {
        let mock = MockTransport::new();
        fake_org(&mock);
        let mut platform = Platform::new(
            platform(&mock).client.clone(),
            &crate::config::Settings::default(),
        );
        platform.rate_limit_defaults = BTreeMap::from([
            ("gpt-4".to_string(), BTreeMap::from([("max_requests_per_1_minute".to_string(), 800)])),
            ("*".to_string(), BTreeMap::from([("max_requests_per_1_day".to_string(), 9000)])),
        ]);
        let controller = RateLimitController {
            platform: Arc::new(platform),
        };

        let body = controller.defaults_for(
            "gpt-4",
            Some(&json!({"max_requests_per_1_minute": 500, "max_tokens_per_1_minute": 10000})),
        );
        assert_eq!(
            Value::Object(body),
            json!({
                "max_requests_per_1_minute": 800,
                "max_tokens_per_1_minute": 10000,
                "max_requests_per_1_day": 9000
            })
        );
    }

    #[test]
    fn test_read_carries_captured_defaults() {
        let mock = MockTransport::new();
        let registry = registry_for(&mock);
        fake_org(&mock);
        let api_platform = platform(&mock);
        let project = api_platform
            .api(Scope::Admin)
            .unwrap()
            .post("/organization/projects", &json!({"name": "Demo"}))
            .unwrap();
        assert_eq!(project["id"], "proj_1");

        let controller = registry.get("rate_limit").unwrap();
        let declared = attrs(json!({"project_id": "proj_1", "model": "gpt-4", "max_tokens_per_1_minute": 20}));
        let created = controller.create(&declared).unwrap();
        assert_eq!(
            created.observed[DEFAULTS],
            json!({"max_requests_per_1_minute": 500, "max_tokens_per_1_minute": 10000})
        );

        let read = controller.read(&created.identity, &created.observed).unwrap();
        assert_eq!(read[DEFAULTS], created.observed[DEFAULTS]);
        assert_eq!(read["max_tokens_per_1_minute"], 20);
    }

    #[test]
    fn test_unknown_model_is_not_found() {
        let mock = MockTransport::new();
        fake_org(&mock);
        let registry = registry_for(&mock);
        platform(&mock)
            .api(Scope::Admin)
            .unwrap()
            .post("/organization/projects", &json!({"name": "Demo"}))
            .unwrap();

        let err = registry
            .get("rate_limit")
            .unwrap()
            .create(&attrs(json!({"project_id": "proj_1", "model": "dall-e-9", "max_requests_per_1_minute": 1})))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rate_limit_validation() {
        let mock = MockTransport::new();
        let registry = registry_for(&mock);
        let controller = registry.get("rate_limit").unwrap();

        let err = controller
            .validate(&attrs(json!({"project_id": "p", "model": "gpt-4"})))
            .unwrap_err();
        assert!(err.to_string().contains("at least one"));

        let err = controller
            .validate(&attrs(json!({"project_id": "p", "model": "gpt-4", "max_requests_per_1_minute": -1})))
            .unwrap_err();
        assert!(err.to_string().contains("positive integer"));
    }

    #[test]
    fn test_accepted_invite_is_forgotten_without_remote_delete() {
        let mock = MockTransport::new();
        mock.respond(
            Method::Get,
            "/organization/invites/inv_1",
            200,
            json!({"id": "inv_1", "email": "a@example.com", "role": "reader", "status": "accepted"}),
        );
        let registry = registry_for(&mock);
        let store = SnapshotStore::new();
        store.commit(
            "alice",
            converge::Entry {
                kind: "invite".into(),
                identity: "inv_1".into(),
                observed: attrs(json!({"id": "inv_1", "status": "pending"})),
                ..converge::Entry::default()
            },
        );

        let report = Driver::new(&registry, &store, options())
            .execute(&[], &mut NoProgress, &mut AutoConfirm)
            .unwrap();
        assert_eq!(report.result("alice"), Some(&ApplyResult::Deleted));
        assert!(mock.calls_with(Method::Delete).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_pending_invite_is_deleted_remotely() {
        let mock = MockTransport::new();
        mock.respond(
            Method::Get,
            "/organization/invites/inv_2",
            200,
            json!({"id": "inv_2", "status": "pending"}),
        );
        mock.respond(
            Method::Delete,
            "/organization/invites/inv_2",
            200,
            json!({"id": "inv_2", "deleted": true}),
        );
        let registry = registry_for(&mock);
        let controller = registry.get("invite").unwrap();
        let observed = controller.read("inv_2", &Attributes::new()).unwrap();
        let outcome = converge::policy::delete(
            controller.as_ref(),
            "inv_2",
            &observed,
        )
        .unwrap();
        assert_eq!(outcome, converge::DeleteOutcome::Deleted);
        assert_eq!(mock.count(Method::Delete, "/organization/invites/inv_2"), 1);
    }

    #[test]
    fn test_invite_validation() {
        let mock = MockTransport::new();
        let registry = registry_for(&mock);
        let invite = registry.get("invite").unwrap();
        assert!(
            invite
                .validate(&attrs(json!({"email": "a@example.com", "role": "reader"})))
                .is_ok()
        );
        for bad in ["nobody", "a@b", "two@@example.com", "a b@example.com"] {
            assert!(
                invite.validate(&attrs(json!({"email": bad, "role": "reader"}))).is_err(),
                "{bad}"
            );
        }
        assert!(
            invite
                .validate(&attrs(json!({"email": "First.Last+ops@sub.example.io", "role": "owner"})))
                .is_ok()
        );
        let err = invite
            .validate(&attrs(json!({
                "email": "a@example.com",
                "role": "reader",
                "projects": [{"id": "proj_1", "role": "admin"}]
            })))
            .unwrap_err();
        assert!(err.to_string().contains("role must be one of owner, member"));
    }

    #[test]
    fn test_project_archived_on_delete() {
        let mock = MockTransport::new();
        mock.respond(Method::Post, "/organization/projects/proj_9/archive", 200, json!({"id": "proj_9", "status": "archived"}));
        let registry = registry_for(&mock);
        let project = registry.get("project").unwrap();

        let active = attrs(json!({"status": "active"}));
        let outcome =
            converge::policy::delete(project.as_ref(), "proj_9", &active).unwrap();
        assert_eq!(outcome, converge::DeleteOutcome::Deleted);

        let archived = attrs(json!({"status": "archived"}));
        let outcome =
            converge::policy::delete(project.as_ref(), "proj_9", &archived).unwrap();
        assert_eq!(outcome, converge::DeleteOutcome::LocalOnly);
        assert_eq!(mock.count(Method::Post, "/organization/projects/proj_9/archive"), 1);
    }

    #[test]
    fn test_admin_kinds_fail_fast_without_admin_key() {
        let mock = MockTransport::new();
        let mut registry = Registry::new();
        register(&mut registry, &platform_with(&mock, None));

        let err = registry
            .get("project")
            .unwrap()
            .create(&attrs(json!({"name": "Demo"})))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PermissionDenied {
                kind: PermissionKind::MissingScope,
                ..
            }
        ));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_project_user_identity_is_composite() {
        let mock = MockTransport::new();
        mock.respond(
            Method::Post,
            "/organization/projects/proj_1/users",
            200,
            json!({"id": "user_7", "role": "member"}),
        );
        let registry = registry_for(&mock);
        let created = registry
            .get("project_user")
            .unwrap()
            .create(&attrs(json!({"project_id": "proj_1", "user_id": "user_7", "role": "member"})))
            .unwrap();
        assert_eq!(created.identity, "proj_1/user_7");
        assert_eq!(
            mock.calls_with(Method::Post)[0].json().unwrap(),
            &json!({"user_id": "user_7", "role": "member"})
        );
    }
}
