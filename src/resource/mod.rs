//! Controllers for every platform resource kind
//!
//! Most kinds are plain REST collections and are described by a [`Rest`]
//! value: collection path, optional parent attribute, schema and delete
//! behavior. Kinds with protocol logic (rate limits, files, uploads,
//! one-shot calls, list data sources) have their own controllers.
//!
//! Kinds nested under a parent object (project users, messages, runs,
//! vector store files) use `"<parent id>/<id>"` as their identity so they
//! can be read and imported without any other context.

use apikit::{Client, Error, Result, Scope, Scoped};
use converge::{Attributes, Controller, Created, DeleteRule, Diff, Imported, Registry, Schema};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Settings;

pub mod assistants;
pub mod datasource;
pub mod files;
pub mod jobs;
pub mod oneshot;
pub mod organization;

/// Client plus the settings controllers need
#[derive(Debug)]
pub struct Platform {
    pub client: Client,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub import_placeholder: String,
    /// Model (`"*"` for all) → field → default value
    pub rate_limit_defaults: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Platform {
    pub fn new(client: Client, settings: &Settings) -> Self {
        Self {
            client,
            poll_interval: settings.poll_interval(),
            poll_timeout: settings.poll_timeout(),
            import_placeholder: settings.import_placeholder.clone(),
            rate_limit_defaults: settings.rate_limit_defaults.clone(),
        }
    }

    pub fn api(&self, scope: Scope) -> Result<Scoped<'_>> {
        self.client.scoped(scope)
    }

    /// Re-read an object until `settled` holds or the poll timeout passes.
    ///
    /// On timeout the latest observation is returned; the next pass reads
    /// the object again.
    pub fn poll(
        &self,
        what: &str,
        mut observed: Attributes,
        mut fetch: impl FnMut() -> Result<Attributes>,
        settled: impl Fn(&Attributes) -> bool,
    ) -> Result<Attributes> {
        let started = Instant::now();
        while !settled(&observed) {
            if started.elapsed() >= self.poll_timeout {
                log::warn!(
                    "{what} still {} after {}s; continuing",
                    status(&observed),
                    self.poll_timeout.as_secs()
                );
                return Ok(observed);
            }
            log::debug!("Waiting for {what} ({})", status(&observed));
            thread::sleep(self.poll_interval);
            observed = fetch()?;
        }
        Ok(observed)
    }
}

/// Build the registry of every supported kind
pub fn registry(platform: &Arc<Platform>) -> Registry {
    let mut registry = Registry::new();
    organization::register(&mut registry, platform);
    files::register(&mut registry, platform);
    assistants::register(&mut registry, platform);
    jobs::register(&mut registry, platform);
    oneshot::register(&mut registry, platform);
    datasource::register(&mut registry, platform);
    registry
}

// ============================================================================
// Helpers
// ============================================================================

/// Require a JSON object payload
pub fn object(value: Value) -> Result<Attributes> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidResponse(format!(
            "expected an object, got {other}"
        ))),
    }
}

/// The `id` of a remote object
pub fn identity_of(observed: &Attributes) -> Result<String> {
    observed
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::InvalidResponse("object has no id".to_string()))
}

/// A required string attribute
pub fn required<'a>(declared: &'a Attributes, name: &str) -> Result<&'a str> {
    declared
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation(format!("missing required attribute '{name}'")))
}

/// Object of the named attributes present in `declared`
pub fn pick<'a>(declared: &Attributes, names: impl IntoIterator<Item = &'a str>) -> Attributes {
    names
        .into_iter()
        .filter_map(|name| {
            declared
                .get(name)
                .filter(|v| !v.is_null())
                .map(|v| (name.to_string(), v.clone()))
        })
        .collect()
}

/// Reject attributes the kind does not know
pub fn only_known(kind: &str, declared: &Attributes, schema: &Schema) -> Result<()> {
    match declared.keys().find(|k| !schema.names().any(|n| n == k.as_str())) {
        Some(unknown) => Err(Error::validation(format!(
            "{kind} does not accept attribute '{unknown}'"
        ))),
        None => Ok(()),
    }
}

/// Status string of a remote object
pub fn status(observed: &Attributes) -> &str {
    observed
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

// ============================================================================
// Generic REST collection
// ============================================================================

/// How a REST kind is removed remotely
#[derive(Debug, Clone, Copy)]
pub enum Removal {
    /// `DELETE {collection}/{id}`
    Delete,
    /// `POST {collection}/{id}{suffix}` (archive, cancel)
    Post(&'static str),
}

/// Statuses at which a freshly created object stops being polled
#[derive(Debug, Clone, Copy)]
pub struct Settle {
    pub field: &'static str,
    pub done: &'static [&'static str],
}

/// A kind that maps onto a REST collection
pub struct Rest {
    platform: Arc<Platform>,
    kind: &'static str,
    scope: Scope,
    /// Collection path; `{parent}` is replaced by the parent id
    collection: &'static str,
    /// Declared attribute holding the parent id
    parent: Option<&'static str>,
    schema: Schema,
    removal: Removal,
    rule: DeleteRule,
    settle: Option<Settle>,
    check: fn(&Attributes) -> Result<()>,
}

impl fmt::Debug for Rest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rest")
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

fn accept_all(_declared: &Attributes) -> Result<()> {
    Ok(())
}

impl Rest {
    pub fn new(
        platform: &Arc<Platform>,
        kind: &'static str,
        scope: Scope,
        collection: &'static str,
        schema: Schema,
    ) -> Self {
        Self {
            platform: Arc::clone(platform),
            kind,
            scope,
            collection,
            parent: None,
            schema,
            removal: Removal::Delete,
            rule: DeleteRule::Remote,
            settle: None,
            check: accept_all,
        }
    }

    pub fn parent(mut self, attribute: &'static str) -> Self {
        self.parent = Some(attribute);
        self
    }

    pub fn removal(mut self, removal: Removal, rule: DeleteRule) -> Self {
        self.removal = removal;
        self.rule = rule;
        self
    }

    pub fn settle(mut self, field: &'static str, done: &'static [&'static str]) -> Self {
        self.settle = Some(Settle { field, done });
        self
    }

    pub fn check(mut self, check: fn(&Attributes) -> Result<()>) -> Self {
        self.check = check;
        self
    }

    fn collection_path(&self, parent: Option<&str>) -> String {
        match parent {
            Some(parent) => self.collection.replace("{parent}", parent),
            None => self.collection.to_string(),
        }
    }

    /// Split an identity into (parent, id)
    fn split<'a>(&self, identity: &'a str) -> Result<(Option<&'a str>, &'a str)> {
        match self.parent {
            None => Ok((None, identity)),
            Some(attribute) => identity
                .split_once('/')
                .map(|(parent, id)| (Some(parent), id))
                .ok_or_else(|| {
                    Error::validation(format!(
                        "{} identity '{identity}' must be '<{attribute}>/<id>'",
                        self.kind
                    ))
                }),
        }
    }

    fn item_path(&self, identity: &str) -> Result<String> {
        let (parent, id) = self.split(identity)?;
        Ok(format!("{}/{id}", self.collection_path(parent)))
    }

    fn settled(&self, observed: &Attributes) -> bool {
        self.settle.is_none_or(|settle| {
            observed
                .get(settle.field)
                .and_then(Value::as_str)
                .is_some_and(|s| settle.done.contains(&s))
        })
    }
}

impl Controller for Rest {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn delete_rule(&self) -> DeleteRule {
        self.rule
    }

    fn validate(&self, declared: &Attributes) -> Result<()> {
        only_known(self.kind, declared, &self.schema)?;
        if let Some(parent) = self.parent {
            required(declared, parent)?;
        }
        (self.check)(declared)
    }

    fn create(&self, declared: &Attributes) -> Result<Created> {
        let api = self.platform.api(self.scope)?;
        let parent = self.parent.map(|p| required(declared, p)).transpose()?;
        let body: Attributes = declared
            .iter()
            .filter(|(k, v)| Some(k.as_str()) != self.parent && !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let observed = object(api.post(&self.collection_path(parent), &Value::Object(body))?)?;
        let id = identity_of(&observed)?;
        let identity = match parent {
            Some(parent) => format!("{parent}/{id}"),
            None => id,
        };

        let path = self.item_path(&identity)?;
        let observed = self.platform.poll(
            &format!("{} {identity}", self.kind),
            observed,
            || object(api.get(&path)?),
            |o| self.settled(o),
        )?;
        Ok(Created { identity, observed })
    }

    fn read(&self, identity: &str, _prior: &Attributes) -> Result<Attributes> {
        let api = self.platform.api(self.scope)?;
        object(api.get(&self.item_path(identity)?)?)
    }

    fn update(
        &self,
        identity: &str,
        declared: &Attributes,
        diff: &Diff,
        observed: &Attributes,
    ) -> Result<Attributes> {
        let api = self.platform.api(self.scope)?;
        let body = pick(declared, diff.updatable());
        if body.is_empty() {
            return Ok(observed.clone());
        }
        object(api.post(&self.item_path(identity)?, &Value::Object(body))?)
    }

    fn delete(&self, identity: &str, _observed: &Attributes) -> Result<()> {
        let api = self.platform.api(self.scope)?;
        let path = self.item_path(identity)?;
        match self.removal {
            Removal::Delete => api.delete(&path)?,
            Removal::Post(suffix) => api.post_empty(&format!("{path}{suffix}"))?,
        };
        Ok(())
    }

    fn import(&self, identity: &str) -> Result<Imported> {
        let observed = self.read(identity, &Attributes::new())?;
        let mut declared = pick(&observed, self.schema.names());
        if let (Some(attribute), (Some(parent), _)) = (self.parent, self.split(identity)?) {
            declared.insert(attribute.to_string(), Value::String(parent.to_string()));
        }
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
